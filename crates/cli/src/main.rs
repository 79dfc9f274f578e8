use clap::{Parser, Subcommand};
use gatelink::client::{ConnectionEvent, PushMessage};
use gatelink::config::Config;
use gatelink::protocol::{self, Payload};
use gatelink::{Credential, Deadline, GatewayClient};
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::broadcast;

#[derive(Parser)]
#[command(name = "gatelink")]
#[command(about = "Gatelink CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show version
    Version,

    /// Create the configuration directory and a default config file.
    Init {
        /// Config file path (default: GATELINK_CONFIG_PATH or ~/.gatelink/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,
    },

    /// Run the development gateway (HTTP + WebSocket).
    Gateway {
        /// Config file path (default: GATELINK_CONFIG_PATH or ~/.gatelink/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,

        /// WebSocket and HTTP port (default from config or 15151)
        #[arg(long, short)]
        port: Option<u16>,
    },

    /// Send one request and print the response payload.
    Call {
        /// Config file path (default: GATELINK_CONFIG_PATH or ~/.gatelink/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,

        /// Request type (e.g. chat, command, subscribe)
        #[arg(value_name = "TYPE")]
        typ: String,

        /// Payload entries as key=value
        #[arg(value_name = "KEY=VALUE")]
        payload: Vec<String>,

        /// Response deadline in seconds (default from config)
        #[arg(long, short, value_name = "SECS")]
        timeout: Option<u64>,
    },

    /// Chat through the gateway (interactive). Pushes and connection events are printed as they arrive.
    Chat {
        /// Config file path (default: GATELINK_CONFIG_PATH or ~/.gatelink/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Version) => {
            println!("gatelink {}", env!("CARGO_PKG_VERSION"));
        }
        Some(Commands::Init { config }) => {
            if let Err(e) = run_init(config) {
                log::error!("init failed: {}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Gateway { config, port }) => {
            if let Err(e) = run_gateway(config, port).await {
                log::error!("gateway failed: {}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Call {
            config,
            typ,
            payload,
            timeout,
        }) => {
            if let Err(e) = run_call(config, typ, payload, timeout).await {
                log::error!("call failed: {}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Chat { config }) => {
            if let Err(e) = run_chat(config).await {
                log::error!("chat failed: {}", e);
                std::process::exit(1);
            }
        }
        None => {
            println!("Run with --help for usage");
        }
    }
}

fn run_init(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let path = config_path.unwrap_or_else(gatelink::config::default_config_path);
    let dir = gatelink::init::init_config_dir(&path)?;
    println!("initialized configuration at {}", dir.display());
    Ok(())
}

async fn run_gateway(config_path: Option<PathBuf>, port: Option<u16>) -> anyhow::Result<()> {
    let (mut config, _) = gatelink::config::load_config(config_path)?;
    if let Some(p) = port {
        config.gateway.port = p;
    }
    log::info!("starting gateway on {}:{}", config.gateway.bind, config.gateway.port);
    gatelink::gateway::run_gateway(config).await
}

fn parse_payload(pairs: &[String]) -> anyhow::Result<Payload> {
    pairs
        .iter()
        .map(|pair| {
            pair.split_once('=')
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .ok_or_else(|| anyhow::anyhow!("payload entry must be key=value: {}", pair))
        })
        .collect()
}

/// Load config and connect a client to the configured endpoint.
async fn connect(config_path: Option<PathBuf>) -> anyhow::Result<(GatewayClient, Config)> {
    let (config, _) = gatelink::config::load_config(config_path)?;
    let client = GatewayClient::new(config.client.engine_options());
    let credential = gatelink::config::resolve_client_token(&config).map(Credential::bearer);
    client.connect(&config.client.endpoint, credential).await?;
    Ok((client, config))
}

async fn run_call(
    config_path: Option<PathBuf>,
    typ: String,
    payload: Vec<String>,
    timeout: Option<u64>,
) -> anyhow::Result<()> {
    let payload = parse_payload(&payload)?;
    let (client, _) = connect(config_path).await?;
    let deadline = timeout
        .map(|secs| Deadline::After(Duration::from_secs(secs)))
        .unwrap_or_default();
    let result = client.call_with(typ, payload, deadline).await;
    client.disconnect().await;
    if let Some(text) = result? {
        println!("{}", text);
    }
    Ok(())
}

async fn run_chat(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let (client, config) = connect(config_path).await?;
    let mut pushes = client.subscribe_pushes();
    let mut events = client.subscribe_events();
    let mut topic = Payload::new();
    topic.insert("topic".to_string(), "chat".to_string());
    if let Err(e) = client.call(protocol::SUBSCRIBE, topic).await {
        log::warn!("subscribing to chat pushes failed: {}", e);
    }
    println!("connected to {} (/quit to exit)", config.client.endpoint);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    loop {
        stdout.write_all(b"> ").await?;
        stdout.flush().await?;
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                let input = line.trim();
                if input.is_empty() {
                    continue;
                }
                if input.eq_ignore_ascii_case("/exit") || input.eq_ignore_ascii_case("/quit") {
                    break;
                }
                let mut payload = Payload::new();
                payload.insert("message".to_string(), input.to_string());
                match client.call(protocol::CHAT, payload).await {
                    Ok(reply) => println!("< {}", reply.unwrap_or_default().trim()),
                    Err(e) => eprintln!("chat error: {}", e),
                }
            }
            push = pushes.recv() => match push {
                Ok(PushMessage::Frame { typ, payload }) => {
                    println!("\n[{}] {}", typ, payload.unwrap_or_default());
                }
                Ok(PushMessage::Raw(text)) => println!("\n[raw] {}", text),
                Err(broadcast::error::RecvError::Lagged(n)) => log::debug!("missed {} pushes", n),
                Err(broadcast::error::RecvError::Closed) => break,
            },
            event = events.recv() => match event {
                Ok(ConnectionEvent::StateChanged(state)) => println!("\n[connection] {}", state),
                Ok(ConnectionEvent::ReconnectScheduled { attempt, delay }) => {
                    println!("\n[connection] reconnect attempt {} in {}s", attempt, delay.as_secs());
                }
                Ok(ConnectionEvent::ReconnectFailed { attempt, error }) => {
                    println!("\n[connection] reconnect attempt {} failed: {}", attempt, error);
                }
                Ok(ConnectionEvent::ReconnectExhausted(error)) => {
                    println!("\n[connection] {}", error);
                    break;
                }
                Err(broadcast::error::RecvError::Lagged(n)) => log::debug!("missed {} events", n),
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    client.disconnect().await;
    Ok(())
}
