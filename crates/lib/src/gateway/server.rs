//! Gateway HTTP + WebSocket server (single port).

use crate::config::{self, Config};
use crate::protocol::{self, RequestFrame, ResponseFrame};
use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde_json::json;
use std::collections::HashSet;
use std::future::Future;
use tokio::net::TcpListener;
use tokio::sync::broadcast;

const PROTOCOL_VERSION: u32 = 1;

/// Topic chat messages are pushed on.
const CHAT_TOPIC: &str = "chat";

/// Frame fanned out to connected sockets.
#[derive(Debug, Clone)]
struct Broadcast {
    /// Socket that caused it; never echoed back there.
    origin: Option<String>,
    /// Only sockets subscribed to this topic receive it. None reaches everyone.
    topic: Option<String>,
    text: String,
    /// Socket closes after delivering it.
    last: bool,
}

#[derive(Clone)]
struct GatewayState {
    port: u16,
    /// When Some, the upgrade request must carry `Authorization: Bearer <token>`.
    required_token: Option<String>,
    event_tx: broadcast::Sender<Broadcast>,
}

/// When auth mode is token and a token is configured, returns it for upgrade validation.
fn require_connect_token(config: &Config) -> Option<String> {
    if config.gateway.auth.mode == config::GatewayAuthMode::Token {
        config::resolve_gateway_token(config)
    } else {
        None
    }
}

/// Run the gateway server; binds to config.gateway.bind:config.gateway.port.
/// When bind is not loopback, a gateway token must be configured or startup fails.
/// Blocks until shutdown (Ctrl+C or SIGTERM).
pub async fn run_gateway(config: Config) -> Result<()> {
    let bind = config.gateway.bind.trim();
    let required_token = require_connect_token(&config);
    if !config::is_loopback_bind(bind) && required_token.is_none() {
        anyhow::bail!(
            "refusing to bind gateway to {} without auth (set gateway.auth.mode to \"token\" and gateway.auth.token or GATELINK_GATEWAY_TOKEN)",
            bind
        );
    }

    let bind_addr = format!("{}:{}", bind, config.gateway.port);
    let listener = TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("binding to {}", bind_addr))?;
    log::info!("gateway listening on {}", bind_addr);

    serve_gateway(listener, required_token, shutdown_signal()).await?;
    log::info!("gateway stopped");
    Ok(())
}

/// Serve on an already bound listener until `shutdown` completes. Connected sockets receive a
/// final `shutdown` push and are closed.
pub async fn serve_gateway(
    listener: TcpListener,
    required_token: Option<String>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let port = listener.local_addr().context("reading listener address")?.port();
    let (event_tx, _) = broadcast::channel(64);
    let state = GatewayState {
        port,
        required_token,
        event_tx: event_tx.clone(),
    };

    let app = Router::new()
        .route("/", get(health_http))
        .route("/ws", get(ws_handler))
        .with_state(state);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown.await;
            log::info!("shutting down, notifying connected clients");
            let _ = event_tx.send(Broadcast {
                origin: None,
                topic: None,
                text: ResponseFrame::push("shutdown", "gateway shutting down").encode(),
                last: true,
            });
        })
        .await
        .context("gateway server exited")
}

/// Future that completes when the process should shut down (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    log::info!("shutdown signal received");
}

/// GET / returns a simple health JSON (for probes).
async fn health_http(State(state): State<GatewayState>) -> Json<serde_json::Value> {
    Json(json!({
        "runtime": "running",
        "protocol": PROTOCOL_VERSION,
        "port": state.port,
    }))
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
}

/// GET /ws upgrades to WebSocket once the bearer token (if required) matches.
async fn ws_handler(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    if let Some(required) = state.required_token.as_deref() {
        if bearer_token(&headers) != Some(required) {
            log::debug!("rejecting websocket upgrade: bad or missing token");
            return StatusCode::UNAUTHORIZED.into_response();
        }
    }
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: GatewayState) {
    let conn_id = uuid::Uuid::new_v4().to_string();
    let mut topics: HashSet<String> = HashSet::new();
    let mut event_rx = state.event_tx.subscribe();
    log::debug!("ws client {} connected", conn_id);

    loop {
        tokio::select! {
            biased;

            event = event_rx.recv() => {
                match event {
                    Ok(event) => {
                        if event.origin.as_deref() == Some(conn_id.as_str()) {
                            continue;
                        }
                        let wanted = event.topic.as_ref().map_or(true, |t| topics.contains(t));
                        if wanted && socket.send(Message::Text(event.text)).await.is_err() {
                            break;
                        }
                        if event.last {
                            let _ = socket.send(Message::Close(None)).await;
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        log::debug!("ws client lagged {} broadcast messages", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            msg = socket.recv() => {
                let Some(Ok(msg)) = msg else { break };
                let text = match msg {
                    Message::Text(text) => text,
                    Message::Binary(data) => String::from_utf8_lossy(&data).into_owned(),
                    Message::Close(_) => break,
                    _ => continue,
                };
                let reply = match RequestFrame::decode(&text) {
                    Ok(req) => handle_request(req, &conn_id, &mut topics, &state),
                    Err(e) => {
                        log::debug!("undecodable request from {}: {}", conn_id, e);
                        ResponseFrame::push("error", format!("invalid request frame: {}", e))
                    }
                };
                if socket.send(Message::Text(reply.encode())).await.is_err() {
                    break;
                }
            }
        }
    }
    log::debug!("ws client {} disconnected", conn_id);
}

fn handle_request(
    req: RequestFrame,
    conn_id: &str,
    topics: &mut HashSet<String>,
    state: &GatewayState,
) -> ResponseFrame {
    match req.typ.as_str() {
        protocol::CHAT => {
            let Some(message) = req.payload.get("message") else {
                return ResponseFrame::err(&req.id, "error", "chat requires a message");
            };
            let _ = state.event_tx.send(Broadcast {
                origin: Some(conn_id.to_string()),
                topic: Some(CHAT_TOPIC.to_string()),
                text: ResponseFrame::push("message", message.as_str()).encode(),
                last: false,
            });
            ResponseFrame::ok(&req.id, "message", Some(message.clone()))
        }
        protocol::COMMAND => match req.payload.get("name").map(String::as_str) {
            Some("ping") => ResponseFrame::ok(&req.id, "command", Some("pong".to_string())),
            Some(other) => ResponseFrame::err(&req.id, "error", format!("unknown command: {}", other)),
            None => ResponseFrame::err(&req.id, "error", "command requires a name"),
        },
        protocol::SUBSCRIBE | protocol::UNSUBSCRIBE => {
            let Some(topic) = req.payload.get("topic") else {
                return ResponseFrame::err(&req.id, "error", format!("{} requires a topic", req.typ));
            };
            let typ = if req.typ == protocol::SUBSCRIBE {
                topics.insert(topic.clone());
                "subscribed"
            } else {
                topics.remove(topic);
                "unsubscribed"
            };
            ResponseFrame::ok(&req.id, typ, Some(topic.clone()))
        }
        other => ResponseFrame::err(&req.id, "error", format!("unsupported request type: {}", other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Payload;

    fn state() -> GatewayState {
        let (event_tx, _) = broadcast::channel(8);
        GatewayState {
            port: 0,
            required_token: None,
            event_tx,
        }
    }

    fn request(typ: &str, pairs: &[(&str, &str)]) -> RequestFrame {
        let payload: Payload = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        RequestFrame::new("r1", typ, payload)
    }

    #[test]
    fn chat_echoes_and_broadcasts() {
        let state = state();
        let mut rx = state.event_tx.subscribe();
        let mut topics = HashSet::new();
        let res = handle_request(request("chat", &[("message", "hi")]), "c1", &mut topics, &state);
        assert_eq!(res, ResponseFrame::ok("r1", "message", Some("hi".into())));
        let event = rx.try_recv().unwrap();
        assert_eq!(event.origin.as_deref(), Some("c1"));
        assert_eq!(event.topic.as_deref(), Some(CHAT_TOPIC));
    }

    #[test]
    fn ping_command_answers_pong() {
        let state = state();
        let res = handle_request(request("command", &[("name", "ping")]), "c1", &mut HashSet::new(), &state);
        assert_eq!(res.payload.as_deref(), Some("pong"));
        let res = handle_request(request("command", &[("name", "reboot")]), "c1", &mut HashSet::new(), &state);
        assert_eq!(res.error.as_deref(), Some("unknown command: reboot"));
    }

    #[test]
    fn subscribe_toggles_topics() {
        let state = state();
        let mut topics = HashSet::new();
        handle_request(request("subscribe", &[("topic", "chat")]), "c1", &mut topics, &state);
        assert!(topics.contains("chat"));
        handle_request(request("unsubscribe", &[("topic", "chat")]), "c1", &mut topics, &state);
        assert!(topics.is_empty());
    }

    #[test]
    fn unknown_type_is_an_error_response() {
        let res = handle_request(request("teleport", &[]), "c1", &mut HashSet::new(), &state());
        assert_eq!(res.request_id.as_deref(), Some("r1"));
        assert_eq!(res.error.as_deref(), Some("unsupported request type: teleport"));
    }

    #[test]
    fn bearer_header_parsing() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer_token(&headers), None);
        headers.insert(header::AUTHORIZATION, "Bearer abc".parse().unwrap());
        assert_eq!(bearer_token(&headers), Some("abc"));
    }
}
