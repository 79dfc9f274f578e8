//! Configuration types and loading.
//!
//! Config is loaded from a JSON file (`~/.gatelink/config.json` by default) and environment.

use crate::client::EngineOptions;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Client engine settings.
    #[serde(default)]
    pub client: ClientConfig,

    /// Development gateway settings.
    #[serde(default)]
    pub gateway: GatewayConfig,
}

/// Where to connect and how patient to be.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientConfig {
    /// WebSocket URI of the gateway (default `ws://127.0.0.1:15151/ws`).
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    /// Bearer token. Overridden by GATELINK_TOKEN env.
    #[serde(default)]
    pub token: Option<String>,

    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,

    /// 0 disables keepalive probes.
    #[serde(default = "default_keepalive_interval_secs")]
    pub keepalive_interval_secs: u64,

    #[serde(default)]
    pub reconnect: ReconnectConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconnectConfig {
    /// Attempt n waits n * baseDelaySecs.
    #[serde(default = "default_reconnect_base_delay_secs")]
    pub base_delay_secs: u64,

    /// 0 disables automatic reconnection.
    #[serde(default = "default_reconnect_max_attempts")]
    pub max_attempts: u32,
}

/// Gateway bind, port, and auth settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfig {
    /// Port for HTTP and WebSocket (default 15151).
    #[serde(default = "default_gateway_port")]
    pub port: u16,

    /// Bind address (default "127.0.0.1").
    #[serde(default = "default_gateway_bind")]
    pub bind: String,

    #[serde(default)]
    pub auth: GatewayAuthConfig,
}

/// Gateway auth: token or none (loopback-only when none).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayAuthConfig {
    /// "none" = no shared secret (only allowed on loopback). "token" = require a bearer token on upgrade.
    #[serde(default)]
    pub mode: GatewayAuthMode,

    /// Shared secret. Overridden by GATELINK_GATEWAY_TOKEN env.
    pub token: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GatewayAuthMode {
    #[default]
    None,
    Token,
}

fn default_endpoint() -> String {
    "ws://127.0.0.1:15151/ws".to_string()
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_call_timeout_secs() -> u64 {
    120
}

fn default_keepalive_interval_secs() -> u64 {
    30
}

fn default_reconnect_base_delay_secs() -> u64 {
    2
}

fn default_reconnect_max_attempts() -> u32 {
    5
}

fn default_gateway_port() -> u16 {
    15151
}

fn default_gateway_bind() -> String {
    "127.0.0.1".to_string()
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            token: None,
            connect_timeout_secs: default_connect_timeout_secs(),
            call_timeout_secs: default_call_timeout_secs(),
            keepalive_interval_secs: default_keepalive_interval_secs(),
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay_secs: default_reconnect_base_delay_secs(),
            max_attempts: default_reconnect_max_attempts(),
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_gateway_port(),
            bind: default_gateway_bind(),
            auth: GatewayAuthConfig::default(),
        }
    }
}

impl ClientConfig {
    pub fn engine_options(&self) -> EngineOptions {
        EngineOptions {
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            call_timeout: Duration::from_secs(self.call_timeout_secs),
            keepalive_interval: Duration::from_secs(self.keepalive_interval_secs),
            reconnect_base_delay: Duration::from_secs(self.reconnect.base_delay_secs),
            max_reconnect_attempts: self.reconnect.max_attempts,
        }
    }
}

/// Trimmed, non-empty env var value.
fn env_token(name: &str) -> Option<String> {
    std::env::var(name).ok().and_then(|s| {
        let t = s.trim();
        if t.is_empty() {
            None
        } else {
            Some(t.to_string())
        }
    })
}

fn config_token(token: &Option<String>) -> Option<String> {
    token
        .as_ref()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Resolve the client token: env GATELINK_TOKEN overrides config.
pub fn resolve_client_token(config: &Config) -> Option<String> {
    env_token("GATELINK_TOKEN").or_else(|| config_token(&config.client.token))
}

/// Resolve the gateway token: env GATELINK_GATEWAY_TOKEN overrides config.
pub fn resolve_gateway_token(config: &Config) -> Option<String> {
    env_token("GATELINK_GATEWAY_TOKEN").or_else(|| config_token(&config.gateway.auth.token))
}

/// True if the bind address is loopback (127.0.0.1, ::1, etc.).
pub fn is_loopback_bind(bind: &str) -> bool {
    let b = bind.trim();
    b == "127.0.0.1" || b == "::1" || b == "localhost"
}

/// Resolve config path from env or default.
pub fn default_config_path() -> PathBuf {
    std::env::var("GATELINK_CONFIG_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            dirs::home_dir()
                .map(|h| h.join(".gatelink").join("config.json"))
                .unwrap_or_else(|| PathBuf::from("config.json"))
        })
}

/// Load config from the given path, GATELINK_CONFIG_PATH, or the default. Missing file => default config.
/// Returns the config and the path that was used.
pub fn load_config(path: Option<PathBuf>) -> Result<(Config, PathBuf)> {
    let path = path.unwrap_or_else(default_config_path);
    let config = if !path.exists() {
        log::debug!("config file not found, using defaults: {}", path.display());
        Config::default()
    } else {
        let s = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        serde_json::from_str(&s)
            .with_context(|| format!("parsing config from {}", path.display()))?
    };
    Ok((config, path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_engine_defaults() {
        let config = Config::default();
        assert_eq!(config.client.endpoint, "ws://127.0.0.1:15151/ws");
        assert_eq!(config.client.engine_options(), EngineOptions::default());
        assert_eq!(config.gateway.port, 15151);
        assert_eq!(config.gateway.bind, "127.0.0.1");
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let config: Config = serde_json::from_str(
            r#"{"client":{"callTimeoutSecs":5,"reconnect":{"maxAttempts":0}},"gateway":{"auth":{"mode":"token","token":" s3cret "}}}"#,
        )
        .unwrap();
        let options = config.client.engine_options();
        assert_eq!(options.call_timeout, Duration::from_secs(5));
        assert_eq!(options.connect_timeout, Duration::from_secs(30));
        assert_eq!(options.reconnect_base_delay, Duration::from_secs(2));
        assert_eq!(options.max_reconnect_attempts, 0);
        assert_eq!(config.gateway.auth.mode, GatewayAuthMode::Token);
        assert_eq!(config_token(&config.gateway.auth.token).as_deref(), Some("s3cret"));
    }

    #[test]
    fn blank_token_is_absent() {
        assert_eq!(config_token(&Some("   ".into())), None);
        assert_eq!(config_token(&None), None);
    }

    #[test]
    fn loopback_binds() {
        assert!(is_loopback_bind("127.0.0.1"));
        assert!(is_loopback_bind(" ::1 "));
        assert!(is_loopback_bind("localhost"));
        assert!(!is_loopback_bind("0.0.0.0"));
    }

    #[test]
    fn missing_file_loads_defaults() {
        let path = std::env::temp_dir().join(format!("gatelink-missing-{}.json", uuid::Uuid::new_v4()));
        let (config, used) = load_config(Some(path.clone())).unwrap();
        assert_eq!(used, path);
        assert_eq!(config.client.reconnect.max_attempts, 5);
    }
}
