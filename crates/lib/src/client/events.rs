//! Notifications the engine publishes to its subscribers.

use crate::error::{ConnectError, LifecycleError};
use std::fmt;
use std::time::Duration;

/// Connection lifecycle state. Only the engine task changes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Closing,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Closing => "closing",
        })
    }
}

/// Published on the connection event channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    StateChanged(ConnectionState),
    ReconnectScheduled { attempt: u32, delay: Duration },
    ReconnectFailed { attempt: u32, error: ConnectError },
    /// Automatic reconnection stopped; only a manual `connect` can bring the link back.
    ReconnectExhausted(LifecycleError),
}

/// Unsolicited frame from the gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushMessage {
    Frame { typ: String, payload: Option<String> },
    /// Inbound content that could not be decoded, passed through untouched.
    Raw(String),
}
