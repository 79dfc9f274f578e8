//! Engine error taxonomy: connect-time, call-time, and lifecycle failures.

use std::time::Duration;
use thiserror::Error;

/// Why a `connect` did not reach `Connected`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectError {
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),

    #[error("gateway rejected credentials: {0}")]
    AuthRejected(String),

    #[error("transport error: {0}")]
    TransportError(String),
}

/// Why a call did not produce a payload.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallError {
    /// Nothing was sent.
    #[error("not connected")]
    NotConnected,

    #[error("request timed out")]
    RequestTimeout,

    #[error("server error: {0}")]
    ServerError(String),

    /// The connection went away while the call was outstanding.
    #[error("connection closed")]
    ConnectionClosed,
}

/// Terminal lifecycle failures, reported on the connection event channel.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LifecycleError {
    #[error("gave up reconnecting after {attempts} attempt(s)")]
    MaxReconnectAttemptsReached { attempts: u32 },
}
