//! Gatelink core library: the gateway client engine, its wire protocol, and a development
//! gateway that speaks the same protocol.

pub mod client;
pub mod config;
pub mod error;
pub mod gateway;
pub mod init;
pub mod protocol;

pub use client::{Credential, Deadline, EngineOptions, GatewayClient};
pub use error::{CallError, ConnectError, LifecycleError};
