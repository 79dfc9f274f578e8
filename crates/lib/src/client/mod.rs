//! Gateway client engine.
//!
//! [`GatewayClient`] is the entry point: connect once, then issue calls that resolve with the
//! gateway's correlated response. Pushes and lifecycle events are published on broadcast
//! channels. The transport is pluggable through [`Connector`].

mod connection;
pub mod events;
pub mod keepalive;
pub mod pending;
pub mod reconnect;
pub mod router;
pub mod transport;

pub use connection::{Deadline, EngineOptions, GatewayClient, ReconnectStatus};
pub use events::{ConnectionEvent, ConnectionState, PushMessage};
pub use pending::CallResult;
pub use reconnect::ReconnectPhase;
pub use transport::{
    Connector, Credential, Endpoint, Inbound, Link, LinkPeer, Outbound, WsConnector,
};
