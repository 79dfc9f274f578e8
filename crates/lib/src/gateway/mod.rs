//! Development gateway: HTTP + WebSocket on a single port, speaking the client wire format.
//!
//! Used by the CLI (`gatelink gateway`) and by end-to-end tests. Requests are answered with a
//! correlated response; chat messages are also pushed to other subscribed sockets.

mod server;

pub use server::{run_gateway, serve_gateway};
