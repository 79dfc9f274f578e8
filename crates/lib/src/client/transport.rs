//! Transport seam: endpoint parsing, the bearer credential, and the frame link between
//! the engine and a concrete socket.
//!
//! A [`Connector`] performs the handshake and hands back a [`Link`]: an outbound queue the
//! engine writes to and an inbound stream the engine reads from. [`WsConnector`] is the
//! WebSocket implementation; tests plug in their own connector and drive the [`LinkPeer`].

use crate::error::ConnectError;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::fmt;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header::AUTHORIZATION, HeaderValue, StatusCode, Uri};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};

const INBOUND_CAPACITY: usize = 64;

/// Parsed gateway endpoint (`ws://` or `wss://` with a host).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    raw: String,
}

impl Endpoint {
    pub fn parse(raw: &str) -> Result<Self, ConnectError> {
        let raw = raw.trim();
        let uri: Uri = raw
            .parse()
            .map_err(|e| ConnectError::InvalidEndpoint(format!("{}: {}", raw, e)))?;
        match uri.scheme_str() {
            Some("ws") | Some("wss") => {}
            _ => {
                return Err(ConnectError::InvalidEndpoint(format!(
                    "{}: scheme must be ws or wss",
                    raw
                )))
            }
        }
        if uri.host().map_or(true, str::is_empty) {
            return Err(ConnectError::InvalidEndpoint(format!("{}: missing host", raw)));
        }
        Ok(Self {
            raw: raw.to_string(),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Bearer token attached to the handshake. `Debug` never prints the secret.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    pub fn bearer(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn token(&self) -> &str {
        &self.0
    }

    /// `Authorization` header value.
    pub fn header_value(&self) -> String {
        format!("Bearer {}", self.0)
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(***)")
    }
}

/// Engine → transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Text(String),
    /// Transport-level keepalive probe.
    Ping,
    Close,
}

/// Transport → engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Text(String),
    Binary(Vec<u8>),
    Pong,
    /// Peer closed the connection, with its reason when given.
    Closed(Option<String>),
    /// The transport failed and is no longer usable.
    Error(String),
}

/// Engine side of an established connection.
pub struct Link {
    pub outbound: mpsc::UnboundedSender<Outbound>,
    pub inbound: mpsc::Receiver<Inbound>,
}

/// Transport side of an established connection.
pub struct LinkPeer {
    pub outbound: mpsc::UnboundedReceiver<Outbound>,
    pub inbound: mpsc::Sender<Inbound>,
}

impl Link {
    pub fn pair(inbound_capacity: usize) -> (Link, LinkPeer) {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::channel(inbound_capacity);
        (
            Link {
                outbound: out_tx,
                inbound: in_rx,
            },
            LinkPeer {
                outbound: out_rx,
                inbound: in_tx,
            },
        )
    }
}

/// Opens a connection to the gateway. The engine bounds the call with its connect timeout.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(
        &self,
        endpoint: &Endpoint,
        credential: Option<&Credential>,
    ) -> Result<Link, ConnectError>;
}

/// WebSocket connector (tokio-tungstenite).
#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn connect(
        &self,
        endpoint: &Endpoint,
        credential: Option<&Credential>,
    ) -> Result<Link, ConnectError> {
        let mut request = endpoint
            .as_str()
            .into_client_request()
            .map_err(|e| ConnectError::InvalidEndpoint(e.to_string()))?;
        if let Some(credential) = credential {
            let value = HeaderValue::from_str(&credential.header_value()).map_err(|_| {
                ConnectError::AuthRejected("credential is not a valid header value".to_string())
            })?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }

        if endpoint.as_str().starts_with("wss://") {
            // Err means a provider is already installed.
            let _ = rustls::crypto::ring::default_provider().install_default();
        }

        log::debug!("opening websocket to {}", endpoint);
        let ws = match tokio_tungstenite::connect_async(request).await {
            Ok((ws, _)) => ws,
            Err(WsError::Http(response)) => {
                let status = response.status();
                return Err(
                    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
                        ConnectError::AuthRejected(format!("gateway answered {}", status))
                    } else {
                        ConnectError::TransportError(format!("gateway answered {}", status))
                    },
                );
            }
            // The endpoint already parsed, so a URL error here is a transport limitation.
            Err(WsError::Url(e)) => return Err(ConnectError::TransportError(e.to_string())),
            Err(e) => return Err(ConnectError::TransportError(e.to_string())),
        };

        let (link, peer) = Link::pair(INBOUND_CAPACITY);
        let LinkPeer {
            outbound: mut out_rx,
            inbound: in_tx,
        } = peer;
        let (mut sink, mut stream) = ws.split();

        tokio::spawn(async move {
            while let Some(out) = out_rx.recv().await {
                let msg = match out {
                    Outbound::Text(text) => Message::Text(text),
                    Outbound::Ping => Message::Ping(Vec::new()),
                    Outbound::Close => break,
                };
                if let Err(e) = sink.send(msg).await {
                    log::debug!("websocket write failed: {}", e);
                    break;
                }
            }
            let _ = sink.close().await;
        });

        tokio::spawn(async move {
            while let Some(item) = stream.next().await {
                let event = match item {
                    Ok(Message::Text(text)) => Inbound::Text(text),
                    Ok(Message::Binary(data)) => Inbound::Binary(data),
                    Ok(Message::Pong(_)) => Inbound::Pong,
                    Ok(Message::Ping(_)) | Ok(Message::Frame(_)) => continue,
                    Ok(Message::Close(frame)) => {
                        let reason = frame
                            .map(|f| f.reason.to_string())
                            .filter(|r| !r.is_empty());
                        let _ = in_tx.send(Inbound::Closed(reason)).await;
                        return;
                    }
                    Err(e) => {
                        let _ = in_tx.send(Inbound::Error(e.to_string())).await;
                        return;
                    }
                };
                if in_tx.send(event).await.is_err() {
                    return;
                }
            }
            let _ = in_tx.send(Inbound::Closed(None)).await;
        });

        Ok(link)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ws_and_wss_endpoints() {
        assert!(Endpoint::parse("ws://127.0.0.1:15151/ws").is_ok());
        assert!(Endpoint::parse(" wss://gateway.example.com/ws ").is_ok());
        assert_eq!(
            Endpoint::parse("wss://gateway.example.com/ws").unwrap().as_str(),
            "wss://gateway.example.com/ws"
        );
    }

    #[test]
    fn rejects_unusable_endpoints() {
        for raw in ["", "not a url", "http://127.0.0.1/ws", "127.0.0.1:15151", "ws:///ws"] {
            assert!(
                matches!(Endpoint::parse(raw), Err(ConnectError::InvalidEndpoint(_))),
                "{raw:?} should be rejected"
            );
        }
    }

    #[test]
    fn credential_debug_hides_token() {
        let c = Credential::bearer("s3cret");
        assert_eq!(format!("{:?}", c), "Credential(***)");
        assert_eq!(c.header_value(), "Bearer s3cret");
    }

    #[tokio::test]
    async fn wss_handshake_failure_is_a_transport_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        // Accept and hang up without speaking TLS.
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                drop(socket);
            }
        });

        let endpoint = Endpoint::parse(&format!("wss://127.0.0.1:{}/ws", port)).unwrap();
        let result = WsConnector.connect(&endpoint, None).await;
        assert!(
            matches!(result, Err(ConnectError::TransportError(_))),
            "{:?}",
            result.err()
        );
    }

    #[tokio::test]
    async fn link_pair_connects_both_ends() {
        let (mut link, mut peer) = Link::pair(4);
        link.outbound.send(Outbound::Ping).unwrap();
        assert_eq!(peer.outbound.recv().await, Some(Outbound::Ping));
        peer.inbound.send(Inbound::Pong).await.unwrap();
        assert_eq!(link.inbound.recv().await, Some(Inbound::Pong));
    }
}
