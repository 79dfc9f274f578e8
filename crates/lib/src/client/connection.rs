//! Connection manager: the engine task and its public handle.
//!
//! One spawned task owns the link, the connection state, the pending table, the keepalive
//! monitor, and the reconnection policy. [`GatewayClient`] handles talk to it over an mpsc
//! command channel, so every mutation happens on that task. Handshakes and deadline timers
//! run as side tasks that report back over internal channels; stale reports are ignored.

use super::events::{ConnectionEvent, ConnectionState, PushMessage};
use super::keepalive::KeepaliveMonitor;
use super::pending::{CallResult, PendingTable};
use super::reconnect::{ReconnectDecision, ReconnectPhase, ReconnectPolicy};
use super::router::{MessageRouter, Route};
use super::transport::{Connector, Credential, Endpoint, Inbound, Link, Outbound, WsConnector};
use crate::error::{CallError, ConnectError};
use crate::protocol::{Payload, RequestFrame};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::AbortHandle;
use tokio::time::Instant;

const COMMAND_CAPACITY: usize = 256;
const EVENT_CAPACITY: usize = 64;
const PUSH_CAPACITY: usize = 256;

/// Timing and retry knobs for one engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineOptions {
    /// Bound on the handshake.
    pub connect_timeout: Duration,
    /// Deadline for calls made with [`Deadline::Default`].
    pub call_timeout: Duration,
    /// Keepalive probe period; zero disables probes.
    pub keepalive_interval: Duration,
    /// Attempt `n` waits `n * reconnect_base_delay`.
    pub reconnect_base_delay: Duration,
    /// Zero disables automatic reconnection.
    pub max_reconnect_attempts: u32,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            call_timeout: Duration::from_secs(120),
            keepalive_interval: Duration::from_secs(30),
            reconnect_base_delay: Duration::from_secs(2),
            max_reconnect_attempts: 5,
        }
    }
}

/// How long a call may wait for its response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Deadline {
    /// [`EngineOptions::call_timeout`].
    #[default]
    Default,
    After(Duration),
    /// Wait until a response arrives or the connection goes away.
    Never,
}

/// Reconnection progress as seen by callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectStatus {
    pub phase: ReconnectPhase,
    pub attempt: u32,
}

enum Command {
    Connect {
        endpoint: Endpoint,
        credential: Option<Credential>,
        reply: oneshot::Sender<Result<(), ConnectError>>,
    },
    Disconnect {
        reply: oneshot::Sender<()>,
    },
    Call {
        typ: String,
        payload: Payload,
        deadline: Deadline,
        reply: oneshot::Sender<CallResult>,
    },
    Notify {
        typ: String,
        payload: Payload,
        reply: oneshot::Sender<Result<String, CallError>>,
    },
    Send {
        frame: RequestFrame,
        reply: oneshot::Sender<Result<(), CallError>>,
    },
    PendingCount {
        reply: oneshot::Sender<usize>,
    },
    ReconnectStatus {
        reply: oneshot::Sender<ReconnectStatus>,
    },
}

/// Handle to one engine instance. Clones share the engine; it stops when the last clone drops.
#[derive(Clone)]
pub struct GatewayClient {
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<ConnectionState>,
    events: broadcast::Sender<ConnectionEvent>,
    pushes: broadcast::Sender<PushMessage>,
}

impl GatewayClient {
    /// Engine over the WebSocket transport. Must be called inside a tokio runtime.
    pub fn new(options: EngineOptions) -> Self {
        Self::with_connector(WsConnector, options)
    }

    pub fn with_connector(connector: impl Connector, options: EngineOptions) -> Self {
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (pushes, _) = broadcast::channel(PUSH_CAPACITY);
        let (expire_tx, expiries) = mpsc::unbounded_channel();
        let (handshake_tx, handshakes) = mpsc::unbounded_channel();

        let engine = Engine {
            connector: Arc::new(connector),
            commands: commands_rx,
            state: ConnectionState::Disconnected,
            state_tx,
            events: events.clone(),
            router: MessageRouter::new(pushes.clone()),
            pending: PendingTable::new(expire_tx),
            expiries,
            keepalive: KeepaliveMonitor::new(options.keepalive_interval),
            reconnect: ReconnectPolicy::new(
                options.reconnect_base_delay,
                options.max_reconnect_attempts,
            ),
            reconnect_at: None,
            link: None,
            target: None,
            handshake: None,
            handshake_tx,
            handshakes,
            generation: 0,
            options,
        };
        tokio::spawn(engine.run());

        Self {
            commands: commands_tx,
            state: state_rx,
            events,
            pushes,
        }
    }

    /// Connect to `endpoint`. Returns at once when already connected; joins the handshake in
    /// flight when one is running.
    pub async fn connect(
        &self,
        endpoint: &str,
        credential: Option<Credential>,
    ) -> Result<(), ConnectError> {
        let endpoint = Endpoint::parse(endpoint)?;
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Connect {
                endpoint,
                credential,
                reply,
            })
            .await
            .map_err(|_| engine_gone())?;
        rx.await.map_err(|_| engine_gone())?
    }

    /// Close the link and fail every outstanding call. Never triggers reconnection.
    pub async fn disconnect(&self) {
        let (reply, rx) = oneshot::channel();
        if self.commands.send(Command::Disconnect { reply }).await.is_ok() {
            let _ = rx.await;
        }
    }

    /// Send a request and wait for its response with the default deadline.
    pub async fn call(&self, typ: impl Into<String>, payload: Payload) -> CallResult {
        self.call_with(typ, payload, Deadline::Default).await
    }

    pub async fn call_with(
        &self,
        typ: impl Into<String>,
        payload: Payload,
        deadline: Deadline,
    ) -> CallResult {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Call {
                typ: typ.into(),
                payload,
                deadline,
                reply,
            })
            .await
            .map_err(|_| CallError::ConnectionClosed)?;
        rx.await.map_err(|_| CallError::ConnectionClosed)?
    }

    /// Send a request without waiting for a response. Returns the id it was sent under.
    pub async fn notify(
        &self,
        typ: impl Into<String>,
        payload: Payload,
    ) -> Result<String, CallError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Notify {
                typ: typ.into(),
                payload,
                reply,
            })
            .await
            .map_err(|_| CallError::NotConnected)?;
        rx.await.map_err(|_| CallError::NotConnected)?
    }

    /// Send a caller-built frame as is.
    pub async fn send(&self, frame: RequestFrame) -> Result<(), CallError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Send { frame, reply })
            .await
            .map_err(|_| CallError::NotConnected)?;
        rx.await.map_err(|_| CallError::NotConnected)?
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    pub fn subscribe_pushes(&self) -> broadcast::Receiver<PushMessage> {
        self.pushes.subscribe()
    }

    /// Number of calls waiting for a response.
    pub async fn pending_calls(&self) -> usize {
        let (reply, rx) = oneshot::channel();
        if self.commands.send(Command::PendingCount { reply }).await.is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    pub async fn reconnect_status(&self) -> Option<ReconnectStatus> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::ReconnectStatus { reply })
            .await
            .ok()?;
        rx.await.ok()
    }
}

fn engine_gone() -> ConnectError {
    ConnectError::TransportError("engine stopped".to_string())
}

/// Handshake in flight.
struct Handshake {
    generation: u64,
    /// Started by the reconnection policy rather than a caller.
    automatic: bool,
    waiters: Vec<oneshot::Sender<Result<(), ConnectError>>>,
    task: AbortHandle,
}

struct HandshakeOutcome {
    generation: u64,
    result: Result<Link, ConnectError>,
}

struct Engine {
    connector: Arc<dyn Connector>,
    options: EngineOptions,
    commands: mpsc::Receiver<Command>,
    state: ConnectionState,
    state_tx: watch::Sender<ConnectionState>,
    events: broadcast::Sender<ConnectionEvent>,
    router: MessageRouter,
    pending: PendingTable,
    expiries: mpsc::UnboundedReceiver<String>,
    keepalive: KeepaliveMonitor,
    reconnect: ReconnectPolicy,
    reconnect_at: Option<Instant>,
    link: Option<Link>,
    /// Endpoint and credential of the last `connect`, reused by automatic reconnects.
    target: Option<(Endpoint, Option<Credential>)>,
    handshake: Option<Handshake>,
    handshake_tx: mpsc::UnboundedSender<HandshakeOutcome>,
    handshakes: mpsc::UnboundedReceiver<HandshakeOutcome>,
    generation: u64,
}

async fn next_inbound(link: &mut Option<Link>) -> Option<Inbound> {
    match link.as_mut() {
        Some(link) => link.inbound.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

impl Engine {
    async fn run(mut self) {
        loop {
            tokio::select! {
                biased;

                cmd = self.commands.recv() => match cmd {
                    Some(cmd) => self.on_command(cmd),
                    None => {
                        log::debug!("all client handles dropped, stopping engine");
                        self.disconnect();
                        return;
                    }
                },
                Some(outcome) = self.handshakes.recv() => self.on_handshake(outcome),
                inbound = next_inbound(&mut self.link) => self.on_inbound(inbound),
                Some(id) = self.expiries.recv() => {
                    self.pending.expire(&id);
                }
                _ = self.keepalive.tick() => self.on_keepalive(),
                _ = sleep_until(self.reconnect_at) => self.on_reconnect_due(),
            }
        }
    }

    fn on_command(&mut self, cmd: Command) {
        match cmd {
            Command::Connect {
                endpoint,
                credential,
                reply,
            } => self.on_connect(endpoint, credential, reply),
            Command::Disconnect { reply } => {
                self.disconnect();
                let _ = reply.send(());
            }
            Command::Call {
                typ,
                payload,
                deadline,
                reply,
            } => {
                if self.state != ConnectionState::Connected {
                    let _ = reply.send(Err(CallError::NotConnected));
                    return;
                }
                let timeout = match deadline {
                    Deadline::Default => Some(self.options.call_timeout),
                    Deadline::After(after) => Some(after),
                    Deadline::Never => None,
                };
                let id = self.pending.register(&typ, Box::new(reply), timeout);
                self.transmit(RequestFrame::new(id, typ, payload));
            }
            Command::Notify {
                typ,
                payload,
                reply,
            } => {
                if self.state != ConnectionState::Connected {
                    let _ = reply.send(Err(CallError::NotConnected));
                    return;
                }
                let id = self.pending.fresh_id();
                let sent = self.transmit(RequestFrame::new(id.clone(), typ, payload));
                let _ = reply.send(if sent {
                    Ok(id)
                } else {
                    Err(CallError::ConnectionClosed)
                });
            }
            Command::Send { frame, reply } => {
                if self.state != ConnectionState::Connected {
                    let _ = reply.send(Err(CallError::NotConnected));
                    return;
                }
                let sent = self.transmit(frame);
                let _ = reply.send(if sent {
                    Ok(())
                } else {
                    Err(CallError::ConnectionClosed)
                });
            }
            Command::PendingCount { reply } => {
                let _ = reply.send(self.pending.len());
            }
            Command::ReconnectStatus { reply } => {
                let _ = reply.send(ReconnectStatus {
                    phase: self.reconnect.phase(),
                    attempt: self.reconnect.attempt(),
                });
            }
        }
    }

    fn on_connect(
        &mut self,
        endpoint: Endpoint,
        credential: Option<Credential>,
        reply: oneshot::Sender<Result<(), ConnectError>>,
    ) {
        match self.state {
            ConnectionState::Connected => {
                let _ = reply.send(Ok(()));
            }
            ConnectionState::Connecting => match self.handshake.as_mut() {
                Some(handshake) => handshake.waiters.push(reply),
                None => {
                    let _ = reply.send(Err(ConnectError::TransportError(
                        "no handshake in progress".to_string(),
                    )));
                }
            },
            ConnectionState::Disconnected | ConnectionState::Closing => {
                if self.reconnect_at.take().is_some() {
                    log::debug!("manual connect supersedes scheduled reconnect");
                }
                self.reconnect.cancel();
                self.target = Some((endpoint, credential));
                self.start_handshake(false, vec![reply]);
            }
        }
    }

    fn start_handshake(
        &mut self,
        automatic: bool,
        waiters: Vec<oneshot::Sender<Result<(), ConnectError>>>,
    ) {
        let Some((endpoint, credential)) = self.target.clone() else {
            for waiter in waiters {
                let _ = waiter.send(Err(ConnectError::InvalidEndpoint(
                    "no endpoint to connect to".to_string(),
                )));
            }
            return;
        };
        self.generation += 1;
        let generation = self.generation;
        self.set_state(ConnectionState::Connecting);
        log::info!("connecting to {}", endpoint);

        let connector = self.connector.clone();
        let timeout = self.options.connect_timeout;
        let outcomes = self.handshake_tx.clone();
        let task = tokio::spawn(async move {
            let result = match tokio::time::timeout(
                timeout,
                connector.connect(&endpoint, credential.as_ref()),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(ConnectError::ConnectTimeout(timeout)),
            };
            let _ = outcomes.send(HandshakeOutcome { generation, result });
        });
        self.handshake = Some(Handshake {
            generation,
            automatic,
            waiters,
            task: task.abort_handle(),
        });
    }

    fn on_handshake(&mut self, outcome: HandshakeOutcome) {
        let current = self
            .handshake
            .as_ref()
            .map_or(false, |h| h.generation == outcome.generation);
        if !current {
            log::debug!("ignoring stale handshake result");
            return;
        }
        let Some(handshake) = self.handshake.take() else {
            return;
        };
        match outcome.result {
            Ok(link) => {
                self.link = Some(link);
                self.reconnect.on_connected();
                self.keepalive.start();
                self.set_state(ConnectionState::Connected);
                for waiter in handshake.waiters {
                    let _ = waiter.send(Ok(()));
                }
            }
            Err(error) => {
                log::warn!("connect failed: {}", error);
                self.set_state(ConnectionState::Disconnected);
                for waiter in handshake.waiters {
                    let _ = waiter.send(Err(error.clone()));
                }
                if handshake.automatic {
                    if let ReconnectPhase::Attempting { attempt } = self.reconnect.phase() {
                        self.emit(ConnectionEvent::ReconnectFailed { attempt, error });
                    }
                    let decision = self.reconnect.on_attempt_failed();
                    self.apply(decision);
                }
            }
        }
    }

    fn on_inbound(&mut self, inbound: Option<Inbound>) {
        match inbound {
            Some(Inbound::Text(text)) => {
                let route = self.router.dispatch_text(&text, &mut self.pending);
                self.on_routed(route);
            }
            Some(Inbound::Binary(data)) => {
                let route = self.router.dispatch_binary(data, &mut self.pending);
                self.on_routed(route);
            }
            Some(Inbound::Pong) => log::debug!("keepalive pong"),
            Some(Inbound::Closed(reason)) => {
                self.on_lost(&reason.unwrap_or_else(|| "closed by peer".to_string()))
            }
            Some(Inbound::Error(e)) => self.on_lost(&e),
            None => self.on_lost("transport stream ended"),
        }
    }

    fn on_routed(&self, route: Route) {
        match route {
            Route::Late(id) => {
                log::warn!("dropping response for unknown or expired request {}", id)
            }
            Route::Resolved(id) | Route::Rejected(id) => {
                log::debug!("completed request {} ({} pending)", id, self.pending.len())
            }
            Route::Pushed => {}
        }
    }

    fn on_keepalive(&mut self) {
        let Some(link) = self.link.as_ref() else {
            self.keepalive.stop();
            return;
        };
        log::debug!("sending keepalive ping");
        if link.outbound.send(Outbound::Ping).is_err() {
            self.on_lost("keepalive send failed");
        }
    }

    fn on_reconnect_due(&mut self) {
        self.reconnect_at = None;
        if let Some(attempt) = self.reconnect.begin_attempt() {
            log::info!(
                "reconnect attempt {}/{}",
                attempt,
                self.reconnect.max_attempts()
            );
            self.start_handshake(true, Vec::new());
        }
    }

    /// Encode and queue a frame. A closed queue means the transport is gone.
    fn transmit(&mut self, frame: RequestFrame) -> bool {
        let sent = self
            .link
            .as_ref()
            .map_or(false, |link| link.outbound.send(Outbound::Text(frame.encode())).is_ok());
        if sent {
            log::debug!("sent {} frame {}", frame.typ, frame.id);
        } else {
            self.on_lost("outbound queue closed");
        }
        sent
    }

    /// Involuntary loss of an established link.
    fn on_lost(&mut self, reason: &str) {
        if self.state != ConnectionState::Connected {
            return;
        }
        log::warn!("connection lost: {}", reason);
        self.keepalive.stop();
        self.link = None;
        self.set_state(ConnectionState::Disconnected);
        let failed = self.pending.fail_all(CallError::ConnectionClosed);
        if failed > 0 {
            log::info!("failed {} pending call(s) after connection loss", failed);
        }
        let decision = self.reconnect.on_connection_lost();
        self.apply(decision);
    }

    fn apply(&mut self, decision: ReconnectDecision) {
        match decision {
            ReconnectDecision::Retry { attempt, delay } => {
                log::info!("reconnect attempt {} in {:?}", attempt, delay);
                self.reconnect_at = Some(Instant::now() + delay);
                self.emit(ConnectionEvent::ReconnectScheduled { attempt, delay });
            }
            ReconnectDecision::GiveUp(error) => {
                log::warn!("{}", error);
                self.reconnect_at = None;
                self.emit(ConnectionEvent::ReconnectExhausted(error));
            }
        }
    }

    /// Deliberate close from any state.
    fn disconnect(&mut self) {
        if let Some(handshake) = self.handshake.take() {
            handshake.task.abort();
            for waiter in handshake.waiters {
                let _ = waiter.send(Err(ConnectError::TransportError(
                    "connect cancelled by disconnect".to_string(),
                )));
            }
        }
        self.reconnect_at = None;
        if matches!(
            self.reconnect.phase(),
            ReconnectPhase::Scheduled { .. } | ReconnectPhase::Attempting { .. }
        ) {
            self.reconnect.cancel();
        }
        self.keepalive.stop();
        if let Some(link) = self.link.take() {
            self.set_state(ConnectionState::Closing);
            let _ = link.outbound.send(Outbound::Close);
        }
        let failed = self.pending.fail_all(CallError::ConnectionClosed);
        if failed > 0 {
            log::info!("failed {} pending call(s) on disconnect", failed);
        }
        self.set_state(ConnectionState::Disconnected);
    }

    fn set_state(&mut self, next: ConnectionState) {
        if self.state == next {
            return;
        }
        log::info!("connection state {} -> {}", self.state, next);
        self.state = next;
        self.state_tx.send_replace(next);
        self.emit(ConnectionEvent::StateChanged(next));
    }

    fn emit(&self, event: ConnectionEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}
