// Connection manager: owns the single shared websocket transport.
//
// One manager instance is created by the application root and handed to
// the engine explicitly; `connect()` starts the transport task exactly
// once and repeated calls are no-ops. The transport itself sits behind
// the `Transport`/`Connector` traits so reconnection can mint fresh
// connections and tests can script them without TCP.
//
// Session lifecycle: dial, send the `auth` command as the first frame,
// wait for `auth:ok`, re-issue `room:join` for every auction currently
// considered joined, then pump frames both ways until the transport
// drops. Transport loss retries with exponential backoff under a bounded
// attempt budget; after exhaustion (or an `auth:error`, which is a
// credential problem rather than a transient fault) the manager parks
// until an explicit `reconnect()` re-arms it.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::config::{AuthConfig, ReconnectConfig};
use crate::protocol::{ClientCommand, ServerEvent};

// ---------------------------------------------------------------------------
// Errors and events
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ConnError {
    #[error("websocket error: {0}")]
    Ws(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("connection closed")]
    Closed,

    #[error("failed to encode outbound command: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Events the manager delivers to the engine. `Up` is diagnostic and may
/// be dropped under backpressure; everything else is always delivered.
#[derive(Debug, PartialEq)]
pub enum ConnEvent {
    /// Transport established and handshake sent.
    Up,
    /// `auth:ok` received; the session is live.
    Authenticated { user_id: String },
    /// `auth:error` received; the manager parks until `reconnect()`.
    AuthFailed { message: String },
    /// A decoded server event.
    Event(ServerEvent),
    /// Transport lost; a retry follows if budget remains.
    Down { reason: String },
    /// Retry budget exhausted; requires an explicit `reconnect()`.
    GaveUp,
}

// ---------------------------------------------------------------------------
// Transport abstraction
// ---------------------------------------------------------------------------

/// One live connection. `recv` yields `None` on clean close.
#[async_trait]
pub trait Transport: Send {
    async fn send(&mut self, text: String) -> Result<(), ConnError>;
    async fn recv(&mut self) -> Option<Result<String, ConnError>>;
    async fn close(&mut self);
}

/// Factory minting fresh transports, once per (re)connection attempt.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn Transport>, ConnError>;
}

/// Production connector dialing the configured websocket endpoint.
pub struct WsConnector {
    url: String,
}

impl WsConnector {
    pub fn new(url: String) -> Self {
        WsConnector { url }
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self) -> Result<Box<dyn Transport>, ConnError> {
        let (ws, _response) = tokio_tungstenite::connect_async(self.url.as_str()).await?;
        Ok(Box::new(WsTransport { ws }))
    }
}

struct WsTransport {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl Transport for WsTransport {
    async fn send(&mut self, text: String) -> Result<(), ConnError> {
        self.ws.send(Message::Text(text.into())).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Option<Result<String, ConnError>> {
        while let Some(item) = self.ws.next().await {
            match item {
                Ok(Message::Text(text)) => return Some(Ok(text.to_string())),
                Ok(Message::Close(_)) => return None,
                Err(e) => return Some(Err(e.into())),
                _ => {
                    // Ignore Binary, Ping, Pong, Frame variants.
                }
            }
        }
        None
    }

    async fn close(&mut self) {
        let _ = self.ws.close(None).await;
    }
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

enum Control {
    Rearm,
    Shutdown,
}

struct Inner {
    connector: Box<dyn Connector>,
    auth: AuthConfig,
    reconnect: ReconnectConfig,
    started: AtomicBool,
    joined: Mutex<HashSet<String>>,
    event_tx: mpsc::Sender<ConnEvent>,
    outbound_tx: mpsc::Sender<ClientCommand>,
    outbound_rx: Mutex<Option<mpsc::Receiver<ClientCommand>>>,
    control_tx: mpsc::Sender<Control>,
    control_rx: Mutex<Option<mpsc::Receiver<Control>>>,
}

#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    pub fn new(
        connector: Box<dyn Connector>,
        auth: AuthConfig,
        reconnect: ReconnectConfig,
        event_tx: mpsc::Sender<ConnEvent>,
    ) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::channel(64);
        let (control_tx, control_rx) = mpsc::channel(8);
        ConnectionManager {
            inner: Arc::new(Inner {
                connector,
                auth,
                reconnect,
                started: AtomicBool::new(false),
                joined: Mutex::new(HashSet::new()),
                event_tx,
                outbound_tx,
                outbound_rx: Mutex::new(Some(outbound_rx)),
                control_tx,
                control_rx: Mutex::new(Some(control_rx)),
            }),
        }
    }

    /// Start the transport task. Exactly one task for the process
    /// lifetime; repeated calls are no-ops.
    pub fn connect(&self) {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            debug!("connect() called again; transport task already running");
            return;
        }
        let inner = self.inner.clone();
        let outbound_rx = inner.outbound_rx.lock().unwrap_or_else(|e| e.into_inner()).take();
        let control_rx = inner.control_rx.lock().unwrap_or_else(|e| e.into_inner()).take();
        let (Some(outbound_rx), Some(control_rx)) = (outbound_rx, control_rx) else {
            warn!("transport task channels already taken; connect ignored");
            return;
        };
        tokio::spawn(run_sessions(inner, outbound_rx, control_rx));
    }

    /// Re-arm after the retry budget was exhausted (user-triggered retry).
    pub fn reconnect(&self) {
        let _ = self.inner.control_tx.try_send(Control::Rearm);
    }

    /// Stop the transport task and close the connection.
    pub async fn shutdown(&self) {
        let _ = self.inner.control_tx.send(Control::Shutdown).await;
    }

    /// Idempotent room join keyed by auction id. Already-joined ids send
    /// nothing; the membership is re-established automatically on every
    /// reconnect.
    pub fn join_auction(&self, auction_id: &str) {
        let newly_joined = self
            .inner
            .joined
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(auction_id.to_string());
        if newly_joined {
            self.send(ClientCommand::JoinRoom {
                auction_id: auction_id.to_string(),
            });
        }
    }

    /// Idempotent room leave; a leave for a non-joined id is a no-op and
    /// sends nothing.
    pub fn leave_auction(&self, auction_id: &str) {
        let was_joined = self
            .inner
            .joined
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(auction_id);
        if was_joined {
            self.send(ClientCommand::LeaveRoom {
                auction_id: auction_id.to_string(),
            });
        }
    }

    pub fn joined_auctions(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .inner
            .joined
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    /// Queue an outbound command for the transport task.
    pub fn send(&self, command: ClientCommand) {
        if self.inner.outbound_tx.try_send(command).is_err() {
            warn!("outbound command queue full; command dropped");
        }
    }
}

// ---------------------------------------------------------------------------
// Transport task
// ---------------------------------------------------------------------------

fn backoff_delay(reconnect: &ReconnectConfig, attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(16);
    let delay = reconnect
        .base_delay_ms
        .saturating_mul(1u64 << exp)
        .min(reconnect.max_delay_ms);
    Duration::from_millis(delay)
}

/// Diagnostic events must never block UI logic: deliver with `try_send`
/// and drop with a warning when the channel is full.
fn emit_diag(inner: &Inner, event: ConnEvent) {
    if let Err(e) = inner.event_tx.try_send(event) {
        warn!("diagnostic connection event dropped: {e}");
    }
}

/// Disconnect-class and data events are always delivered.
async fn emit(inner: &Inner, event: ConnEvent) -> Result<(), ()> {
    inner.event_tx.send(event).await.map_err(|_| ())
}

enum SessionEnd {
    /// Transport lost; retry. `authenticated` is true only if the session
    /// reached `auth:ok` before dropping; the retry budget resets only
    /// then, so a server that accepts the socket and drops it mid-handshake
    /// still exhausts the bounded attempt count.
    Lost {
        reason: String,
        authenticated: bool,
    },
    /// Auth rejected; park without burning the retry budget.
    AuthRejected(String),
    /// Shutdown requested or engine gone.
    Stop,
}

async fn run_sessions(
    inner: Arc<Inner>,
    mut outbound_rx: mpsc::Receiver<ClientCommand>,
    mut control_rx: mpsc::Receiver<Control>,
) {
    let mut attempt: u32 = 0;
    loop {
        let transport = tokio::select! {
            result = inner.connector.connect() => result,
            control = control_rx.recv() => {
                match control {
                    Some(Control::Shutdown) | None => return,
                    Some(Control::Rearm) => continue,
                }
            }
        };

        match transport {
            Ok(transport) => {
                match run_session(&inner, transport, &mut outbound_rx, &mut control_rx).await {
                    SessionEnd::Lost {
                        reason,
                        authenticated,
                    } => {
                        if emit(&inner, ConnEvent::Down { reason }).await.is_err() {
                            return;
                        }
                        if authenticated {
                            attempt = 1;
                        } else {
                            attempt += 1;
                        }
                    }
                    SessionEnd::AuthRejected(message) => {
                        if emit(&inner, ConnEvent::AuthFailed { message }).await.is_err() {
                            return;
                        }
                        if !park_until_rearm(&mut control_rx).await {
                            return;
                        }
                        attempt = 0;
                        continue;
                    }
                    SessionEnd::Stop => return,
                }
            }
            Err(e) => {
                attempt += 1;
                if emit(
                    &inner,
                    ConnEvent::Down {
                        reason: e.to_string(),
                    },
                )
                .await
                .is_err()
                {
                    return;
                }
            }
        }

        if attempt >= inner.reconnect.max_attempts {
            info!(
                attempts = attempt,
                "reconnect budget exhausted; awaiting explicit retry"
            );
            if emit(&inner, ConnEvent::GaveUp).await.is_err() {
                return;
            }
            if !park_until_rearm(&mut control_rx).await {
                return;
            }
            attempt = 0;
            continue;
        }

        let delay = backoff_delay(&inner.reconnect, attempt.max(1));
        debug!(?delay, attempt, "reconnecting after backoff");
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            control = control_rx.recv() => {
                match control {
                    Some(Control::Shutdown) | None => return,
                    Some(Control::Rearm) => { attempt = 0; }
                }
            }
        }
    }
}

/// Park after giving up; returns `false` on shutdown.
async fn park_until_rearm(control_rx: &mut mpsc::Receiver<Control>) -> bool {
    loop {
        match control_rx.recv().await {
            Some(Control::Rearm) => return true,
            Some(Control::Shutdown) | None => return false,
        }
    }
}

async fn run_session(
    inner: &Inner,
    mut transport: Box<dyn Transport>,
    outbound_rx: &mut mpsc::Receiver<ClientCommand>,
    control_rx: &mut mpsc::Receiver<Control>,
) -> SessionEnd {
    // The first frame is always the auth command.
    let auth = ClientCommand::Auth {
        token: inner.auth.token.clone(),
        dev_user_id: inner.auth.dev_user_id.clone(),
    };
    let frame = match serde_json::to_string(&auth) {
        Ok(f) => f,
        Err(e) => {
            return SessionEnd::Lost {
                reason: format!("encode auth: {e}"),
                authenticated: false,
            }
        }
    };
    if let Err(e) = transport.send(frame).await {
        return SessionEnd::Lost {
            reason: e.to_string(),
            authenticated: false,
        };
    }
    emit_diag(inner, ConnEvent::Up);

    // The connection counts as up only after auth:ok.
    let user_id = loop {
        match transport.recv().await {
            Some(Ok(text)) => match serde_json::from_str::<ServerEvent>(&text) {
                Ok(ServerEvent::AuthOk { user_id }) => break user_id,
                Ok(ServerEvent::AuthError { message }) => {
                    transport.close().await;
                    return SessionEnd::AuthRejected(message);
                }
                Ok(other) => {
                    warn!(?other, "event before auth:ok ignored");
                }
                Err(e) => {
                    warn!("malformed frame during handshake dropped: {e}");
                }
            },
            Some(Err(e)) => {
                return SessionEnd::Lost {
                    reason: e.to_string(),
                    authenticated: false,
                }
            }
            None => {
                return SessionEnd::Lost {
                    reason: "closed during handshake".to_string(),
                    authenticated: false,
                }
            }
        }
    };

    info!(%user_id, "session authenticated");
    if emit(inner, ConnEvent::Authenticated { user_id }).await.is_err() {
        return SessionEnd::Stop;
    }

    // Re-establish room membership for every auction currently joined.
    let joined: Vec<String> = {
        let mut ids: Vec<String> = inner
            .joined
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect();
        ids.sort();
        ids
    };
    for auction_id in joined {
        let command = ClientCommand::JoinRoom { auction_id };
        match serde_json::to_string(&command) {
            Ok(frame) => {
                if let Err(e) = transport.send(frame).await {
                    return SessionEnd::Lost {
                        reason: e.to_string(),
                        authenticated: true,
                    };
                }
            }
            Err(e) => warn!("encode join failed: {e}"),
        }
    }

    // Pump frames both ways until the transport drops.
    loop {
        tokio::select! {
            inbound = transport.recv() => {
                match inbound {
                    Some(Ok(text)) => {
                        match serde_json::from_str::<ServerEvent>(&text) {
                            Ok(event) => {
                                if emit(inner, ConnEvent::Event(event)).await.is_err() {
                                    return SessionEnd::Stop;
                                }
                            }
                            Err(e) => {
                                // Malformed or unknown kinds are dropped at
                                // this boundary; the reconciler never sees
                                // them.
                                warn!("malformed event dropped: {e}");
                            }
                        }
                    }
                    Some(Err(e)) => {
                        return SessionEnd::Lost {
                            reason: e.to_string(),
                            authenticated: true,
                        }
                    }
                    None => {
                        return SessionEnd::Lost {
                            reason: "connection closed".to_string(),
                            authenticated: true,
                        }
                    }
                }
            }
            outbound = outbound_rx.recv() => {
                match outbound {
                    Some(command) => {
                        match serde_json::to_string(&command) {
                            Ok(frame) => {
                                if let Err(e) = transport.send(frame).await {
                                    return SessionEnd::Lost {
                                        reason: e.to_string(),
                                        authenticated: true,
                                    };
                                }
                            }
                            Err(e) => warn!("encode outbound command failed: {e}"),
                        }
                    }
                    None => {
                        transport.close().await;
                        return SessionEnd::Stop;
                    }
                }
            }
            control = control_rx.recv() => {
                match control {
                    Some(Control::Rearm) => {}
                    Some(Control::Shutdown) | None => {
                        transport.close().await;
                        return SessionEnd::Stop;
                    }
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
