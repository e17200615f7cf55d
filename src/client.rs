//! Client-side connection manager.
//!
//! ## Design
//! - One [`ConnectionManager`] per application, cloned into every consumer.
//!   All clones share one socket, one reconnect timer and one set of listener
//!   registries.
//! - State lives behind a `std::sync::Mutex`; no lock is held across `.await`
//!   and listeners always run outside it.
//! - Each live socket is driven by one task that multiplexes outgoing frames,
//!   the close signal and incoming frames with `tokio::select!`.
//!
//! ## Lifecycle
//! `Disconnected → Connecting → Open → Disconnected`, then, unless the close
//! was requested through [`ConnectionManager::close`], a single reconnect is
//! scheduled after the policy interval while the attempt counter is below the
//! cap. A successful open resets the counter.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::{validate_endpoint, ClientConfig, ManualConnect};
use crate::error::{CollabError, Result};
use crate::listeners::{Listeners, Subscription};
use crate::protocol::Inbound;
use crate::transport::{Connector, Transport, TungsteniteConnector};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Open,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Open => write!(f, "open"),
        }
    }
}

/// Result of [`ConnectionManager::connect`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
    /// A dial was started; readiness is signalled by the connect listeners.
    Started,
    /// A socket is already open or being opened, or a final automatic retry
    /// is still scheduled under [`ManualConnect::HonorCap`]. Nothing was done.
    AlreadyActive,
    /// The retry budget is spent and the policy is [`ManualConnect::HonorCap`].
    Exhausted,
}

/// Snapshot for connection indicators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStats {
    pub state: ConnectionState,
    pub reconnect_attempts: u32,
    pub max_reconnect_attempts: u32,
    /// Dials started since the manager was built, automatic or explicit.
    pub dials: u64,
    /// Frames written to the socket. Frames accepted by `send` but lost with
    /// the socket are not counted.
    pub messages_sent: u64,
    pub messages_received: u64,
    pub last_error: Option<String>,
}

struct ManagerState {
    state: ConnectionState,
    reconnect_attempts: u32,
    reconnect_timer: Option<JoinHandle<()>>,
    outgoing: Option<mpsc::UnboundedSender<String>>,
    close_tx: Option<oneshot::Sender<()>>,
    /// Bumped on every dial and on `close()`; stale tasks compare against it.
    generation: u64,
    user_closed: bool,
    dials: u64,
    messages_sent: u64,
    messages_received: u64,
    last_error: Option<String>,
}

impl ManagerState {
    fn new() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            reconnect_attempts: 0,
            reconnect_timer: None,
            outgoing: None,
            close_tx: None,
            generation: 0,
            user_closed: false,
            dials: 0,
            messages_sent: 0,
            messages_received: 0,
            last_error: None,
        }
    }

    fn retry_scheduled(&self) -> bool {
        self.reconnect_timer.as_ref().is_some_and(|t| !t.is_finished())
    }

    fn begin_dial(&mut self) -> u64 {
        self.state = ConnectionState::Connecting;
        self.generation += 1;
        self.dials += 1;
        self.generation
    }
}

struct Inner {
    config: ClientConfig,
    connector: Arc<dyn Connector>,
    state: Mutex<ManagerState>,
    listeners: Listeners<Inbound, CollabError>,
}

/// Shared handle to the single client connection.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("url", &self.inner.config.url)
            .field("state", &self.state())
            .finish()
    }
}

impl ConnectionManager {
    /// Build a manager that dials with tokio-tungstenite.
    pub fn new(config: ClientConfig) -> Result<Self> {
        Self::with_connector(config, Arc::new(TungsteniteConnector))
    }

    /// Build a manager over any [`Connector`]. Fails if the endpoint is not a
    /// `ws://` / `wss://` URL; nothing is dialed yet.
    pub fn with_connector(config: ClientConfig, connector: Arc<dyn Connector>) -> Result<Self> {
        validate_endpoint(&config.url)?;
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                connector,
                state: Mutex::new(ManagerState::new()),
                listeners: Listeners::new(),
            }),
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    // -- connection control --------------------------------------------------

    /// Start connecting unless a socket is already open or opening.
    ///
    /// Returns immediately; use [`on_connect`](Self::on_connect) for readiness.
    /// Must be called from inside a tokio runtime.
    pub fn connect(&self) -> ConnectOutcome {
        let generation = {
            let Some(mut st) = self.inner.lock() else {
                return ConnectOutcome::AlreadyActive;
            };
            if st.state != ConnectionState::Disconnected {
                debug!(state = %st.state, "connect ignored: socket already active");
                return ConnectOutcome::AlreadyActive;
            }
            let policy = &self.inner.config.reconnect;
            if policy.manual_connect == ManualConnect::HonorCap
                && !policy.allows_retry(st.reconnect_attempts)
            {
                if st.retry_scheduled() {
                    debug!("connect deferred: last reconnect attempt still pending");
                    return ConnectOutcome::AlreadyActive;
                }
                warn!(
                    attempts = st.reconnect_attempts,
                    "connect refused: reconnect attempts exhausted"
                );
                return ConnectOutcome::Exhausted;
            }
            if let Some(timer) = st.reconnect_timer.take() {
                timer.abort();
            }
            st.reconnect_attempts = 0;
            st.user_closed = false;
            st.begin_dial()
        };
        tokio::spawn(run_connection(Arc::clone(&self.inner), generation));
        ConnectOutcome::Started
    }

    /// Call [`connect`](Self::connect) after `delay`.
    pub fn connect_after(&self, delay: Duration) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            manager.connect();
        })
    }

    /// Close the socket if there is one and cancel any pending reconnect.
    ///
    /// Disconnect listeners still fire if a socket was open.
    pub fn close(&self) {
        let (timer, close_tx) = {
            let Some(mut st) = self.inner.lock() else {
                return;
            };
            st.user_closed = true;
            // Any in-flight dial or live socket task now holds a stale generation.
            st.generation += 1;
            st.state = ConnectionState::Disconnected;
            st.outgoing = None;
            (st.reconnect_timer.take(), st.close_tx.take())
        };
        if let Some(timer) = timer {
            debug!("pending reconnect cancelled");
            timer.abort();
        }
        if let Some(tx) = close_tx {
            let _ = tx.send(());
        }
        info!("websocket closed by client");
    }

    // -- sending -------------------------------------------------------------

    /// Serialize `message` to JSON and send it.
    ///
    /// Returns `false`, without error, when the socket is not open.
    pub fn send<T: Serialize + ?Sized>(&self, message: &T) -> bool {
        match serde_json::to_string(message) {
            Ok(text) => self.send_text(text),
            Err(e) => {
                warn!(error = %e, "failed to serialize outgoing message");
                false
            }
        }
    }

    /// Send a pre-encoded text frame. Same semantics as [`send`](Self::send).
    pub fn send_text(&self, text: impl Into<String>) -> bool {
        let Some(mut st) = self.inner.lock() else {
            return false;
        };
        if st.state != ConnectionState::Open {
            debug!(state = %st.state, "send dropped: socket not open");
            return false;
        }
        let queued = st
            .outgoing
            .as_ref()
            .is_some_and(|tx| tx.send(text.into()).is_ok());
        if !queued {
            debug!("send dropped: connection task gone");
        }
        queued
    }

    // -- observation ---------------------------------------------------------

    pub fn state(&self) -> ConnectionState {
        self.inner
            .lock()
            .map(|st| st.state)
            .unwrap_or(ConnectionState::Disconnected)
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.lock().map(|st| st.reconnect_attempts).unwrap_or(0)
    }

    /// Whether an automatic reconnect is currently scheduled.
    pub fn reconnect_pending(&self) -> bool {
        self.inner
            .lock()
            .is_some_and(|st| st.retry_scheduled())
    }

    pub fn stats(&self) -> ConnectionStats {
        let max = self.inner.config.reconnect.max_attempts;
        match self.inner.lock() {
            Some(st) => ConnectionStats {
                state: st.state,
                reconnect_attempts: st.reconnect_attempts,
                max_reconnect_attempts: max,
                dials: st.dials,
                messages_sent: st.messages_sent,
                messages_received: st.messages_received,
                last_error: st.last_error.clone(),
            },
            None => ConnectionStats {
                state: ConnectionState::Disconnected,
                reconnect_attempts: 0,
                max_reconnect_attempts: max,
                dials: 0,
                messages_sent: 0,
                messages_received: 0,
                last_error: Some("state lock poisoned".to_string()),
            },
        }
    }

    // -- listeners -----------------------------------------------------------

    pub fn on_message(&self, f: impl Fn(&Inbound) + Send + Sync + 'static) -> Subscription {
        self.inner.listeners.on_message(f)
    }

    pub fn on_connect(&self, f: impl Fn() + Send + Sync + 'static) -> Subscription {
        self.inner.listeners.on_connect(f)
    }

    pub fn on_disconnect(&self, f: impl Fn() + Send + Sync + 'static) -> Subscription {
        self.inner.listeners.on_disconnect(f)
    }

    pub fn on_error(&self, f: impl Fn(&CollabError) + Send + Sync + 'static) -> Subscription {
        self.inner.listeners.on_error(f)
    }

    pub fn unsubscribe(&self, sub: Subscription) -> bool {
        self.inner.listeners.unsubscribe(sub)
    }

    /// Live subscriptions across all four registries.
    pub fn listener_count(&self) -> usize {
        self.inner.listeners.count()
    }
}

// ---------------------------------------------------------------------------
// Connection task
// ---------------------------------------------------------------------------

impl Inner {
    fn lock(&self) -> Option<MutexGuard<'_, ManagerState>> {
        self.state.lock().ok()
    }

    fn is_current(&self, generation: u64) -> bool {
        self.lock().is_some_and(|st| st.generation == generation)
    }

    fn report_error(&self, err: CollabError) {
        if let Some(mut st) = self.lock() {
            st.last_error = Some(err.to_string());
        }
        self.listeners.error.dispatch(&err);
    }

    /// Tear down after a socket (or dial) ends and apply the reconnect policy.
    ///
    /// A stale socket whose successor is already open stays silent, so
    /// listeners never see `disconnect` after the newer `connect`.
    fn finish(self: &Arc<Self>, generation: u64, was_open: bool) {
        let superseded = {
            let Some(mut st) = self.lock() else {
                return;
            };
            if st.generation == generation {
                st.state = ConnectionState::Disconnected;
                st.outgoing = None;
                st.close_tx = None;
                if !st.user_closed {
                    self.schedule_reconnect(&mut st);
                }
                false
            } else {
                st.state == ConnectionState::Open
            }
        };
        if !was_open {
            return;
        }
        if superseded {
            debug!(generation, "stale socket closed after a newer one opened");
            return;
        }
        info!("websocket disconnected");
        self.listeners.disconnect.dispatch(&());
    }

    fn schedule_reconnect(self: &Arc<Self>, st: &mut ManagerState) {
        let policy = &self.config.reconnect;
        if !policy.allows_retry(st.reconnect_attempts) {
            error!(
                max_attempts = policy.max_attempts,
                "giving up: maximum reconnect attempts reached"
            );
            return;
        }
        st.reconnect_attempts += 1;
        let interval = policy.interval();
        info!(
            attempt = st.reconnect_attempts,
            max_attempts = policy.max_attempts,
            delay_ms = interval.as_millis() as u64,
            "scheduling reconnect"
        );
        let inner = Arc::clone(self);
        st.reconnect_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(interval).await;
            inner.reconnect();
        }));
    }

    /// Timer-driven dial. Does not touch the attempt counter.
    fn reconnect(self: &Arc<Self>) {
        let generation = {
            let Some(mut st) = self.lock() else {
                return;
            };
            st.reconnect_timer = None;
            if st.user_closed || st.state != ConnectionState::Disconnected {
                return;
            }
            st.begin_dial()
        };
        tokio::spawn(run_connection(Arc::clone(self), generation));
    }
}

async fn run_connection(inner: Arc<Inner>, generation: u64) {
    let url = inner.config.url.clone();
    debug!(url = %url, generation, "dialing");

    let mut transport = match inner.connector.connect(&url).await {
        Ok(t) => t,
        Err(e) => {
            if inner.is_current(generation) {
                warn!(url = %url, error = %e, "websocket connect failed");
                inner.report_error(e);
            }
            inner.finish(generation, false);
            return;
        }
    };

    let (out_tx, out_rx) = mpsc::unbounded_channel::<String>();
    let (close_tx, close_rx) = oneshot::channel::<()>();
    let opened = match inner.lock() {
        Some(mut st) if st.generation == generation && !st.user_closed => {
            st.state = ConnectionState::Open;
            st.reconnect_attempts = 0;
            st.outgoing = Some(out_tx);
            st.close_tx = Some(close_tx);
            true
        }
        _ => false,
    };
    if !opened {
        debug!("dial completed after close(); discarding socket");
        let _ = transport.close().await;
        return;
    }

    info!(url = %url, "websocket connected");
    inner.listeners.connect.dispatch(&());

    pump(&inner, transport.as_mut(), out_rx, close_rx).await;
    inner.finish(generation, true);
}

async fn pump(
    inner: &Inner,
    transport: &mut dyn Transport,
    mut outgoing: mpsc::UnboundedReceiver<String>,
    mut close_rx: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = &mut close_rx => {
                debug!("close requested");
                if let Err(e) = transport.close().await {
                    debug!(error = %e, "error while closing socket");
                }
                break;
            }

            out = outgoing.recv() => {
                match out {
                    Some(text) => {
                        if let Err(e) = transport.send(text).await {
                            warn!(error = %e, "websocket send failed");
                            inner.report_error(e);
                            break;
                        }
                        if let Some(mut st) = inner.lock() {
                            st.messages_sent += 1;
                        }
                    }
                    // Sender dropped by close(); the close branch may not have run yet.
                    None => {
                        let _ = transport.close().await;
                        break;
                    }
                }
            }

            incoming = transport.recv() => {
                match incoming {
                    Some(Ok(text)) => {
                        if let Some(mut st) = inner.lock() {
                            st.messages_received += 1;
                        }
                        let inbound = Inbound::from_text(&text);
                        match &inbound {
                            Inbound::Raw(_) => debug!("non-JSON frame delivered raw"),
                            Inbound::Unknown { kind, .. } => debug!(kind = %kind, "unknown message type"),
                            Inbound::Invalid { reason, .. } => warn!(reason = %reason, "invalid message"),
                            Inbound::Message(m) => debug!(kind = m.kind(), "message received"),
                        }
                        inner.listeners.message.dispatch(&inbound);
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "websocket transport error");
                        inner.report_error(e);
                    }
                    None => {
                        debug!("socket closed by peer");
                        break;
                    }
                }
            }
        }
    }
}
