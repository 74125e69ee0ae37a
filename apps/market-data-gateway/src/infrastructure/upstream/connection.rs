//! Connection Manager
//!
//! Owns the single physical streaming connection to the upstream feed and
//! runs its state machine:
//!
//! ```text
//! Idle -> Connecting -> Authenticating -> Connected
//!            ^                |              |
//!            |                v              v
//!       Reconnecting <--- Disconnected <-----+
//!                             |
//!                             v
//!                          Errored (terminal until connect())
//! ```
//!
//! A driver task per `connect()` call opens the transport, authenticates,
//! re-sends the registry's full subscription set in one batch on every
//! transition into `Connected`, writes keep-alive pings, and feeds inbound
//! frames to the [`MessageRouter`]. Transport failures go through the
//! [`ReconnectScheduler`]; an authentication rejection goes straight to
//! `Errored` without consuming an attempt.
//!
//! # Consistency
//!
//! Registry mutations made through [`ConnectionManager::reconcile`] and the
//! full-set resend on authentication are serialized on the same link lock.
//! A mutation either happens before the resend (and is covered by it) or
//! after it (and its delta is queued behind it on the same session
//! channel). Each session gets a fresh outbound channel, so a delta
//! computed in one epoch can never be written to a later session.

use std::convert::Infallible;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::codec::JsonCodec;
use super::keepalive::{self, KeepaliveTick, TimerHandle};
use super::messages::{Action, ClientRequest, StatusKind};
use super::reconnect::{ReconnectConfig, ReconnectScheduler};
use super::router::MessageRouter;
use crate::application::ports::{FrameSink, StreamConnector, TransportError};
use crate::domain::subscription::{SubscriptionDelta, SubscriptionRegistry};
use crate::infrastructure::metrics;

// =============================================================================
// Constants
// =============================================================================

/// Default time allowed between sending credentials and the verdict.
pub const DEFAULT_AUTH_TIMEOUT: Duration = Duration::from_secs(10);

/// Default keep-alive ping interval.
pub const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// How long a deliberate disconnect waits for the close handshake.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

// =============================================================================
// State and Events
// =============================================================================

/// Connection state machine values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Not started, or stopped by `disconnect()`.
    Idle,
    /// Opening the transport.
    Connecting,
    /// Transport open, waiting for the authentication verdict.
    Authenticating,
    /// Authenticated; subscriptions are live.
    Connected,
    /// Transport lost; consulting the reconnect scheduler.
    Disconnected,
    /// Waiting out a backoff delay.
    Reconnecting,
    /// Terminal until the next explicit `connect()`.
    Errored,
}

impl ConnectionState {
    /// Stable lowercase name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Authenticating => "authenticating",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Reconnecting => "reconnecting",
            Self::Errored => "errored",
        }
    }

    /// Whether a driver task is (or should be) running in this state.
    #[must_use]
    pub const fn is_running(self) -> bool {
        !matches!(self, Self::Idle | Self::Errored)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status events published to observers of the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// The state machine moved.
    StateChanged {
        /// Previous state.
        from: ConnectionState,
        /// New state.
        to: ConnectionState,
    },
    /// The transport failed; a reconnect may follow.
    TransportError(TransportError),
    /// Credentials were rejected. Terminal.
    AuthenticationFailed {
        /// Provider's message.
        message: String,
    },
    /// The reconnect ceiling was reached. Terminal.
    MaxReconnectAttemptsExceeded {
        /// Attempts made before giving up.
        attempts: u32,
    },
}

/// Point-in-time view of the connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionStatus {
    /// Current state.
    pub state: ConnectionState,
    /// Reconnect attempts since the last successful authentication.
    pub reconnect_attempts: u32,
    /// Most recent transport or authentication error.
    pub last_error: Option<String>,
    /// Number of times `Connected` has been reached.
    pub epoch: u64,
}

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the connection manager.
#[derive(Clone)]
pub struct ConnectionConfig {
    /// Upstream API key sent in the auth frame.
    pub api_key: String,
    /// Backoff and retry ceiling.
    pub reconnect: ReconnectConfig,
    /// Keep-alive ping interval while connected.
    pub keepalive_interval: Duration,
    /// Time allowed for the authentication verdict.
    pub auth_timeout: Duration,
    /// Capacity of the status event channel.
    pub event_capacity: usize,
}

impl ConnectionConfig {
    /// Create a configuration with default timings.
    #[must_use]
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            reconnect: ReconnectConfig::default(),
            keepalive_interval: DEFAULT_KEEPALIVE_INTERVAL,
            auth_timeout: DEFAULT_AUTH_TIMEOUT,
            event_capacity: 64,
        }
    }
}

impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("api_key", &"[REDACTED]")
            .field("reconnect", &self.reconnect)
            .field("keepalive_interval", &self.keepalive_interval)
            .field("auth_timeout", &self.auth_timeout)
            .field("event_capacity", &self.event_capacity)
            .finish()
    }
}

// =============================================================================
// Connection Manager
// =============================================================================

struct DriverHandle {
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

struct Link {
    state: ConnectionState,
    /// Bumped by every connect()/disconnect(); stale drivers check it.
    run_id: u64,
    epoch: u64,
    reconnect_attempts: u32,
    last_error: Option<String>,
    /// Outbound channel of the current `Connected` session.
    session: Option<mpsc::UnboundedSender<ClientRequest>>,
    driver: Option<DriverHandle>,
}

struct Inner {
    config: ConnectionConfig,
    connector: Arc<dyn StreamConnector>,
    registry: Arc<SubscriptionRegistry>,
    router: MessageRouter,
    codec: JsonCodec,
    link: Mutex<Link>,
    events: broadcast::Sender<ConnectionEvent>,
}

/// Handle to the single upstream connection.
///
/// Cheap to clone; all clones share one connection.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    /// Create a manager in the `Idle` state.
    #[must_use]
    pub fn new(
        config: ConnectionConfig,
        connector: Arc<dyn StreamConnector>,
        registry: Arc<SubscriptionRegistry>,
    ) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let router = MessageRouter::new(Arc::clone(&registry));

        Self {
            inner: Arc::new(Inner {
                config,
                connector,
                registry,
                router,
                codec: JsonCodec::new(),
                link: Mutex::new(Link {
                    state: ConnectionState::Idle,
                    run_id: 0,
                    epoch: 0,
                    reconnect_attempts: 0,
                    last_error: None,
                    session: None,
                    driver: None,
                }),
                events,
            }),
        }
    }

    /// Start the connection.
    ///
    /// No-op while a driver is already running. From `Idle` or `Errored`
    /// this spawns a fresh driver onto the current Tokio runtime.
    pub fn connect(&self) {
        let mut link = self.inner.link.lock();
        if link.state.is_running() {
            tracing::debug!(state = %link.state, "Connect ignored, driver already running");
            return;
        }

        link.run_id += 1;
        link.reconnect_attempts = 0;
        let from = link.state;
        link.state = ConnectionState::Connecting;
        // Published before the driver exists, so its transitions follow this one.
        self.inner.state_changed(from, ConnectionState::Connecting);

        let cancel = CancellationToken::new();
        let join = tokio::spawn(drive(
            Arc::clone(&self.inner),
            link.run_id,
            cancel.clone(),
        ));
        // A finished driver from an Errored run is simply replaced.
        link.driver = Some(DriverHandle { cancel, join });
    }

    /// Stop the connection from any state and return to `Idle`.
    ///
    /// Cancels the driver task, which tears down any pending backoff delay
    /// along with the open session, then waits for it to exit.
    pub async fn disconnect(&self) {
        let (from, driver) = {
            let mut link = self.inner.link.lock();
            link.run_id += 1;
            let from = link.state;
            link.state = ConnectionState::Idle;
            link.session = None;
            link.reconnect_attempts = 0;
            self.inner.state_changed(from, ConnectionState::Idle);
            (from, link.driver.take())
        };

        if let Some(driver) = driver {
            driver.cancel.cancel();
            if let Err(e) = driver.join.await {
                tracing::warn!(error = %e, "Connection driver exited abnormally");
            }
        }

        if from != ConnectionState::Idle {
            tracing::info!(from = %from, "Upstream connection stopped");
        }
    }

    /// Mutate the registry and dispatch the resulting delta.
    ///
    /// The delta is written upstream immediately when `Connected`. In any
    /// other state it is discarded: the next transition into `Connected`
    /// re-sends the full subscription set instead.
    pub fn reconcile<F>(&self, mutate: F) -> SubscriptionDelta
    where
        F: FnOnce(&SubscriptionRegistry) -> SubscriptionDelta,
    {
        let Ok(delta) = self.try_reconcile(|registry| Ok::<_, Infallible>(mutate(registry)));
        delta
    }

    /// Fallible form of [`Self::reconcile`].
    ///
    /// # Errors
    ///
    /// Returns the mutation's error. Nothing is sent upstream in that case.
    pub fn try_reconcile<F, E>(&self, mutate: F) -> Result<SubscriptionDelta, E>
    where
        F: FnOnce(&SubscriptionRegistry) -> Result<SubscriptionDelta, E>,
    {
        let link = self.inner.link.lock();
        let delta = mutate(&self.inner.registry)?;
        metrics::set_active_subscriptions(self.inner.registry.stats().key_count);

        if delta.is_empty() {
            return Ok(delta);
        }

        match (&link.session, link.state) {
            (Some(session), ConnectionState::Connected) => {
                if !delta.subscribe.is_empty() {
                    queue(session, ClientRequest::subscribe(&delta.subscribe));
                }
                if !delta.unsubscribe.is_empty() {
                    queue(session, ClientRequest::unsubscribe(&delta.unsubscribe));
                }
            }
            (_, state) => {
                tracing::debug!(
                    state = %state,
                    subscribe = delta.subscribe.len(),
                    unsubscribe = delta.unsubscribe.len(),
                    "Not connected, deferring delta to next full resend"
                );
            }
        }

        Ok(delta)
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.inner.link.lock().state
    }

    /// Snapshot of the connection.
    #[must_use]
    pub fn status(&self) -> ConnectionStatus {
        let link = self.inner.link.lock();
        ConnectionStatus {
            state: link.state,
            reconnect_attempts: link.reconnect_attempts,
            last_error: link.last_error.clone(),
            epoch: link.epoch,
        }
    }

    /// Subscribe to status events.
    #[must_use]
    pub fn subscribe_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.events.subscribe()
    }

    /// The registry this connection serves.
    #[must_use]
    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.inner.registry
    }
}

fn queue(session: &mpsc::UnboundedSender<ClientRequest>, request: ClientRequest) {
    let action = match request.action {
        Action::Unsubscribe => "unsubscribe",
        _ => "subscribe",
    };
    let entries = request.entry_count();
    if session.send(request).is_ok() {
        metrics::record_upstream_entries(action, entries);
    }
}

// =============================================================================
// Driver
// =============================================================================

enum SessionEnd {
    Cancelled,
    AuthRejected(String),
    Transport(TransportError),
}

impl Inner {
    fn emit(&self, event: ConnectionEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    /// Publish a state change. Callers hold the link lock so observers see
    /// transitions in the order they were applied.
    fn state_changed(&self, from: ConnectionState, to: ConnectionState) {
        metrics::set_connection_state(to.as_str());
        if from != to {
            self.emit(ConnectionEvent::StateChanged { from, to });
        }
    }

    /// Move to `to` if `run_id` is still current. Returns false for stale runs.
    fn transition(&self, run_id: u64, to: ConnectionState) -> bool {
        let mut link = self.link.lock();
        if link.run_id != run_id {
            return false;
        }
        let from = link.state;
        link.state = to;
        if to != ConnectionState::Connected {
            link.session = None;
        }
        self.state_changed(from, to);
        true
    }

    fn record_error(&self, run_id: u64, error: &str) {
        let mut link = self.link.lock();
        if link.run_id == run_id {
            link.last_error = Some(error.to_string());
        }
    }

    /// Enter `Connected`, open a session channel and queue the full resend.
    fn on_authenticated(&self, run_id: u64) -> Option<mpsc::UnboundedReceiver<ClientRequest>> {
        let (epoch, resubscribed, rx) = {
            let mut link = self.link.lock();
            if link.run_id != run_id {
                return None;
            }
            let from = link.state;
            link.state = ConnectionState::Connected;
            link.epoch += 1;
            link.reconnect_attempts = 0;

            let (tx, rx) = mpsc::unbounded_channel();
            let keys = self.registry.active_keys();
            if !keys.is_empty() {
                queue(&tx, ClientRequest::subscribe(&keys));
            }
            link.session = Some(tx);
            self.state_changed(from, ConnectionState::Connected);
            (link.epoch, keys.len(), rx)
        };

        tracing::info!(epoch, resubscribed, "Upstream stream authenticated");
        Some(rx)
    }

    /// Enter `Errored` after a credential rejection.
    fn on_auth_rejected(&self, run_id: u64, message: String) {
        tracing::error!(message = %message, "Upstream rejected credentials");
        self.record_error(run_id, &format!("authentication failed: {message}"));
        if self.transition(run_id, ConnectionState::Errored) {
            self.emit(ConnectionEvent::AuthenticationFailed { message });
        }
    }

    /// Run one session: open, authenticate, then pump frames until it ends.
    async fn run_session(
        &self,
        run_id: u64,
        cancel: &CancellationToken,
        scheduler: &mut ReconnectScheduler,
    ) -> SessionEnd {
        let opened = tokio::select! {
            () = cancel.cancelled() => return SessionEnd::Cancelled,
            opened = self.connector.connect() => opened,
        };
        let (mut sink, mut stream) = match opened {
            Ok(halves) => halves,
            Err(e) => return SessionEnd::Transport(e),
        };

        if !self.transition(run_id, ConnectionState::Authenticating) {
            return SessionEnd::Cancelled;
        }
        if let Err(e) = self.write(&mut sink, &ClientRequest::auth(&self.config.api_key)).await {
            return SessionEnd::Transport(e);
        }

        let auth_deadline = tokio::time::sleep(self.config.auth_timeout);
        tokio::pin!(auth_deadline);

        let (tick_tx, mut tick_rx) = mpsc::channel::<KeepaliveTick>(1);
        let mut session_rx: Option<mpsc::UnboundedReceiver<ClientRequest>> = None;
        // Dropping the handle stops the ticker on every exit path.
        let mut keepalive_timer: Option<TimerHandle> = None;

        loop {
            tokio::select! {
                biased;

                () = cancel.cancelled() => {
                    let _ = tokio::time::timeout(CLOSE_TIMEOUT, sink.close()).await;
                    return SessionEnd::Cancelled;
                }
                () = &mut auth_deadline, if session_rx.is_none() => {
                    tracing::warn!(
                        timeout_ms = self.config.auth_timeout.as_millis(),
                        "No authentication verdict from upstream"
                    );
                    return SessionEnd::Transport(TransportError::AuthTimeout);
                }
                Some(request) = recv_session(&mut session_rx) => {
                    if let Err(e) = self.write(&mut sink, &request).await {
                        return SessionEnd::Transport(e);
                    }
                }
                Some(KeepaliveTick) = tick_rx.recv() => {
                    tracing::trace!("Sending keep-alive ping");
                    if let Err(e) = self.write(&mut sink, &ClientRequest::ping()).await {
                        return SessionEnd::Transport(e);
                    }
                }
                frame = stream.next() => {
                    let text = match frame {
                        Some(Ok(text)) => text,
                        Some(Err(e)) => return SessionEnd::Transport(e),
                        None => {
                            return SessionEnd::Transport(TransportError::Closed(
                                "stream ended".to_string(),
                            ));
                        }
                    };

                    for status in self.router.route(&text).statuses {
                        match status.status {
                            StatusKind::AuthSuccess if session_rx.is_none() => {
                                let Some(rx) = self.on_authenticated(run_id) else {
                                    return SessionEnd::Cancelled;
                                };
                                session_rx = Some(rx);
                                scheduler.reset();
                                let timer = keepalive::start(
                                    self.config.keepalive_interval,
                                    tick_tx.clone(),
                                );
                                if let Some(previous) = keepalive_timer.replace(timer) {
                                    previous.cancel();
                                }
                            }
                            StatusKind::AuthFailed => {
                                return SessionEnd::AuthRejected(status.message);
                            }
                            _ => {
                                tracing::debug!(
                                    status = ?status.status,
                                    message = %status.message,
                                    "Upstream status"
                                );
                            }
                        }
                    }
                }
            }
        }
    }

    async fn write(&self, sink: &mut FrameSink, request: &ClientRequest) -> Result<(), TransportError> {
        let text = self
            .codec
            .encode(request)
            .map_err(|e| TransportError::Io(e.to_string()))?;
        sink.send(text).await
    }
}

async fn recv_session(
    rx: &mut Option<mpsc::UnboundedReceiver<ClientRequest>>,
) -> Option<ClientRequest> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Driver task for one `connect()` call.
async fn drive(inner: Arc<Inner>, run_id: u64, cancel: CancellationToken) {
    let mut scheduler = ReconnectScheduler::new(inner.config.reconnect);

    loop {
        if !inner.transition(run_id, ConnectionState::Connecting) {
            return;
        }

        match inner.run_session(run_id, &cancel, &mut scheduler).await {
            SessionEnd::Cancelled => return,
            SessionEnd::AuthRejected(message) => {
                inner.on_auth_rejected(run_id, message);
                return;
            }
            SessionEnd::Transport(error) => {
                tracing::warn!(error = %error, "Upstream transport failed");
                inner.record_error(run_id, &error.to_string());
                if !inner.transition(run_id, ConnectionState::Disconnected) {
                    return;
                }
                inner.emit(ConnectionEvent::TransportError(error));
            }
        }

        let Some(delay) = scheduler.next_delay() else {
            let attempts = scheduler.attempt_count();
            tracing::error!(attempts, "Reconnect attempts exhausted");
            if inner.transition(run_id, ConnectionState::Errored) {
                inner.emit(ConnectionEvent::MaxReconnectAttemptsExceeded { attempts });
            }
            return;
        };

        {
            let mut link = inner.link.lock();
            if link.run_id != run_id {
                return;
            }
            link.reconnect_attempts = scheduler.attempt_count();
        }
        metrics::record_reconnect();
        tracing::info!(
            attempt = scheduler.attempt_count(),
            delay_ms = delay.as_millis(),
            "Reconnecting to upstream stream"
        );
        if !inner.transition(run_id, ConnectionState::Reconnecting) {
            return;
        }

        tokio::select! {
            () = cancel.cancelled() => {
                tracing::info!("Reconnect cancelled during backoff");
                return;
            }
            () = tokio::time::sleep(delay) => {}
        }
    }
}
