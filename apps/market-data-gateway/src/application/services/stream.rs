//! Stream Service
//!
//! Consumer-facing entry point to the shared upstream connection. Every
//! consumer gets a [`ConsumerId`]; subscription changes go through the
//! [`ConnectionManager`] so the upstream view stays in step with the
//! registry. Connection health reaches consumers as [`StatusUpdate`]s.

use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};

use futures::{Stream, StreamExt, future};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_stream::wrappers::{BroadcastStream, ReceiverStream};

use crate::domain::streaming::{
    AggregateMessage, Channel, MarketDataObserver, MarketMessage, ObserverError, QuoteMessage,
    Symbol, SymbolError, TradeMessage,
};
use crate::domain::subscription::{ConsumerId, ObserverHandle, SubscriptionDelta};
use crate::infrastructure::upstream::{
    ConnectionEvent, ConnectionManager, ConnectionState, ConnectionStatus,
};

/// Default per-consumer buffer for [`MarketStream`].
pub const DEFAULT_STREAM_BUFFER: usize = 1024;

// =============================================================================
// Channel Observer
// =============================================================================

/// Observer that forwards every message into a bounded mpsc channel.
///
/// Never blocks the router: a full buffer drops the message and reports
/// [`ObserverError::Failed`], a dropped receiver reports
/// [`ObserverError::Closed`].
#[derive(Debug, Clone)]
pub struct ChannelObserver {
    tx: mpsc::Sender<MarketMessage>,
}

impl ChannelObserver {
    /// Wrap a sender.
    #[must_use]
    pub const fn new(tx: mpsc::Sender<MarketMessage>) -> Self {
        Self { tx }
    }

    fn forward(&self, message: MarketMessage) -> Result<(), ObserverError> {
        self.tx.try_send(message).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                ObserverError::Failed("consumer buffer full".to_string())
            }
            mpsc::error::TrySendError::Closed(_) => ObserverError::Closed,
        })
    }
}

impl MarketDataObserver for ChannelObserver {
    fn on_trade(&self, trade: &TradeMessage) -> Result<(), ObserverError> {
        self.forward(MarketMessage::Trade(trade.clone()))
    }

    fn on_quote(&self, quote: &QuoteMessage) -> Result<(), ObserverError> {
        self.forward(MarketMessage::Quote(quote.clone()))
    }

    fn on_aggregate(&self, aggregate: &AggregateMessage) -> Result<(), ObserverError> {
        self.forward(MarketMessage::Aggregate(aggregate.clone()))
    }
}

// =============================================================================
// Status Updates
// =============================================================================

/// Connection health as seen by a stream consumer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusUpdate {
    /// Connection state after the change.
    pub state: ConnectionState,
    /// Whether market data is currently flowing.
    pub data_available: bool,
    /// Why data stopped, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl StatusUpdate {
    fn new(state: ConnectionState, reason: Option<String>) -> Self {
        Self {
            state,
            data_available: state == ConnectionState::Connected,
            reason,
        }
    }

    fn from_status(status: &ConnectionStatus) -> Self {
        let reason = match status.state {
            ConnectionState::Connected => None,
            _ => status.last_error.clone(),
        };
        Self::new(status.state, reason)
    }

    fn from_event(event: ConnectionEvent) -> Self {
        match event {
            ConnectionEvent::StateChanged { to, .. } => Self::new(to, None),
            ConnectionEvent::TransportError(error) => {
                Self::new(ConnectionState::Disconnected, Some(error.to_string()))
            }
            ConnectionEvent::AuthenticationFailed { message } => Self::new(
                ConnectionState::Errored,
                Some(format!("authentication failed: {message}")),
            ),
            ConnectionEvent::MaxReconnectAttemptsExceeded { attempts } => Self::new(
                ConnectionState::Errored,
                Some(format!("reconnect attempts exhausted after {attempts}")),
            ),
        }
    }
}

// =============================================================================
// Stream Service
// =============================================================================

/// Registers consumers against the shared upstream connection.
pub struct StreamService {
    connection: ConnectionManager,
    next_consumer: AtomicU64,
    buffer: usize,
}

impl StreamService {
    /// Create a service over `connection`.
    #[must_use]
    pub const fn new(connection: ConnectionManager) -> Self {
        Self {
            connection,
            next_consumer: AtomicU64::new(1),
            buffer: DEFAULT_STREAM_BUFFER,
        }
    }

    /// Override the per-consumer buffer used by [`Self::open`].
    #[must_use]
    pub const fn with_buffer(mut self, buffer: usize) -> Self {
        self.buffer = buffer;
        self
    }

    /// Allocate a fresh consumer id.
    pub fn next_consumer_id(&self) -> ConsumerId {
        self.next_consumer.fetch_add(1, Ordering::Relaxed)
    }

    /// Register `handler` for every (symbol, channel) pair.
    ///
    /// # Errors
    ///
    /// Returns [`SymbolError::Invalid`] if any symbol fails validation.
    pub fn subscribe(
        &self,
        consumer: ConsumerId,
        symbols: &[Symbol],
        channels: &[Channel],
        handler: ObserverHandle,
    ) -> Result<SubscriptionDelta, SymbolError> {
        let delta = self
            .connection
            .try_reconcile(|registry| registry.subscribe(consumer, symbols, channels, handler))?;
        tracing::debug!(
            consumer,
            symbols = symbols.len(),
            channels = channels.len(),
            upstream_new = delta.subscribe.len(),
            "Consumer subscribed"
        );
        Ok(delta)
    }

    /// Drop the consumer's interest in every (symbol, channel) pair.
    ///
    /// # Errors
    ///
    /// Returns [`SymbolError::Invalid`] if any symbol fails validation.
    pub fn unsubscribe(
        &self,
        consumer: ConsumerId,
        symbols: &[Symbol],
        channels: &[Channel],
    ) -> Result<SubscriptionDelta, SymbolError> {
        let delta = self
            .connection
            .try_reconcile(|registry| registry.unsubscribe(consumer, symbols, channels))?;
        tracing::debug!(
            consumer,
            upstream_removed = delta.unsubscribe.len(),
            "Consumer unsubscribed"
        );
        Ok(delta)
    }

    /// Drop everything a consumer holds.
    pub fn unsubscribe_all(&self, consumer: ConsumerId) -> SubscriptionDelta {
        let delta = self
            .connection
            .reconcile(|registry| registry.unsubscribe_all(consumer));
        tracing::debug!(
            consumer,
            upstream_removed = delta.unsubscribe.len(),
            "Consumer released"
        );
        delta
    }

    /// Subscribe a new consumer and hand back its messages as a stream.
    ///
    /// Dropping the returned [`MarketStream`] releases every key it held.
    ///
    /// # Errors
    ///
    /// Returns [`SymbolError::Invalid`] if any symbol fails validation.
    pub fn open(
        self: &Arc<Self>,
        symbols: &[Symbol],
        channels: &[Channel],
    ) -> Result<MarketStream, SymbolError> {
        let consumer = self.next_consumer_id();
        let (tx, rx) = mpsc::channel(self.buffer.max(1));
        let handler: ObserverHandle = Arc::new(ChannelObserver::new(tx));
        self.subscribe(consumer, symbols, channels, handler)?;

        Ok(MarketStream {
            consumer,
            inner: ReceiverStream::new(rx),
            service: Arc::clone(self),
        })
    }

    /// Connection status for consumers: the current status first, then
    /// one update per connection event. Updates a slow reader falls
    /// behind on are skipped.
    pub fn status_updates(&self) -> impl Stream<Item = StatusUpdate> + Send + 'static + use<> {
        let events = BroadcastStream::new(self.connection.subscribe_events());
        let current = StatusUpdate::from_status(&self.connection.status());

        futures::stream::once(future::ready(current)).chain(
            events.filter_map(|event| future::ready(event.ok().map(StatusUpdate::from_event))),
        )
    }

    /// The connection this service routes through.
    #[must_use]
    pub const fn connection(&self) -> &ConnectionManager {
        &self.connection
    }
}

// =============================================================================
// Market Stream
// =============================================================================

/// A consumer's live message stream.
pub struct MarketStream {
    consumer: ConsumerId,
    inner: ReceiverStream<MarketMessage>,
    service: Arc<StreamService>,
}

impl MarketStream {
    /// The consumer id backing this stream.
    #[must_use]
    pub const fn consumer_id(&self) -> ConsumerId {
        self.consumer
    }
}

impl Stream for MarketStream {
    type Item = MarketMessage;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

impl Drop for MarketStream {
    fn drop(&mut self) {
        self.service.unsubscribe_all(self.consumer);
    }
}
