//! Typed observer interface for market data consumers.
//!
//! Each channel kind has its own callback so registration and dispatch
//! are checked at compile time. Consumers override the callbacks for the
//! channels they subscribe to; the defaults ignore the message.

use super::{AggregateMessage, MarketMessage, QuoteMessage, TradeMessage};

/// Error returned by an observer callback.
///
/// The router logs it and continues delivering to the remaining observers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ObserverError {
    /// The consumer is gone (receiver dropped, client disconnected).
    #[error("observer closed")]
    Closed,

    /// The consumer rejected the message.
    #[error("observer failed: {0}")]
    Failed(String),
}

/// Receives parsed market data for the keys it is registered under.
///
/// Callbacks run on the connection's read task and must not block.
pub trait MarketDataObserver: Send + Sync {
    /// Called for every trade on a subscribed symbol.
    ///
    /// # Errors
    ///
    /// Implementations may fail; the error is logged and isolated.
    fn on_trade(&self, _trade: &TradeMessage) -> Result<(), ObserverError> {
        Ok(())
    }

    /// Called for every quote on a subscribed symbol.
    ///
    /// # Errors
    ///
    /// Implementations may fail; the error is logged and isolated.
    fn on_quote(&self, _quote: &QuoteMessage) -> Result<(), ObserverError> {
        Ok(())
    }

    /// Called for every minute aggregate on a subscribed symbol.
    ///
    /// # Errors
    ///
    /// Implementations may fail; the error is logged and isolated.
    fn on_aggregate(&self, _aggregate: &AggregateMessage) -> Result<(), ObserverError> {
        Ok(())
    }
}

/// Route a message to the matching typed callback.
///
/// # Errors
///
/// Propagates the observer's error.
pub(crate) fn deliver(
    observer: &dyn MarketDataObserver,
    message: &MarketMessage,
) -> Result<(), ObserverError> {
    match message {
        MarketMessage::Trade(m) => observer.on_trade(m),
        MarketMessage::Quote(m) => observer.on_quote(m),
        MarketMessage::Aggregate(m) => observer.on_aggregate(m),
    }
}
