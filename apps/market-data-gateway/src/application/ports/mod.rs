//! Port Interfaces
//!
//! Defines the interfaces (ports) for external systems following
//! the Hexagonal Architecture pattern. These are the contracts that
//! infrastructure adapters must implement.
//!
//! ## Driven Ports (Outbound)
//!
//! - [`StreamConnector`]: opens the single upstream streaming transport
//! - [`ReferenceDataPort`]: the provider's REST reference-data endpoints

use std::pin::Pin;

use async_trait::async_trait;
use futures::{Sink, Stream};
use serde_json::Value;

// =============================================================================
// Streaming Transport
// =============================================================================

/// Transport-level failure. Always retryable.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// Could not open the connection.
    #[error("connect failed: {0}")]
    Connect(String),

    /// Peer closed the connection.
    #[error("connection closed: {0}")]
    Closed(String),

    /// Read or write failed.
    #[error("transport I/O error: {0}")]
    Io(String),

    /// Authentication was neither accepted nor rejected in time.
    #[error("authentication timed out")]
    AuthTimeout,
}

/// Outbound half of a connection: text frames.
pub type FrameSink = Pin<Box<dyn Sink<String, Error = TransportError> + Send>>;

/// Inbound half of a connection: text frames.
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<String, TransportError>> + Send>>;

/// Opens the upstream streaming transport.
///
/// Implementations only deal in text frames; framing, pings at the
/// protocol level, and binary frames are handled inside the adapter.
#[async_trait]
pub trait StreamConnector: Send + Sync {
    /// Open a new connection.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Connect`] if the connection cannot be opened.
    async fn connect(&self) -> Result<(FrameSink, FrameStream), TransportError>;
}

// =============================================================================
// Reference Data
// =============================================================================

/// Errors returned by the upstream REST API.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RestError {
    /// Request could not be sent or the response could not be read.
    #[error("request failed: {0}")]
    Request(String),

    /// Upstream returned a non-success status.
    #[error("upstream returned {status}: {body}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Truncated response body.
        body: String,
    },

    /// Response body was not valid JSON.
    #[error("invalid response body: {0}")]
    Decode(String),
}

/// The provider's REST reference-data surface.
///
/// Payloads are opaque JSON; the gateway caches and forwards them as-is.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ReferenceDataPort: Send + Sync {
    /// Latest snapshot for one ticker.
    async fn snapshot(&self, symbol: &str) -> Result<Value, RestError>;

    /// Previous session's OHLCV for one ticker.
    async fn previous_close(&self, symbol: &str) -> Result<Value, RestError>;

    /// Reference details (name, exchange, market cap, ...) for one ticker.
    async fn ticker_details(&self, symbol: &str) -> Result<Value, RestError>;

    /// Grouped daily bars for the whole market on `date` (`YYYY-MM-DD`).
    async fn grouped_daily(&self, date: &str) -> Result<Value, RestError>;

    /// Ticker search by name or symbol fragment.
    async fn search_tickers(&self, query: &str, limit: u32) -> Result<Value, RestError>;
}
