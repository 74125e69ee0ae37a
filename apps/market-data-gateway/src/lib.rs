#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::match_same_arms,
        clippy::needless_pass_by_value,
        clippy::needless_collect,
        clippy::option_if_let_else,
        clippy::default_trait_access,
        clippy::items_after_statements,
        clippy::or_fun_call
    )
)]

//! Market Data Gateway - Shared Upstream Stream and REST Governor
//!
//! Keeps exactly one authenticated streaming connection to the upstream
//! market-data provider and fans its messages out to any number of
//! consumers, and fronts the provider's REST endpoints with per-caller rate
//! limiting and a short-lived response cache.
//!
//! # Layers (inside -> outside)
//!
//! - **Domain**: Market data types and subscription bookkeeping
//!   - `streaming`: symbols, channels, typed messages, observer trait
//!   - `subscription`: reference-counted (symbol, channel) registry
//!
//! - **Application**: Use cases and port definitions
//!   - `ports`: streaming transport and REST reference-data interfaces
//!   - `services`: consumer streams, rate-limited cached reference data
//!
//! - **Infrastructure**: Adapters and external integrations
//!   - `upstream`: connection state machine, codec, router, REST client
//!   - `rate_limit`, `cache`: REST governors
//!   - `http`, `health`: axum servers
//!   - `config`, `metrics`, `telemetry`: ambient concerns
//!
//! # Data Flow
//!
//! ```text
//!                      +-------------------+     +---------------+
//! Upstream WS <------> | ConnectionManager |---->| MessageRouter |--> observer 1
//!   (one socket)       +-------------------+     +---------------+--> observer 2
//!                              ^                        |         --> observer N
//!                              | deltas                 | handlers
//!                      +----------------------+         |
//!                      | SubscriptionRegistry |<--------+
//!                      +----------------------+
//!
//! Caller --> RateLimiter --> ResponseCache --(miss)--> Upstream REST
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Market data types and subscription bookkeeping.
pub mod domain;

/// Application layer - Use cases and port definitions.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::streaming::{
    AggregateMessage, Channel, MarketDataObserver, MarketMessage, ObserverError, QuoteMessage,
    SubscriptionKey, Symbol, SymbolError, TradeMessage,
};
pub use domain::subscription::{
    ConsumerId, ObserverHandle, SubscriptionDelta, SubscriptionRegistry, SubscriptionStats,
};

// Ports
pub use application::ports::{
    FrameSink, FrameStream, ReferenceDataPort, RestError, StreamConnector, TransportError,
};

// Services
pub use application::services::{
    ChannelObserver, MarketStream, ReferenceDataConfig, ReferenceDataService, ReferenceQuery,
    RestRoute, RoutePolicy, ServiceError, StatusUpdate, StreamService,
};

// Upstream
pub use infrastructure::upstream::{
    ConnectionConfig, ConnectionEvent, ConnectionManager, ConnectionState, ConnectionStatus,
    MessageRouter, ReconnectConfig, ReconnectScheduler, RestClient, WebSocketConnector,
};

// Governors
pub use infrastructure::cache::ResponseCache;
pub use infrastructure::rate_limit::{BucketConfig, RateLimitExceeded, RateLimiter};

// Servers
pub use infrastructure::health::{HealthServer, HealthServerError, HealthServerState};
pub use infrastructure::http::{ApiError, ApiServer, ApiServerError, ApiState};

// Configuration
pub use infrastructure::config::{ConfigError, GatewayConfig};

// Metrics
pub use infrastructure::metrics::init_metrics;

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};
