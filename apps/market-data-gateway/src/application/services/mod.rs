//! Application Services
//!
//! Services that coordinate domain logic and infrastructure adapters:
//!
//! - [`StreamService`]: consumer subscriptions over the shared upstream stream
//! - [`ReferenceDataService`]: rate-limited, cached REST reference data

mod reference_data;
mod stream;

pub use reference_data::{
    DEFAULT_MAX_BATCH_SYMBOLS, DEFAULT_SEARCH_LIMIT, MAX_SEARCH_LIMIT, ReferenceDataConfig,
    ReferenceDataService, ReferenceQuery, RestRoute, RoutePolicy, ServiceError, symbol_tag,
};
pub use stream::{
    ChannelObserver, DEFAULT_STREAM_BUFFER, MarketStream, StatusUpdate, StreamService,
};
