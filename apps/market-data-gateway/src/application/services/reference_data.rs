//! Reference Data Service
//!
//! Read-through access to the provider's REST endpoints. Every request is
//! admitted by the [`RateLimiter`] first, then served from the
//! [`ResponseCache`] or fetched upstream and cached with per-symbol tags.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::NaiveDate;
use futures::future::join_all;
use serde_json::{Map, Value};

use crate::application::ports::{ReferenceDataPort, RestError};
use crate::domain::streaming::Symbol;
use crate::infrastructure::cache::ResponseCache;
use crate::infrastructure::metrics;
use crate::infrastructure::rate_limit::{BucketConfig, RateLimiter};

/// Default maximum symbols per batch snapshot.
pub const DEFAULT_MAX_BATCH_SYMBOLS: usize = 50;

/// Default page size for ticker search.
pub const DEFAULT_SEARCH_LIMIT: u32 = 10;

/// Largest page size accepted for ticker search.
pub const MAX_SEARCH_LIMIT: u32 = 1000;

// =============================================================================
// Routes
// =============================================================================

/// Rate-limited, cached REST routes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RestRoute {
    /// Single-ticker snapshot.
    Snapshot,
    /// Multi-ticker snapshot.
    BatchSnapshot,
    /// Previous session close.
    PreviousClose,
    /// Ticker reference details.
    TickerDetails,
    /// Grouped daily bars.
    Grouped,
    /// Ticker search.
    Search,
}

impl RestRoute {
    /// Every route.
    #[must_use]
    pub const fn all() -> &'static [Self] {
        &[
            Self::Snapshot,
            Self::BatchSnapshot,
            Self::PreviousClose,
            Self::TickerDetails,
            Self::Grouped,
            Self::Search,
        ]
    }

    /// Route name used for rate-limit buckets and metric labels.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Snapshot => "snapshot",
            Self::BatchSnapshot => "batch_snapshot",
            Self::PreviousClose => "previous_close",
            Self::TickerDetails => "ticker_details",
            Self::Grouped => "grouped",
            Self::Search => "search",
        }
    }

    /// Default bucket. Batch and market-wide routes get less headroom.
    #[must_use]
    pub const fn default_bucket(self) -> BucketConfig {
        match self {
            Self::Snapshot | Self::PreviousClose | Self::TickerDetails => {
                BucketConfig::new(20.0, 10.0)
            }
            Self::BatchSnapshot => BucketConfig::new(5.0, 1.0),
            Self::Grouped => BucketConfig::new(5.0, 0.5),
            Self::Search => BucketConfig::new(10.0, 5.0),
        }
    }

    /// Default cache TTL.
    #[must_use]
    pub const fn default_ttl(self) -> Duration {
        match self {
            Self::Snapshot | Self::BatchSnapshot => Duration::from_secs(5),
            Self::PreviousClose => Duration::from_secs(3600),
            Self::TickerDetails => Duration::from_secs(86_400),
            Self::Grouped => Duration::from_secs(900),
            Self::Search => Duration::from_secs(300),
        }
    }
}

impl fmt::Display for RestRoute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rate-limit and cache policy for one route.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RoutePolicy {
    /// Token bucket per caller.
    pub bucket: BucketConfig,
    /// Cache lifetime of a successful response.
    pub ttl: Duration,
}

impl RoutePolicy {
    /// The route's built-in policy.
    #[must_use]
    pub const fn default_for(route: RestRoute) -> Self {
        Self {
            bucket: route.default_bucket(),
            ttl: route.default_ttl(),
        }
    }
}

/// Service configuration.
#[derive(Debug, Clone)]
pub struct ReferenceDataConfig {
    /// Policy per route.
    pub routes: HashMap<RestRoute, RoutePolicy>,
    /// Largest accepted batch snapshot.
    pub max_batch_symbols: usize,
}

impl Default for ReferenceDataConfig {
    fn default() -> Self {
        Self {
            routes: RestRoute::all()
                .iter()
                .map(|r| (*r, RoutePolicy::default_for(*r)))
                .collect(),
            max_batch_symbols: DEFAULT_MAX_BATCH_SYMBOLS,
        }
    }
}

impl ReferenceDataConfig {
    /// Policy for `route`, falling back to its built-in default.
    #[must_use]
    pub fn policy(&self, route: RestRoute) -> RoutePolicy {
        self.routes
            .get(&route)
            .copied()
            .unwrap_or_else(|| RoutePolicy::default_for(route))
    }
}

// =============================================================================
// Queries
// =============================================================================

/// A single cacheable upstream request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReferenceQuery {
    /// Snapshot for one ticker.
    Snapshot(Symbol),
    /// Previous close for one ticker.
    PreviousClose(Symbol),
    /// Reference details for one ticker.
    TickerDetails(Symbol),
    /// Grouped daily bars.
    Grouped(NaiveDate),
    /// Ticker search.
    Search {
        /// Search text, trimmed.
        query: String,
        /// Page size.
        limit: u32,
    },
}

impl ReferenceQuery {
    /// Build a search query.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::InvalidRequest`] for empty text or a limit
    /// outside `1..=MAX_SEARCH_LIMIT`.
    pub fn search(query: &str, limit: Option<u32>) -> Result<Self, ServiceError> {
        let query = query.trim();
        if query.is_empty() {
            return Err(ServiceError::InvalidRequest(
                "search query must not be empty".to_string(),
            ));
        }
        let limit = limit.unwrap_or(DEFAULT_SEARCH_LIMIT);
        if limit == 0 || limit > MAX_SEARCH_LIMIT {
            return Err(ServiceError::InvalidRequest(format!(
                "limit must be between 1 and {MAX_SEARCH_LIMIT}"
            )));
        }
        Ok(Self::Search {
            query: query.to_string(),
            limit,
        })
    }

    /// Build a grouped-daily query from `YYYY-MM-DD`.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::InvalidRequest`] if the date does not parse.
    pub fn grouped(date: &str) -> Result<Self, ServiceError> {
        NaiveDate::parse_from_str(date, "%Y-%m-%d")
            .map(Self::Grouped)
            .map_err(|_| ServiceError::InvalidRequest(format!("invalid date: {date}")))
    }

    /// Route this query is limited and cached under.
    #[must_use]
    pub const fn route(&self) -> RestRoute {
        match self {
            Self::Snapshot(_) => RestRoute::Snapshot,
            Self::PreviousClose(_) => RestRoute::PreviousClose,
            Self::TickerDetails(_) => RestRoute::TickerDetails,
            Self::Grouped(_) => RestRoute::Grouped,
            Self::Search { .. } => RestRoute::Search,
        }
    }

    /// Cache key.
    #[must_use]
    pub fn cache_key(&self) -> String {
        match self {
            Self::Snapshot(s) | Self::PreviousClose(s) | Self::TickerDetails(s) => {
                format!("{}:{s}", self.route())
            }
            Self::Grouped(date) => format!("grouped:{date}"),
            Self::Search { query, limit } => {
                format!("search:{}:{limit}", query.to_lowercase())
            }
        }
    }

    /// Invalidation tags.
    #[must_use]
    pub fn tags(&self) -> Vec<String> {
        match self {
            Self::Snapshot(s) | Self::PreviousClose(s) | Self::TickerDetails(s) => {
                vec![symbol_tag(s)]
            }
            Self::Grouped(_) => vec!["grouped".to_string()],
            Self::Search { .. } => vec!["search".to_string()],
        }
    }
}

/// Tag shared by every cached response about `symbol`.
#[must_use]
pub fn symbol_tag(symbol: &str) -> String {
    format!("symbol:{symbol}")
}

// =============================================================================
// Errors
// =============================================================================

/// Errors returned by [`ReferenceDataService`].
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    /// The caller's bucket for this route is empty.
    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited {
        /// Time until one token is available.
        retry_after: Duration,
    },

    /// The request was malformed.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The upstream call failed.
    #[error("upstream request failed: {0}")]
    Upstream(#[from] RestError),
}

// =============================================================================
// Service
// =============================================================================

/// Rate-limited, cached access to upstream reference data.
pub struct ReferenceDataService {
    port: Arc<dyn ReferenceDataPort>,
    limiter: RateLimiter,
    cache: ResponseCache<Value>,
    config: ReferenceDataConfig,
}

impl ReferenceDataService {
    /// Create a service over `port`.
    #[must_use]
    pub fn new(port: Arc<dyn ReferenceDataPort>, config: ReferenceDataConfig) -> Self {
        let limiter = RestRoute::all().iter().fold(
            RateLimiter::new(BucketConfig::default()),
            |limiter, route| limiter.with_route(route.as_str(), config.policy(*route).bucket),
        );

        Self {
            port,
            limiter,
            cache: ResponseCache::new(),
            config,
        }
    }

    /// Serve one query for `caller`.
    ///
    /// # Errors
    ///
    /// [`ServiceError::RateLimited`] when the caller's bucket is empty,
    /// [`ServiceError::Upstream`] when the upstream call fails.
    pub async fn fetch(&self, caller: &str, query: &ReferenceQuery) -> Result<Value, ServiceError> {
        let route = query.route();
        self.admit(caller, route)?;
        self.read_through(route, query).await
    }

    /// Serve a snapshot for each symbol as one object keyed by symbol.
    ///
    /// The whole batch costs a single `batch_snapshot` token; each symbol
    /// shares cache entries with the single-ticker route.
    ///
    /// # Errors
    ///
    /// [`ServiceError::InvalidRequest`] for an empty batch or one over the
    /// configured maximum, otherwise as [`Self::fetch`]. Any failed symbol
    /// fails the batch.
    pub async fn fetch_snapshots(
        &self,
        caller: &str,
        symbols: &[Symbol],
    ) -> Result<Value, ServiceError> {
        if symbols.is_empty() {
            return Err(ServiceError::InvalidRequest(
                "at least one symbol is required".to_string(),
            ));
        }
        if symbols.len() > self.config.max_batch_symbols {
            return Err(ServiceError::InvalidRequest(format!(
                "batch of {} symbols exceeds maximum of {}",
                symbols.len(),
                self.config.max_batch_symbols
            )));
        }

        self.admit(caller, RestRoute::BatchSnapshot)?;

        let queries: Vec<ReferenceQuery> = symbols
            .iter()
            .map(|s| ReferenceQuery::Snapshot(s.clone()))
            .collect();
        let results = join_all(
            queries
                .iter()
                .map(|q| self.read_through(RestRoute::BatchSnapshot, q)),
        )
        .await;

        let mut tickers = Map::with_capacity(symbols.len());
        for (symbol, result) in symbols.iter().zip(results) {
            tickers.insert(symbol.clone(), result?);
        }
        Ok(Value::Object(tickers))
    }

    /// Evict every cached response tagged with `symbol`.
    pub fn invalidate_symbol(&self, symbol: &str) -> usize {
        let evicted = self.cache.invalidate_by_tag(&symbol_tag(symbol));
        tracing::info!(symbol, evicted, "Cache invalidated for symbol");
        evicted
    }

    /// Drop expired cache entries.
    pub fn purge_expired(&self) -> usize {
        self.cache.purge_expired()
    }

    /// Live cache entries.
    #[must_use]
    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }

    /// Largest accepted batch snapshot.
    #[must_use]
    pub const fn max_batch_symbols(&self) -> usize {
        self.config.max_batch_symbols
    }

    fn admit(&self, caller: &str, route: RestRoute) -> Result<(), ServiceError> {
        self.limiter.check(caller, route.as_str()).map_err(|e| {
            metrics::record_rate_limited(route.as_str());
            tracing::debug!(
                caller,
                route = %route,
                retry_after_ms = u64::try_from(e.retry_after.as_millis()).unwrap_or(u64::MAX),
                "Rate limited"
            );
            ServiceError::RateLimited {
                retry_after: e.retry_after,
            }
        })
    }

    async fn read_through(
        &self,
        route: RestRoute,
        query: &ReferenceQuery,
    ) -> Result<Value, ServiceError> {
        let key = query.cache_key();
        if let Some(value) = self.cache.get(&key) {
            metrics::record_cache_lookup(route.as_str(), true);
            return Ok(value);
        }
        metrics::record_cache_lookup(route.as_str(), false);

        let started = Instant::now();
        let result = match query {
            ReferenceQuery::Snapshot(s) => self.port.snapshot(s).await,
            ReferenceQuery::PreviousClose(s) => self.port.previous_close(s).await,
            ReferenceQuery::TickerDetails(s) => self.port.ticker_details(s).await,
            ReferenceQuery::Grouped(date) => {
                self.port
                    .grouped_daily(&date.format("%Y-%m-%d").to_string())
                    .await
            }
            ReferenceQuery::Search { query, limit } => {
                self.port.search_tickers(query, *limit).await
            }
        };
        metrics::record_upstream_request(route.as_str(), started.elapsed());

        let value = result.map_err(|e| {
            tracing::warn!(route = %route, key = %key, error = %e, "Upstream request failed");
            e
        })?;

        let ttl = self.config.policy(query.route()).ttl;
        self.cache
            .set_with_tags(key, value.clone(), ttl, query.tags());
        Ok(value)
    }
}
