//! Token Bucket Rate Limiter
//!
//! Admission control for the REST routes that front the upstream provider.
//! Buckets are keyed by (caller identity, route) so the same caller gets
//! independent budgets per endpoint, and each route can be configured
//! with its own capacity and refill rate (batch endpoints typically run
//! with a lower capacity).
//!
//! # Algorithm
//!
//! On each check the bucket is refilled by `elapsed * refill_per_sec`,
//! capped at `capacity`. If at least `cost` tokens remain they are
//! consumed; otherwise the request is rejected with the time until
//! `cost` tokens will be available. Rejected requests are never queued.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

// =============================================================================
// Configuration
// =============================================================================

/// Capacity and refill rate for one route's buckets.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketConfig {
    /// Maximum tokens a bucket can hold (burst size).
    pub capacity: f64,
    /// Tokens added per second.
    pub refill_per_sec: f64,
}

impl BucketConfig {
    /// Create a bucket configuration.
    #[must_use]
    pub const fn new(capacity: f64, refill_per_sec: f64) -> Self {
        Self {
            capacity,
            refill_per_sec,
        }
    }
}

impl Default for BucketConfig {
    fn default() -> Self {
        Self::new(10.0, 5.0)
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Rejection returned when a bucket cannot cover the request cost.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("rate limit exceeded, retry after {retry_after:?}")]
pub struct RateLimitExceeded {
    /// Time until enough tokens will be available.
    pub retry_after: Duration,
}

// =============================================================================
// Bucket
// =============================================================================

#[derive(Debug, Clone, Copy)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

impl Bucket {
    const fn full(config: BucketConfig, now: Instant) -> Self {
        Self {
            tokens: config.capacity,
            last_refill: now,
        }
    }

    fn refill(&mut self, config: BucketConfig, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = elapsed
            .mul_add(config.refill_per_sec, self.tokens)
            .min(config.capacity);
        self.last_refill = now;
    }

    fn take(&mut self, config: BucketConfig, cost: f64) -> Result<(), RateLimitExceeded> {
        if self.tokens >= cost {
            self.tokens -= cost;
            return Ok(());
        }

        let missing = cost - self.tokens;
        let retry_after = if config.refill_per_sec > 0.0 {
            Duration::try_from_secs_f64(missing / config.refill_per_sec).unwrap_or(Duration::MAX)
        } else {
            Duration::MAX
        };
        Err(RateLimitExceeded { retry_after })
    }
}

// =============================================================================
// Rate Limiter
// =============================================================================

/// Per-(caller, route) token bucket limiter.
///
/// Buckets are created lazily, full, on a key's first request and are never
/// evicted.
pub struct RateLimiter {
    default: BucketConfig,
    routes: HashMap<String, BucketConfig>,
    buckets: Mutex<HashMap<(String, String), Bucket>>,
}

impl RateLimiter {
    /// Create a limiter using `default` for routes without an override.
    #[must_use]
    pub fn new(default: BucketConfig) -> Self {
        Self {
            default,
            routes: HashMap::new(),
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Override the bucket configuration for one route.
    #[must_use]
    pub fn with_route(mut self, route: impl Into<String>, config: BucketConfig) -> Self {
        self.routes.insert(route.into(), config);
        self
    }

    /// Configuration in effect for a route.
    #[must_use]
    pub fn config_for(&self, route: &str) -> BucketConfig {
        self.routes.get(route).copied().unwrap_or(self.default)
    }

    /// Admit a unit-cost request now.
    ///
    /// # Errors
    ///
    /// Returns [`RateLimitExceeded`] if the bucket is empty.
    pub fn check(&self, caller: &str, route: &str) -> Result<(), RateLimitExceeded> {
        self.check_at(caller, route, 1.0, Instant::now())
    }

    /// Admit a request of `cost` tokens at an explicit instant.
    ///
    /// # Errors
    ///
    /// Returns [`RateLimitExceeded`] if fewer than `cost` tokens remain
    /// after refilling.
    pub fn check_at(
        &self,
        caller: &str,
        route: &str,
        cost: f64,
        now: Instant,
    ) -> Result<(), RateLimitExceeded> {
        let config = self.config_for(route);
        let mut buckets = self.buckets.lock();
        let bucket = buckets
            .entry((caller.to_string(), route.to_string()))
            .or_insert_with(|| Bucket::full(config, now));

        bucket.refill(config, now);
        bucket.take(config, cost)
    }

    /// Number of buckets created so far.
    #[must_use]
    pub fn bucket_count(&self) -> usize {
        self.buckets.lock().len()
    }
}

// =============================================================================
// Tests
// =============================================================================
