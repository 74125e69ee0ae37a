//! Reconnect Scheduler
//!
//! Computes capped exponential backoff delays and enforces a retry
//! ceiling. The scheduler owns no timer: it hands back a delay and the
//! connection driver sleeps on it inside a cancellable `select!`.
//!
//! `delay(n) = min(base * 2^n, ceiling)` for the n-th consecutive failure
//! (counting from 0). The count resets on every successful authentication.

use std::time::Duration;

use rand::Rng;

/// Configuration for reconnection behavior.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReconnectConfig {
    /// Delay before the first reconnection attempt.
    pub base_delay: Duration,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
    /// Jitter as a fraction of the delay (0.0 disables jitter).
    pub jitter_factor: f64,
    /// Maximum consecutive reconnection attempts (0 = unlimited).
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            jitter_factor: 0.0,
            max_attempts: 5,
        }
    }
}

impl ReconnectConfig {
    /// Create a configuration without jitter.
    #[must_use]
    pub const fn new(base_delay: Duration, max_delay: Duration, max_attempts: u32) -> Self {
        Self {
            base_delay,
            max_delay,
            jitter_factor: 0.0,
            max_attempts,
        }
    }

    /// Set the jitter fraction.
    #[must_use]
    pub const fn with_jitter(mut self, jitter_factor: f64) -> Self {
        self.jitter_factor = jitter_factor;
        self
    }
}

/// Backoff state for one connection.
///
/// # Example
///
/// ```rust
/// use market_data_gateway::infrastructure::upstream::reconnect::{ReconnectConfig, ReconnectScheduler};
/// use std::time::Duration;
///
/// let config = ReconnectConfig::new(Duration::from_millis(100), Duration::from_secs(1), 3);
/// let mut scheduler = ReconnectScheduler::new(config);
///
/// assert_eq!(scheduler.next_delay(), Some(Duration::from_millis(100)));
/// assert_eq!(scheduler.next_delay(), Some(Duration::from_millis(200)));
/// assert_eq!(scheduler.next_delay(), Some(Duration::from_millis(400)));
/// assert_eq!(scheduler.next_delay(), None);
///
/// // Successful connection
/// scheduler.reset();
/// assert_eq!(scheduler.attempt_count(), 0);
/// ```
#[derive(Debug)]
pub struct ReconnectScheduler {
    config: ReconnectConfig,
    attempt_count: u32,
}

impl ReconnectScheduler {
    /// Create a scheduler with no attempts consumed.
    #[must_use]
    pub const fn new(config: ReconnectConfig) -> Self {
        Self {
            config,
            attempt_count: 0,
        }
    }

    /// Un-jittered delay for the given attempt index.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.config
            .base_delay
            .checked_mul(factor)
            .map_or(self.config.max_delay, |d| d.min(self.config.max_delay))
    }

    /// Consume one attempt and return its delay.
    ///
    /// Returns `None` once the attempt ceiling has been reached.
    #[must_use]
    pub fn next_delay(&mut self) -> Option<Duration> {
        if !self.should_retry() {
            return None;
        }

        let delay = self.apply_jitter(self.delay_for(self.attempt_count));
        self.attempt_count += 1;
        Some(delay)
    }

    /// Reset after a successful connection.
    pub const fn reset(&mut self) {
        self.attempt_count = 0;
    }

    /// Get the number of attempts consumed since the last reset.
    #[must_use]
    pub const fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    /// Check if another attempt is allowed.
    #[must_use]
    pub const fn should_retry(&self) -> bool {
        self.config.max_attempts == 0 || self.attempt_count < self.config.max_attempts
    }

    /// Get the configuration.
    #[must_use]
    pub const fn config(&self) -> &ReconnectConfig {
        &self.config
    }

    fn apply_jitter(&self, duration: Duration) -> Duration {
        if self.config.jitter_factor <= 0.0 {
            return duration;
        }

        #[allow(clippy::cast_precision_loss)]
        let base_millis = duration.as_millis() as f64;
        let jitter_range = base_millis * self.config.jitter_factor;
        let jitter: f64 = rand::rng().random_range(-jitter_range..=jitter_range);
        let adjusted_millis = (base_millis + jitter).max(1.0);

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let adjusted_u64 = adjusted_millis as u64;
        Duration::from_millis(adjusted_u64)
    }
}
