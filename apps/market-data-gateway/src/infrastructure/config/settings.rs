//! Gateway Configuration Settings
//!
//! Configuration types for the gateway, loaded from environment variables.

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use crate::application::services::{
    DEFAULT_MAX_BATCH_SYMBOLS, ReferenceDataConfig, RestRoute, RoutePolicy,
};
use crate::infrastructure::rate_limit::BucketConfig;
use crate::infrastructure::upstream::connection::{
    DEFAULT_AUTH_TIMEOUT, DEFAULT_KEEPALIVE_INTERVAL,
};
use crate::infrastructure::upstream::{
    ConnectionConfig, DEFAULT_REST_URL, DEFAULT_STREAM_URL, ReconnectConfig,
};

/// Upstream provider credentials.
#[derive(Clone)]
pub struct Credentials {
    api_key: String,
}

impl Credentials {
    /// Create new credentials.
    #[must_use]
    pub const fn new(api_key: String) -> Self {
        Self { api_key }
    }

    /// Get the API key.
    #[must_use]
    pub fn api_key(&self) -> &str {
        &self.api_key
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &"[REDACTED]")
            .finish()
    }
}

/// Upstream endpoints.
#[derive(Debug, Clone)]
pub struct UpstreamSettings {
    /// Streaming WebSocket URL.
    pub stream_url: String,
    /// REST base URL.
    pub rest_url: String,
    /// Per-request REST timeout.
    pub rest_timeout: Duration,
}

impl Default for UpstreamSettings {
    fn default() -> Self {
        Self {
            stream_url: DEFAULT_STREAM_URL.to_string(),
            rest_url: DEFAULT_REST_URL.to_string(),
            rest_timeout: crate::infrastructure::upstream::DEFAULT_REST_TIMEOUT,
        }
    }
}

/// Streaming connection settings.
#[derive(Debug, Clone)]
pub struct StreamSettings {
    /// Base reconnect delay.
    pub reconnect_delay_base: Duration,
    /// Reconnect delay ceiling.
    pub reconnect_delay_max: Duration,
    /// Maximum reconnect attempts before giving up (0 = unlimited).
    pub max_reconnect_attempts: u32,
    /// Jitter fraction applied to each delay, in `[0, 1]`.
    pub reconnect_jitter: f64,
    /// Keep-alive ping interval.
    pub keepalive_interval: Duration,
    /// Time allowed for the authentication verdict.
    pub auth_timeout: Duration,
}

impl Default for StreamSettings {
    fn default() -> Self {
        let reconnect = ReconnectConfig::default();
        Self {
            reconnect_delay_base: reconnect.base_delay,
            reconnect_delay_max: reconnect.max_delay,
            max_reconnect_attempts: reconnect.max_attempts,
            reconnect_jitter: reconnect.jitter_factor,
            keepalive_interval: DEFAULT_KEEPALIVE_INTERVAL,
            auth_timeout: DEFAULT_AUTH_TIMEOUT,
        }
    }
}

/// Server port settings.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    /// Caller-facing REST API port.
    pub api_port: u16,
    /// Health check HTTP port.
    pub health_port: u16,
    /// Period of the cache sweeper.
    pub cache_sweep_interval: Duration,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            api_port: 8080,
            health_port: 8082,
            cache_sweep_interval: Duration::from_secs(60),
        }
    }
}

/// Complete gateway configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// API credentials.
    pub credentials: Credentials,
    /// Upstream endpoints.
    pub upstream: UpstreamSettings,
    /// Streaming connection settings.
    pub stream: StreamSettings,
    /// Server port settings.
    pub server: ServerSettings,
    /// Rate limits, cache TTLs, and batch ceiling.
    pub reference: ReferenceDataConfig,
}

impl GatewayConfig {
    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if required environment variables are missing or
    /// any value fails to parse.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from an arbitrary key lookup.
    ///
    /// # Errors
    ///
    /// As [`Self::from_env`].
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(&lookup);

        let api_key = env
            .get("MARKET_DATA_API_KEY")
            .ok_or_else(|| ConfigError::MissingEnvVar("MARKET_DATA_API_KEY".to_string()))?;
        if api_key.trim().is_empty() {
            return Err(ConfigError::EmptyValue("MARKET_DATA_API_KEY".to_string()));
        }

        let upstream_defaults = UpstreamSettings::default();
        let upstream = UpstreamSettings {
            stream_url: env
                .get("MARKET_DATA_STREAM_URL")
                .unwrap_or(upstream_defaults.stream_url),
            rest_url: env
                .get("MARKET_DATA_REST_URL")
                .unwrap_or(upstream_defaults.rest_url),
            rest_timeout: env.duration_secs(
                "MARKET_DATA_REST_TIMEOUT_SECS",
                upstream_defaults.rest_timeout,
            )?,
        };

        let stream_defaults = StreamSettings::default();
        let stream = StreamSettings {
            reconnect_delay_base: env.positive_millis(
                "GATEWAY_RECONNECT_DELAY_BASE_MS",
                stream_defaults.reconnect_delay_base,
            )?,
            reconnect_delay_max: env.positive_secs(
                "GATEWAY_RECONNECT_DELAY_MAX_SECS",
                stream_defaults.reconnect_delay_max,
            )?,
            max_reconnect_attempts: env.parse(
                "GATEWAY_MAX_RECONNECT_ATTEMPTS",
                stream_defaults.max_reconnect_attempts,
            )?,
            reconnect_jitter: env.parse(
                "GATEWAY_RECONNECT_JITTER",
                stream_defaults.reconnect_jitter,
            )?,
            keepalive_interval: env.positive_secs(
                "GATEWAY_KEEPALIVE_INTERVAL_SECS",
                stream_defaults.keepalive_interval,
            )?,
            auth_timeout: env.positive_secs(
                "GATEWAY_AUTH_TIMEOUT_SECS",
                stream_defaults.auth_timeout,
            )?,
        };
        if !(0.0..=1.0).contains(&stream.reconnect_jitter) {
            return Err(ConfigError::InvalidValue {
                key: "GATEWAY_RECONNECT_JITTER".to_string(),
                reason: "must be between 0 and 1".to_string(),
            });
        }

        let server_defaults = ServerSettings::default();
        let server = ServerSettings {
            api_port: env.parse("GATEWAY_API_PORT", server_defaults.api_port)?,
            health_port: env.parse("GATEWAY_HEALTH_PORT", server_defaults.health_port)?,
            cache_sweep_interval: env.positive_secs(
                "GATEWAY_CACHE_SWEEP_INTERVAL_SECS",
                server_defaults.cache_sweep_interval,
            )?,
        };

        let mut routes = HashMap::new();
        for route in RestRoute::all() {
            routes.insert(*route, route_policy(&env, *route)?);
        }
        let reference = ReferenceDataConfig {
            routes,
            max_batch_symbols: env.parse("GATEWAY_MAX_BATCH_SYMBOLS", DEFAULT_MAX_BATCH_SYMBOLS)?,
        };

        Ok(Self {
            credentials: Credentials::new(api_key),
            upstream,
            stream,
            server,
            reference,
        })
    }

    /// Connection manager configuration derived from these settings.
    #[must_use]
    pub fn connection_config(&self) -> ConnectionConfig {
        let mut config = ConnectionConfig::new(self.credentials.api_key());
        config.reconnect = ReconnectConfig::new(
            self.stream.reconnect_delay_base,
            self.stream.reconnect_delay_max,
            self.stream.max_reconnect_attempts,
        )
        .with_jitter(self.stream.reconnect_jitter);
        config.keepalive_interval = self.stream.keepalive_interval;
        config.auth_timeout = self.stream.auth_timeout;
        config
    }
}

fn route_policy(env: &Env<'_>, route: RestRoute) -> Result<RoutePolicy, ConfigError> {
    let defaults = RoutePolicy::default_for(route);
    let name = route.as_str().to_uppercase();

    let capacity_key = format!("GATEWAY_RATE_LIMIT_{name}_CAPACITY");
    let capacity: f64 = env.parse(&capacity_key, defaults.bucket.capacity)?;
    if !capacity.is_finite() || capacity < 1.0 {
        return Err(ConfigError::InvalidValue {
            key: capacity_key,
            reason: "must be a finite number of at least 1".to_string(),
        });
    }

    let refill_key = format!("GATEWAY_RATE_LIMIT_{name}_REFILL_PER_SEC");
    let refill: f64 = env.parse(&refill_key, defaults.bucket.refill_per_sec)?;
    if !refill.is_finite() || refill < 0.0 {
        return Err(ConfigError::InvalidValue {
            key: refill_key,
            reason: "must be a finite, non-negative rate".to_string(),
        });
    }

    Ok(RoutePolicy {
        bucket: BucketConfig::new(capacity, refill),
        ttl: env.duration_secs(&format!("GATEWAY_CACHE_TTL_{name}_SECS"), defaults.ttl)?,
    })
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),
    /// Environment variable has empty value.
    #[error("environment variable {0} cannot be empty")]
    EmptyValue(String),
    /// Environment variable could not be parsed or is out of range.
    #[error("invalid value for {key}: {reason}")]
    InvalidValue {
        /// Variable name.
        key: String,
        /// What was wrong.
        reason: String,
    },
}

struct Env<'a>(&'a dyn Fn(&str) -> Option<String>);

impl Env<'_> {
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key).filter(|v| !v.trim().is_empty())
    }

    fn parse<T: FromStr>(&self, key: &str, default: T) -> Result<T, ConfigError> {
        self.get(key).map_or(Ok(default), |v| {
            v.trim().parse().map_err(|_| ConfigError::InvalidValue {
                key: key.to_string(),
                reason: format!("cannot parse {v:?}"),
            })
        })
    }

    fn duration_secs(&self, key: &str, default: Duration) -> Result<Duration, ConfigError> {
        self.get(key).map_or(Ok(default), |_| {
            self.parse::<u64>(key, 0).map(Duration::from_secs)
        })
    }

    fn duration_millis(&self, key: &str, default: Duration) -> Result<Duration, ConfigError> {
        self.get(key).map_or(Ok(default), |_| {
            self.parse::<u64>(key, 0).map(Duration::from_millis)
        })
    }

    /// Like [`Self::duration_secs`], but zero is rejected.
    fn positive_secs(&self, key: &str, default: Duration) -> Result<Duration, ConfigError> {
        non_zero(key, self.duration_secs(key, default)?)
    }

    /// Like [`Self::duration_millis`], but zero is rejected.
    fn positive_millis(&self, key: &str, default: Duration) -> Result<Duration, ConfigError> {
        non_zero(key, self.duration_millis(key, default)?)
    }
}

// Timers and backoff built from these values cannot run on a zero period.
fn non_zero(key: &str, value: Duration) -> Result<Duration, ConfigError> {
    if value.is_zero() {
        return Err(ConfigError::InvalidValue {
            key: key.to_string(),
            reason: "must be greater than zero".to_string(),
        });
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn missing_api_key_is_error() {
        let err = GatewayConfig::from_lookup(lookup(&[])).unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnvVar(k) if k == "MARKET_DATA_API_KEY"));
    }

    #[test]
    fn blank_api_key_is_error() {
        let err = GatewayConfig::from_lookup(lookup(&[("MARKET_DATA_API_KEY", "  ")])).unwrap_err();
        assert!(matches!(err, ConfigError::EmptyValue(_)));
    }

    #[test]
    fn defaults_apply() {
        let config = GatewayConfig::from_lookup(lookup(&[("MARKET_DATA_API_KEY", "k")])).unwrap();

        assert_eq!(config.server.api_port, 8080);
        assert_eq!(config.server.health_port, 8082);
        assert_eq!(config.stream.reconnect_delay_base, Duration::from_secs(1));
        assert_eq!(config.stream.reconnect_delay_max, Duration::from_secs(30));
        assert_eq!(config.stream.max_reconnect_attempts, 5);
        assert_eq!(config.stream.keepalive_interval, Duration::from_secs(30));
        assert_eq!(config.stream.auth_timeout, Duration::from_secs(10));
        assert_eq!(config.reference.max_batch_symbols, 50);
        assert_eq!(config.upstream.stream_url, DEFAULT_STREAM_URL);
        assert_eq!(
            config.reference.policy(RestRoute::BatchSnapshot),
            RoutePolicy::default_for(RestRoute::BatchSnapshot)
        );
    }

    #[test]
    fn overrides_apply() {
        let config = GatewayConfig::from_lookup(lookup(&[
            ("MARKET_DATA_API_KEY", "k"),
            ("GATEWAY_API_PORT", "9000"),
            ("GATEWAY_RECONNECT_DELAY_BASE_MS", "250"),
            ("GATEWAY_MAX_RECONNECT_ATTEMPTS", "0"),
            ("GATEWAY_RATE_LIMIT_SEARCH_CAPACITY", "3"),
            ("GATEWAY_RATE_LIMIT_SEARCH_REFILL_PER_SEC", "0.5"),
            ("GATEWAY_CACHE_TTL_SNAPSHOT_SECS", "2"),
        ]))
        .unwrap();

        assert_eq!(config.server.api_port, 9000);
        assert_eq!(config.stream.reconnect_delay_base, Duration::from_millis(250));
        assert_eq!(config.stream.max_reconnect_attempts, 0);

        let search = config.reference.policy(RestRoute::Search);
        assert_eq!(search.bucket, BucketConfig::new(3.0, 0.5));
        assert_eq!(
            config.reference.policy(RestRoute::Snapshot).ttl,
            Duration::from_secs(2)
        );

        let connection = config.connection_config();
        assert_eq!(connection.reconnect.max_attempts, 0);
        assert_eq!(connection.reconnect.base_delay, Duration::from_millis(250));
    }

    #[test]
    fn unparsable_value_is_error() {
        let err = GatewayConfig::from_lookup(lookup(&[
            ("MARKET_DATA_API_KEY", "k"),
            ("GATEWAY_HEALTH_PORT", "not-a-port"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { key, .. } if key == "GATEWAY_HEALTH_PORT"));
    }

    #[test]
    fn jitter_out_of_range_is_error() {
        let err = GatewayConfig::from_lookup(lookup(&[
            ("MARKET_DATA_API_KEY", "k"),
            ("GATEWAY_RECONNECT_JITTER", "1.5"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn zero_capacity_is_error() {
        let err = GatewayConfig::from_lookup(lookup(&[
            ("MARKET_DATA_API_KEY", "k"),
            ("GATEWAY_RATE_LIMIT_BATCH_SNAPSHOT_CAPACITY", "0"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test_case("GATEWAY_KEEPALIVE_INTERVAL_SECS" ; "keepalive interval")]
    #[test_case("GATEWAY_AUTH_TIMEOUT_SECS" ; "auth timeout")]
    #[test_case("GATEWAY_RECONNECT_DELAY_BASE_MS" ; "reconnect base delay")]
    #[test_case("GATEWAY_RECONNECT_DELAY_MAX_SECS" ; "reconnect delay ceiling")]
    #[test_case("GATEWAY_CACHE_SWEEP_INTERVAL_SECS" ; "cache sweep interval")]
    fn zero_period_is_error(key: &str) {
        let err = GatewayConfig::from_lookup(lookup(&[("MARKET_DATA_API_KEY", "k"), (key, "0")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { key: k, .. } if k == key));
    }

    #[test_case("GATEWAY_RATE_LIMIT_SEARCH_CAPACITY", "NaN" ; "nan capacity")]
    #[test_case("GATEWAY_RATE_LIMIT_SEARCH_CAPACITY", "inf" ; "infinite capacity")]
    #[test_case("GATEWAY_RATE_LIMIT_SEARCH_REFILL_PER_SEC", "NaN" ; "nan refill")]
    #[test_case("GATEWAY_RATE_LIMIT_SEARCH_REFILL_PER_SEC", "-1" ; "negative refill")]
    fn non_finite_bucket_is_error(key: &str, value: &str) {
        let err = GatewayConfig::from_lookup(lookup(&[("MARKET_DATA_API_KEY", "k"), (key, value)]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { key: k, .. } if k == key));
    }

    #[test]
    fn credentials_redacted_debug() {
        let config =
            GatewayConfig::from_lookup(lookup(&[("MARKET_DATA_API_KEY", "key123")])).unwrap();
        let debug = format!("{config:?}");
        assert!(!debug.contains("key123"));
        assert!(debug.contains("[REDACTED]"));
    }
}
