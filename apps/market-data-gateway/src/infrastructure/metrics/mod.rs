//! Prometheus Metrics Module
//!
//! Exposes gateway metrics via Prometheus format for monitoring.
//!
//! # Metrics Categories
//!
//! - **Stream**: inbound messages by channel, parse errors, observer failures
//! - **Connection**: state gauge, reconnect attempts, upstream requests sent
//! - **Subscriptions**: live upstream keys
//! - **REST**: rate-limit rejections, cache hits and misses, upstream latency
//!
//! # Integration
//!
//! Metrics are exposed at `/metrics` on the health server port.

use std::sync::OnceLock;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use crate::domain::streaming::Channel;

// =============================================================================
// Global Metrics Handle
// =============================================================================

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize the Prometheus metrics recorder.
///
/// # Panics
///
/// Panics if the recorder cannot be installed.
pub fn init_metrics() -> PrometheusHandle {
    PROMETHEUS_HANDLE
        .get_or_init(|| {
            let builder = PrometheusBuilder::new();
            let handle = builder
                .install_recorder()
                .expect("failed to install Prometheus recorder");

            register_metrics();
            handle
        })
        .clone()
}

/// Get the Prometheus handle for rendering metrics.
///
/// Returns `None` if metrics have not been initialized.
#[must_use]
pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

// =============================================================================
// Metric Registration
// =============================================================================

fn register_metrics() {
    // Stream
    describe_counter!(
        "market_gateway_messages_received_total",
        "Market data messages parsed from the upstream feed"
    );
    describe_counter!(
        "market_gateway_parse_errors_total",
        "Inbound frames or elements dropped because they could not be parsed"
    );
    describe_counter!(
        "market_gateway_observer_failures_total",
        "Observer callbacks that returned an error or panicked"
    );

    // Connection
    describe_gauge!(
        "market_gateway_connection_state",
        "1 for the current connection state, 0 for the others"
    );
    describe_counter!(
        "market_gateway_reconnects_total",
        "Reconnection attempts scheduled"
    );
    describe_counter!(
        "market_gateway_upstream_entries_total",
        "Channel entries sent upstream in subscribe/unsubscribe requests"
    );

    // Subscriptions
    describe_gauge!(
        "market_gateway_active_subscriptions",
        "Live upstream (symbol, channel) subscriptions"
    );

    // REST
    describe_counter!(
        "market_gateway_rate_limited_total",
        "REST requests rejected by the rate limiter"
    );
    describe_counter!(
        "market_gateway_cache_lookups_total",
        "REST response cache lookups by outcome"
    );
    describe_histogram!(
        "market_gateway_upstream_request_seconds",
        "Latency of upstream REST requests on cache miss"
    );
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Connection states as exported on the state gauge.
pub const CONNECTION_STATES: [&str; 7] = [
    "idle",
    "connecting",
    "authenticating",
    "connected",
    "disconnected",
    "reconnecting",
    "errored",
];

/// Record a parsed market data message.
pub fn record_message_received(channel: Channel) {
    counter!(
        "market_gateway_messages_received_total",
        "channel" => channel.as_str()
    )
    .increment(1);
}

/// Record a dropped frame or element.
pub fn record_parse_error(kind: &'static str) {
    counter!("market_gateway_parse_errors_total", "kind" => kind).increment(1);
}

/// Record a failed observer callback.
pub fn record_observer_failure(channel: Channel, kind: &'static str) {
    counter!(
        "market_gateway_observer_failures_total",
        "channel" => channel.as_str(),
        "kind" => kind
    )
    .increment(1);
}

/// Set the connection state gauge.
pub fn set_connection_state(state: &str) {
    for candidate in CONNECTION_STATES {
        let value = if candidate == state { 1.0 } else { 0.0 };
        gauge!("market_gateway_connection_state", "state" => candidate).set(value);
    }
}

/// Record a scheduled reconnection attempt.
pub fn record_reconnect() {
    counter!("market_gateway_reconnects_total").increment(1);
}

/// Record channel entries sent upstream.
pub fn record_upstream_entries(action: &'static str, entries: usize) {
    counter!("market_gateway_upstream_entries_total", "action" => action)
        .increment(entries as u64);
}

/// Update the live subscription gauge.
pub fn set_active_subscriptions(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("market_gateway_active_subscriptions").set(count as f64);
}

/// Record a rate-limit rejection.
pub fn record_rate_limited(route: &'static str) {
    counter!("market_gateway_rate_limited_total", "route" => route).increment(1);
}

/// Record a cache lookup outcome.
pub fn record_cache_lookup(route: &'static str, hit: bool) {
    counter!(
        "market_gateway_cache_lookups_total",
        "route" => route,
        "outcome" => if hit { "hit" } else { "miss" }
    )
    .increment(1);
}

/// Record upstream REST latency.
pub fn record_upstream_request(route: &'static str, duration: Duration) {
    histogram!("market_gateway_upstream_request_seconds", "route" => route)
        .record(duration.as_secs_f64());
}

// =============================================================================
// Tests
// =============================================================================
