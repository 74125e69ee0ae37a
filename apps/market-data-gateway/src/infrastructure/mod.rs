//! Infrastructure Layer - Adapters and external integrations.
//!
//! This layer contains the concrete implementations of the port interfaces
//! defined in the application layer, plus the HTTP surfaces.

/// Upstream provider adapters (streaming connection, REST client).
pub mod upstream;

/// Per-caller token bucket rate limiting.
pub mod rate_limit;

/// TTL response cache with tag invalidation.
pub mod cache;

/// Caller-facing HTTP API.
pub mod http;

/// Configuration loading.
pub mod config;

/// Health check HTTP endpoint.
pub mod health;

/// Prometheus metrics instrumentation.
pub mod metrics;

/// OpenTelemetry tracing integration.
pub mod telemetry;
