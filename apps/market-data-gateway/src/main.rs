//! Market Data Gateway Binary
//!
//! Starts the shared upstream stream, the caller-facing API, and the
//! health server.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin market-data-gateway
//! ```
//!
//! # Environment Variables
//!
//! ## Required
//! - `MARKET_DATA_API_KEY`: upstream provider API key
//!
//! ## Optional
//! - `MARKET_DATA_STREAM_URL`, `MARKET_DATA_REST_URL`: upstream endpoints
//! - `GATEWAY_API_PORT`: caller-facing API port (default: 8080)
//! - `GATEWAY_HEALTH_PORT`: health check HTTP port (default: 8082)
//! - `GATEWAY_RECONNECT_DELAY_BASE_MS`, `GATEWAY_RECONNECT_DELAY_MAX_SECS`,
//!   `GATEWAY_MAX_RECONNECT_ATTEMPTS`, `GATEWAY_RECONNECT_JITTER`: backoff
//! - `GATEWAY_KEEPALIVE_INTERVAL_SECS`, `GATEWAY_AUTH_TIMEOUT_SECS`
//! - `GATEWAY_RATE_LIMIT_<ROUTE>_CAPACITY`, `GATEWAY_RATE_LIMIT_<ROUTE>_REFILL_PER_SEC`,
//!   `GATEWAY_CACHE_TTL_<ROUTE>_SECS`: per-route REST policy
//! - `OTEL_ENABLED`, `OTEL_EXPORTER_OTLP_ENDPOINT`, `OTEL_SERVICE_NAME`
//! - `RUST_LOG`: Log level (default: info)

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use market_data_gateway::application::services::{ReferenceDataService, StreamService};
use market_data_gateway::infrastructure::http::{ApiServer, ApiState};
use market_data_gateway::infrastructure::health::{HealthServer, HealthServerState};
use market_data_gateway::infrastructure::telemetry;
use market_data_gateway::infrastructure::upstream::{
    ConnectionEvent, ConnectionManager, RestClient, WebSocketConnector,
};
use market_data_gateway::{GatewayConfig, SubscriptionRegistry, init_metrics};
use tokio::signal;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

/// Graceful shutdown timeout.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("failed to install rustls crypto provider"))?;

    load_dotenv();

    let _telemetry_guard = telemetry::init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting market data gateway");

    let _metrics_handle = init_metrics();

    let config = GatewayConfig::from_env().context("invalid configuration")?;
    log_config(&config);

    let shutdown_token = CancellationToken::new();

    // Upstream streaming connection
    let registry = Arc::new(SubscriptionRegistry::new());
    let connector = Arc::new(WebSocketConnector::new(config.upstream.stream_url.clone()));
    let connection =
        ConnectionManager::new(config.connection_config(), connector, Arc::clone(&registry));
    let streams = Arc::new(StreamService::new(connection.clone()));

    // Upstream REST
    let rest = RestClient::new(
        config.upstream.rest_url.clone(),
        config.credentials.api_key(),
        config.upstream.rest_timeout,
    )
    .context("failed to build REST client")?;
    let reference = Arc::new(ReferenceDataService::new(
        Arc::new(rest),
        config.reference.clone(),
    ));

    tokio::spawn(log_connection_events(connection.subscribe_events()));
    connection.connect();

    // Cache sweeper
    let sweeper_reference = Arc::clone(&reference);
    let sweep_interval = config.server.cache_sweep_interval;
    let sweeper_shutdown = shutdown_token.clone();
    let sweeper = tokio::spawn(async move {
        run_cache_sweeper(sweeper_reference, sweep_interval, sweeper_shutdown).await;
    });

    // Servers
    let api_server = ApiServer::new(
        config.server.api_port,
        Arc::new(ApiState::new(
            Arc::clone(&reference),
            streams,
            shutdown_token.clone(),
        )),
        shutdown_token.clone(),
    );
    let api = tokio::spawn(async move {
        if let Err(e) = api_server.run().await {
            tracing::error!(error = %e, "API server error");
        }
    });

    let health_state = Arc::new(HealthServerState::new(
        env!("CARGO_PKG_VERSION").to_string(),
        connection.clone(),
        Arc::clone(&reference),
    ));
    let health_server = HealthServer::new(
        config.server.health_port,
        health_state,
        shutdown_token.clone(),
    );
    let health = tokio::spawn(async move {
        if let Err(e) = health_server.run().await {
            tracing::error!(error = %e, "Health server error");
        }
    });

    tracing::info!("Market data gateway ready");

    await_shutdown(shutdown_token).await;

    let drained = tokio::time::timeout(SHUTDOWN_TIMEOUT, async {
        connection.disconnect().await;
        let _ = tokio::join!(api, health, sweeper);
    })
    .await;
    if drained.is_err() {
        tracing::warn!(
            timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
            "Shutdown timed out, exiting anyway"
        );
    }

    tracing::info!("Market data gateway stopped");
    Ok(())
}

/// Log connection status events.
async fn log_connection_events(mut rx: broadcast::Receiver<ConnectionEvent>) {
    loop {
        match rx.recv().await {
            Ok(ConnectionEvent::StateChanged { from, to }) => {
                tracing::debug!(from = %from, to = %to, "Upstream state changed");
            }
            Ok(ConnectionEvent::TransportError(e)) => {
                tracing::warn!(error = %e, "Upstream transport error");
            }
            Ok(ConnectionEvent::AuthenticationFailed { message }) => {
                tracing::error!(message = %message, "Upstream rejected credentials");
            }
            Ok(ConnectionEvent::MaxReconnectAttemptsExceeded { attempts }) => {
                tracing::error!(attempts, "Upstream reconnect attempts exhausted");
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::debug!(skipped, "Connection event log lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Periodically drop expired cache entries.
async fn run_cache_sweeper(
    reference: Arc<ReferenceDataService>,
    interval: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval.max(Duration::from_secs(1)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let purged = reference.purge_expired();
                if purged > 0 {
                    tracing::debug!(purged, remaining = reference.cache_len(), "Cache swept");
                }
            }
        }
    }
}

/// Load .env file from current or ancestor directories.
fn load_dotenv() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = cwd.as_path();
        while let Some(parent) = dir.parent() {
            let env_path = parent.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
            dir = parent;
        }
    }
}

/// Log the parsed configuration.
fn log_config(config: &GatewayConfig) {
    tracing::info!(
        api_port = config.server.api_port,
        health_port = config.server.health_port,
        max_reconnect_attempts = config.stream.max_reconnect_attempts,
        max_batch_symbols = config.reference.max_batch_symbols,
        "Configuration loaded"
    );
    tracing::debug!(
        stream_url = %config.upstream.stream_url,
        rest_url = %config.upstream.rest_url,
        "Upstream endpoints"
    );
}

/// Wait for shutdown signal (SIGTERM or SIGINT).
#[allow(clippy::expect_used)]
async fn await_shutdown(shutdown_token: CancellationToken) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("signal handler installation is critical for graceful shutdown");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("SIGTERM handler installation is critical for graceful shutdown")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }

    shutdown_token.cancel();

    tracing::info!(
        timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
        "Graceful shutdown started"
    );
}
