//! Caller-Facing HTTP API
//!
//! Axum routes for rate-limited, cached reference data and a server-sent
//! events stream backed by the shared upstream connection.
//!
//! # Endpoints
//!
//! - `GET /api/v1/snapshot/{symbol}`
//! - `GET /api/v1/snapshots?symbols=A,B`
//! - `GET /api/v1/previous-close/{symbol}`
//! - `GET /api/v1/tickers/{symbol}`
//! - `GET /api/v1/grouped/{date}`
//! - `GET /api/v1/search?q=..&limit=..`
//! - `DELETE /api/v1/cache/symbols/{symbol}`
//! - `GET /api/v1/stream?symbols=..&channels=..` (SSE)
//!
//! The stream interleaves market data events (named by channel) with
//! `status` events describing the upstream connection, and ends when the
//! server shuts down.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get};
use axum::{Json, Router};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::application::services::{
    ReferenceDataService, ReferenceQuery, ServiceError, StreamService,
};
use crate::domain::streaming::{
    SymbolError, normalize_symbol, parse_channel_list, parse_symbol_list,
};

/// Caller identity header.
pub const CLIENT_ID_HEADER: &str = "x-client-id";

/// SSE event name for connection status frames.
pub const STATUS_EVENT: &str = "status";

const FORWARDED_FOR_HEADER: &str = "x-forwarded-for";
const ANONYMOUS: &str = "anonymous";

// =============================================================================
// Errors
// =============================================================================

/// Errors surfaced to API callers.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Caller exhausted the route's bucket.
    #[error("rate limit exceeded")]
    RateLimited {
        /// Time until a token is available.
        retry_after: Duration,
    },

    /// Malformed request.
    #[error("{0}")]
    BadRequest(String),

    /// Upstream failure. Details are logged, not returned.
    #[error("upstream request failed")]
    Upstream,
}

impl From<ServiceError> for ApiError {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::RateLimited { retry_after } => Self::RateLimited { retry_after },
            ServiceError::InvalidRequest(msg) => Self::BadRequest(msg),
            ServiceError::Upstream(_) => Self::Upstream,
        }
    }
}

impl From<SymbolError> for ApiError {
    fn from(err: SymbolError) -> Self {
        Self::BadRequest(err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({ "error": self.to_string() }));
        match self {
            Self::RateLimited { retry_after } => {
                let secs = retry_after_secs(retry_after);
                (
                    StatusCode::TOO_MANY_REQUESTS,
                    [(header::RETRY_AFTER, HeaderValue::from(secs))],
                    body,
                )
                    .into_response()
            }
            Self::BadRequest(_) => (StatusCode::BAD_REQUEST, body).into_response(),
            Self::Upstream => (StatusCode::INTERNAL_SERVER_ERROR, body).into_response(),
        }
    }
}

/// Whole seconds for `Retry-After`, rounded up, at least 1.
#[must_use]
pub fn retry_after_secs(retry_after: Duration) -> u64 {
    let secs = retry_after
        .as_secs()
        .saturating_add(u64::from(retry_after.subsec_nanos() > 0));
    secs.max(1)
}

/// Caller identity: `x-client-id`, else the first `x-forwarded-for` hop,
/// else `anonymous`.
#[must_use]
pub fn caller_identity(headers: &HeaderMap) -> String {
    if let Some(id) = header_str(headers, CLIENT_ID_HEADER) {
        return id.to_string();
    }
    header_str(headers, FORWARDED_FOR_HEADER)
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map_or_else(|| ANONYMOUS.to_string(), ToString::to_string)
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

// =============================================================================
// Server
// =============================================================================

/// Shared state for API handlers.
pub struct ApiState {
    reference: Arc<ReferenceDataService>,
    streams: Arc<StreamService>,
    /// Ends open streams so graceful shutdown is not held up by them.
    shutdown: CancellationToken,
}

impl ApiState {
    /// Create API state.
    #[must_use]
    pub const fn new(
        reference: Arc<ReferenceDataService>,
        streams: Arc<StreamService>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            reference,
            streams,
            shutdown,
        }
    }
}

/// Caller-facing HTTP server.
pub struct ApiServer {
    port: u16,
    state: Arc<ApiState>,
    cancel: CancellationToken,
}

impl ApiServer {
    /// Create a new API server.
    #[must_use]
    pub const fn new(port: u16, state: Arc<ApiState>, cancel: CancellationToken) -> Self {
        Self {
            port,
            state,
            cancel,
        }
    }

    /// Build the router without binding.
    #[must_use]
    pub fn router(state: Arc<ApiState>) -> Router {
        Router::new()
            .route("/api/v1/snapshot/{symbol}", get(snapshot_handler))
            .route("/api/v1/snapshots", get(snapshots_handler))
            .route("/api/v1/previous-close/{symbol}", get(previous_close_handler))
            .route("/api/v1/tickers/{symbol}", get(ticker_details_handler))
            .route("/api/v1/grouped/{date}", get(grouped_handler))
            .route("/api/v1/search", get(search_handler))
            .route("/api/v1/cache/symbols/{symbol}", delete(invalidate_handler))
            .route("/api/v1/stream", get(stream_handler))
            .with_state(state)
    }

    /// Run the API server until cancelled.
    ///
    /// # Errors
    ///
    /// Returns `ApiServerError` if binding fails or the HTTP server
    /// encounters a fatal error while running.
    pub async fn run(self) -> Result<(), ApiServerError> {
        let app = Self::router(self.state);

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ApiServerError::BindFailed(self.port, e.to_string()))?;

        tracing::info!(port = self.port, "API server listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(self.cancel.cancelled_owned())
            .await
            .map_err(|e| ApiServerError::ServerFailed(e.to_string()))?;

        tracing::info!("API server stopped");
        Ok(())
    }
}

/// API server errors.
#[derive(Debug, thiserror::Error)]
pub enum ApiServerError {
    /// Failed to bind to port.
    #[error("failed to bind to port {0}: {1}")]
    BindFailed(u16, String),

    /// Server error.
    #[error("server error: {0}")]
    ServerFailed(String),
}

// =============================================================================
// Reference Data Handlers
// =============================================================================

type ApiResult = Result<Json<Value>, ApiError>;

async fn snapshot_handler(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Path(symbol): Path<String>,
) -> ApiResult {
    let query = ReferenceQuery::Snapshot(normalize_symbol(&symbol)?);
    fetch(&state, &headers, &query).await
}

async fn previous_close_handler(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Path(symbol): Path<String>,
) -> ApiResult {
    let query = ReferenceQuery::PreviousClose(normalize_symbol(&symbol)?);
    fetch(&state, &headers, &query).await
}

async fn ticker_details_handler(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Path(symbol): Path<String>,
) -> ApiResult {
    let query = ReferenceQuery::TickerDetails(normalize_symbol(&symbol)?);
    fetch(&state, &headers, &query).await
}

async fn grouped_handler(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Path(date): Path<String>,
) -> ApiResult {
    let query = ReferenceQuery::grouped(&date)?;
    fetch(&state, &headers, &query).await
}

#[derive(Debug, Deserialize)]
struct SearchParams {
    q: Option<String>,
    limit: Option<String>,
}

async fn search_handler(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Query(params): Query<SearchParams>,
) -> ApiResult {
    let limit = params
        .limit
        .as_deref()
        .map(|raw| {
            raw.trim()
                .parse::<u32>()
                .map_err(|_| ApiError::BadRequest(format!("invalid limit: {raw}")))
        })
        .transpose()?;
    let query = ReferenceQuery::search(params.q.as_deref().unwrap_or_default(), limit)?;
    fetch(&state, &headers, &query).await
}

#[derive(Debug, Deserialize)]
struct SymbolsParams {
    symbols: Option<String>,
}

async fn snapshots_handler(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Query(params): Query<SymbolsParams>,
) -> ApiResult {
    let symbols = parse_symbol_list(
        params.symbols.as_deref().unwrap_or_default(),
        state.reference.max_batch_symbols(),
    )?;
    let caller = caller_identity(&headers);
    let value = state.reference.fetch_snapshots(&caller, &symbols).await?;
    Ok(Json(value))
}

async fn invalidate_handler(
    State(state): State<Arc<ApiState>>,
    Path(symbol): Path<String>,
) -> ApiResult {
    let symbol = normalize_symbol(&symbol)?;
    let evicted = state.reference.invalidate_symbol(&symbol);
    Ok(Json(json!({ "symbol": symbol, "evicted": evicted })))
}

async fn fetch(state: &ApiState, headers: &HeaderMap, query: &ReferenceQuery) -> ApiResult {
    let caller = caller_identity(headers);
    let value = state.reference.fetch(&caller, query).await?;
    Ok(Json(value))
}

// =============================================================================
// Streaming Handler
// =============================================================================

#[derive(Debug, Deserialize)]
struct StreamParams {
    symbols: Option<String>,
    channels: Option<String>,
}

async fn stream_handler(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Query(params): Query<StreamParams>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let symbols = parse_symbol_list(
        params.symbols.as_deref().unwrap_or_default(),
        state.reference.max_batch_symbols(),
    )?;
    let channels = parse_channel_list(params.channels.as_deref().unwrap_or_default())?;

    let status = state
        .streams
        .status_updates()
        .filter_map(|update| async move { sse_event(STATUS_EVENT, &update) });

    let stream = state.streams.open(&symbols, &channels)?;
    tracing::info!(
        caller = %caller_identity(&headers),
        consumer = stream.consumer_id(),
        symbols = symbols.len(),
        channels = channels.len(),
        "Stream opened"
    );

    let market = stream
        .filter_map(|message| async move { sse_event(message.channel().as_str(), &message) });

    let events = futures::stream::select(status, market)
        .take_until(state.shutdown.clone().cancelled_owned());

    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

fn sse_event<T: Serialize>(name: &str, data: &T) -> Option<Result<Event, Infallible>> {
    match Event::default().event(name).json_data(data) {
        Ok(event) => Some(Ok(event)),
        Err(e) => {
            tracing::warn!(event = name, error = %e, "Failed to encode stream event");
            None
        }
    }
}
