//! Upstream REST Client
//!
//! `reqwest` adapter for [`ReferenceDataPort`]. The API key travels as the
//! `apiKey` query parameter. Responses are returned as opaque JSON.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::application::ports::{ReferenceDataPort, RestError};

/// Default upstream REST base URL.
pub const DEFAULT_REST_URL: &str = "https://api.polygon.io";

/// Default per-request timeout.
pub const DEFAULT_REST_TIMEOUT: Duration = Duration::from_secs(10);

/// Longest error body kept in [`RestError::Status`].
const MAX_ERROR_BODY: usize = 256;

/// HTTP client for the provider's reference-data endpoints.
#[derive(Clone)]
pub struct RestClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl fmt::Debug for RestClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RestClient")
            .field("base_url", &self.base_url)
            .field("api_key", &"[REDACTED]")
            .finish_non_exhaustive()
    }
}

impl RestClient {
    /// Create a client.
    ///
    /// # Errors
    ///
    /// Returns [`RestError::Request`] if the HTTP client cannot be built.
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, RestError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RestError::Request(e.to_string()))?;

        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        })
    }

    async fn get(&self, path: &str, query: &[(&str, String)]) -> Result<Value, RestError> {
        let url = format!("{}{}", self.base_url, path);
        tracing::debug!(path, "Upstream REST request");

        let response = self
            .http
            .get(&url)
            .query(query)
            .query(&[("apiKey", self.api_key.as_str())])
            .send()
            .await
            .map_err(|e| RestError::Request(e.without_url().to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RestError::Status {
                status: status.as_u16(),
                body: body.chars().take(MAX_ERROR_BODY).collect(),
            });
        }

        response
            .json::<Value>()
            .await
            .map_err(|e| RestError::Decode(e.without_url().to_string()))
    }
}

#[async_trait]
impl ReferenceDataPort for RestClient {
    async fn snapshot(&self, symbol: &str) -> Result<Value, RestError> {
        self.get(
            &format!("/v2/snapshot/locale/us/markets/stocks/tickers/{symbol}"),
            &[],
        )
        .await
    }

    async fn previous_close(&self, symbol: &str) -> Result<Value, RestError> {
        self.get(
            &format!("/v2/aggs/ticker/{symbol}/prev"),
            &[("adjusted", "true".to_string())],
        )
        .await
    }

    async fn ticker_details(&self, symbol: &str) -> Result<Value, RestError> {
        self.get(&format!("/v3/reference/tickers/{symbol}"), &[]).await
    }

    async fn grouped_daily(&self, date: &str) -> Result<Value, RestError> {
        self.get(
            &format!("/v2/aggs/grouped/locale/us/market/stocks/{date}"),
            &[("adjusted", "true".to_string())],
        )
        .await
    }

    async fn search_tickers(&self, query: &str, limit: u32) -> Result<Value, RestError> {
        self.get(
            "/v3/reference/tickers",
            &[
                ("search", query.to_string()),
                ("active", "true".to_string()),
                ("limit", limit.to_string()),
            ],
        )
        .await
    }
}
