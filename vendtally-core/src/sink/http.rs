//! HTTP sink for aggregate payloads
//!
//! POSTs each aggregate as JSON to the configured endpoint. The client is
//! async (`reqwest`) and driven by a private current-thread runtime so the
//! counter can stay synchronous.

use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use reqwest::StatusCode;

use crate::config::SinkConfig;
use crate::error::{Error, Result};

use super::{NetworkSink, SyncRequest};

/// Delay before the first retry; doubles per attempt
const INITIAL_BACKOFF: Duration = Duration::from_millis(500);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Delivery statistics
#[derive(Debug, Default, Clone)]
pub struct SinkStats {
    /// Aggregates delivered successfully
    pub payloads_sent: usize,
    /// Number of HTTP requests made (including retries)
    pub api_calls: usize,
    /// Number of failed HTTP requests
    pub api_failures: usize,
}

/// Blocking HTTP sink
pub struct HttpSink {
    http_client: reqwest::Client,
    runtime: tokio::runtime::Runtime,
    stats: SinkStats,
}

impl HttpSink {
    /// Create a new sink from configuration
    pub fn new(config: &SinkConfig) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .default_headers(headers)
            .build()
            .map_err(|e| Error::InvalidConfig(format!("failed to create HTTP client: {}", e)))?;

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| Error::InvalidConfig(format!("failed to create runtime: {}", e)))?;

        Ok(Self {
            http_client,
            runtime,
            stats: SinkStats::default(),
        })
    }

    /// Get current delivery statistics
    pub fn stats(&self) -> &SinkStats {
        &self.stats
    }

    /// Send with retry logic
    ///
    /// Retries transient failures (5xx, timeouts, refused connections) with
    /// exponential backoff, up to `max_retries` extra attempts.
    async fn post_with_retry(
        client: &reqwest::Client,
        stats: &mut SinkStats,
        request: &SyncRequest<'_>,
    ) -> Result<()> {
        let mut last_error = None;
        let mut delay = INITIAL_BACKOFF;

        for attempt in 0..=request.max_retries {
            if attempt > 0 {
                tracing::debug!(
                    "Retrying aggregate send (attempt {}/{}), waiting {:?}",
                    attempt + 1,
                    request.max_retries + 1,
                    delay
                );
                tokio::time::sleep(delay).await;
                delay = std::cmp::min(delay * 2, MAX_BACKOFF);
            }

            stats.api_calls += 1;
            match Self::post(client, request).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    stats.api_failures += 1;
                    if e.is_retryable() {
                        tracing::warn!("Transient error sending aggregate: {}", e);
                        last_error = Some(e);
                        continue;
                    }
                    return Err(e);
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| Error::NetworkUnavailable("max retries exceeded".to_string())))
    }

    async fn post(client: &reqwest::Client, request: &SyncRequest<'_>) -> Result<()> {
        let mut builder = client
            .post(request.endpoint)
            .body(request.payload.to_vec());

        if let Some(api_key) = request.api_key {
            builder = builder.bearer_auth(api_key);
        }

        let response = builder.send().await.map_err(classify_transport_error)?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let error_text = response
            .text()
            .await
            .unwrap_or_else(|_| "unknown".to_string());
        Err(classify_status(status, &error_text))
    }
}

impl NetworkSink for HttpSink {
    fn send(&mut self, request: &SyncRequest<'_>) -> Result<()> {
        let client = &self.http_client;
        let stats = &mut self.stats;
        self.runtime
            .block_on(Self::post_with_retry(client, stats, request))?;
        self.stats.payloads_sent += 1;
        Ok(())
    }
}

/// Map a failed request to the counter's error kinds
fn classify_transport_error(error: reqwest::Error) -> Error {
    if error.is_builder() {
        // Bad URL or header; retrying cannot help
        Error::ApiError(format!("invalid request: {}", error))
    } else {
        Error::NetworkUnavailable(format!("HTTP request failed: {}", error))
    }
}

/// Map a non-success status: server-side trouble is transient, the rest is a rejection
fn classify_status(status: StatusCode, body: &str) -> Error {
    if status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
    {
        Error::NetworkUnavailable(format!("server unavailable ({}): {}", status, body))
    } else {
        Error::ApiError(format!("API error ({}): {}", status, body))
    }
}
