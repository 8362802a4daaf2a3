//! Rate-limited HTTP transport shared by every outbound remote call.
//!
//! One [`RateLimitedClient`] is constructed at startup and handed to each
//! client that talks to a remote service. Before a request is sent the caller
//! waits on a token-bucket limiter; the wait can be cancelled, in which case
//! the request is never sent. Requests are only ever delayed, never dropped.

use std::num::NonZeroU32;
use std::time::Duration;

use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use regex::Regex;
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Max characters of an error body kept in [`TransportError::Status`].
const MAX_ERROR_BODY_CHARS: usize = 256;

/// Errors produced by the transport layer.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The caller cancelled while waiting for a permit; nothing was sent.
    #[error("request cancelled while waiting for rate limiter")]
    Cancelled,
    /// No HTTP response was received (connect error, timeout, reset).
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    /// The remote responded with a non-success status.
    #[error("remote returned non-success status {status}: {body}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Sanitized, truncated response body.
        body: String,
    },
}

impl TransportError {
    /// Whether the failure carried no response at all.
    ///
    /// Only transport-level failures without a response qualify; an HTTP
    /// error status or a cancelled wait is never transient.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Request(e) => {
                e.status().is_none() && !e.is_decode() && !e.is_body() && !e.is_builder()
            }
            Self::Cancelled | Self::Status { .. } => false,
        }
    }
}

/// HTTP client wrapped with a shared token-bucket limiter.
#[derive(Debug)]
pub struct RateLimitedClient {
    http: reqwest::Client,
    limiter: DefaultDirectRateLimiter,
}

impl RateLimitedClient {
    /// Build a client admitting `requests` permits per `period`.
    ///
    /// Permits refill evenly (one every `period / requests`) and up to
    /// `requests` may be spent in a burst. `timeout` bounds every request.
    ///
    /// # Errors
    ///
    /// Returns an error if the quota is degenerate or the HTTP client cannot
    /// be built.
    pub fn new(requests: u32, period: Duration, timeout: Duration) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("guildsync/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .map_err(|e| anyhow::anyhow!("failed to build HTTP client: {e}"))?;
        Self::with_client(http, requests, period)
    }

    /// Wrap an existing [`reqwest::Client`].
    ///
    /// # Errors
    ///
    /// Returns an error if `requests` is zero or the refill interval rounds
    /// down to zero.
    pub fn with_client(
        http: reqwest::Client,
        requests: u32,
        period: Duration,
    ) -> anyhow::Result<Self> {
        let burst = NonZeroU32::new(requests)
            .ok_or_else(|| anyhow::anyhow!("rate limit requests must be non-zero"))?;
        let quota = period
            .checked_div(burst.get())
            .and_then(Quota::with_period)
            .ok_or_else(|| anyhow::anyhow!("rate limit period too small for {requests} requests"))?
            .allow_burst(burst);

        Ok(Self {
            http,
            limiter: RateLimiter::direct(quota),
        })
    }

    /// The underlying HTTP client, for building requests.
    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    /// Wait until the limiter admits one request.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Cancelled`] if `cancel` fires first.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<(), TransportError> {
        if cancel.is_cancelled() {
            return Err(TransportError::Cancelled);
        }
        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(TransportError::Cancelled),
            () = self.limiter.until_ready() => Ok(()),
        }
    }

    /// Wait for a permit, then send the request.
    ///
    /// The response is returned as-is; use [`check_http_response`] or
    /// [`require_success`] to turn error statuses into errors.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Cancelled`] if the wait was cancelled, or
    /// [`TransportError::Request`] if no response was received.
    pub async fn send(
        &self,
        request: reqwest::RequestBuilder,
        cancel: &CancellationToken,
    ) -> Result<reqwest::Response, TransportError> {
        self.acquire(cancel).await?;
        let request = request.build()?;
        trace!(method = %request.method(), url = %request.url(), "sending request");
        Ok(self.http.execute(request).await?)
    }
}

/// Check HTTP response status and return the body text.
///
/// # Errors
///
/// Returns [`TransportError::Request`] if the body cannot be read, or
/// [`TransportError::Status`] on a non-2xx status.
pub async fn check_http_response(response: reqwest::Response) -> Result<String, TransportError> {
    let status = response.status();
    let body = response.text().await?;
    if !status.is_success() {
        return Err(TransportError::Status {
            status: status.as_u16(),
            body: sanitize_http_error_body(&body),
        });
    }
    Ok(body)
}

/// Pass a successful response through, or consume an error body into
/// [`TransportError::Status`].
///
/// # Errors
///
/// Returns [`TransportError::Status`] on a non-2xx status.
pub async fn require_success(
    response: reqwest::Response,
) -> Result<reqwest::Response, TransportError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(TransportError::Status {
        status: status.as_u16(),
        body: sanitize_http_error_body(&body),
    })
}

/// Collapse whitespace, redact bearer tokens, and truncate an error body.
pub fn sanitize_http_error_body(raw: &str) -> String {
    let collapsed = raw.split_whitespace().collect::<Vec<_>>().join(" ");

    let mut sanitized = collapsed;
    for pattern in [
        r#"(?i)"?access_token"?\s*[:=]\s*"?[A-Za-z0-9._\-]{8,}"?"#,
        r"(?i)bearer\s+[A-Za-z0-9._\-]{8,}",
    ] {
        if let Ok(regex) = Regex::new(pattern) {
            sanitized = regex.replace_all(&sanitized, "[REDACTED]").into_owned();
        }
    }

    if sanitized.chars().count() > MAX_ERROR_BODY_CHARS {
        let shortened = sanitized
            .chars()
            .take(MAX_ERROR_BODY_CHARS)
            .collect::<String>();
        return format!("{shortened}...[truncated]");
    }

    sanitized
}
