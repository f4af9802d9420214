//! Upstream event source client.
//!
//! Opens one streaming `GET` against the backend for an area, presenting
//! the caller's bearer credential. The response body is handed back as a
//! byte stream and is never parsed.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use cmdrelay_core::Area;
use cmdrelay_core::SessionCredential;
use cmdrelay_core::config::UpstreamConfig;
use futures::StreamExt;
use futures::stream::BoxStream;
use reqwest::StatusCode;
use reqwest::header::{ACCEPT, AUTHORIZATION, CACHE_CONTROL, CONNECTION, CONTENT_LENGTH};
use thiserror::Error;
use tracing::debug;

/// Chunks of an upstream response body.
pub type UpstreamBody = BoxStream<'static, Result<Bytes, UpstreamError>>;

/// Errors while opening or reading an upstream stream.
#[derive(Debug, Error)]
pub enum UpstreamError {
    /// The upstream URL could not be built.
    #[error("invalid upstream url: {0}")]
    InvalidUrl(String),

    /// Connecting, sending, or reading failed.
    #[error("upstream transport error: {0}")]
    Transport(String),
}

/// Result of opening an upstream stream.
pub enum UpstreamReply {
    /// 2xx with a body to pump.
    Streaming(UpstreamBody),
    /// Non-2xx; the body is discarded.
    Rejected {
        /// Upstream status.
        status: StatusCode,
    },
    /// 2xx without a readable body.
    Empty,
}

impl std::fmt::Debug for UpstreamReply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Streaming(_) => f.write_str("Streaming(..)"),
            Self::Rejected { status } => f.debug_struct("Rejected").field("status", status).finish(),
            Self::Empty => f.write_str("Empty"),
        }
    }
}

/// Source of area-scoped event streams.
#[async_trait]
pub trait EventSource: Send + Sync + 'static {
    /// Opens the stream for `area` on behalf of `credential`.
    ///
    /// # Errors
    ///
    /// Returns [`UpstreamError`] when no HTTP exchange took place.
    async fn open(
        &self,
        area: &Area,
        credential: &SessionCredential,
    ) -> Result<UpstreamReply, UpstreamError>;
}

/// [`EventSource`] backed by reqwest.
#[derive(Clone)]
pub struct HttpEventSource {
    http: reqwest::Client,
    config: UpstreamConfig,
}

impl HttpEventSource {
    /// Creates a source sharing `http` for connection pooling.
    #[must_use]
    pub const fn new(http: reqwest::Client, config: UpstreamConfig) -> Self {
        Self { http, config }
    }
}

/// Builds the shared HTTP client used for every backend request.
///
/// Only connection setup is bounded; a total timeout would cut streams.
///
/// # Errors
///
/// Returns an error if the TLS backend cannot be initialized.
pub fn build_http_client(connect_timeout: Duration) -> reqwest::Result<reqwest::Client> {
    reqwest::Client::builder()
        .connect_timeout(connect_timeout)
        .http1_only()
        .build()
}

#[async_trait]
impl EventSource for HttpEventSource {
    async fn open(
        &self,
        area: &Area,
        credential: &SessionCredential,
    ) -> Result<UpstreamReply, UpstreamError> {
        let url = reqwest::Url::parse(&self.config.stream_url(area))
            .map_err(|e| UpstreamError::InvalidUrl(e.to_string()))?;

        let response = self
            .http
            .get(url)
            .header(AUTHORIZATION, credential.bearer())
            .header(ACCEPT, "text/event-stream")
            .header(CACHE_CONTROL, "no-cache")
            .header(CONNECTION, "keep-alive")
            .send()
            .await
            .map_err(|e| UpstreamError::Transport(e.to_string()))?;

        let status = response.status();
        debug!(area = %area, status = status.as_u16(), "upstream responded");

        if !status.is_success() {
            return Ok(UpstreamReply::Rejected { status });
        }
        if has_no_body(status, response.headers()) {
            return Ok(UpstreamReply::Empty);
        }

        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| UpstreamError::Transport(e.to_string())));
        Ok(UpstreamReply::Streaming(body.boxed()))
    }
}

fn has_no_body(status: StatusCode, headers: &reqwest::header::HeaderMap) -> bool {
    if matches!(status, StatusCode::NO_CONTENT | StatusCode::RESET_CONTENT) {
        return true;
    }
    headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        == Some(0)
}
