//! Attachment download seam.
//!
//! The engine never talks to the chat platform directly; it hands a fetch URL
//! to an [`ArtifactFetcher`]. [`HttpArtifactFetcher`] is the production
//! implementation; tests substitute in-memory fetchers to inject failures.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use thiserror::Error;

const DEFAULT_FETCH_TIMEOUT_MS: u64 = 30_000;

/// Errors raised while downloading an attachment.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("fetch url '{0}' is not an http(s) url")]
    InvalidUrl(String),
    #[error("fetch of '{url}' returned status {status}")]
    Status { url: String, status: u16 },
    #[error("fetch of '{url}' exceeded {limit_bytes} bytes")]
    TooLarge { url: String, limit_bytes: u64 },
    #[error("fetch of '{url}' failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("fetch of '{url}' failed: {message}")]
    Unavailable { url: String, message: String },
}

/// Downloads attachment bytes from a platform URL.
#[async_trait]
pub trait ArtifactFetcher: Send + Sync {
    async fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>, FetchError>;
}

#[derive(Debug, Clone)]
/// `reqwest`-backed fetcher with a request timeout and a streamed byte cap.
pub struct HttpArtifactFetcher {
    client: reqwest::Client,
    max_bytes: u64,
}

impl HttpArtifactFetcher {
    pub fn new(request_timeout: Duration, max_bytes: u64) -> Result<Self> {
        let timeout = if request_timeout.is_zero() {
            Duration::from_millis(DEFAULT_FETCH_TIMEOUT_MS)
        } else {
            request_timeout
        };
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build attachment http client")?;
        Ok(Self {
            client,
            max_bytes: max_bytes.max(1),
        })
    }
}

#[async_trait]
impl ArtifactFetcher for HttpArtifactFetcher {
    async fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let url = url.trim();
        if !(url.starts_with("https://") || url.starts_with("http://")) {
            return Err(FetchError::InvalidUrl(url.to_string()));
        }
        let transport = |source: reqwest::Error| FetchError::Transport {
            url: url.to_string(),
            source,
        };

        let mut response = self.client.get(url).send().await.map_err(transport)?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        let too_large = || FetchError::TooLarge {
            url: url.to_string(),
            limit_bytes: self.max_bytes,
        };
        if response
            .content_length()
            .is_some_and(|length| length > self.max_bytes)
        {
            return Err(too_large());
        }

        let mut bytes = Vec::new();
        while let Some(chunk) = response.chunk().await.map_err(transport)? {
            if (bytes.len() as u64).saturating_add(chunk.len() as u64) > self.max_bytes {
                return Err(too_large());
            }
            bytes.extend_from_slice(&chunk);
        }
        tracing::debug!(url, bytes = bytes.len(), "attachment fetched");
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use httpmock::Method::GET;
    use httpmock::MockServer;

    use super::{ArtifactFetcher, FetchError, HttpArtifactFetcher};

    #[tokio::test]
    async fn functional_http_fetcher_downloads_body() {
        let server = MockServer::start();
        let download = server.mock(|when, then| {
            when.method(GET).path("/attachments/crash.zip");
            then.status(200).body("PK-crash-bytes");
        });

        let fetcher = HttpArtifactFetcher::new(Duration::from_secs(5), 1_024).expect("fetcher");
        let bytes = fetcher
            .fetch_bytes(&server.url("/attachments/crash.zip"))
            .await
            .expect("download");
        assert_eq!(bytes, b"PK-crash-bytes".to_vec());
        download.assert_calls(1);
    }

    #[tokio::test]
    async fn regression_http_fetcher_surfaces_status_and_size_failures() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/gone.zip");
            then.status(404);
        });
        server.mock(|when, then| {
            when.method(GET).path("/huge.zip");
            then.status(200).body("0123456789");
        });

        let fetcher = HttpArtifactFetcher::new(Duration::from_secs(5), 4).expect("fetcher");
        let missing = fetcher
            .fetch_bytes(&server.url("/gone.zip"))
            .await
            .expect_err("404 should fail");
        assert!(matches!(missing, FetchError::Status { status: 404, .. }));

        let oversized = fetcher
            .fetch_bytes(&server.url("/huge.zip"))
            .await
            .expect_err("oversized body should fail");
        assert!(matches!(oversized, FetchError::TooLarge { limit_bytes: 4, .. }));
    }

    #[tokio::test]
    async fn unit_http_fetcher_rejects_non_http_urls() {
        let fetcher = HttpArtifactFetcher::new(Duration::ZERO, 4).expect("fetcher");
        let error = fetcher
            .fetch_bytes("file:///etc/passwd")
            .await
            .expect_err("file url should fail");
        assert!(matches!(error, FetchError::InvalidUrl(_)));
    }
}
