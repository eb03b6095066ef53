//! Source retrieval: download the document named by a request.
//!
//! The job only depends on the [`Fetcher`] trait, so tests can serve bytes
//! from memory. [`HttpFetcher`] is the real implementation: one
//! unauthenticated GET with a total timeout, a redirect cap and a body
//! size cap, so a slow or huge remote document cannot pin a job slot.

use crate::config::ServiceConfig;
use crate::error::CropError;
use async_trait::async_trait;
use reqwest::Url;
use std::time::Duration;
use tracing::{debug, info};

/// Retrieves the raw bytes of a remote document.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Fetch `url`. An empty body is a failure.
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, CropError>;
}

/// Check if the input string looks like a URL.
pub fn is_url(input: &str) -> bool {
    input.starts_with("http://") || input.starts_with("https://")
}

/// Parse a request body into an HTTP/HTTPS URL.
pub fn parse_document_url(input: &str) -> Result<Url, CropError> {
    let trimmed = input.trim();
    if !is_url(trimmed) {
        return Err(CropError::InvalidUrl {
            input: trimmed.to_string(),
        });
    }
    Url::parse(trimmed).map_err(|_| CropError::InvalidUrl {
        input: trimmed.to_string(),
    })
}

/// [`Fetcher`] backed by a shared `reqwest` client.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    timeout: Duration,
    max_bytes: u64,
}

impl HttpFetcher {
    pub fn new(timeout: Duration, max_bytes: u64) -> Result<Self, CropError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("pdf-crop-gateway/", env!("CARGO_PKG_VERSION")))
            .redirect(reqwest::redirect::Policy::limited(5))
            .timeout(timeout)
            .build()
            .map_err(|e| CropError::InvalidConfig(format!("HTTP client: {e}")))?;

        Ok(Self {
            client,
            timeout,
            max_bytes,
        })
    }

    pub fn from_config(config: &ServiceConfig) -> Result<Self, CropError> {
        Self::new(config.fetch_timeout(), config.max_document_bytes)
    }

    fn transport_error(&self, url: &Url, e: reqwest::Error) -> CropError {
        if e.is_timeout() {
            CropError::FetchTimeout {
                url: url.to_string(),
                secs: self.timeout.as_secs(),
            }
        } else {
            CropError::Fetch {
                url: url.to_string(),
                reason: e.to_string(),
            }
        }
    }

    fn too_large(&self, url: &Url) -> CropError {
        CropError::DocumentTooLarge {
            url: url.to_string(),
            limit: self.max_bytes,
        }
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, CropError> {
        let url = parse_document_url(url)?;
        info!("Fetching document from: {}", url);

        let mut response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| self.transport_error(&url, e))?;

        if !response.status().is_success() {
            return Err(CropError::Fetch {
                url: url.to_string(),
                reason: format!("HTTP {}", response.status()),
            });
        }

        let declared = response.content_length();
        if declared.is_some_and(|len| len > self.max_bytes) {
            return Err(self.too_large(&url));
        }

        let mut body = Vec::with_capacity(declared.unwrap_or(0) as usize);
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| self.transport_error(&url, e))?
        {
            if (body.len() + chunk.len()) as u64 > self.max_bytes {
                return Err(self.too_large(&url));
            }
            body.extend_from_slice(&chunk);
        }

        if body.is_empty() {
            return Err(CropError::Fetch {
                url: url.to_string(),
                reason: "empty response body".into(),
            });
        }

        debug!("Fetched {} bytes from {}", body.len(), url);
        Ok(body)
    }
}
