//! Source site adapters
//!
//! Thin HTTP clients for the image search sites, plus the downloader the
//! pipeline fetches originals with. Each adapter maps one site's payload
//! into [`ResultItem`]s; auth and rate-limit rejections surface as typed
//! errors the pipeline records as stage-level item failures.

pub mod pexels;
pub mod pixabay;
pub mod unsplash;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use std::time::Duration;
use thiserror::Error;

use crate::storage::settings::HiveSettings;
use crate::types::image::ResultItem;

/// Shared HTTP client: one connection pool for every adapter.
static HTTP: Lazy<reqwest::Client> = Lazy::new(|| {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(15))
        .user_agent(concat!("imagehive/", env!("CARGO_PKG_VERSION")))
        .build()
        .expect("failed to build HTTP client")
});

/// Adapter errors
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("unknown source: {0}")]
    UnknownSource(String),
    #[error("no API key configured for {0}")]
    MissingKey(String),
    #[error("{site} rate limited the request")]
    RateLimited { site: String },
    #[error("{site} rejected the credentials")]
    AuthRejected { site: String },
    #[error("http error: {0}")]
    Http(String),
    #[error("unexpected payload from {site}: {reason}")]
    BadPayload { site: String, reason: String },
}

impl SourceError {
    /// Whether a bounded retry with backoff is worth attempting.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SourceError::Http(_) | SourceError::RateLimited { .. }
        )
    }
}

/// Map an HTTP status into the adapter error taxonomy.
fn status_error(site: &str, status: reqwest::StatusCode) -> SourceError {
    match status.as_u16() {
        429 => SourceError::RateLimited {
            site: site.to_string(),
        },
        401 | 403 => SourceError::AuthRejected {
            site: site.to_string(),
        },
        code => SourceError::Http(format!("{} returned status {}", site, code)),
    }
}

/// Queries one source site for image results.
#[async_trait]
pub trait SearchClient: Send + Sync {
    /// Fetch one page (1-based) of results for `query` from `source`.
    async fn search(
        &self,
        source: &str,
        query: &str,
        page: u32,
    ) -> Result<Vec<ResultItem>, SourceError>;

    /// Source names this client can serve.
    fn sources(&self) -> Vec<String>;
}

/// The production client multiplexing over the supported sites.
pub struct SiteSearchClient {
    pixabay_key: String,
    pexels_key: String,
    unsplash_key: String,
}

impl SiteSearchClient {
    pub fn new(settings: &HiveSettings) -> Self {
        Self {
            pixabay_key: settings.pixabay_key.clone(),
            pexels_key: settings.pexels_key.clone(),
            unsplash_key: settings.unsplash_key.clone(),
        }
    }
}

#[async_trait]
impl SearchClient for SiteSearchClient {
    async fn search(
        &self,
        source: &str,
        query: &str,
        page: u32,
    ) -> Result<Vec<ResultItem>, SourceError> {
        match source.to_lowercase().as_str() {
            "pixabay" => pixabay::search(&HTTP, &self.pixabay_key, query, page).await,
            "pexels" => pexels::search(&HTTP, &self.pexels_key, query, page).await,
            "unsplash" => unsplash::search(&HTTP, &self.unsplash_key, query, page).await,
            other => Err(SourceError::UnknownSource(other.to_string())),
        }
    }

    fn sources(&self) -> Vec<String> {
        let mut names = Vec::new();
        if !self.pixabay_key.is_empty() {
            names.push("pixabay".to_string());
        }
        if !self.pexels_key.is_empty() {
            names.push("pexels".to_string());
        }
        if !self.unsplash_key.is_empty() {
            names.push("unsplash".to_string());
        }
        names
    }
}

/// Fetches original image bytes.
#[async_trait]
pub trait Downloader: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, SourceError>;
}

/// Plain HTTP downloader with a generous per-file timeout.
pub struct HttpDownloader {
    timeout: Duration,
}

impl HttpDownloader {
    pub fn new() -> Self {
        Self {
            timeout: Duration::from_secs(60),
        }
    }
}

impl Default for HttpDownloader {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Downloader for HttpDownloader {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, SourceError> {
        let response = HTTP
            .get(url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| SourceError::Http(e.to_string()))?;

        if !response.status().is_success() {
            return Err(status_error("download", response.status()));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| SourceError::Http(e.to_string()))?;

        tracing::debug!("Fetched {} bytes from {}", bytes.len(), url);
        Ok(bytes.to_vec())
    }
}
