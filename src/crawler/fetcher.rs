//! Fetcher seam and the default HTTP implementation
//!
//! This module defines:
//! - The [`Fetcher`] trait workers call for every attempt
//! - The [`FetchError`] taxonomy the retry policy consumes
//! - [`HttpFetcher`], a `reqwest` client that maps transport and status
//!   failures onto that taxonomy

use crate::config::FetcherConfig;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Body and metadata of a successfully fetched page
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawPage {
    /// Final URL after redirects
    pub final_url: String,

    /// HTTP status code
    pub status_code: u16,

    /// Content-Type header value, if any
    pub content_type: Option<String>,

    /// Page body
    pub body: String,
}

/// Failure category of a fetch attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchErrorKind {
    /// No response within the per-fetch timeout
    Timeout,

    /// The site refused us (403, 429, 451)
    Blocked,

    /// Any other non-success status
    HttpError,

    /// Connection, TLS, or body read failure
    Network,
}

impl fmt::Display for FetchErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Timeout => "timeout",
            Self::Blocked => "blocked",
            Self::HttpError => "http",
            Self::Network => "network",
        };
        f.write_str(name)
    }
}

/// A failed fetch attempt
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct FetchError {
    pub kind: FetchErrorKind,
    pub message: String,
}

impl FetchError {
    pub fn new(kind: FetchErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn timeout(after: Duration) -> Self {
        Self::new(FetchErrorKind::Timeout, format!("no response after {:?}", after))
    }
}

/// Retrieves raw page content for a URL
///
/// Implementations must be safe to call from many workers at once.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, url: &str, timeout: Duration) -> Result<RawPage, FetchError>;
}

/// Default fetcher backed by a shared `reqwest` client
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    /// Builds a fetcher with the configured user agent
    ///
    /// # Example
    ///
    /// ```no_run
    /// use crawl_ledger::config::FetcherConfig;
    /// use crawl_ledger::crawler::HttpFetcher;
    ///
    /// let fetcher = HttpFetcher::new(&FetcherConfig::default()).unwrap();
    /// ```
    pub fn new(config: &FetcherConfig) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .user_agent(config.user_agent.as_str())
            .connect_timeout(Duration::from_secs(10))
            .gzip(true)
            .brotli(true)
            .build()?;

        Ok(Self { client })
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, url: &str, timeout: Duration) -> Result<RawPage, FetchError> {
        let response = self
            .client
            .get(url)
            .timeout(timeout)
            .send()
            .await
            .map_err(classify_transport_error)?;

        let status = response.status();
        if !status.is_success() {
            return Err(classify_status(status));
        }

        let final_url = response.url().to_string();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let body = response.text().await.map_err(classify_transport_error)?;

        Ok(RawPage {
            final_url,
            status_code: status.as_u16(),
            content_type,
            body,
        })
    }
}

/// Maps a non-success status onto the error taxonomy
///
/// | Status | Kind |
/// |--------|------|
/// | 403, 429, 451 | Blocked |
/// | anything else | HttpError |
fn classify_status(status: StatusCode) -> FetchError {
    let kind = match status {
        StatusCode::FORBIDDEN
        | StatusCode::TOO_MANY_REQUESTS
        | StatusCode::UNAVAILABLE_FOR_LEGAL_REASONS => FetchErrorKind::Blocked,
        _ => FetchErrorKind::HttpError,
    };
    FetchError::new(kind, format!("HTTP {}", status.as_u16()))
}

fn classify_transport_error(e: reqwest::Error) -> FetchError {
    if e.is_timeout() {
        FetchError::new(FetchErrorKind::Timeout, "request timeout")
    } else if e.is_connect() {
        FetchError::new(FetchErrorKind::Network, format!("connection failed: {}", e))
    } else {
        FetchError::new(FetchErrorKind::Network, e.to_string())
    }
}
