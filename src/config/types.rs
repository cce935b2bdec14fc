use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main configuration structure for crawl-ledger
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub crawler: CrawlerConfig,
    #[serde(default)]
    pub writer: WriterConfig,
    #[serde(default)]
    pub fetcher: FetcherConfig,
    #[serde(default)]
    pub scope: ScopeConfig,
    pub output: OutputConfig,
    #[serde(default)]
    pub seeds: SeedConfig,
}

/// Worker pool and retry configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CrawlerConfig {
    /// Number of concurrent fetch workers
    #[serde(rename = "worker-count")]
    pub worker_count: u32,

    /// Fetch attempts allowed per URL before it is terminally failed
    #[serde(rename = "max-attempts")]
    pub max_attempts: u32,

    /// Backoff unit; the delay after attempt `n` is `n * base-backoff-ms`
    #[serde(rename = "base-backoff-ms")]
    pub base_backoff_ms: u64,

    /// Upper bound on a single retry delay
    #[serde(rename = "backoff-cap-ms")]
    pub backoff_cap_ms: u64,

    /// Upper bound on one fetch attempt (milliseconds)
    #[serde(rename = "per-fetch-timeout-ms")]
    pub per_fetch_timeout_ms: u64,

    /// How often the coordinator checks for completion (milliseconds)
    #[serde(rename = "completion-poll-ms", default = "default_completion_poll_ms")]
    pub completion_poll_ms: u64,

    /// How long an idle worker parks before re-checking the frontier (milliseconds)
    #[serde(rename = "idle-poll-ms", default = "default_idle_poll_ms")]
    pub idle_poll_ms: u64,

    /// Whether `Blocked` fetch errors are retried like any other error
    #[serde(rename = "retry-blocked", default = "default_true")]
    pub retry_blocked: bool,
}

impl CrawlerConfig {
    pub fn per_fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.per_fetch_timeout_ms)
    }

    pub fn completion_poll(&self) -> Duration {
        Duration::from_millis(self.completion_poll_ms)
    }

    pub fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.idle_poll_ms)
    }
}

/// Single-writer batching configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WriterConfig {
    /// Maximum requests per transaction
    #[serde(rename = "batch-size", default = "default_batch_size")]
    pub batch_size: usize,

    /// Maximum time a partial batch waits before it is flushed (milliseconds)
    #[serde(rename = "flush-interval-ms", default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,

    /// Capacity of the bounded write queue
    #[serde(rename = "channel-capacity", default = "default_channel_capacity")]
    pub channel_capacity: usize,

    /// Retries of a failed batch before its writes are reported lost
    #[serde(rename = "max-batch-retries", default = "default_max_batch_retries")]
    pub max_batch_retries: u32,
}

impl WriterConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            flush_interval_ms: default_flush_interval_ms(),
            channel_capacity: default_channel_capacity(),
            max_batch_retries: default_max_batch_retries(),
        }
    }
}

/// HTTP fetcher configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FetcherConfig {
    #[serde(rename = "user-agent", default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            user_agent: default_user_agent(),
        }
    }
}

/// Which discovered links are admitted to the frontier
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ScopeConfig {
    /// Links must start with this prefix (after normalization)
    #[serde(rename = "url-prefix")]
    pub url_prefix: Option<String>,

    /// Links must point at exactly this host
    #[serde(rename = "allowed-domain")]
    pub allowed_domain: Option<String>,

    /// Drop the query string during normalization
    #[serde(rename = "strip-query", default)]
    pub strip_query: bool,

    /// CSS selector for the element holding a page's content; the whole
    /// `<body>` is used when unset
    #[serde(rename = "content-selector")]
    pub content_selector: Option<String>,
}

/// Output configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OutputConfig {
    /// Path to the SQLite database file
    #[serde(rename = "database-path")]
    pub database_path: String,
}

/// Seed URLs used when the store is empty
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SeedConfig {
    #[serde(default)]
    pub urls: Vec<String>,
}

fn default_completion_poll_ms() -> u64 {
    250
}

fn default_idle_poll_ms() -> u64 {
    100
}

fn default_true() -> bool {
    true
}

fn default_batch_size() -> usize {
    200
}

fn default_flush_interval_ms() -> u64 {
    1000
}

fn default_channel_capacity() -> usize {
    1024
}

fn default_max_batch_retries() -> u32 {
    3
}

fn default_user_agent() -> String {
    format!("crawl-ledger/{}", env!("CARGO_PKG_VERSION"))
}
