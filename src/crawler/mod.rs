//! Crawler module for concurrent, resumable crawling
//!
//! This module contains the crawl engine, including:
//! - The in-memory frontier with dedup and in-flight accounting
//! - The single batching writer that owns the store
//! - The fetch worker pool and retry scheduling
//! - Overall crawl coordination
//! - The fetcher and extractor seams with their default implementations

mod coordinator;
mod extractor;
mod fetcher;
mod frontier;
mod retry;
mod worker;
mod writer;

pub use coordinator::{Coordinator, CrawlReport};
pub use extractor::{ExtractError, Extraction, Extractor, HtmlExtractor};
pub use fetcher::{FetchError, FetchErrorKind, Fetcher, HttpFetcher, RawPage};
pub use frontier::{Frontier, FrontierSnapshot, QueuedUrl};
pub use retry::{RetryDecision, RetryPolicy, RetryScheduler};
pub use writer::{WriteQueue, Writer, WriterHandle, WriterOutcome, WriterStats};

use crate::config::Config;
use tokio_util::sync::CancellationToken;

/// Runs a complete crawl with the default collaborators
///
/// This is the main entry point for starting a crawl. It will:
/// 1. Open the SQLite store and load the resumable snapshot
/// 2. Seed or recover the frontier
/// 3. Fetch, extract, and follow links until the frontier drains or
///    `shutdown` fires
/// 4. Record the run outcome
pub async fn crawl(config: Config, shutdown: CancellationToken) -> crate::Result<CrawlReport> {
    Coordinator::from_config(config)?.run(shutdown).await
}
