//! Fetch worker loop
//!
//! Workers pull URLs from the frontier and fetch and extract them. Every
//! resulting state change is submitted to the write queue; workers never
//! touch the store.

use crate::crawler::extractor::Extractor;
use crate::crawler::fetcher::{FetchError, FetchErrorKind, Fetcher};
use crate::crawler::frontier::{Frontier, QueuedUrl};
use crate::crawler::retry::{RetryDecision, RetryPolicy, RetryScheduler};
use crate::crawler::writer::WriteQueue;
use crate::storage::WriteRequest;
use crate::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Everything a worker shares with its siblings
pub struct WorkerContext {
    pub frontier: Arc<Frontier>,
    pub queue: WriteQueue,
    pub fetcher: Arc<dyn Fetcher>,
    pub extractor: Arc<dyn Extractor>,
    pub retry: Arc<RetryScheduler>,
    pub policy: RetryPolicy,
    pub stop: CancellationToken,
    pub fetch_timeout: Duration,
    pub idle_poll: Duration,
    pub retry_blocked: bool,
}

/// Runs one worker until the stop signal fires or the write queue closes
pub async fn run_worker(id: usize, ctx: Arc<WorkerContext>) {
    tracing::debug!("Worker {} started", id);

    while !ctx.stop.is_cancelled() {
        let item = match ctx.frontier.dequeue() {
            Some(item) => item,
            None => {
                tokio::select! {
                    _ = ctx.stop.cancelled() => break,
                    _ = ctx.frontier.wait_for_work(ctx.idle_poll) => {}
                }
                continue;
            }
        };

        if let Err(e) = process(&ctx, item).await {
            tracing::warn!("Worker {} exiting: {}", id, e);
            break;
        }
    }

    tracing::debug!("Worker {} stopped", id);
}

/// One fetch attempt for one URL
async fn process(ctx: &WorkerContext, item: QueuedUrl) -> Result<()> {
    let url = item.url;
    ctx.queue.submit(WriteRequest::claim(url.clone())).await?;

    tracing::debug!("Fetching {} (attempt {})", url, item.attempts + 1);

    let fetch = ctx.fetcher.fetch(&url, ctx.fetch_timeout);
    let fetched = match tokio::time::timeout(ctx.fetch_timeout, fetch).await {
        Ok(result) => result,
        Err(_) => Err(FetchError::timeout(ctx.fetch_timeout)),
    };

    let outcome = match fetched {
        Ok(raw) => ctx
            .extractor
            .extract(&url, &raw)
            .map_err(|e| Failure::Extract(e.to_string())),
        Err(e) => Err(Failure::Fetch(e)),
    };

    match outcome {
        Ok(extraction) => {
            tracing::trace!("Entities on {}: {:?}", url, extraction.entities);

            let mut discovered = 0;
            for link in extraction.outbound_urls {
                if ctx.frontier.enqueue(QueuedUrl::new(link.clone(), 0)) {
                    ctx.queue
                        .submit(WriteRequest::discover(link, Some(url.clone())))
                        .await?;
                    discovered += 1;
                }
            }

            tracing::info!("Crawled {} ({} new links)", url, discovered);
            ctx.queue
                .submit(WriteRequest::success(url, extraction.cleaned_text))
                .await?;
        }
        Err(failure) => {
            let attempts = item.attempts + 1;
            let error = failure.to_string();

            let decision = if failure.is_blocked() && !ctx.retry_blocked {
                RetryDecision::PermanentFailure
            } else {
                ctx.policy.should_retry(attempts)
            };

            match decision {
                RetryDecision::RetryAfter(delay) => {
                    tracing::warn!(
                        "Fetch of {} failed (attempt {}/{}), retrying in {:?}: {}",
                        url,
                        attempts,
                        ctx.policy.max_attempts,
                        delay,
                        error
                    );
                    ctx.queue
                        .submit(WriteRequest::failure(url.clone(), error, false))
                        .await?;
                    ctx.retry.schedule(url, attempts, delay);
                }
                RetryDecision::PermanentFailure => {
                    tracing::warn!(
                        "Fetch of {} failed permanently after {} attempt(s): {}",
                        url,
                        attempts,
                        error
                    );
                    ctx.queue
                        .submit(WriteRequest::failure(url, error, true))
                        .await?;
                }
            }
        }
    }

    Ok(())
}

/// Why an attempt produced no content
enum Failure {
    Fetch(FetchError),
    Extract(String),
}

impl Failure {
    fn is_blocked(&self) -> bool {
        matches!(self, Self::Fetch(e) if e.kind == FetchErrorKind::Blocked)
    }
}

impl std::fmt::Display for Failure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fetch(e) => write!(f, "{}", e),
            Self::Extract(message) => write!(f, "extract: {}", message),
        }
    }
}
