//! Retry policy and deferred re-enqueue timers
//!
//! The policy is a pure function of the attempt count. The scheduler turns a
//! `RetryAfter` decision into a timer task that, once the delay elapses,
//! records the Failed to New transition and hands the URL back to the frontier.

use crate::config::CrawlerConfig;
use crate::crawler::frontier::{Frontier, QueuedUrl};
use crate::crawler::writer::WriteQueue;
use crate::storage::WriteRequest;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Outcome of consulting the retry policy after a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Re-enqueue the URL once the delay has elapsed
    RetryAfter(Duration),

    /// No attempts remain; the Failed status is terminal
    PermanentFailure,
}

/// Linear backoff capped at `backoff_cap`
///
/// | attempts | delay (base 5s, cap 60s) |
/// |----------|--------------------------|
/// | 1        | 5s                       |
/// | 2        | 10s                      |
/// | 12+      | 60s                      |
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub backoff_cap: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_backoff: Duration, backoff_cap: Duration) -> Self {
        Self {
            max_attempts,
            base_backoff,
            backoff_cap,
        }
    }

    pub fn from_config(config: &CrawlerConfig) -> Self {
        Self::new(
            config.max_attempts,
            Duration::from_millis(config.base_backoff_ms),
            Duration::from_millis(config.backoff_cap_ms),
        )
    }

    /// Decides what to do with a URL that has failed `attempt_count` times
    pub fn should_retry(&self, attempt_count: u32) -> RetryDecision {
        if attempt_count >= self.max_attempts {
            return RetryDecision::PermanentFailure;
        }

        let delay = self
            .base_backoff
            .checked_mul(attempt_count.max(1))
            .unwrap_or(self.backoff_cap)
            .min(self.backoff_cap);

        RetryDecision::RetryAfter(delay)
    }
}

/// Spawns and tracks retry timers
pub struct RetryScheduler {
    queue: WriteQueue,
    frontier: Arc<Frontier>,
    stop: CancellationToken,
    timers: Mutex<JoinSet<()>>,
}

impl RetryScheduler {
    pub fn new(queue: WriteQueue, frontier: Arc<Frontier>, stop: CancellationToken) -> Self {
        Self {
            queue,
            frontier,
            stop,
            timers: Mutex::new(JoinSet::new()),
        }
    }

    /// Re-enqueues `url` after `delay` unless the stop signal fires first
    ///
    /// `attempts` is the attempt count already recorded for the URL, including
    /// the failure that triggered this retry.
    pub fn schedule(&self, url: String, attempts: u32, delay: Duration) {
        let queue = self.queue.clone();
        let frontier = self.frontier.clone();
        let stop = self.stop.clone();

        tracing::debug!("Retry of {} scheduled in {:?}", url, delay);

        let mut timers = self.timers.lock().unwrap_or_else(PoisonError::into_inner);
        // Reap finished timers so the set stays small on long crawls
        while timers.try_join_next().is_some() {}

        timers.spawn(async move {
            tokio::select! {
                _ = stop.cancelled() => {
                    tracing::debug!("Retry of {} abandoned by shutdown", url);
                }
                _ = tokio::time::sleep(delay) => {
                    if queue.submit(WriteRequest::requeue(url.clone())).await.is_err() {
                        tracing::debug!("Write queue closed before retry of {}", url);
                        return;
                    }
                    frontier.retry_ready(QueuedUrl::new(url, attempts));
                }
            }
        });
    }

    /// Number of timers not yet reaped
    pub fn pending(&self) -> usize {
        self.timers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Waits for every outstanding timer, then drops the queue handle
    pub async fn shutdown(self) {
        let mut timers = self
            .timers
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner);

        while let Some(result) = timers.join_next().await {
            if let Err(e) = result {
                tracing::warn!("Retry timer failed: {}", e);
            }
        }
    }
}
