//! Crawler coordinator - main crawl orchestration logic
//!
//! This module wires the pieces of a crawl together:
//! - Loading the resumable snapshot from the store and seeding the frontier
//! - Spawning the writer, the worker pool, and the retry scheduler
//! - Detecting completion, interruption, and writer failure
//! - Draining everything in order and recording the run outcome

use crate::config::{config_fingerprint, Config};
use crate::crawler::extractor::{Extractor, HtmlExtractor};
use crate::crawler::fetcher::{Fetcher, HttpFetcher};
use crate::crawler::frontier::{Frontier, QueuedUrl};
use crate::crawler::retry::{RetryPolicy, RetryScheduler};
use crate::crawler::worker::{run_worker, WorkerContext};
use crate::crawler::writer::{Writer, WriterStats};
use crate::state::UrlStatus;
use crate::storage::{RunStatus, SqliteStorage, StatusCounts, Storage, WriteRequest};
use crate::url::CrawlScope;
use crate::{LedgerError, Result};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Interval between progress log lines
const PROGRESS_INTERVAL: Duration = Duration::from_secs(10);

/// Summary of a finished run
#[derive(Debug, Clone)]
pub struct CrawlReport {
    pub run_id: i64,
    pub status: RunStatus,
    pub elapsed: Duration,

    /// Store-wide counts after the final flush
    pub counts: StatusCounts,

    pub writer: WriterStats,
}

/// Main crawler coordinator structure
pub struct Coordinator<S: Storage> {
    config: Config,
    store: S,
    fetcher: Arc<dyn Fetcher>,
    extractor: Arc<dyn Extractor>,
    frontier: Arc<Frontier>,
    bootstrap: Vec<WriteRequest>,
    run_id: i64,
}

impl Coordinator<SqliteStorage> {
    /// Builds a coordinator with the default SQLite store, HTTP fetcher, and HTML extractor
    pub fn from_config(config: Config) -> Result<Self> {
        let store = SqliteStorage::new(Path::new(&config.output.database_path))?;
        let fetcher = HttpFetcher::new(&config.fetcher)?;
        let mut extractor = HtmlExtractor::new(CrawlScope::new(&config.scope));
        if let Some(selector) = &config.scope.content_selector {
            extractor = extractor.with_content_selector(selector.clone());
        }

        Self::new(config, store, Arc::new(fetcher), Arc::new(extractor))
    }
}

impl<S: Storage> Coordinator<S> {
    /// Creates a coordinator and prepares the frontier
    ///
    /// # Startup
    ///
    /// | Stored status | Action |
    /// |---------------|--------|
    /// | (empty store) | seed from the configured seed list |
    /// | New | re-queue |
    /// | InProgress | reset to New, re-queue |
    /// | Failed, attempts remaining | reset to New, re-queue |
    /// | Failed, no attempts left or marked permanent | leave terminal |
    /// | Success | never loaded |
    ///
    /// Seeds are offered on every run; ones already in the store are ignored.
    ///
    /// # Returns
    ///
    /// * `Ok(Coordinator)` - Ready to run
    /// * `Err(LedgerError::Storage)` - The store could not be read
    pub fn new(
        config: Config,
        mut store: S,
        fetcher: Arc<dyn Fetcher>,
        extractor: Arc<dyn Extractor>,
    ) -> Result<Self> {
        let resumable = store.load_resumable()?;
        let known = store.load_known_urls()?;
        let run_id = store.create_run(&config_fingerprint(&config)?)?;

        let frontier = Arc::new(Frontier::new());
        let mut bootstrap = Vec::new();

        if known.is_empty() {
            tracing::info!("Empty store, starting run {} from seeds", run_id);
        } else {
            tracing::info!(
                "Resuming run {} with {} known URLs ({} unfinished)",
                run_id,
                known.len(),
                resumable.len()
            );
        }
        frontier.seed_known(known);

        let max_attempts = config.crawler.max_attempts;
        let mut recovered = 0;
        let mut exhausted = 0;

        for record in resumable {
            match record.status {
                UrlStatus::New => {}
                UrlStatus::InProgress => {
                    recovered += 1;
                    bootstrap.push(WriteRequest::requeue(record.url.clone()));
                }
                UrlStatus::Failed if !record.terminal && record.attempt_count < max_attempts => {
                    bootstrap.push(WriteRequest::requeue(record.url.clone()));
                }
                UrlStatus::Failed => {
                    exhausted += 1;
                    continue;
                }
                UrlStatus::Success => continue,
            }
            frontier.requeue(QueuedUrl::new(record.url, record.attempt_count));
        }

        if recovered > 0 {
            tracing::info!("Recovered {} URLs left in progress by a previous run", recovered);
        }
        if exhausted > 0 {
            tracing::debug!("{} failed URLs have no attempts left", exhausted);
        }

        let scope = CrawlScope::new(&config.scope);
        for seed in &config.seeds.urls {
            let url = scope.normalize_seed(seed)?;
            if frontier.enqueue(QueuedUrl::new(url.clone(), 0)) {
                bootstrap.push(WriteRequest::discover(url, None));
            }
        }

        Ok(Self {
            config,
            store,
            fetcher,
            extractor,
            frontier,
            bootstrap,
            run_id,
        })
    }

    pub fn run_id(&self) -> i64 {
        self.run_id
    }

    pub fn frontier(&self) -> &Arc<Frontier> {
        &self.frontier
    }

    /// Runs the crawl until completion, `shutdown`, or writer failure
    ///
    /// # Shutdown Order
    ///
    /// 1. Cancel the stop token and wake idle workers
    /// 2. Join workers, then retry timers
    /// 3. Drop the last write queue handle so the writer flushes and exits
    /// 4. Stamp the run with its final status
    ///
    /// # Returns
    ///
    /// * `Ok(CrawlReport)` - The run ended and every write was committed
    /// * `Err(LedgerError::WriterFailed)` - A batch was lost; the run is marked Failed
    pub async fn run(self, shutdown: CancellationToken) -> Result<CrawlReport> {
        let Self {
            config,
            store,
            fetcher,
            extractor,
            frontier,
            bootstrap,
            run_id,
        } = self;

        let started = Instant::now();
        let stop = shutdown.child_token();

        let (queue, writer) = Writer::spawn(store, frontier.clone(), &config.writer, stop.clone());

        for request in bootstrap {
            queue.submit(request).await?;
        }

        let retry = Arc::new(RetryScheduler::new(
            queue.clone(),
            frontier.clone(),
            stop.clone(),
        ));

        let ctx = Arc::new(WorkerContext {
            frontier: frontier.clone(),
            queue,
            fetcher,
            extractor,
            retry: retry.clone(),
            policy: RetryPolicy::from_config(&config.crawler),
            stop: stop.clone(),
            fetch_timeout: config.crawler.per_fetch_timeout(),
            idle_poll: config.crawler.idle_poll(),
            retry_blocked: config.crawler.retry_blocked,
        });

        let worker_count = config.crawler.worker_count as usize;
        tracing::info!("Starting crawl run {} with {} workers", run_id, worker_count);

        let mut workers = JoinSet::new();
        for id in 0..worker_count {
            workers.spawn(run_worker(id, ctx.clone()));
        }

        let completed = wait_for_completion(
            &frontier,
            &stop,
            config.crawler.completion_poll(),
            || writer.stats(),
        )
        .await;

        if completed {
            tracing::info!("Frontier drained, crawl complete");
        } else if shutdown.is_cancelled() {
            tracing::info!("Shutdown requested, draining workers");
        }

        stop.cancel();
        frontier.wake_all();

        while let Some(result) = workers.join_next().await {
            if let Err(e) = result {
                tracing::warn!("Worker task failed: {}", e);
            }
        }

        drop(ctx);
        match Arc::try_unwrap(retry) {
            Ok(retry) => retry.shutdown().await,
            Err(_) => tracing::warn!("Retry scheduler still shared at shutdown"),
        }

        let outcome = writer.finish().await?;
        let mut store = outcome.store;

        let status = if !outcome.lost.is_empty() {
            RunStatus::Failed
        } else if completed {
            RunStatus::Completed
        } else {
            RunStatus::Interrupted
        };
        store.finish_run(run_id, status)?;

        if !outcome.lost.is_empty() {
            tracing::error!(
                "Run {} failed: {} URLs need reconciliation",
                run_id,
                outcome.lost.len()
            );
            for url in frontier.unreconciled() {
                tracing::warn!("Unreconciled: {}", url);
            }
            return Err(LedgerError::WriterFailed { lost: outcome.lost });
        }

        let report = CrawlReport {
            run_id,
            status,
            elapsed: started.elapsed(),
            counts: StatusCounts::load(&store)?,
            writer: outcome.stats,
        };

        tracing::info!(
            "Run {} {}: {} succeeded, {} failed, {} pending in {:.1}s",
            run_id,
            status.to_db_string(),
            report.counts.success,
            report.counts.failed,
            report.counts.new + report.counts.in_progress,
            report.elapsed.as_secs_f64()
        );

        Ok(report)
    }
}

/// Polls the frontier until it is complete or `stop` fires
///
/// Returns true on completion.
async fn wait_for_completion<F>(
    frontier: &Frontier,
    stop: &CancellationToken,
    poll: Duration,
    writer_stats: F,
) -> bool
where
    F: Fn() -> WriterStats,
{
    let mut ticker = tokio::time::interval(poll);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut last_progress = Instant::now();

    loop {
        tokio::select! {
            _ = stop.cancelled() => return false,
            _ = ticker.tick() => {
                if frontier.is_complete() {
                    return true;
                }

                if last_progress.elapsed() >= PROGRESS_INTERVAL {
                    let snapshot = frontier.snapshot();
                    let stats = writer_stats();
                    tracing::info!(
                        "Progress: {} queued, {} in flight, {} known, {} writes committed",
                        snapshot.queued,
                        snapshot.in_flight,
                        snapshot.seen,
                        stats.applied
                    );
                    last_progress = Instant::now();
                }
            }
        }
    }
}
