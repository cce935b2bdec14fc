//! Single-consumer batching writer
//!
//! Every URL mutation travels through one bounded channel to one task that
//! owns the store. Requests are grouped into batches and each batch is applied
//! as a single transaction in submission order, so per-URL ordering is the
//! order in which workers submitted.

use crate::config::WriterConfig;
use crate::crawler::frontier::Frontier;
use crate::storage::{Storage, WriteRequest};
use crate::{LedgerError, Result};
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Pause between attempts to commit a failed batch, multiplied by the attempt number
const BATCH_RETRY_PAUSE: Duration = Duration::from_millis(50);

/// Cloneable producer handle for the write channel
#[derive(Debug, Clone)]
pub struct WriteQueue {
    tx: mpsc::Sender<WriteRequest>,
}

impl WriteQueue {
    /// Submits a request, waiting while the channel is full
    pub async fn submit(&self, request: WriteRequest) -> Result<()> {
        self.tx
            .send(request)
            .await
            .map_err(|_| LedgerError::QueueClosed)
    }
}

/// Counters maintained by the writer task
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriterStats {
    /// Batches committed
    pub batches: u64,

    /// Requests committed
    pub applied: u64,

    /// Batches dropped, either after exhausting retries or because an
    /// earlier batch was already lost
    pub failed_batches: u64,
}

/// What the writer hands back once its channel has closed
pub struct WriterOutcome<S> {
    pub store: S,
    pub stats: WriterStats,

    /// URLs touched by batches that could not be committed
    pub lost: Vec<String>,
}

/// Join handle for a running writer
pub struct WriterHandle<S> {
    join: JoinHandle<WriterOutcome<S>>,
    stats: Arc<Mutex<WriterStats>>,
}

impl<S> WriterHandle<S> {
    /// Current counters, readable while the writer is running
    pub fn stats(&self) -> WriterStats {
        *self.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Waits for the writer to drain and exit
    ///
    /// Returns only after every `WriteQueue` clone has been dropped.
    pub async fn finish(self) -> Result<WriterOutcome<S>> {
        Ok(self.join.await?)
    }
}

/// The writer task state
pub struct Writer<S> {
    store: S,
    rx: mpsc::Receiver<WriteRequest>,
    frontier: Arc<Frontier>,
    stop: CancellationToken,
    batch_size: usize,
    flush_interval: Duration,
    max_batch_retries: u32,
    stats: Arc<Mutex<WriterStats>>,
    lost: BTreeSet<String>,
}

impl<S: Storage> Writer<S> {
    /// Starts the writer task
    ///
    /// `stop` is cancelled by the writer itself if a batch is lost. From then
    /// on nothing more is committed: later batches are drained and dropped
    /// until every producer handle is gone, so a lost write can never be
    /// followed by a committed write that depends on it.
    pub fn spawn(
        store: S,
        frontier: Arc<Frontier>,
        config: &WriterConfig,
        stop: CancellationToken,
    ) -> (WriteQueue, WriterHandle<S>) {
        let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));
        let stats = Arc::new(Mutex::new(WriterStats::default()));

        let writer = Writer {
            store,
            rx,
            frontier,
            stop,
            batch_size: config.batch_size.max(1),
            flush_interval: config.flush_interval(),
            max_batch_retries: config.max_batch_retries,
            stats: stats.clone(),
            lost: BTreeSet::new(),
        };

        let join = tokio::spawn(writer.run());

        (WriteQueue { tx }, WriterHandle { join, stats })
    }

    async fn run(mut self) -> WriterOutcome<S> {
        tracing::debug!(
            "Writer started (batch size {}, flush interval {:?})",
            self.batch_size,
            self.flush_interval
        );

        loop {
            let Some(first) = self.rx.recv().await else {
                break;
            };

            let (batch, closed) = self.collect_batch(first).await;
            self.commit(batch).await;

            if closed {
                break;
            }
        }

        let stats = *self.stats.lock().unwrap_or_else(PoisonError::into_inner);
        tracing::debug!(
            "Writer stopped: {} batches, {} writes applied, {} batches lost",
            stats.batches,
            stats.applied,
            stats.failed_batches
        );

        WriterOutcome {
            store: self.store,
            stats,
            lost: self.lost.into_iter().collect(),
        }
    }

    /// Gathers requests until the batch is full or the flush deadline passes
    ///
    /// The deadline is measured from the arrival of `first`. Returns true as the
    /// second element when the channel closed while collecting.
    async fn collect_batch(&mut self, first: WriteRequest) -> (Vec<WriteRequest>, bool) {
        let mut batch = Vec::with_capacity(self.batch_size);
        batch.push(first);

        let deadline = tokio::time::sleep_until(Instant::now() + self.flush_interval);
        tokio::pin!(deadline);

        while batch.len() < self.batch_size {
            tokio::select! {
                biased;
                request = self.rx.recv() => match request {
                    Some(request) => batch.push(request),
                    None => return (batch, true),
                },
                _ = &mut deadline => break,
            }
        }

        (batch, false)
    }

    async fn commit(&mut self, batch: Vec<WriteRequest>) {
        if !self.lost.is_empty() {
            self.discard(batch);
            return;
        }

        let mut attempt = 0;

        loop {
            match self.store.apply_batch(&batch) {
                Ok(()) => {
                    {
                        let mut stats = self.stats.lock().unwrap_or_else(PoisonError::into_inner);
                        stats.batches += 1;
                        stats.applied += batch.len() as u64;
                    }
                    tracing::trace!("Committed batch of {} writes", batch.len());
                    self.release(&batch);
                    return;
                }
                Err(e) if attempt < self.max_batch_retries => {
                    attempt += 1;
                    tracing::warn!(
                        "Batch of {} writes failed (attempt {}/{}): {}",
                        batch.len(),
                        attempt,
                        self.max_batch_retries + 1,
                        e
                    );
                    tokio::time::sleep(BATCH_RETRY_PAUSE * attempt).await;
                }
                Err(e) => {
                    self.give_up(batch, e);
                    return;
                }
            }
        }
    }

    fn release(&self, batch: &[WriteRequest]) {
        for request in batch.iter().filter(|r| r.releases()) {
            self.frontier.release(&request.url);
        }
    }

    fn give_up(&mut self, batch: Vec<WriteRequest>, error: crate::storage::StorageError) {
        let urls: BTreeSet<String> = batch.iter().map(|r| r.url.clone()).collect();

        tracing::error!(
            "Data loss: dropping batch of {} writes touching {} URLs after {} attempts: {}",
            batch.len(),
            urls.len(),
            self.max_batch_retries + 1,
            error
        );

        self.drop_batch(&batch, urls);
        self.stop.cancel();
    }

    /// Drops a batch that arrived after an earlier batch was lost
    fn discard(&mut self, batch: Vec<WriteRequest>) {
        let urls: BTreeSet<String> = batch.iter().map(|r| r.url.clone()).collect();
        tracing::warn!(
            "Dropping batch of {} writes after an earlier loss ({} URLs)",
            batch.len(),
            urls.len()
        );
        self.drop_batch(&batch, urls);
    }

    fn drop_batch(&mut self, batch: &[WriteRequest], urls: BTreeSet<String>) {
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .failed_batches += 1;

        self.frontier.mark_unreconciled(urls.iter().cloned());
        self.lost.extend(urls);

        // In-flight slots these writes would have ended must still end
        self.release(batch);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crawler::frontier::QueuedUrl;
    use crate::state::UrlStatus;
    use crate::storage::{RunRecord, RunStatus, SqliteStorage, StorageError, StorageResult, UrlRecord};
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Wraps a store, records every committed write, and fails the first
    /// `failures` batches
    struct FlakyStorage {
        inner: SqliteStorage,
        failures: Arc<AtomicU32>,
        log: Arc<Mutex<Vec<WriteRequest>>>,
    }

    impl FlakyStorage {
        fn new(failures: u32) -> Self {
            Self {
                inner: SqliteStorage::new_in_memory().unwrap(),
                failures: Arc::new(AtomicU32::new(failures)),
                log: Arc::new(Mutex::new(Vec::new())),
            }
        }
    }

    impl Storage for FlakyStorage {
        fn load_resumable(&self) -> StorageResult<Vec<UrlRecord>> {
            self.inner.load_resumable()
        }

        fn load_known_urls(&self) -> StorageResult<Vec<String>> {
            self.inner.load_known_urls()
        }

        fn get_record(&self, url: &str) -> StorageResult<Option<UrlRecord>> {
            self.inner.get_record(url)
        }

        fn apply_batch(&mut self, batch: &[WriteRequest]) -> StorageResult<()> {
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Err(StorageError::Database("disk I/O error".into()));
            }
            self.inner.apply_batch(batch)?;
            self.log.lock().unwrap().extend(batch.iter().cloned());
            Ok(())
        }

        fn create_run(&mut self, config_hash: &str) -> StorageResult<i64> {
            self.inner.create_run(config_hash)
        }

        fn latest_run(&self) -> StorageResult<Option<RunRecord>> {
            self.inner.latest_run()
        }

        fn finish_run(&mut self, run_id: i64, status: RunStatus) -> StorageResult<()> {
            self.inner.finish_run(run_id, status)
        }

        fn count_by_status(&self, status: UrlStatus) -> StorageResult<u64> {
            self.inner.count_by_status(status)
        }

        fn count_total(&self) -> StorageResult<u64> {
            self.inner.count_total()
        }
    }

    fn config(batch_size: usize) -> WriterConfig {
        WriterConfig {
            batch_size,
            flush_interval_ms: 1000,
            channel_capacity: 64,
            max_batch_retries: 2,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_batch_flushes_immediately() {
        let frontier = Arc::new(Frontier::new());
        let (queue, handle) = Writer::spawn(
            SqliteStorage::new_in_memory().unwrap(),
            frontier,
            &config(5),
            CancellationToken::new(),
        );

        for i in 0..5 {
            queue
                .submit(WriteRequest::discover(format!("https://example.com/{}", i), None))
                .await
                .unwrap();
        }

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(handle.stats().batches, 1);
        assert_eq!(handle.stats().applied, 5);

        drop(queue);
        handle.finish().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_batch_flushes_after_interval() {
        let frontier = Arc::new(Frontier::new());
        let (queue, handle) = Writer::spawn(
            SqliteStorage::new_in_memory().unwrap(),
            frontier,
            &config(5),
            CancellationToken::new(),
        );

        queue
            .submit(WriteRequest::discover("https://example.com/", None))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(900)).await;
        assert_eq!(handle.stats().applied, 0);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(handle.stats().applied, 1);

        drop(queue);
        handle.finish().await.unwrap();
    }

    #[tokio::test]
    async fn test_close_flushes_partial_batch() {
        let frontier = Arc::new(Frontier::new());
        let (queue, handle) = Writer::spawn(
            SqliteStorage::new_in_memory().unwrap(),
            frontier,
            &WriterConfig::default(),
            CancellationToken::new(),
        );

        queue
            .submit(WriteRequest::discover("https://example.com/a", None))
            .await
            .unwrap();
        queue
            .submit(WriteRequest::discover("https://example.com/b", None))
            .await
            .unwrap();
        drop(queue);

        let outcome = handle.finish().await.unwrap();
        assert_eq!(outcome.stats.applied, 2);
        assert_eq!(outcome.store.count_total().unwrap(), 2);
        assert!(outcome.lost.is_empty());
    }

    #[tokio::test]
    async fn test_per_url_order_preserved() {
        let store = FlakyStorage::new(0);
        let log = store.log.clone();
        let frontier = Arc::new(Frontier::new());
        let (queue, handle) =
            Writer::spawn(store, frontier, &config(2), CancellationToken::new());

        let url = "https://example.com/";
        let sequence = vec![
            WriteRequest::discover(url, None),
            WriteRequest::claim(url),
            WriteRequest::failure(url, "timeout".into(), false),
            WriteRequest::requeue(url),
            WriteRequest::claim(url),
            WriteRequest::success(url, "body".into()),
        ];
        for request in sequence.clone() {
            queue.submit(request).await.unwrap();
        }
        drop(queue);

        let outcome = handle.finish().await.unwrap();
        assert_eq!(*log.lock().unwrap(), sequence);

        let record = outcome.store.get_record(url).unwrap().unwrap();
        assert_eq!(record.status, UrlStatus::Success);
        assert_eq!(record.attempt_count, 2);
    }

    #[tokio::test]
    async fn test_success_releases_in_flight_after_commit() {
        let frontier = Arc::new(Frontier::new());
        frontier.enqueue(QueuedUrl::new("https://example.com/", 0));
        frontier.dequeue();

        let (queue, handle) = Writer::spawn(
            SqliteStorage::new_in_memory().unwrap(),
            frontier.clone(),
            &WriterConfig::default(),
            CancellationToken::new(),
        );

        queue
            .submit(WriteRequest::claim("https://example.com/"))
            .await
            .unwrap();
        queue
            .submit(WriteRequest::success("https://example.com/", "text".into()))
            .await
            .unwrap();
        assert_eq!(frontier.snapshot().in_flight, 1);

        drop(queue);
        handle.finish().await.unwrap();
        assert!(frontier.is_complete());
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried() {
        let frontier = Arc::new(Frontier::new());
        let stop = CancellationToken::new();
        let (queue, handle) =
            Writer::spawn(FlakyStorage::new(2), frontier, &config(10), stop.clone());

        queue
            .submit(WriteRequest::discover("https://example.com/", None))
            .await
            .unwrap();
        drop(queue);

        let outcome = handle.finish().await.unwrap();
        assert_eq!(outcome.stats.batches, 1);
        assert_eq!(outcome.stats.failed_batches, 0);
        assert!(outcome.lost.is_empty());
        assert!(!stop.is_cancelled());
    }

    #[tokio::test]
    async fn test_exhausted_retries_raise_stop() {
        let frontier = Arc::new(Frontier::new());
        frontier.enqueue(QueuedUrl::new("https://example.com/", 0));
        frontier.dequeue();

        let stop = CancellationToken::new();
        let (queue, handle) =
            Writer::spawn(FlakyStorage::new(3), frontier.clone(), &config(10), stop.clone());

        queue
            .submit(WriteRequest::success("https://example.com/", "text".into()))
            .await
            .unwrap();
        drop(queue);

        let outcome = handle.finish().await.unwrap();
        assert!(stop.is_cancelled());
        assert_eq!(outcome.stats.failed_batches, 1);
        assert_eq!(outcome.lost, vec!["https://example.com/".to_string()]);
        assert_eq!(frontier.unreconciled(), vec!["https://example.com/".to_string()]);
        assert!(frontier.is_complete());
        assert_eq!(outcome.store.count_total().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_nothing_commits_after_a_lost_batch() {
        let parent = "https://example.com/";
        let child = "https://example.com/child";

        let frontier = Arc::new(Frontier::new());
        frontier.enqueue(QueuedUrl::new(parent, 0));
        frontier.dequeue();

        let mut store = FlakyStorage::new(0);
        store
            .inner
            .apply_batch(&[WriteRequest::discover(parent, None), WriteRequest::claim(parent)])
            .unwrap();
        store.failures.store(3, Ordering::SeqCst);

        let stop = CancellationToken::new();
        let (queue, handle) =
            Writer::spawn(store, frontier.clone(), &config(1), stop.clone());

        queue
            .submit(WriteRequest::discover(child, Some(parent.to_string())))
            .await
            .unwrap();
        queue
            .submit(WriteRequest::success(parent, "text".into()))
            .await
            .unwrap();
        drop(queue);

        let outcome = handle.finish().await.unwrap();
        assert!(stop.is_cancelled());
        assert_eq!(outcome.stats.batches, 0);
        assert_eq!(outcome.stats.failed_batches, 2);
        assert_eq!(outcome.lost, vec![parent.to_string(), child.to_string()]);
        assert!(frontier.is_complete());

        // The parent stays claimed so a later run fetches it and rediscovers the child
        let record = outcome.store.get_record(parent).unwrap().unwrap();
        assert_eq!(record.status, UrlStatus::InProgress);
        assert_eq!(outcome.store.get_record(child).unwrap(), None);
    }

    #[tokio::test]
    async fn test_submit_after_writer_exit_fails() {
        let frontier = Arc::new(Frontier::new());
        let (queue, handle) = Writer::spawn(
            SqliteStorage::new_in_memory().unwrap(),
            frontier,
            &WriterConfig::default(),
            CancellationToken::new(),
        );
        handle.join.abort();
        let _ = handle.join.await;

        assert!(matches!(
            queue.submit(WriteRequest::discover("https://example.com/", None)).await,
            Err(LedgerError::QueueClosed)
        ));
    }
}
