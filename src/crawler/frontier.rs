//! In-memory frontier of URLs awaiting a fetch attempt
//!
//! The frontier owns transient membership only: which URLs are queued, which
//! have been seen, and how many are in flight. Authoritative status lives in
//! the store.

use std::collections::{HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;

/// A URL queued for fetching
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedUrl {
    /// The normalized URL
    pub url: String,

    /// Fetch attempts already recorded for this URL
    pub attempts: u32,
}

impl QueuedUrl {
    pub fn new(url: impl Into<String>, attempts: u32) -> Self {
        Self {
            url: url.into(),
            attempts,
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    queue: VecDeque<QueuedUrl>,
    queued: HashSet<String>,
    seen: HashSet<String>,
    in_flight: usize,
    unreconciled: Vec<String>,
}

/// Thread-safe work queue with dedup and in-flight accounting
///
/// The lock is never held across an await point, so fetch I/O always happens
/// outside it.
#[derive(Debug, Default)]
pub struct Frontier {
    inner: Mutex<Inner>,
    work_available: Notify,
}

/// Point-in-time view of the frontier counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrontierSnapshot {
    pub queued: usize,
    pub in_flight: usize,
    pub seen: usize,
}

impl Frontier {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Marks URLs known to the store as seen so they are never re-discovered
    pub fn seed_known<I>(&self, urls: I)
    where
        I: IntoIterator<Item = String>,
    {
        let mut inner = self.lock();
        inner.seen.extend(urls);
    }

    /// Enqueues a newly discovered URL
    ///
    /// Returns false (and does nothing) if the URL was already seen, whether it
    /// is queued, in flight, or terminal.
    pub fn enqueue(&self, item: QueuedUrl) -> bool {
        {
            let mut inner = self.lock();
            if !inner.seen.insert(item.url.clone()) {
                return false;
            }
            inner.queued.insert(item.url.clone());
            inner.queue.push_back(item);
        }
        self.work_available.notify_one();
        true
    }

    /// Re-admits a URL that is already known, e.g. a resumed record at startup
    ///
    /// Returns false if the URL is already queued.
    pub fn requeue(&self, item: QueuedUrl) -> bool {
        {
            let mut inner = self.lock();
            if !inner.queued.insert(item.url.clone()) {
                return false;
            }
            inner.seen.insert(item.url.clone());
            inner.queue.push_back(item);
        }
        self.work_available.notify_one();
        true
    }

    /// Moves a URL whose retry delay has elapsed from in-flight back to the queue
    ///
    /// Both counters change under one lock so completion is never observed in
    /// between.
    pub fn retry_ready(&self, item: QueuedUrl) {
        {
            let mut inner = self.lock();
            inner.in_flight = inner.in_flight.saturating_sub(1);
            if inner.queued.insert(item.url.clone()) {
                inner.queue.push_back(item);
            }
        }
        self.work_available.notify_one();
    }

    /// Pops the next URL and counts it as in flight
    pub fn dequeue(&self) -> Option<QueuedUrl> {
        let mut inner = self.lock();
        let item = inner.queue.pop_front()?;
        inner.queued.remove(&item.url);
        inner.in_flight += 1;
        Some(item)
    }

    /// Ends an in-flight period once the outcome write is durable
    pub fn release(&self, url: &str) {
        let mut inner = self.lock();
        if inner.in_flight == 0 {
            tracing::warn!("Release of {} with nothing in flight", url);
            return;
        }
        inner.in_flight -= 1;
    }

    /// True when nothing is queued and nothing is in flight
    pub fn is_complete(&self) -> bool {
        let inner = self.lock();
        inner.queue.is_empty() && inner.in_flight == 0
    }

    /// Parks until an enqueue happens or `timeout` elapses
    pub async fn wait_for_work(&self, timeout: Duration) {
        let _ = tokio::time::timeout(timeout, self.work_available.notified()).await;
    }

    /// Wakes every parked worker, e.g. on shutdown
    pub fn wake_all(&self) {
        self.work_available.notify_waiters();
    }

    /// Records URLs whose outcome write was lost; a later run reconciles them
    pub fn mark_unreconciled<I>(&self, urls: I)
    where
        I: IntoIterator<Item = String>,
    {
        let mut inner = self.lock();
        inner.unreconciled.extend(urls);
    }

    pub fn unreconciled(&self) -> Vec<String> {
        self.lock().unreconciled.clone()
    }

    pub fn snapshot(&self) -> FrontierSnapshot {
        let inner = self.lock();
        FrontierSnapshot {
            queued: inner.queue.len(),
            in_flight: inner.in_flight,
            seen: inner.seen.len(),
        }
    }
}
