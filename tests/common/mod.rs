//! Shared helpers for integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use crawl_ledger::config::{parse_config, Config};
use crawl_ledger::crawler::{FetchError, FetchErrorKind, Fetcher, HtmlExtractor, RawPage};
use crawl_ledger::state::UrlStatus;
use crawl_ledger::storage::{
    RunRecord, RunStatus, SqliteStorage, Storage, StorageError, StorageResult, UrlRecord,
    WriteKind, WriteRequest,
};
use crawl_ledger::url::CrawlScope;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Builds a validated config with fast timings for tests
pub fn test_config(db: &Path, seeds: &[String], workers: u32) -> Config {
    let seeds = seeds
        .iter()
        .map(|s| format!("\"{}\"", s))
        .collect::<Vec<_>>()
        .join(", ");

    parse_config(&format!(
        r#"
[crawler]
worker-count = {workers}
max-attempts = 3
base-backoff-ms = 100
backoff-cap-ms = 1000
per-fetch-timeout-ms = 2000
completion-poll-ms = 20
idle-poll-ms = 10

[writer]
batch-size = 16
flush-interval-ms = 20

[output]
database-path = "{db}"

[seeds]
urls = [{seeds}]
"#,
        workers = workers,
        db = db.display(),
        seeds = seeds
    ))
    .unwrap()
}

pub fn seed_urls(n: usize) -> Vec<String> {
    (0..n)
        .map(|i| format!("https://example.com/page/{}", i))
        .collect()
}

pub fn extractor() -> Arc<HtmlExtractor> {
    Arc::new(HtmlExtractor::new(CrawlScope::unrestricted()))
}

pub fn html_page(url: &str, body: &str) -> RawPage {
    RawPage {
        final_url: url.to_string(),
        status_code: 200,
        content_type: Some("text/html".to_string()),
        body: body.to_string(),
    }
}

/// What the scripted fetcher does for a URL
#[derive(Debug, Clone)]
pub enum Script {
    /// Serve this HTML
    Page(String),
    /// Fail every attempt with this kind
    AlwaysFail(FetchErrorKind),
    /// Fail this many attempts, then serve the HTML
    FailThen(u32, String),
    /// Never answer this many attempts, then serve the HTML
    HangThen(u32, String),
}

/// In-memory fetcher driven by a per-URL script
///
/// URLs without a script get a small page with no links.
#[derive(Default)]
pub struct ScriptedFetcher {
    scripts: HashMap<String, Script>,
    calls: Mutex<Vec<(String, Instant)>>,
    cancel_after: Option<(usize, CancellationToken)>,
}

impl ScriptedFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(mut self, url: impl Into<String>, script: Script) -> Self {
        self.scripts.insert(url.into(), script);
        self
    }

    /// Cancels `token` from inside the `n`th fetch
    pub fn cancel_after(mut self, n: usize, token: CancellationToken) -> Self {
        self.cancel_after = Some((n, token));
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|(url, _)| url.clone())
            .collect()
    }

    pub fn call_times(&self, url: &str) -> Vec<Instant> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(u, _)| u == url)
            .map(|(_, at)| *at)
            .collect()
    }
}

#[async_trait]
impl Fetcher for ScriptedFetcher {
    async fn fetch(&self, url: &str, _timeout: Duration) -> Result<RawPage, FetchError> {
        let attempt = {
            let mut calls = self.calls.lock().unwrap();
            calls.push((url.to_string(), Instant::now()));

            if let Some((n, token)) = &self.cancel_after {
                if calls.len() == *n {
                    token.cancel();
                }
            }

            calls.iter().filter(|(u, _)| u == url).count() as u32
        };

        tokio::task::yield_now().await;

        match self.scripts.get(url) {
            None => Ok(html_page(url, "<html><body>leaf</body></html>")),
            Some(Script::Page(body)) => Ok(html_page(url, body)),
            Some(Script::AlwaysFail(kind)) => Err(FetchError::new(*kind, "scripted failure")),
            Some(Script::FailThen(failures, body)) => {
                if attempt <= *failures {
                    Err(FetchError::new(FetchErrorKind::Network, "scripted failure"))
                } else {
                    Ok(html_page(url, body))
                }
            }
            Some(Script::HangThen(hangs, body)) => {
                if attempt <= *hangs {
                    std::future::pending::<()>().await;
                }
                Ok(html_page(url, body))
            }
        }
    }
}

/// SQLite store that records every committed write in commit order
pub struct RecordingStorage {
    inner: SqliteStorage,
    log: Arc<Mutex<Vec<WriteRequest>>>,
    broken: bool,
}

impl RecordingStorage {
    pub fn open(path: &Path) -> (Self, Arc<Mutex<Vec<WriteRequest>>>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let storage = Self {
            inner: SqliteStorage::new(path).unwrap(),
            log: log.clone(),
            broken: false,
        };
        (storage, log)
    }

    /// A store whose batches never commit; run bookkeeping still works
    pub fn broken(path: &Path) -> Self {
        let (mut storage, _) = Self::open(path);
        storage.broken = true;
        storage
    }
}

impl Storage for RecordingStorage {
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
        if self.broken {
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

/// Status sequence written for one URL; `None` marks a discovery
pub fn status_trail(log: &[WriteRequest], url: &str) -> Vec<Option<UrlStatus>> {
    log.iter()
        .filter(|r| r.url == url)
        .map(|r| match &r.kind {
            WriteKind::Discover { .. } => None,
            WriteKind::Transition { status, .. } => Some(*status),
        })
        .collect()
}
