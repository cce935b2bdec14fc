//! SQLite storage implementation
//!
//! This module provides a SQLite-based implementation of the Storage trait.

use crate::state::UrlStatus;
use crate::storage::schema::initialize_schema;
use crate::storage::traits::{Storage, StorageError, StorageResult};
use crate::storage::{NormalizeSummary, RunRecord, RunStatus, UrlRecord, WriteKind, WriteRequest};
use crate::url::normalize_url;
use crate::LedgerError;
use chrono::Utc;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};
use std::collections::BTreeMap;
use std::path::Path;

const RECORD_COLUMNS: &str =
    "url, status, content, discovered_from, attempt_count, last_error, updated_at, terminal";

/// SQLite storage backend
pub struct SqliteStorage {
    conn: Connection,
}

impl SqliteStorage {
    /// Opens (or creates) the database at `path` and ensures the schema exists
    ///
    /// # Returns
    ///
    /// * `Ok(SqliteStorage)` - Successfully opened/created database
    /// * `Err(LedgerError)` - Failed to open database
    pub fn new(path: &Path) -> Result<Self, LedgerError> {
        let conn = Connection::open(path)?;

        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA temp_store = MEMORY;
        ",
        )?;

        initialize_schema(&conn)?;

        Ok(Self { conn })
    }

    /// Creates an in-memory database
    pub fn new_in_memory() -> Result<Self, LedgerError> {
        let conn = Connection::open_in_memory()?;
        initialize_schema(&conn)?;
        Ok(Self { conn })
    }

    /// Returns `(url, content)` for every Success record, ordered by URL
    ///
    /// This is the hand-off point for downstream dataset generation.
    pub fn success_contents(&self) -> StorageResult<Vec<(String, String)>> {
        let mut stmt = self.conn.prepare(
            "SELECT url, content FROM urls WHERE status = ?1 AND content IS NOT NULL ORDER BY url",
        )?;

        let rows = stmt
            .query_map(params![UrlStatus::Success.to_db_string()], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(rows)
    }

    /// Re-keys every stored URL under the current normalization rules
    ///
    /// Rows that normalize to the same key are merged into one. A Success row
    /// wins and keeps its content and attempt count; otherwise the merged row
    /// starts over as New. A row that is only renamed keeps its state. URLs
    /// that no longer parse are left alone. Runs as one transaction.
    pub fn normalize_urls(&mut self, strip_query: bool) -> StorageResult<NormalizeSummary> {
        let now = Utc::now().to_rfc3339();
        let tx = self.conn.transaction()?;

        let records = {
            let mut stmt = tx.prepare(&format!("SELECT {} FROM urls ORDER BY url", RECORD_COLUMNS))?;
            let records = stmt
                .query_map([], Self::read_record)?
                .collect::<Result<Vec<_>, _>>()?;
            records
        };
        let rows_before = records.len() as u64;

        let mut groups: BTreeMap<String, Vec<UrlRecord>> = BTreeMap::new();
        for record in records {
            let key = normalize_url(&record.url, strip_query)
                .map(String::from)
                .unwrap_or_else(|_| record.url.clone());
            groups.entry(key).or_default().push(record);
        }

        let mut rekeyed = 0;
        for (key, group) in &groups {
            if group.len() == 1 && group[0].url == *key {
                continue;
            }
            rekeyed += group.len() as u64;

            let merged = merge_group(key, group, &now);
            for record in group {
                tx.execute("DELETE FROM urls WHERE url = ?1", params![record.url])?;
            }
            tx.execute(
                &format!(
                    "INSERT INTO urls ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    RECORD_COLUMNS
                ),
                params![
                    merged.url,
                    merged.status.to_db_string(),
                    merged.content,
                    merged.discovered_from,
                    merged.attempt_count,
                    merged.last_error,
                    merged.updated_at,
                    merged.terminal
                ],
            )?;
        }

        tx.commit()?;

        let summary = NormalizeSummary {
            rows_before,
            rows_after: groups.len() as u64,
            rekeyed,
        };
        tracing::info!(
            "Normalized {} rows into {} ({} re-keyed)",
            summary.rows_before,
            summary.rows_after,
            summary.rekeyed
        );
        Ok(summary)
    }

    fn read_record(row: &Row<'_>) -> rusqlite::Result<UrlRecord> {
        let raw: String = row.get(1)?;
        let status = UrlStatus::from_db_string(&raw).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                1,
                Type::Text,
                format!("unknown status '{}'", raw).into(),
            )
        })?;

        Ok(UrlRecord {
            url: row.get(0)?,
            status,
            content: row.get(2)?,
            discovered_from: row.get(3)?,
            attempt_count: row.get(4)?,
            last_error: row.get(5)?,
            updated_at: row.get(6)?,
            terminal: row.get(7)?,
        })
    }

    fn current_status(tx: &Transaction<'_>, url: &str) -> StorageResult<Option<UrlStatus>> {
        let raw: Option<String> = tx
            .prepare_cached("SELECT status FROM urls WHERE url = ?1")?
            .query_row(params![url], |row| row.get(0))
            .optional()?;

        match raw {
            None => Ok(None),
            Some(raw) => UrlStatus::from_db_string(&raw)
                .map(Some)
                .ok_or_else(|| StorageError::Corrupt {
                    url: url.to_string(),
                    message: format!("unknown status '{}'", raw),
                }),
        }
    }

    fn apply_one(tx: &Transaction<'_>, request: &WriteRequest, now: &str) -> StorageResult<()> {
        match &request.kind {
            WriteKind::Discover { discovered_from } => {
                tx.prepare_cached(
                    "INSERT OR IGNORE INTO urls (url, status, discovered_from, attempt_count, updated_at)
                     VALUES (?1, ?2, ?3, 0, ?4)",
                )?
                .execute(params![
                    request.url,
                    UrlStatus::New.to_db_string(),
                    discovered_from,
                    now
                ])?;
            }

            WriteKind::Transition {
                status,
                content,
                error,
                attempt_delta,
                ..
            } => {
                if let Some(current) = Self::current_status(tx, &request.url)? {
                    if !current.can_transition_to(*status) {
                        tracing::warn!(
                            "Ignoring illegal transition for {}: {} -> {}",
                            request.url,
                            current,
                            status
                        );
                        return Ok(());
                    }
                }

                // Content only survives on Success; last_error is cleared by Success
                // and otherwise kept until a newer error replaces it.
                let content = if status.carries_content() {
                    content.as_deref()
                } else {
                    None
                };

                tx.prepare_cached(
                    "INSERT INTO urls (url, status, content, attempt_count, last_error, updated_at, terminal)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                     ON CONFLICT(url) DO UPDATE SET
                        status = excluded.status,
                        terminal = excluded.terminal,
                        content = excluded.content,
                        attempt_count = urls.attempt_count + excluded.attempt_count,
                        last_error = CASE WHEN excluded.status = 'success' THEN NULL
                                          ELSE COALESCE(excluded.last_error, urls.last_error) END,
                        updated_at = excluded.updated_at",
                )?
                .execute(params![
                    request.url,
                    status.to_db_string(),
                    content,
                    attempt_delta,
                    error,
                    now,
                    request.is_terminal_failure()
                ])?;
            }
        }
        Ok(())
    }

    fn read_run(row: &Row<'_>) -> rusqlite::Result<RunRecord> {
        Ok(RunRecord {
            id: row.get(0)?,
            started_at: row.get(1)?,
            finished_at: row.get(2)?,
            config_hash: row.get(3)?,
            status: RunStatus::from_db_string(&row.get::<_, String>(4)?)
                .unwrap_or(RunStatus::Running),
        })
    }
}

fn merge_group(key: &str, group: &[UrlRecord], now: &str) -> UrlRecord {
    if let [only] = group {
        return UrlRecord {
            url: key.to_string(),
            ..only.clone()
        };
    }

    if let Some(done) = group.iter().find(|r| r.status == UrlStatus::Success) {
        return UrlRecord {
            url: key.to_string(),
            ..done.clone()
        };
    }

    UrlRecord {
        url: key.to_string(),
        status: UrlStatus::New,
        content: None,
        discovered_from: group.iter().find_map(|r| r.discovered_from.clone()),
        attempt_count: 0,
        last_error: None,
        updated_at: now.to_string(),
        terminal: false,
    }
}

impl Storage for SqliteStorage {
    // ===== Startup Load =====

    fn load_resumable(&self) -> StorageResult<Vec<UrlRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM urls WHERE status != ?1 ORDER BY updated_at, url",
            RECORD_COLUMNS
        ))?;

        let records = stmt
            .query_map(params![UrlStatus::Success.to_db_string()], Self::read_record)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(records)
    }

    fn load_known_urls(&self) -> StorageResult<Vec<String>> {
        let mut stmt = self.conn.prepare("SELECT url FROM urls")?;
        let urls = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(urls)
    }

    fn get_record(&self, url: &str) -> StorageResult<Option<UrlRecord>> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {} FROM urls WHERE url = ?1", RECORD_COLUMNS))?;

        let record = stmt.query_row(params![url], Self::read_record).optional()?;
        Ok(record)
    }

    // ===== Mutation =====

    fn apply_batch(&mut self, batch: &[WriteRequest]) -> StorageResult<()> {
        let now = Utc::now().to_rfc3339();
        let tx = self.conn.transaction()?;

        for request in batch {
            Self::apply_one(&tx, request, &now)?;
        }

        tx.commit()?;
        Ok(())
    }

    // ===== Run Management =====

    fn create_run(&mut self, config_hash: &str) -> StorageResult<i64> {
        let now = Utc::now().to_rfc3339();
        self.conn.execute(
            "INSERT INTO runs (started_at, config_hash, status) VALUES (?1, ?2, ?3)",
            params![now, config_hash, RunStatus::Running.to_db_string()],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    fn latest_run(&self) -> StorageResult<Option<RunRecord>> {
        let run = self
            .conn
            .query_row(
                "SELECT id, started_at, finished_at, config_hash, status FROM runs ORDER BY id DESC LIMIT 1",
                [],
                Self::read_run,
            )
            .optional()?;

        Ok(run)
    }

    fn finish_run(&mut self, run_id: i64, status: RunStatus) -> StorageResult<()> {
        let now = Utc::now().to_rfc3339();
        let updated = self.conn.execute(
            "UPDATE runs SET status = ?1, finished_at = ?2 WHERE id = ?3",
            params![status.to_db_string(), now, run_id],
        )?;

        if updated == 0 {
            return Err(StorageError::RunNotFound(run_id));
        }
        Ok(())
    }

    // ===== Statistics =====

    fn count_by_status(&self, status: UrlStatus) -> StorageResult<u64> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM urls WHERE status = ?1",
            params![status.to_db_string()],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    fn count_total(&self) -> StorageResult<u64> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM urls", [], |row| row.get(0))?;
        Ok(count as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const URL: &str = "https://example.com/a";

    fn storage() -> SqliteStorage {
        SqliteStorage::new_in_memory().unwrap()
    }

    #[test]
    fn test_discover_is_idempotent() {
        let mut storage = storage();
        storage
            .apply_batch(&[
                WriteRequest::discover(URL, None),
                WriteRequest::discover(URL, Some("https://example.com/".into())),
            ])
            .unwrap();

        assert_eq!(storage.count_total().unwrap(), 1);
        let record = storage.get_record(URL).unwrap().unwrap();
        assert_eq!(record.status, UrlStatus::New);
        assert_eq!(record.discovered_from, None);
        assert_eq!(record.attempt_count, 0);
    }

    #[test]
    fn test_discover_does_not_reset_progress() {
        let mut storage = storage();
        storage
            .apply_batch(&[
                WriteRequest::discover(URL, None),
                WriteRequest::claim(URL),
                WriteRequest::success(URL, "body".into()),
                WriteRequest::discover(URL, None),
            ])
            .unwrap();

        let record = storage.get_record(URL).unwrap().unwrap();
        assert_eq!(record.status, UrlStatus::Success);
        assert_eq!(record.content.as_deref(), Some("body"));
    }

    #[test]
    fn test_failure_then_success_lifecycle() {
        let mut storage = storage();
        storage
            .apply_batch(&[
                WriteRequest::discover(URL, None),
                WriteRequest::claim(URL),
                WriteRequest::failure(URL, "timeout".into(), false),
            ])
            .unwrap();

        let record = storage.get_record(URL).unwrap().unwrap();
        assert_eq!(record.status, UrlStatus::Failed);
        assert_eq!(record.attempt_count, 1);
        assert_eq!(record.last_error.as_deref(), Some("timeout"));
        assert_eq!(record.content, None);

        storage
            .apply_batch(&[
                WriteRequest::requeue(URL),
                WriteRequest::claim(URL),
                WriteRequest::success(URL, "text".into()),
            ])
            .unwrap();

        let record = storage.get_record(URL).unwrap().unwrap();
        assert_eq!(record.status, UrlStatus::Success);
        assert_eq!(record.attempt_count, 2);
        assert_eq!(record.last_error, None);
        assert_eq!(record.content.as_deref(), Some("text"));
    }

    #[test]
    fn test_success_is_terminal() {
        let mut storage = storage();
        storage
            .apply_batch(&[
                WriteRequest::claim(URL),
                WriteRequest::success(URL, "text".into()),
                WriteRequest::claim(URL),
                WriteRequest::failure(URL, "late".into(), true),
            ])
            .unwrap();

        let record = storage.get_record(URL).unwrap().unwrap();
        assert_eq!(record.status, UrlStatus::Success);
        assert_eq!(record.attempt_count, 1);
    }

    #[test]
    fn test_load_resumable_skips_success() {
        let mut storage = storage();
        storage
            .apply_batch(&[
                WriteRequest::discover("https://example.com/new", None),
                WriteRequest::claim("https://example.com/busy"),
                WriteRequest::claim("https://example.com/done"),
                WriteRequest::success("https://example.com/done", "x".into()),
                WriteRequest::claim("https://example.com/bad"),
                WriteRequest::failure("https://example.com/bad", "e".into(), true),
            ])
            .unwrap();

        let mut resumable: Vec<_> = storage
            .load_resumable()
            .unwrap()
            .into_iter()
            .map(|r| (r.url, r.status))
            .collect();
        resumable.sort_by(|a, b| a.0.cmp(&b.0));

        assert_eq!(
            resumable,
            vec![
                ("https://example.com/bad".to_string(), UrlStatus::Failed),
                ("https://example.com/busy".to_string(), UrlStatus::InProgress),
                ("https://example.com/new".to_string(), UrlStatus::New),
            ]
        );
        assert_eq!(storage.load_known_urls().unwrap().len(), 4);
    }

    #[test]
    fn test_terminal_flag_follows_latest_failure() {
        let mut storage = storage();
        let url = "https://example.com/blocked";

        storage
            .apply_batch(&[
                WriteRequest::claim(url),
                WriteRequest::failure(url, "blocked: 403".into(), false),
            ])
            .unwrap();
        assert!(!storage.get_record(url).unwrap().unwrap().terminal);

        storage
            .apply_batch(&[
                WriteRequest::requeue(url),
                WriteRequest::claim(url),
                WriteRequest::failure(url, "blocked: 403".into(), true),
            ])
            .unwrap();
        let record = storage.get_record(url).unwrap().unwrap();
        assert!(record.terminal);
        assert_eq!(record.attempt_count, 2);

        storage.apply_batch(&[WriteRequest::requeue(url)]).unwrap();
        assert!(!storage.get_record(url).unwrap().unwrap().terminal);
    }

    #[test]
    fn test_normalize_urls_merges_duplicates() {
        let mut storage = storage();
        storage
            .apply_batch(&[
                WriteRequest::claim("https://example.com/a?tab=1"),
                WriteRequest::success("https://example.com/a?tab=1", "A".into()),
                WriteRequest::claim("https://example.com/a?tab=2"),
                WriteRequest::failure("https://example.com/a?tab=2", "http: 500".into(), false),
                WriteRequest::discover("https://example.com/b?ref=nav", None),
                WriteRequest::claim("https://example.com/b?ref=side"),
                WriteRequest::discover("https://example.com/c?ref=nav", Some("https://example.com/".into())),
                WriteRequest::claim("https://example.com/d"),
                WriteRequest::failure("https://example.com/d", "blocked: 403".into(), true),
            ])
            .unwrap();

        let summary = storage.normalize_urls(true).unwrap();
        assert_eq!(
            summary,
            NormalizeSummary {
                rows_before: 6,
                rows_after: 4,
                rekeyed: 5,
            }
        );

        let a = storage.get_record("https://example.com/a").unwrap().unwrap();
        assert_eq!(a.status, UrlStatus::Success);
        assert_eq!(a.content.as_deref(), Some("A"));
        assert_eq!(a.attempt_count, 1);

        let b = storage.get_record("https://example.com/b").unwrap().unwrap();
        assert_eq!(b.status, UrlStatus::New);
        assert_eq!(b.attempt_count, 0);

        let c = storage.get_record("https://example.com/c").unwrap().unwrap();
        assert_eq!(c.status, UrlStatus::New);
        assert_eq!(c.discovered_from.as_deref(), Some("https://example.com/"));

        let d = storage.get_record("https://example.com/d").unwrap().unwrap();
        assert_eq!(d.status, UrlStatus::Failed);
        assert!(d.terminal);

        assert_eq!(storage.count_total().unwrap(), 4);
        assert_eq!(storage.get_record("https://example.com/a?tab=1").unwrap(), None);
    }

    #[test]
    fn test_normalize_urls_keeps_query_when_not_stripping() {
        let mut storage = storage();
        storage
            .apply_batch(&[
                WriteRequest::discover("https://example.com/a?tab=1", None),
                WriteRequest::discover("https://example.com/a?tab=2#top", None),
            ])
            .unwrap();

        let summary = storage.normalize_urls(false).unwrap();
        assert_eq!(summary.rows_after, 2);
        assert_eq!(summary.rekeyed, 1);
        assert!(storage.get_record("https://example.com/a?tab=1").unwrap().is_some());
        assert!(storage.get_record("https://example.com/a?tab=2").unwrap().is_some());
    }

    #[test]
    fn test_batch_is_atomic() {
        let mut storage = storage();
        storage
            .conn
            .execute_batch(
                "CREATE TRIGGER reject_poison BEFORE INSERT ON urls
                 WHEN NEW.url = 'poison' BEGIN SELECT RAISE(ABORT, 'rejected'); END;",
            )
            .unwrap();

        let result = storage.apply_batch(&[
            WriteRequest::discover(URL, None),
            WriteRequest::claim("poison"),
        ]);

        assert!(result.is_err());
        assert_eq!(storage.count_total().unwrap(), 0);
    }

    #[test]
    fn test_run_lifecycle() {
        let mut storage = storage();
        let run_id = storage.create_run("hash").unwrap();

        let run = storage.latest_run().unwrap().unwrap();
        assert_eq!(run.id, run_id);
        assert_eq!(run.status, RunStatus::Running);
        assert!(run.finished_at.is_none());

        storage.finish_run(run_id, RunStatus::Interrupted).unwrap();
        let run = storage.latest_run().unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Interrupted);
        assert!(run.finished_at.is_some());

        assert!(matches!(
            storage.finish_run(run_id + 1, RunStatus::Completed),
            Err(StorageError::RunNotFound(_))
        ));
    }

    #[test]
    fn test_success_contents() {
        let mut storage = storage();
        storage
            .apply_batch(&[
                WriteRequest::claim("https://example.com/b"),
                WriteRequest::success("https://example.com/b", "bee".into()),
                WriteRequest::claim("https://example.com/a"),
                WriteRequest::success("https://example.com/a", "ay".into()),
                WriteRequest::discover("https://example.com/c", None),
            ])
            .unwrap();

        let contents = storage.success_contents().unwrap();
        assert_eq!(
            contents,
            vec![
                ("https://example.com/a".to_string(), "ay".to_string()),
                ("https://example.com/b".to_string(), "bee".to_string()),
            ]
        );
    }

    #[test]
    fn test_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("crawl.db");

        {
            let mut storage = SqliteStorage::new(&path).unwrap();
            storage
                .apply_batch(&[WriteRequest::discover(URL, None)])
                .unwrap();
        }

        let storage = SqliteStorage::new(&path).unwrap();
        assert!(storage.get_record(URL).unwrap().is_some());
    }
}
