//! Storage traits and error types
//!
//! This module defines the trait interface for storage backends and
//! associated error types.

use crate::state::UrlStatus;
use crate::storage::{RunRecord, RunStatus, UrlRecord, WriteRequest};
use thiserror::Error;

/// Errors that can occur during storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Run not found: {0}")]
    RunNotFound(i64),

    #[error("Corrupt record for {url}: {message}")]
    Corrupt { url: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Trait for storage backend implementations
///
/// Reads happen once at startup before any worker exists. After that the
/// backend is owned by the writer task and `apply_batch` is the only entry
/// point for URL mutations.
pub trait Storage: Send + 'static {
    // ===== Startup Load =====

    /// Loads every record whose status is not Success
    fn load_resumable(&self) -> StorageResult<Vec<UrlRecord>>;

    /// Loads every known URL, terminal or not
    fn load_known_urls(&self) -> StorageResult<Vec<String>>;

    /// Point lookup by URL
    fn get_record(&self, url: &str) -> StorageResult<Option<UrlRecord>>;

    // ===== Mutation =====

    /// Applies a batch of write requests as one transaction, in order
    ///
    /// Either every request in the batch is applied or none is.
    fn apply_batch(&mut self, batch: &[WriteRequest]) -> StorageResult<()>;

    // ===== Run Management =====

    /// Creates a new crawl run and returns its ID
    fn create_run(&mut self, config_hash: &str) -> StorageResult<i64>;

    /// Gets the most recent run
    fn latest_run(&self) -> StorageResult<Option<RunRecord>>;

    /// Stamps a run with its final status and finish time
    fn finish_run(&mut self, run_id: i64, status: RunStatus) -> StorageResult<()>;

    // ===== Statistics =====

    /// Counts records in a status
    fn count_by_status(&self, status: UrlStatus) -> StorageResult<u64>;

    /// Counts all records
    fn count_total(&self) -> StorageResult<u64>;
}
