//! Storage module for persisting crawl state
//!
//! This module handles all database operations for the crawler, including:
//! - SQLite database initialization and schema management
//! - URL record persistence (one row per distinct URL)
//! - Batched, transactional application of write requests
//! - Run tracking and resumption support
//!
//! Mutations reach the store only through the writer task; see
//! [`crate::crawler::Writer`].

mod schema;
mod sqlite;
mod traits;

pub use sqlite::SqliteStorage;
pub use traits::{Storage, StorageError, StorageResult};

use crate::state::UrlStatus;

/// One record per distinct URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlRecord {
    pub url: String,
    pub status: UrlStatus,
    pub content: Option<String>,
    pub discovered_from: Option<String>,
    pub attempt_count: u32,
    pub last_error: Option<String>,
    pub updated_at: String,

    /// Set when the latest failure was final; cleared by any later transition
    pub terminal: bool,
}

/// A state mutation queued for the writer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteRequest {
    pub url: String,
    pub kind: WriteKind,
}

/// What a write request does to its URL record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteKind {
    /// Insert a New record unless one already exists
    Discover { discovered_from: Option<String> },

    /// Move an existing (or implicitly created) record to `status`
    Transition {
        status: UrlStatus,
        content: Option<String>,
        error: Option<String>,
        attempt_delta: u32,
        /// This write ends the URL's in-flight period once committed
        release: bool,
    },
}

impl WriteRequest {
    pub fn discover(url: impl Into<String>, discovered_from: Option<String>) -> Self {
        Self {
            url: url.into(),
            kind: WriteKind::Discover { discovered_from },
        }
    }

    /// Worker claimed the URL for a fetch attempt
    pub fn claim(url: impl Into<String>) -> Self {
        Self::transition(url, UrlStatus::InProgress, None, None, 0, false)
    }

    /// Attempt succeeded with extracted content
    pub fn success(url: impl Into<String>, content: String) -> Self {
        Self::transition(url, UrlStatus::Success, Some(content), None, 1, true)
    }

    /// Attempt failed; `permanent` releases the URL since no retry follows
    pub fn failure(url: impl Into<String>, error: String, permanent: bool) -> Self {
        Self::transition(url, UrlStatus::Failed, None, Some(error), 1, permanent)
    }

    /// Put the URL back into New (retry re-queue or crash recovery)
    pub fn requeue(url: impl Into<String>) -> Self {
        Self::transition(url, UrlStatus::New, None, None, 0, false)
    }

    fn transition(
        url: impl Into<String>,
        status: UrlStatus,
        content: Option<String>,
        error: Option<String>,
        attempt_delta: u32,
        release: bool,
    ) -> Self {
        Self {
            url: url.into(),
            kind: WriteKind::Transition {
                status,
                content,
                error,
                attempt_delta,
                release,
            },
        }
    }

    /// The status this request writes, if it is a transition
    pub fn status(&self) -> Option<UrlStatus> {
        match &self.kind {
            WriteKind::Transition { status, .. } => Some(*status),
            WriteKind::Discover { .. } => None,
        }
    }

    /// Whether this request records a failure that will not be retried
    pub fn is_terminal_failure(&self) -> bool {
        matches!(
            self.kind,
            WriteKind::Transition {
                status: UrlStatus::Failed,
                release: true,
                ..
            }
        )
    }

    /// Whether committing this request ends the URL's in-flight period
    pub fn releases(&self) -> bool {
        matches!(self.kind, WriteKind::Transition { release: true, .. })
    }
}

/// Represents a crawl run
#[derive(Debug, Clone)]
pub struct RunRecord {
    pub id: i64,
    pub started_at: String,
    pub finished_at: Option<String>,
    pub config_hash: String,
    pub status: RunStatus,
}

/// Status of a crawl run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Running,
    Completed,
    Interrupted,
    Failed,
}

impl RunStatus {
    pub fn to_db_string(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Interrupted => "interrupted",
            Self::Failed => "failed",
        }
    }

    pub fn from_db_string(s: &str) -> Option<Self> {
        match s {
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "interrupted" => Some(Self::Interrupted),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Result of re-keying stored URLs under the current normalization rules
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NormalizeSummary {
    pub rows_before: u64,
    pub rows_after: u64,

    /// Rows whose key changed or that were merged into another row
    pub rekeyed: u64,
}

/// Record counts per status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusCounts {
    pub new: u64,
    pub in_progress: u64,
    pub success: u64,
    pub failed: u64,
}

impl StatusCounts {
    /// Reads the counts from a store
    pub fn load<S: Storage + ?Sized>(store: &S) -> StorageResult<Self> {
        Ok(Self {
            new: store.count_by_status(UrlStatus::New)?,
            in_progress: store.count_by_status(UrlStatus::InProgress)?,
            success: store.count_by_status(UrlStatus::Success)?,
            failed: store.count_by_status(UrlStatus::Failed)?,
        })
    }

    pub fn get(&self, status: UrlStatus) -> u64 {
        match status {
            UrlStatus::New => self.new,
            UrlStatus::InProgress => self.in_progress,
            UrlStatus::Success => self.success,
            UrlStatus::Failed => self.failed,
        }
    }

    pub fn total(&self) -> u64 {
        self.new + self.in_progress + self.success + self.failed
    }
}
