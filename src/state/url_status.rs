/// URL status definitions for tracking crawl progress
///
/// This module defines the lifecycle states of a URL record and which
/// transitions between them are legal.
use std::fmt;

/// Represents the current status of a URL record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UrlStatus {
    /// Discovered (or re-queued) and waiting for a fetch attempt
    New,

    /// Claimed by a worker; the fetch attempt has not resolved yet
    InProgress,

    /// Fetched and extracted; the record carries content
    Success,

    /// The latest attempt failed; terminal once attempts are exhausted
    Failed,
}

impl UrlStatus {
    /// Returns true if the URL is waiting for or undergoing a fetch attempt
    pub fn is_active(&self) -> bool {
        matches!(self, Self::New | Self::InProgress)
    }

    /// Returns true if this represents a successful completion
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }

    /// Returns true if a record in this status may hold content
    pub fn carries_content(&self) -> bool {
        matches!(self, Self::Success)
    }

    /// Returns true if moving from `self` to `next` is a legal lifecycle step
    ///
    /// Transitions are monotone New -> InProgress -> {Success, Failed}, with two
    /// exceptions: Failed -> New (re-queue) and InProgress -> New (crash recovery).
    /// Re-applying the current status is allowed.
    pub fn can_transition_to(&self, next: UrlStatus) -> bool {
        use UrlStatus::*;
        matches!(
            (self, next),
            (New, New)
                | (New, InProgress)
                | (InProgress, InProgress)
                | (InProgress, Success)
                | (InProgress, Failed)
                | (InProgress, New)
                | (Failed, New)
                | (Failed, Failed)
                | (Success, Success)
        )
    }

    /// Converts the status to its database string representation
    pub fn to_db_string(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::InProgress => "in_progress",
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }

    /// Parses a status from its database string representation
    ///
    /// Returns None if the string doesn't match any known status.
    pub fn from_db_string(s: &str) -> Option<Self> {
        match s {
            "new" => Some(Self::New),
            "in_progress" => Some(Self::InProgress),
            "success" => Some(Self::Success),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Returns all statuses
    pub fn all() -> [Self; 4] {
        [Self::New, Self::InProgress, Self::Success, Self::Failed]
    }
}

impl fmt::Display for UrlStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_db_string())
    }
}
