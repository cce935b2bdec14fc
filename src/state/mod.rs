//! State module for tracking crawl progress
//!
//! `UrlStatus` is the lifecycle of a single URL record: New, InProgress,
//! Success, Failed.

mod url_status;

pub use url_status::UrlStatus;
