//! Output module for reporting on crawl state
//!
//! Statistics are read straight from the store, so they can be shown for a
//! database whether or not a crawl is running against it.

pub mod stats;

pub use stats::{load_statistics, print_statistics, run_duration_seconds, CrawlStatistics};
