//! Storage module for cmdgate
//!
//! - `json`: JSON documents with atomic save (config, job records)
//! - `archive`: SQLite summaries of purged jobs

mod archive;
mod json;

pub use archive::{ArchiveRecord, ArchiveStore, ARCHIVE_DB};
pub use json::{JsonStore, CONFIG_DIR};
