//! File metadata used for change detection.
//!
//! The manifest compares size and modification time bit-for-bit, so the
//! timestamp keeps the full sub-second precision the filesystem reports.

use chrono::{DateTime, Utc};
use std::fs::Metadata;

/// Size and modification time of a regular file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStamp {
    /// File size in bytes
    pub size: u64,

    /// Last modified time, nanosecond precision where available
    pub modified: DateTime<Utc>,
}

impl FileStamp {
    /// Build a stamp from already-fetched metadata.
    pub fn from_metadata(metadata: &Metadata) -> std::io::Result<Self> {
        Ok(Self {
            size: metadata.len(),
            modified: DateTime::<Utc>::from(metadata.modified()?),
        })
    }
}
