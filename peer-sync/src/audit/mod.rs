//! Append-only record of sync attempts.
//!
//! An attempt is created as `running` when it starts and completed exactly
//! once. Rows are never deleted here; retention is an operator concern.

pub mod sqlite;

use crate::{Result, SyncError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;

pub use sqlite::SqliteAuditLog;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttemptStatus {
    Running,
    Success,
    Error,
}

impl AttemptStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptStatus::Running => "running",
            AttemptStatus::Success => "success",
            AttemptStatus::Error => "error",
        }
    }
}

impl fmt::Display for AttemptStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AttemptStatus {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "running" => Ok(AttemptStatus::Running),
            "success" => Ok(AttemptStatus::Success),
            "error" => Ok(AttemptStatus::Error),
            other => Err(SyncError::Audit(format!("unknown attempt status {other:?}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncAttempt {
    pub id: i64,
    pub owner_id: i64,
    pub peer_id: i64,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: AttemptStatus,
    pub files_transferred: u64,
    pub bytes_transferred: u64,
    pub error_detail: String,
}

/// Final state written when an attempt ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptOutcome {
    pub status: AttemptStatus,
    pub files_transferred: u64,
    pub bytes_transferred: u64,
    pub error_detail: String,
}

impl AttemptOutcome {
    pub fn success(files_transferred: u64, bytes_transferred: u64) -> Self {
        Self {
            status: AttemptStatus::Success,
            files_transferred,
            bytes_transferred,
            error_detail: String::new(),
        }
    }

    pub fn error(files_transferred: u64, bytes_transferred: u64, detail: impl Into<String>) -> Self {
        Self {
            status: AttemptStatus::Error,
            files_transferred,
            bytes_transferred,
            error_detail: detail.into(),
        }
    }
}

/// Where the orchestrator records attempts. Calls are blocking.
pub trait AuditSink: Send + Sync {
    /// Record a new running attempt and return its id.
    fn create(&self, owner_id: i64, peer_id: i64) -> Result<i64>;

    /// Complete a running attempt. Completing twice is an error.
    fn complete(&self, id: i64, outcome: &AttemptOutcome) -> Result<()>;
}

/// In-memory audit log, for tests and embedding.
#[derive(Debug, Default)]
pub struct MemoryAuditLog {
    attempts: Mutex<Vec<SyncAttempt>>,
}

impl MemoryAuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Vec<SyncAttempt>>> {
        self.attempts
            .lock()
            .map_err(|_| SyncError::Audit("audit log lock poisoned".to_string()))
    }

    pub fn attempts(&self) -> Result<Vec<SyncAttempt>> {
        Ok(self.lock()?.clone())
    }

    pub fn find_by_id(&self, id: i64) -> Result<Option<SyncAttempt>> {
        Ok(self.lock()?.iter().find(|a| a.id == id).cloned())
    }
}

impl AuditSink for MemoryAuditLog {
    fn create(&self, owner_id: i64, peer_id: i64) -> Result<i64> {
        let mut attempts = self.lock()?;
        let id = attempts.len() as i64 + 1;
        attempts.push(SyncAttempt {
            id,
            owner_id,
            peer_id,
            started_at: Utc::now(),
            completed_at: None,
            status: AttemptStatus::Running,
            files_transferred: 0,
            bytes_transferred: 0,
            error_detail: String::new(),
        });
        Ok(id)
    }

    fn complete(&self, id: i64, outcome: &AttemptOutcome) -> Result<()> {
        let mut attempts = self.lock()?;
        let attempt = attempts
            .iter_mut()
            .find(|a| a.id == id && a.status == AttemptStatus::Running)
            .ok_or_else(|| SyncError::Audit(format!("no running attempt {id}")))?;
        attempt.completed_at = Some(Utc::now());
        attempt.status = outcome.status;
        attempt.files_transferred = outcome.files_transferred;
        attempt.bytes_transferred = outcome.bytes_transferred;
        attempt.error_detail = outcome.error_detail.clone();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_log_completes_once() {
        let log = MemoryAuditLog::new();
        let id = log.create(5, 1).unwrap();
        assert_eq!(log.find_by_id(id).unwrap().unwrap().status, AttemptStatus::Running);

        log.complete(id, &AttemptOutcome::success(3, 300)).unwrap();
        let attempt = log.find_by_id(id).unwrap().unwrap();
        assert_eq!(attempt.status, AttemptStatus::Success);
        assert_eq!(attempt.files_transferred, 3);
        assert!(attempt.completed_at.is_some());

        assert!(log.complete(id, &AttemptOutcome::error(0, 0, "late")).is_err());
    }

    #[test]
    fn test_status_parse() {
        assert_eq!("error".parse::<AttemptStatus>().unwrap(), AttemptStatus::Error);
        assert!("done".parse::<AttemptStatus>().is_err());
        assert_eq!(AttemptStatus::Success.to_string(), "success");
    }
}
