//! SQLite-backed audit log.

use super::{AttemptOutcome, AttemptStatus, AuditSink, SyncAttempt};
use crate::{Result, SyncError};
use chrono::{DateTime, SecondsFormat, Utc};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, OptionalExtension, Row};
use std::path::Path;

pub type AuditPool = Pool<SqliteConnectionManager>;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS sync_attempts (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  owner_id INTEGER NOT NULL,
  peer_id INTEGER NOT NULL,
  started_at TEXT NOT NULL,
  completed_at TEXT,
  status TEXT NOT NULL DEFAULT 'running' CHECK(status IN ('running','success','error')),
  files_transferred INTEGER NOT NULL DEFAULT 0,
  bytes_transferred INTEGER NOT NULL DEFAULT 0,
  error_detail TEXT NOT NULL DEFAULT ''
);

CREATE INDEX IF NOT EXISTS idx_sync_attempts_owner ON sync_attempts(owner_id, started_at DESC);
CREATE INDEX IF NOT EXISTS idx_sync_attempts_status ON sync_attempts(status);
"#;

/// Timestamps are stored as fixed-width RFC 3339 text so they sort lexically.
fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e)))
}

fn row_to_attempt(row: &Row) -> rusqlite::Result<SyncAttempt> {
    let started_at: String = row.get("started_at")?;
    let completed_at: Option<String> = row.get("completed_at")?;
    let status: String = row.get("status")?;
    let files: i64 = row.get("files_transferred")?;
    let bytes: i64 = row.get("bytes_transferred")?;
    Ok(SyncAttempt {
        id: row.get("id")?,
        owner_id: row.get("owner_id")?,
        peer_id: row.get("peer_id")?,
        started_at: parse_timestamp(&started_at)?,
        completed_at: completed_at.as_deref().map(parse_timestamp).transpose()?,
        status: status.parse().map_err(|e: SyncError| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })?,
        files_transferred: files.max(0) as u64,
        bytes_transferred: bytes.max(0) as u64,
        error_detail: row.get("error_detail")?,
    })
}

#[derive(Clone)]
pub struct SqliteAuditLog {
    pool: AuditPool,
}

impl SqliteAuditLog {
    /// Open (creating if needed) the database at `path` and apply the schema.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let manager = SqliteConnectionManager::file(path)
            .with_init(|conn| conn.execute_batch("PRAGMA busy_timeout = 5000;"));
        let pool = Pool::builder().max_size(4).build(manager)?;

        let conn = pool.get()?;
        conn.execute_batch(
            "PRAGMA journal_mode = DELETE;
             PRAGMA synchronous = FULL;",
        )?;
        conn.execute_batch(SCHEMA)?;
        tracing::debug!("Audit log ready at {}", path.display());

        Ok(Self { pool })
    }

    pub fn find_by_id(&self, id: i64) -> Result<Option<SyncAttempt>> {
        let conn = self.pool.get()?;
        let attempt = conn
            .query_row("SELECT * FROM sync_attempts WHERE id = ?1", params![id], row_to_attempt)
            .optional()?;
        Ok(attempt)
    }

    /// Most recent attempts first, optionally for one owner.
    pub fn recent(&self, owner_id: Option<i64>, limit: usize) -> Result<Vec<SyncAttempt>> {
        let conn = self.pool.get()?;
        let limit = limit as i64;
        let attempts = match owner_id {
            Some(owner_id) => {
                let mut stmt = conn.prepare(
                    "SELECT * FROM sync_attempts WHERE owner_id = ?1 ORDER BY started_at DESC, id DESC LIMIT ?2",
                )?;
                let rows = stmt.query_map(params![owner_id, limit], row_to_attempt)?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            }
            None => {
                let mut stmt =
                    conn.prepare("SELECT * FROM sync_attempts ORDER BY started_at DESC, id DESC LIMIT ?1")?;
                let rows = stmt.query_map(params![limit], row_to_attempt)?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            }
        };
        Ok(attempts)
    }

    pub fn last_for_owner(&self, owner_id: i64) -> Result<Option<SyncAttempt>> {
        Ok(self.recent(Some(owner_id), 1)?.into_iter().next())
    }

    pub fn has_running_for_peer(&self, peer_id: i64) -> Result<bool> {
        let conn = self.pool.get()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM sync_attempts WHERE peer_id = ?1 AND status = 'running'",
            params![peer_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Mark `running` rows started before `older_than` as failed. A process
    /// that dies mid-attempt never completes its row.
    pub fn cleanup_zombies(&self, older_than: DateTime<Utc>) -> Result<usize> {
        let conn = self.pool.get()?;
        let updated = conn.execute(
            "UPDATE sync_attempts
             SET status = 'error', completed_at = ?1, error_detail = 'interrupted: attempt never completed'
             WHERE status = 'running' AND started_at < ?2",
            params![timestamp(Utc::now()), timestamp(older_than)],
        )?;
        Ok(updated)
    }
}

impl AuditSink for SqliteAuditLog {
    fn create(&self, owner_id: i64, peer_id: i64) -> Result<i64> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO sync_attempts (owner_id, peer_id, started_at, status) VALUES (?1, ?2, ?3, 'running')",
            params![owner_id, peer_id, timestamp(Utc::now())],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn complete(&self, id: i64, outcome: &AttemptOutcome) -> Result<()> {
        let conn = self.pool.get()?;
        let updated = conn.execute(
            "UPDATE sync_attempts
             SET status = ?1, completed_at = ?2, files_transferred = ?3, bytes_transferred = ?4, error_detail = ?5
             WHERE id = ?6 AND status = 'running'",
            params![
                outcome.status.as_str(),
                timestamp(Utc::now()),
                outcome.files_transferred as i64,
                outcome.bytes_transferred as i64,
                outcome.error_detail,
                id,
            ],
        )?;
        if updated == 0 {
            return Err(SyncError::Audit(format!("no running attempt {id}")));
        }
        Ok(())
    }
}
