//! Error types for the sync engine.

use crate::executor::SyncPhase;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("sync already in progress for owner {owner_id} on peer {peer_id}")]
    AlreadyRunning { owner_id: i64, peer_id: i64 },

    #[error("failed to calculate checksum for {path}: {source}")]
    Build {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("peer returned status {status}: {body}")]
    PeerStatus { status: u16, body: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Encryption error: {0}")]
    Crypto(String),

    #[error("no encryption key for owner {owner_id}: {reason}")]
    KeyLookup { owner_id: i64, reason: String },

    #[error("sync deadline exceeded")]
    Timeout,

    #[error("sync cancelled")]
    Cancelled,

    #[error("Audit log error: {0}")]
    Audit(String),

    #[error("Archive error: {0}")]
    Archive(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("sync attempt panicked: {0}")]
    Panicked(String),

    #[error("{phase}: {source}")]
    Phase {
        phase: SyncPhase,
        #[source]
        source: Box<SyncError>,
    },

    #[error("{path}: {source}")]
    File {
        path: String,
        #[source]
        source: Box<SyncError>,
    },
}

impl SyncError {
    /// Wrap with the orchestrator phase the error surfaced in.
    pub fn in_phase(self, phase: SyncPhase) -> Self {
        SyncError::Phase {
            phase,
            source: Box::new(self),
        }
    }

    /// Wrap with the relative path of the file being processed.
    pub fn for_file(self, path: impl Into<String>) -> Self {
        SyncError::File {
            path: path.into(),
            source: Box::new(self),
        }
    }

    /// The innermost error, looking through phase and file context.
    pub fn root(&self) -> &SyncError {
        match self {
            SyncError::Phase { source, .. } | SyncError::File { source, .. } => source.root(),
            other => other,
        }
    }

    pub fn is_already_running(&self) -> bool {
        matches!(self.root(), SyncError::AlreadyRunning { .. })
    }

    pub fn is_interrupted(&self) -> bool {
        matches!(self.root(), SyncError::Timeout | SyncError::Cancelled)
    }
}

impl From<r2d2::Error> for SyncError {
    fn from(e: r2d2::Error) -> Self {
        SyncError::Audit(e.to_string())
    }
}

impl From<rusqlite::Error> for SyncError {
    fn from(e: rusqlite::Error) -> Self {
        SyncError::Audit(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
