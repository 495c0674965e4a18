//! Sync executor: runs one attempt for one (share, peer) pair.
//!
//! An attempt takes the pair's lock, records itself in the audit log, runs
//! the selected [`SyncStrategy`] under the attempt deadline, completes its
//! audit record and releases the lock.

mod incremental;
pub mod lock;
mod scope;

use crate::audit::{AttemptOutcome, AuditSink};
use crate::config::SyncConfig;
use crate::crypto::KeyStore;
use crate::manifest::{BuildStats, RemoteNaming};
use crate::peer::{PeerTransport, ShareTarget};
use crate::{Result, SyncError};
use futures_util::FutureExt;
use scope::AttemptScope;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Instrument};

pub use lock::{SyncLockGuard, SyncLocks};

/// Where an attempt is. Used to label errors and log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncPhase {
    Idle,
    Locked,
    BuildingLocal,
    FetchingRemote,
    Diffing,
    Transferring,
    Deleting,
    Checkpointing,
    CleaningOrphans,
    Archiving,
    Completed,
    Failed,
}

impl fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SyncPhase::Idle => "idle",
            SyncPhase::Locked => "locked",
            SyncPhase::BuildingLocal => "building local manifest",
            SyncPhase::FetchingRemote => "fetching remote manifest",
            SyncPhase::Diffing => "diffing",
            SyncPhase::Transferring => "transferring",
            SyncPhase::Deleting => "deleting",
            SyncPhase::Checkpointing => "checkpointing",
            SyncPhase::CleaningOrphans => "cleaning orphans",
            SyncPhase::Archiving => "archiving",
            SyncPhase::Completed => "completed",
            SyncPhase::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// How a tree is sent to a peer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStrategy {
    /// Manifest diff with resumable per-file uploads.
    #[default]
    Incremental,
    /// Whole tree as one encrypted archive, no resume.
    Archive,
}

impl fmt::Display for SyncStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncStrategy::Incremental => f.write_str("incremental"),
            SyncStrategy::Archive => f.write_str("archive"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncSettings {
    pub checkpoint_interval: usize,
    pub remote_naming: RemoteNaming,
    /// Budget for persisting the progress manifest after a failure.
    pub progress_flush_grace: Duration,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self::from(&SyncConfig::default())
    }
}

impl From<&SyncConfig> for SyncSettings {
    fn from(config: &SyncConfig) -> Self {
        Self {
            checkpoint_interval: config.checkpoint_interval.max(1),
            remote_naming: config.remote_naming,
            progress_flush_grace: Duration::from_secs(config.progress_flush_grace_secs),
        }
    }
}

/// One share to sync to one peer.
#[derive(Debug, Clone)]
pub struct SyncRequest {
    pub owner_id: i64,
    pub share_name: String,
    pub source_dir: PathBuf,
    pub origin_server: String,
    pub peer_id: i64,
    /// `None` runs without a deadline.
    pub timeout: Option<Duration>,
    /// Manifest cache location; `None` keeps it inside `source_dir`.
    pub cache_path: Option<PathBuf>,
}

impl SyncRequest {
    pub fn target(&self) -> ShareTarget {
        ShareTarget::new(self.owner_id, self.share_name.clone(), self.origin_server.clone())
    }
}

/// What an attempt did, successful or not.
#[derive(Debug, Clone, Default)]
pub struct SyncReport {
    pub attempt_id: i64,
    pub files_total: usize,
    pub files_uploaded: usize,
    pub bytes_sent: u64,
    pub files_deleted: usize,
    pub orphans_removed: usize,
    pub checkpoints: usize,
    pub build: BuildStats,
    pub duration: Duration,
}

pub struct SyncEngine {
    locks: SyncLocks,
    audit: Arc<dyn AuditSink>,
    keys: Arc<dyn KeyStore>,
    settings: SyncSettings,
}

impl SyncEngine {
    pub fn new(audit: Arc<dyn AuditSink>, keys: Arc<dyn KeyStore>, settings: SyncSettings) -> Self {
        Self {
            locks: SyncLocks::new(),
            audit,
            keys,
            settings,
        }
    }

    pub fn locks(&self) -> &SyncLocks {
        &self.locks
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    /// Run one attempt. Fails fast with [`SyncError::AlreadyRunning`] (and
    /// no audit record) when the pair is busy.
    pub async fn run<T>(
        &self,
        transport: &T,
        request: &SyncRequest,
        strategy: SyncStrategy,
        cancel: &CancellationToken,
    ) -> Result<SyncReport>
    where
        T: PeerTransport + ?Sized,
    {
        let _guard = self.locks.try_acquire(request.owner_id, request.peer_id)?;

        let span = tracing::info_span!(
            "sync",
            owner_id = request.owner_id,
            peer_id = request.peer_id,
            share = %request.share_name,
            %strategy
        );
        async move {
            let attempt_id = self.audit_create(request.owner_id, request.peer_id).await?;
            let started = Instant::now();
            let scope = AttemptScope::new(cancel, request.timeout);
            let mut report = SyncReport {
                attempt_id,
                ..SyncReport::default()
            };

            let attempt = async {
                scope.check().map_err(|e| e.in_phase(SyncPhase::Idle))?;
                match strategy {
                    SyncStrategy::Incremental => {
                        self.run_incremental(transport, request, &scope, &mut report).await
                    }
                    SyncStrategy::Archive => self.run_archive(transport, request, &scope, &mut report).await,
                }
            };
            // A panicking strategy still closes its audit record.
            let result = match AssertUnwindSafe(attempt).catch_unwind().await {
                Ok(result) => result,
                Err(panic) => Err(SyncError::Panicked(panic_message(panic.as_ref()))),
            };
            report.duration = started.elapsed();

            let outcome = match &result {
                Ok(()) => AttemptOutcome::success(report.files_uploaded as u64, report.bytes_sent),
                Err(e) => AttemptOutcome::error(report.files_uploaded as u64, report.bytes_sent, e.to_string()),
            };
            if let Err(e) = self.audit_complete(attempt_id, outcome).await {
                error!("Failed to complete audit record {}: {}", attempt_id, e);
            }

            match result {
                Ok(()) => {
                    info!(
                        phase = %SyncPhase::Completed,
                        "Sync completed: {} uploaded, {} deleted, {} orphans removed in {:.1}s",
                        report.files_uploaded,
                        report.files_deleted,
                        report.orphans_removed,
                        report.duration.as_secs_f64()
                    );
                    Ok(report)
                }
                Err(e) => {
                    if e.is_interrupted() {
                        warn!(phase = %SyncPhase::Failed, "Sync interrupted: {}", e);
                    } else {
                        error!(phase = %SyncPhase::Failed, "Sync failed: {}", e);
                    }
                    Err(e)
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn run_archive<T>(
        &self,
        transport: &T,
        request: &SyncRequest,
        scope: &AttemptScope,
        report: &mut SyncReport,
    ) -> Result<()>
    where
        T: PeerTransport + ?Sized,
    {
        let key = self
            .keys
            .key_for(request.owner_id)
            .map_err(|e| e.in_phase(SyncPhase::Locked))?;
        info!(phase = %SyncPhase::Archiving, "Sending {} as a full archive", request.source_dir.display());

        let stats = transport
            .upload_archive(&request.target(), &request.source_dir, &key, scope.token())
            .await
            .map_err(|e| scope.explain(e).in_phase(SyncPhase::Archiving))?;
        report.files_total = stats.files;
        report.files_uploaded = stats.files;
        report.bytes_sent = stats.bytes;
        Ok(())
    }

    async fn audit_create(&self, owner_id: i64, peer_id: i64) -> Result<i64> {
        let audit = Arc::clone(&self.audit);
        tokio::task::spawn_blocking(move || audit.create(owner_id, peer_id))
            .await
            .map_err(|e| SyncError::Audit(e.to_string()))?
    }

    async fn audit_complete(&self, id: i64, outcome: AttemptOutcome) -> Result<()> {
        let audit = Arc::clone(&self.audit);
        tokio::task::spawn_blocking(move || audit.complete(id, &outcome))
            .await
            .map_err(|e| SyncError::Audit(e.to_string()))?
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
