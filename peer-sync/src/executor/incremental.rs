//! Incremental strategy: diff manifests, send what changed, commit progress.

use super::scope::AttemptScope;
use super::{SyncEngine, SyncPhase, SyncReport, SyncRequest};
use crate::crypto::EncryptionKey;
use crate::fs::paths::safe_join;
use crate::manifest::{Manifest, ManifestBuilder};
use crate::peer::{PeerTransport, ShareTarget, SourceInfo, REMOTE_MANIFEST_NAME};
use crate::sync::{diff, Delta};
use crate::transfer::progress::TransferMeter;
use crate::{Result, SyncError};
use std::collections::HashSet;
use tracing::{debug, info, warn};

const PROGRESS_LOG_INTERVAL: usize = 100;

/// Files the peer is known to hold, as of the last commit.
struct Progress {
    manifest: Manifest,
    /// Set when `manifest` has changes the peer has not received yet.
    dirty: bool,
}

impl SyncEngine {
    pub(super) async fn run_incremental<T>(
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
        let target = request.target();

        let local = self
            .build_local(request, report)
            .await
            .map_err(|e| e.in_phase(SyncPhase::BuildingLocal))?;
        scope
            .check()
            .map_err(|e| e.in_phase(SyncPhase::BuildingLocal))?;

        let remote = scope
            .guard(transport.fetch_manifest(&target, &key))
            .await
            .map_err(|e| e.in_phase(SyncPhase::FetchingRemote))?;
        match &remote {
            Some(remote) => debug!(phase = %SyncPhase::FetchingRemote, "Peer holds {} files", remote.files.len()),
            None => info!(phase = %SyncPhase::FetchingRemote, "No manifest on peer, first sync"),
        }

        let delta = diff(&local, remote.as_ref());
        info!(
            phase = %SyncPhase::Diffing,
            "{} to add, {} to update, {} to delete",
            delta.to_add.len(),
            delta.to_update.len(),
            delta.to_delete.len()
        );

        let mut progress = Progress {
            manifest: Manifest::progress_from(
                remote.as_ref(),
                request.owner_id,
                &request.share_name,
                &request.origin_server,
            ),
            dirty: false,
        };

        if delta.is_empty() && remote.is_some() {
            info!("Peer already up to date");
        } else if let Err(e) = self
            .apply_delta(transport, request, &target, &key, &local, remote.as_ref(), &delta, &mut progress, scope, report)
            .await
        {
            if progress.dirty {
                self.flush_progress(transport, &target, &mut progress.manifest, &key).await;
            }
            return Err(e);
        }

        report.orphans_removed = clean_orphans(transport, &target, &local, &progress.manifest, scope).await;

        let info = SourceInfo {
            source_server: request.origin_server.clone(),
            synced_at: chrono::Utc::now(),
        };
        if let Err(e) = scope.guard(transport.put_source_info(&target, &info)).await {
            warn!("Failed to publish source info: {}", e);
        }
        Ok(())
    }

    async fn build_local(&self, request: &SyncRequest, report: &mut SyncReport) -> Result<Manifest> {
        let mut builder = ManifestBuilder::new(self.settings.remote_naming);
        if let Some(cache_path) = &request.cache_path {
            builder = builder.with_cache_path(cache_path);
        }
        let source = request.source_dir.clone();
        let owner_id = request.owner_id;
        let share_name = request.share_name.clone();
        let origin_server = request.origin_server.clone();

        info!(phase = %SyncPhase::BuildingLocal, "Building manifest of {}", source.display());
        let (manifest, stats) = tokio::task::spawn_blocking(move || {
            builder.build(&source, owner_id, &share_name, &origin_server)
        })
        .await
        .map_err(|e| SyncError::Io(std::io::Error::other(e.to_string())))??;

        report.files_total = manifest.files.len();
        report.build = stats;
        Ok(manifest)
    }

    /// Transferring, Deleting and the final checkpoint. Every error is fatal
    /// and leaves `progress` describing what the peer holds.
    #[allow(clippy::too_many_arguments)]
    async fn apply_delta<T>(
        &self,
        transport: &T,
        request: &SyncRequest,
        target: &ShareTarget,
        key: &EncryptionKey,
        local: &Manifest,
        remote: Option<&Manifest>,
        delta: &Delta,
        progress: &mut Progress,
        scope: &AttemptScope,
        report: &mut SyncReport,
    ) -> Result<()>
    where
        T: PeerTransport + ?Sized,
    {
        let mut meter = TransferMeter::new(delta.upload_count());
        let checkpoint_interval = self.settings.checkpoint_interval.max(1);
        for path in delta.uploads() {
            let Some(record) = local.files.get(path) else {
                continue;
            };
            let file_err = |e: SyncError| scope.explain(e).for_file(path.as_str()).in_phase(SyncPhase::Transferring);
            scope.check().map_err(file_err)?;
            let local_path = safe_join(&request.source_dir, path).ok_or_else(|| {
                file_err(SyncError::Io(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "unsafe relative path",
                )))
            })?;

            let sent = transport
                .upload_file(target, &local_path, &record.remote_name, key, scope.token())
                .await
                .map_err(file_err)?;
            debug!(path = %path, bytes = sent, "Uploaded");

            progress.manifest.files.insert(path.clone(), record.clone());
            progress.dirty = true;
            meter.record(sent);
            report.files_uploaded = meter.files();
            report.bytes_sent = meter.bytes();

            if meter.files() % PROGRESS_LOG_INTERVAL == 0 {
                info!(phase = %SyncPhase::Transferring, "Progress: {}", meter.summary());
            }
            if meter.files() % checkpoint_interval == 0 {
                self.commit(transport, target, progress, key, scope)
                    .await
                    .map_err(|e| e.in_phase(SyncPhase::Checkpointing))?;
                report.checkpoints += 1;
                debug!(phase = %SyncPhase::Checkpointing, "Checkpoint after {} files", meter.files());
            }
        }
        if meter.files() > 0 {
            info!(phase = %SyncPhase::Transferring, "Transferred {}", meter.summary());
        }

        if let Some(remote) = remote {
            for path in &delta.to_delete {
                let Some(record) = remote.files.get(path) else {
                    continue;
                };
                let file_err = |e: SyncError| scope.explain(e).for_file(path.as_str()).in_phase(SyncPhase::Deleting);
                scope
                    .guard(transport.delete_remote_file(target, &record.remote_name))
                    .await
                    .map_err(file_err)?;
                progress.manifest.files.remove(path);
                progress.dirty = true;
                report.files_deleted += 1;
            }
            if report.files_deleted > 0 {
                info!(phase = %SyncPhase::Deleting, "Deleted {} files from peer", report.files_deleted);
            }
        }

        self.commit(transport, target, progress, key, scope)
            .await
            .map_err(|e| e.in_phase(SyncPhase::Checkpointing))
    }

    async fn commit<T>(
        &self,
        transport: &T,
        target: &ShareTarget,
        progress: &mut Progress,
        key: &EncryptionKey,
        scope: &AttemptScope,
    ) -> Result<()>
    where
        T: PeerTransport + ?Sized,
    {
        progress.manifest.touch();
        scope
            .guard(transport.push_manifest(target, &progress.manifest, key))
            .await?;
        progress.dirty = false;
        Ok(())
    }

    /// Persist progress after a failed attempt. Runs outside the attempt
    /// scope so an expired deadline still gets its progress saved.
    async fn flush_progress<T>(&self, transport: &T, target: &ShareTarget, manifest: &mut Manifest, key: &EncryptionKey)
    where
        T: PeerTransport + ?Sized,
    {
        manifest.touch();
        let grace = self.settings.progress_flush_grace;
        match tokio::time::timeout(grace, transport.push_manifest(target, manifest, key)).await {
            Ok(Ok(())) => info!("Saved progress: peer holds {} files", manifest.files.len()),
            Ok(Err(e)) => warn!("Failed to save progress manifest: {}", e),
            Err(_) => warn!("Saving progress manifest took longer than {:?}", grace),
        }
    }
}

/// Delete blobs on the peer that no manifest references. Never fails.
async fn clean_orphans<T>(
    transport: &T,
    target: &ShareTarget,
    local: &Manifest,
    committed: &Manifest,
    scope: &AttemptScope,
) -> usize
where
    T: PeerTransport + ?Sized,
{
    let physical = match scope.guard(transport.list_remote_physical_files(target)).await {
        Ok(physical) => physical,
        Err(e) => {
            warn!(phase = %SyncPhase::CleaningOrphans, "Skipping orphan cleanup: {}", e);
            return 0;
        }
    };

    let mut keep: HashSet<&str> = local.remote_names();
    keep.extend(committed.remote_names());
    keep.insert(REMOTE_MANIFEST_NAME);

    let mut orphans: Vec<&String> = physical.iter().filter(|name| !keep.contains(name.as_str())).collect();
    orphans.sort();

    let mut removed = 0;
    for name in orphans {
        match scope.guard(transport.delete_remote_file(target, name)).await {
            Ok(()) => {
                debug!(phase = %SyncPhase::CleaningOrphans, path = %name, "Removed orphan");
                removed += 1;
            }
            Err(e) if e.is_interrupted() => {
                warn!(phase = %SyncPhase::CleaningOrphans, "Orphan cleanup interrupted: {}", e);
                break;
            }
            Err(e) => warn!(phase = %SyncPhase::CleaningOrphans, path = %name, "Failed to remove orphan: {}", e),
        }
    }
    if removed > 0 {
        info!(phase = %SyncPhase::CleaningOrphans, "Removed {} orphaned blobs", removed);
    }
    removed
}
