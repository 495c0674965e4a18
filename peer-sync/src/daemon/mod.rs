//! Daemon mode: periodic sync passes until SIGINT/SIGTERM.

pub mod runner;
pub mod scheduler;
pub mod shutdown;

pub use runner::{PairOutcome, PairResult, SyncRunner};
pub use scheduler::SyncScheduler;
pub use shutdown::ShutdownCoordinator;

use crate::audit::SqliteAuditLog;
use crate::config::Config;
use crate::crypto::FileKeyStore;
use crate::executor::{SyncEngine, SyncSettings};
use std::sync::Arc;
use std::time::Duration;

/// Extra time granted on shutdown on top of the progress flush budget.
const SHUTDOWN_SLACK: Duration = Duration::from_secs(5);

/// Engine wired to the on-disk audit log and key store of `config`.
pub fn engine_from_config(config: &Config) -> anyhow::Result<(SyncEngine, SqliteAuditLog)> {
    let audit = SqliteAuditLog::open(&config.agent.db_path())?;
    let keys = FileKeyStore::new(config.agent.keys_dir());
    let engine = SyncEngine::new(
        Arc::new(audit.clone()),
        Arc::new(keys),
        SyncSettings::from(&config.sync),
    );
    Ok((engine, audit))
}

/// Mark attempts left `running` by a previous process as failed.
pub async fn cleanup_zombies(audit: &SqliteAuditLog, after_hours: u64) -> anyhow::Result<usize> {
    let audit = audit.clone();
    let cutoff = chrono::Utc::now() - chrono::Duration::hours(after_hours as i64);
    let cleaned = tokio::task::spawn_blocking(move || audit.cleanup_zombies(cutoff)).await??;
    if cleaned > 0 {
        tracing::warn!(count = cleaned, "Marked stale running attempts as failed");
    }
    Ok(cleaned)
}

pub async fn run(config: Config) -> anyhow::Result<()> {
    let config = Arc::new(config);
    let (engine, audit) = engine_from_config(&config)?;
    cleanup_zombies(&audit, config.sync.zombie_after_hours).await?;

    let engine = Arc::new(engine);
    let runner = Arc::new(SyncRunner::from_config(config.clone(), engine.clone())?);
    let shutdown = ShutdownCoordinator::new();

    let scheduler = SyncScheduler::new(runner, shutdown.token()).await?;
    scheduler.schedule(&config.sync.schedule).await?;
    scheduler.start().await?;
    tracing::info!(
        origin = %config.agent.origin_server,
        shares = config.shares.iter().filter(|s| s.enabled).count(),
        peers = config.peers.iter().filter(|p| p.enabled).count(),
        "Daemon started"
    );

    shutdown.wait_for_signal().await;
    if let Err(e) = scheduler.shutdown().await {
        tracing::warn!("Scheduler shutdown failed: {}", e);
    }
    let grace = Duration::from_secs(config.sync.progress_flush_grace_secs) + SHUTDOWN_SLACK;
    shutdown.drain(engine.locks(), grace).await;
    Ok(())
}
