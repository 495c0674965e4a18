use super::runner::{PairOutcome, SyncRunner};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tokio_util::sync::CancellationToken;

/// Fires a full pass over every configured pair on a cron schedule.
pub struct SyncScheduler {
    scheduler: Mutex<JobScheduler>,
    runner: Arc<SyncRunner>,
    cancel: CancellationToken,
    pass_running: Arc<AtomicBool>,
}

impl SyncScheduler {
    pub async fn new(runner: Arc<SyncRunner>, cancel: CancellationToken) -> anyhow::Result<Self> {
        let scheduler = JobScheduler::new().await?;
        Ok(Self {
            scheduler: Mutex::new(scheduler),
            runner,
            cancel,
            pass_running: Arc::new(AtomicBool::new(false)),
        })
    }

    pub async fn schedule(&self, cron_expression: &str) -> anyhow::Result<()> {
        let runner = self.runner.clone();
        let cancel = self.cancel.clone();
        let pass_running = self.pass_running.clone();

        let job = Job::new_async(cron_expression, move |_uuid, _lock| {
            let runner = runner.clone();
            let cancel = cancel.clone();
            let pass_running = pass_running.clone();
            Box::pin(async move {
                if cancel.is_cancelled() {
                    return;
                }
                if pass_running.swap(true, Ordering::SeqCst) {
                    tracing::warn!("Skipping scheduled pass: previous pass still running");
                    return;
                }

                tracing::info!("Starting scheduled sync pass");
                let results = runner.run_all(&cancel).await;
                pass_running.store(false, Ordering::SeqCst);

                let synced = results.iter().filter(|r| matches!(r.outcome, PairOutcome::Synced(_))).count();
                let skipped = results.iter().filter(|r| matches!(r.outcome, PairOutcome::Skipped)).count();
                let failed = results.len() - synced - skipped;
                tracing::info!(synced, skipped, failed, "Scheduled sync pass finished");
            })
        })?;

        self.scheduler.lock().await.add(job).await?;
        tracing::info!(cron = %cron_expression, "Sync pass scheduled");
        Ok(())
    }

    pub async fn start(&self) -> anyhow::Result<()> {
        self.scheduler.lock().await.start().await?;
        Ok(())
    }

    pub async fn shutdown(&self) -> anyhow::Result<()> {
        self.scheduler.lock().await.shutdown().await?;
        Ok(())
    }
}
