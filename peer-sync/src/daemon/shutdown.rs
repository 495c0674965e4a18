//! SIGINT/SIGTERM handling.
//!
//! A signal cancels the shared token; running attempts see the cancellation,
//! save their progress manifest and release their locks.

use crate::executor::SyncLocks;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub struct ShutdownCoordinator {
    token: CancellationToken,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    /// Token cancelled once shutdown starts.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Wait for SIGINT or SIGTERM, then cancel the token.
    pub async fn wait_for_signal(&self) {
        let ctrl_c = async {
            if let Err(e) = signal::ctrl_c().await {
                error!("Failed to listen for Ctrl+C: {}", e);
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(mut stream) => {
                    stream.recv().await;
                }
                Err(e) => {
                    error!("Failed to install SIGTERM handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => info!("Received SIGINT (Ctrl+C), initiating graceful shutdown..."),
            _ = terminate => info!("Received SIGTERM, initiating graceful shutdown..."),
            _ = self.token.cancelled() => {}
        }
        self.token.cancel();
    }

    /// Cancel running attempts and wait up to `grace` for their locks to be
    /// released. Returns whether every attempt finished in time.
    pub async fn drain(&self, locks: &SyncLocks, grace: Duration) -> bool {
        self.token.cancel();
        let deadline = tokio::time::Instant::now() + grace;
        while locks.held_count() > 0 {
            if tokio::time::Instant::now() >= deadline {
                warn!("{} sync attempts still running at shutdown", locks.held_count());
                return false;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        info!("Graceful shutdown complete");
        true
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}
