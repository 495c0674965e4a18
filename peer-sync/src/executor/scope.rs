//! Deadline and cancellation for one attempt.

use crate::{Result, SyncError};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// A child of the caller's token that is also cancelled when the attempt
/// deadline passes. No deadline means the attempt only ends on cancellation.
pub(crate) struct AttemptScope {
    token: CancellationToken,
    timed_out: Arc<AtomicBool>,
    timer: Option<JoinHandle<()>>,
}

impl AttemptScope {
    pub(crate) fn new(parent: &CancellationToken, timeout: Option<Duration>) -> Self {
        let token = parent.child_token();
        let timed_out = Arc::new(AtomicBool::new(false));
        let timer = timeout.map(|limit| {
            let token = token.clone();
            let timed_out = Arc::clone(&timed_out);
            tokio::spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep(limit) => {
                        timed_out.store(true, Ordering::SeqCst);
                        token.cancel();
                    }
                    _ = token.cancelled() => {}
                }
            })
        });
        Self {
            token,
            timed_out,
            timer,
        }
    }

    pub(crate) fn token(&self) -> &CancellationToken {
        &self.token
    }

    fn interruption(&self) -> SyncError {
        if self.timed_out.load(Ordering::SeqCst) {
            SyncError::Timeout
        } else {
            SyncError::Cancelled
        }
    }

    pub(crate) fn check(&self) -> Result<()> {
        if self.token.is_cancelled() {
            Err(self.interruption())
        } else {
            Ok(())
        }
    }

    /// Report a cancellation surfaced by a callee as a timeout when the
    /// deadline caused it.
    pub(crate) fn explain(&self, err: SyncError) -> SyncError {
        match err {
            SyncError::Cancelled => self.interruption(),
            other => other,
        }
    }

    /// Run `fut` unless the scope ends first.
    pub(crate) async fn guard<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(self.interruption()),
            result = fut => result.map_err(|e| self.explain(e)),
        }
    }
}

impl Drop for AttemptScope {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_deadline_reports_timeout() {
        let parent = CancellationToken::new();
        let scope = AttemptScope::new(&parent, Some(Duration::from_millis(20)));
        let result: Result<()> = scope
            .guard(async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(SyncError::Timeout)));
        assert!(!parent.is_cancelled());
    }

    #[tokio::test]
    async fn test_no_deadline_runs_to_completion() {
        let scope = AttemptScope::new(&CancellationToken::new(), None);
        let value = scope
            .guard(async {
                tokio::time::sleep(Duration::from_millis(30)).await;
                Ok(7)
            })
            .await
            .unwrap();
        assert_eq!(value, 7);
        assert!(scope.check().is_ok());
    }

    #[tokio::test]
    async fn test_parent_cancel_reports_cancelled() {
        let parent = CancellationToken::new();
        let scope = AttemptScope::new(&parent, Some(Duration::from_secs(60)));
        parent.cancel();
        assert!(matches!(scope.check(), Err(SyncError::Cancelled)));
        assert!(matches!(scope.explain(SyncError::Cancelled), SyncError::Cancelled));
    }
}
