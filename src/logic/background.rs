use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

struct ExecutorInner {
    tracker: TaskTracker,
    permits: Arc<Semaphore>,
    cancel: CancellationToken,
    pending: AtomicUsize,
    idle: Notify,
}

/// Bounded fire-and-forget executor. Jobs never fail their caller: errors
/// and panics are logged and swallowed.
#[derive(Clone)]
pub struct BackgroundExecutor {
    inner: Arc<ExecutorInner>,
}

impl BackgroundExecutor {
    pub fn new(max_concurrency: usize) -> Self {
        Self {
            inner: Arc::new(ExecutorInner {
                tracker: TaskTracker::new(),
                permits: Arc::new(Semaphore::new(max_concurrency.max(1))),
                cancel: CancellationToken::new(),
                pending: AtomicUsize::new(0),
                idle: Notify::new(),
            }),
        }
    }

    /// Token cancelled on shutdown; long-running jobs should watch it.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    pub fn spawn<F>(&self, name: &'static str, job: F)
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        if self.inner.cancel.is_cancelled() {
            log::warn!("Background job '{}' rejected: executor is shutting down", name);
            return;
        }
        let inner = self.inner.clone();
        inner.pending.fetch_add(1, Ordering::SeqCst);
        self.inner.tracker.spawn(async move {
            match inner.permits.clone().acquire_owned().await {
                Ok(_permit) => match AssertUnwindSafe(job).catch_unwind().await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => log::error!("Background job '{}' failed: {:#}", name, e),
                    Err(panic) => {
                        let message = panic
                            .downcast_ref::<&str>()
                            .map(|s| s.to_string())
                            .or_else(|| panic.downcast_ref::<String>().cloned())
                            .unwrap_or_else(|| "unknown panic".to_string());
                        log::error!("Background job '{}' panicked: {}", name, message);
                    }
                },
                Err(_) => log::warn!("Background job '{}' dropped: executor closed", name),
            }
            if inner.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
                inner.idle.notify_waiters();
            }
        });
    }

    /// Wait until every spawned job has finished.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            if self.inner.pending.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Cancel long-running jobs and wait for the rest to drain.
    pub async fn shutdown(&self, grace: Duration) {
        self.inner.cancel.cancel();
        self.inner.tracker.close();
        if tokio::time::timeout(grace, self.inner.tracker.wait()).await.is_err() {
            log::warn!(
                "Background executor shut down with {} jobs still running",
                self.inner.pending.load(Ordering::SeqCst)
            );
        } else {
            log::info!("Background executor drained");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    #[tokio::test]
    async fn test_jobs_run_and_errors_are_swallowed() {
        let executor = BackgroundExecutor::new(2);
        let done = Arc::new(AtomicBool::new(false));
        let flag = done.clone();
        executor.spawn("ok", async move {
            flag.store(true, Ordering::SeqCst);
            Ok(())
        });
        executor.spawn("failing", async { Err::<(), _>(anyhow::anyhow!("boom")) });
        executor.wait_idle().await;
        assert!(done.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_panics_are_captured() {
        let executor = BackgroundExecutor::new(1);
        executor.spawn("panicking", async {
            if true {
                panic!("job exploded");
            }
            Ok(())
        });
        executor.wait_idle().await;

        let after = Arc::new(AtomicBool::new(false));
        let flag = after.clone();
        executor.spawn("after", async move {
            flag.store(true, Ordering::SeqCst);
            Ok(())
        });
        executor.wait_idle().await;
        assert!(after.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_shutdown_rejects_new_jobs() {
        let executor = BackgroundExecutor::new(1);
        executor.shutdown(Duration::from_millis(100)).await;
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        executor.spawn("late", async move {
            flag.store(true, Ordering::SeqCst);
            Ok(())
        });
        executor.wait_idle().await;
        assert!(!ran.load(Ordering::SeqCst));
    }
}
