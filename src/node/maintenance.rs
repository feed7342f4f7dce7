//! Periodic maintenance loop with cooperative cancellation.

use std::future::Future;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::consts::MAINTENANCE_POLL_MS;

/// Handle to a running maintenance task. The task runs one cycle per
/// interval and checks its cancel flag every few milliseconds, so shutdown
/// never waits for a full interval.
pub struct MaintenanceHandle {
    running: Arc<AtomicBool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl MaintenanceHandle {
    /// Spawn a maintenance loop running `cycle` every `interval`. Errors
    /// from a cycle are logged and the next cycle starts on schedule.
    pub fn spawn<F, Fut>(interval: Duration, cycle: F) -> Self
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = crate::error::Result<()>> + Send + 'static,
    {
        let running = Arc::new(AtomicBool::new(true));
        let flag = running.clone();

        let task = tokio::spawn(async move {
            let mut last_cycle = Instant::now();
            while flag.load(Ordering::Relaxed) {
                if last_cycle.elapsed() < interval {
                    tokio::time::sleep(Duration::from_millis(MAINTENANCE_POLL_MS)).await;
                    continue;
                }

                if let Err(e) = cycle().await {
                    tracing::warn!(error = %e, "maintenance cycle failed, continuing");
                }
                last_cycle = Instant::now();
            }
        });

        Self {
            running,
            task: Mutex::new(Some(task)),
        }
    }

    /// Flip the cancel flag and wait for the loop to exit.
    pub async fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
        let task = {
            let mut guard = match self.task.lock() {
                Ok(g) => g,
                Err(_) => return,
            };
            guard.take()
        };
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    /// Is the loop still scheduled?
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    #[tokio::test(flavor = "multi_thread")]
    async fn test_cycles_run_and_stop_promptly() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();

        let handle = MaintenanceHandle::spawn(Duration::from_millis(30), move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(count.load(Ordering::SeqCst) >= 2);

        let before_stop = Instant::now();
        handle.stop().await;
        assert!(before_stop.elapsed() < Duration::from_millis(100));
        assert!(!handle.is_running());

        // No cycles run after stop.
        let stopped_at = count.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(count.load(Ordering::SeqCst), stopped_at);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_errors_do_not_kill_the_loop() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();

        let handle = MaintenanceHandle::spawn(Duration::from_millis(20), move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(crate::error::Error::NoRoute)
            }
        });

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(count.load(Ordering::SeqCst) >= 2);
        handle.stop().await;
    }
}
