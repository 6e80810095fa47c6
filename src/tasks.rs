use dashmap::DashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::error::Result;

/// Tareas en segundo plano del gateway: descargas y refresco.
///
/// Every task is tracked so [`BackgroundTasks::shutdown`] can cancel and
/// drain them. Downloads are bounded by a semaphore, and at most one runs
/// per asset key.
#[derive(Clone)]
pub struct BackgroundTasks {
    tracker: TaskTracker,
    token: CancellationToken,
    download_slots: Arc<Semaphore>,
    in_flight: Arc<DashSet<String>>,
}

struct InFlightGuard {
    set: Arc<DashSet<String>>,
    key: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.set.remove(&self.key);
    }
}

impl BackgroundTasks {
    pub fn new(max_concurrent_downloads: usize) -> Self {
        Self {
            tracker: TaskTracker::new(),
            token: CancellationToken::new(),
            download_slots: Arc::new(Semaphore::new(max_concurrent_downloads.max(1))),
            in_flight: Arc::new(DashSet::new()),
        }
    }

    /// Cancelled once shutdown starts.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn is_downloading(&self, asset_key: &str) -> bool {
        self.in_flight.contains(asset_key)
    }

    pub fn downloads_in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Queues a download unless one for the same asset is already queued or
    /// running. Returns whether the job was accepted.
    pub fn spawn_download<F>(&self, asset_key: impl Into<String>, job: F) -> bool
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let asset_key = asset_key.into();

        if self.token.is_cancelled() {
            debug!("⏹️ Shutting down, not downloading {}", asset_key);
            return false;
        }
        if !self.in_flight.insert(asset_key.clone()) {
            debug!("⏭️ Download already in progress: {}", asset_key);
            return false;
        }

        let guard = InFlightGuard {
            set: Arc::clone(&self.in_flight),
            key: asset_key,
        };
        let slots = Arc::clone(&self.download_slots);
        let token = self.token.clone();

        self.tracker.spawn(async move {
            let _permit = tokio::select! {
                _ = token.cancelled() => return,
                permit = slots.acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => return,
                },
            };

            debug!("⬇️ Downloading {}", guard.key);
            tokio::select! {
                _ = token.cancelled() => {
                    warn!("⏹️ Download cancelled: {}", guard.key);
                }
                result = job => match result {
                    Ok(()) => debug!("✅ Download finished: {}", guard.key),
                    Err(e) => warn!("⚠️ Background download failed for {}: {}", guard.key, e),
                },
            }
        });

        true
    }

    /// Runs `task` until it finishes or shutdown starts.
    pub fn spawn<F>(&self, name: &'static str, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let token = self.token.clone();
        self.tracker.spawn(async move {
            tokio::select! {
                _ = token.cancelled() => debug!("⏹️ {} stopped", name),
                _ = task => {}
            }
        });
    }

    /// Cancels every task and waits up to `grace` for them to finish.
    /// Returns `false` if some were still running when the grace ran out.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        self.token.cancel();
        self.tracker.close();

        match tokio::time::timeout(grace, self.tracker.wait()).await {
            Ok(()) => {
                info!("✅ Background tasks drained");
                true
            }
            Err(_) => {
                warn!(
                    "⌛ {} background tasks still running after {:?}",
                    self.tracker.len(),
                    grace
                );
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GatewayError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_one_download_per_asset() {
        let tasks = BackgroundTasks::new(4);
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();

        assert!(tasks.spawn_download("netease_1_320k", async move {
            let _ = rx.await;
            Ok(())
        }));
        assert!(tasks.is_downloading("netease_1_320k"));
        assert!(!tasks.spawn_download("netease_1_320k", async { Ok(()) }));

        tx.send(()).unwrap();
        assert!(tasks.shutdown(Duration::from_secs(1)).await);
        assert_eq!(tasks.downloads_in_flight(), 0);
    }

    #[tokio::test]
    async fn test_failed_download_frees_the_asset() {
        let tasks = BackgroundTasks::new(1);
        let done = Arc::new(tokio::sync::Notify::new());
        let signal = done.clone();

        tasks.spawn_download("a", async move {
            signal.notify_one();
            Err(GatewayError::Download("HTTP 403".into()))
        });
        done.notified().await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(!tasks.is_downloading("a"));
        assert!(tasks.spawn_download("a", async { Ok(()) }));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrency_is_bounded() {
        let tasks = BackgroundTasks::new(2);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        for i in 0..8 {
            let running = running.clone();
            let peak = peak.clone();
            tasks.spawn_download(format!("asset_{}", i), async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(30)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            });
        }

        tasks.tracker.close();
        tasks.tracker.wait().await;
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_shutdown_cancels_stuck_work() {
        let tasks = BackgroundTasks::new(1);
        tasks.spawn_download("slow", async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(())
        });
        tasks.spawn("refresh", std::future::pending());

        assert!(tasks.shutdown(Duration::from_secs(1)).await);
        assert!(!tasks.spawn_download("late", async { Ok(()) }));
    }
}
