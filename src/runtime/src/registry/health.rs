//! Storage driver health checking.
//!
//! The storage root is stat'ed on a fixed interval. After `threshold`
//! consecutive failures the registry reports itself unhealthy until a check
//! succeeds again.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// Shared health status of the storage driver.
#[derive(Debug)]
pub struct StorageHealth {
    root: PathBuf,
    threshold: u32,
    failures: AtomicU32,
    healthy: AtomicBool,
}

impl StorageHealth {
    pub fn new(root: PathBuf, threshold: u32) -> Self {
        Self {
            root,
            threshold: threshold.max(1),
            failures: AtomicU32::new(0),
            healthy: AtomicBool::new(true),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    /// Run one check and update the status.
    pub async fn check(&self) -> bool {
        let ok = tokio::fs::metadata(&self.root)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false);
        self.record(ok);
        ok
    }

    fn record(&self, ok: bool) {
        if ok {
            self.failures.store(0, Ordering::Release);
            if !self.healthy.swap(true, Ordering::AcqRel) {
                tracing::info!(root = %self.root.display(), "Storage driver healthy again");
            }
            return;
        }

        let failures = self.failures.fetch_add(1, Ordering::AcqRel) + 1;
        tracing::warn!(
            root = %self.root.display(),
            failures,
            threshold = self.threshold,
            "Storage driver health check failed"
        );
        if failures >= self.threshold && self.healthy.swap(false, Ordering::AcqRel) {
            tracing::error!(root = %self.root.display(), "Storage driver marked unhealthy");
        }
    }

    /// Check on every `interval` until `cancel` fires.
    pub async fn run(self: Arc<Self>, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // the first tick completes immediately
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.check().await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_healthy_root() {
        let tmp = TempDir::new().unwrap();
        let health = StorageHealth::new(tmp.path().to_path_buf(), 3);
        assert!(health.check().await);
        assert!(health.is_healthy());
    }

    #[tokio::test]
    async fn test_unhealthy_after_threshold() {
        let tmp = TempDir::new().unwrap();
        let health = StorageHealth::new(tmp.path().join("missing"), 3);

        assert!(!health.check().await);
        assert!(!health.check().await);
        assert!(health.is_healthy());
        assert!(!health.check().await);
        assert!(!health.is_healthy());
    }

    #[tokio::test]
    async fn test_recovers_after_success() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("root");
        let health = StorageHealth::new(root.clone(), 1);

        health.check().await;
        assert!(!health.is_healthy());

        std::fs::create_dir_all(&root).unwrap();
        assert!(health.check().await);
        assert!(health.is_healthy());
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let tmp = TempDir::new().unwrap();
        let health = Arc::new(StorageHealth::new(tmp.path().to_path_buf(), 3));
        let cancel = CancellationToken::new();
        let task = tokio::spawn(health.run(Duration::from_millis(10), cancel.clone()));
        tokio::time::sleep(Duration::from_millis(30)).await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }
}
