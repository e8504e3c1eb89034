//! Batch transfer of collected work items.

use std::sync::Arc;
use std::time::Duration;

use a3s_mirror_core::error::{MirrorError, Result};
use a3s_mirror_core::{GlobalOptions, RunOptions, WorkItem};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use tokio_util::sync::CancellationToken;

use crate::mirror::{CopyOptions, Mirror};

/// Transfers a list of work items.
///
/// Every item is attempted; an error means at least one item failed.
#[async_trait]
pub trait BatchWorker: Send + Sync {
    async fn worker(
        &self,
        cancel: &CancellationToken,
        items: &[WorkItem],
        opts: &RunOptions,
    ) -> Result<()>;
}

/// Bounded-parallel copier with per-item retries.
pub struct Batch {
    mirror: Arc<dyn Mirror>,
    retry_times: u32,
    retry_delay: Duration,
    parallel_images: usize,
}

impl Batch {
    pub fn new(mirror: Arc<dyn Mirror>, opts: &GlobalOptions) -> Self {
        Self {
            mirror,
            retry_times: opts.retry_times,
            retry_delay: opts.retry_delay,
            parallel_images: opts.parallel_images.max(1),
        }
    }

    async fn transfer(
        &self,
        item: &WorkItem,
        opts: &CopyOptions,
        cancel: &CancellationToken,
    ) -> std::result::Result<(), String> {
        let mut attempt = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(format!("{}: cancelled", item.source));
            }
            match self.mirror.copy(&item.source, &item.destination, opts).await {
                Ok(()) => {
                    tracing::info!(
                        image_type = %item.image_type,
                        destination = %item.destination,
                        "Image copied"
                    );
                    return Ok(());
                }
                Err(e) if attempt < self.retry_times => {
                    attempt += 1;
                    tracing::warn!(
                        source = %item.source,
                        attempt,
                        retries = self.retry_times,
                        error = %e,
                        "Copy failed, retrying"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => {}
                        _ = tokio::time::sleep(self.retry_delay) => {}
                    }
                }
                Err(e) => {
                    tracing::error!(source = %item.source, error = %e, "Copy failed");
                    return Err(format!("{} -> {}: {}", item.source, item.destination, e));
                }
            }
        }
    }
}

#[async_trait]
impl BatchWorker for Batch {
    async fn worker(
        &self,
        cancel: &CancellationToken,
        items: &[WorkItem],
        opts: &RunOptions,
    ) -> Result<()> {
        let copy_opts = CopyOptions::from_run(opts);
        let total = items.len();
        tracing::info!(images = total, parallel = self.parallel_images, "Copying images");

        let transfers: Vec<_> = items
            .iter()
            .map(|item| self.transfer(item, &copy_opts, cancel))
            .collect();
        let failures: Vec<String> = stream::iter(transfers)
            .buffer_unordered(self.parallel_images)
            .filter_map(|result| async move { result.err() })
            .collect()
            .await;

        if cancel.is_cancelled() {
            return Err(MirrorError::Cancelled);
        }
        if !failures.is_empty() {
            return Err(MirrorError::Transfer {
                failed: failures.len(),
                total,
                details: failures,
            });
        }

        tracing::info!(images = total, "All images copied");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::path::PathBuf;
    use std::sync::Mutex;

    use a3s_mirror_core::WorkflowMode;

    /// Fails each source a fixed number of times before succeeding.
    #[derive(Default)]
    struct Flaky {
        failures: Mutex<HashMap<String, u32>>,
        attempts: Mutex<Vec<String>>,
    }

    impl Flaky {
        fn failing(source: &str, times: u32) -> Self {
            let flaky = Self::default();
            flaky.failures.lock().unwrap().insert(source.to_string(), times);
            flaky
        }
    }

    #[async_trait]
    impl Mirror for Flaky {
        async fn copy(&self, source: &str, _destination: &str, _opts: &CopyOptions) -> Result<()> {
            self.attempts.lock().unwrap().push(source.to_string());
            let mut failures = self.failures.lock().unwrap();
            match failures.get_mut(source) {
                Some(n) if *n > 0 => {
                    *n -= 1;
                    Err(MirrorError::Other("boom".to_string()))
                }
                _ => Ok(()),
            }
        }

        async fn check(&self, _image: &str, _opts: &CopyOptions) -> Result<bool> {
            Ok(true)
        }
    }

    fn items(sources: &[&str]) -> Vec<WorkItem> {
        sources
            .iter()
            .map(|s| WorkItem::new(*s, format!("{}-dst", s), *s))
            .collect()
    }

    fn run_options(retry_times: u32) -> RunOptions {
        let global = GlobalOptions {
            retry_times,
            retry_delay: Duration::from_millis(1),
            parallel_images: 2,
            ..Default::default()
        };
        RunOptions::resolve(&global, WorkflowMode::MirrorToDisk, "file:///tmp/x", PathBuf::from("/c"))
            .unwrap()
    }

    #[tokio::test]
    async fn test_all_succeed() {
        let mirror = Arc::new(Flaky::default());
        let opts = run_options(0);
        let batch = Batch::new(mirror.clone(), &opts.global);
        batch
            .worker(&CancellationToken::new(), &items(&["a", "b", "c"]), &opts)
            .await
            .unwrap();
        assert_eq!(mirror.attempts.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_retries_then_succeeds() {
        let mirror = Arc::new(Flaky::failing("b", 2));
        let opts = run_options(2);
        let batch = Batch::new(mirror.clone(), &opts.global);
        batch
            .worker(&CancellationToken::new(), &items(&["a", "b"]), &opts)
            .await
            .unwrap();
        let attempts = mirror.attempts.lock().unwrap();
        assert_eq!(attempts.iter().filter(|s| *s == "b").count(), 3);
    }

    #[tokio::test]
    async fn test_attempts_every_item_and_aggregates() {
        let mirror = Arc::new(Flaky::failing("a", 10));
        let opts = run_options(1);
        let batch = Batch::new(mirror.clone(), &opts.global);
        let err = batch
            .worker(&CancellationToken::new(), &items(&["a", "b", "c"]), &opts)
            .await
            .unwrap_err();

        match err {
            MirrorError::Transfer {
                failed,
                total,
                details,
            } => {
                assert_eq!(failed, 1);
                assert_eq!(total, 3);
                assert!(details[0].starts_with("a -> a-dst"));
            }
            other => panic!("unexpected error: {other}"),
        }
        let attempts = mirror.attempts.lock().unwrap();
        assert!(attempts.contains(&"b".to_string()));
        assert!(attempts.contains(&"c".to_string()));
    }

    #[tokio::test]
    async fn test_cancelled() {
        let mirror = Arc::new(Flaky::default());
        let opts = run_options(0);
        let batch = Batch::new(mirror.clone(), &opts.global);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = batch.worker(&cancel, &items(&["a"]), &opts).await.unwrap_err();
        assert!(matches!(err, MirrorError::Cancelled));
        assert!(mirror.attempts.lock().unwrap().is_empty());
    }
}
