use std::sync::Arc;

use a3s_mirror_core::error::Result;
use a3s_mirror_core::{ImageSetConfiguration, RunOptions, WorkItem};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::{check_cancelled, map_to_work_item, parse_declared, ImageCollector};

/// Collects the platform release payload image.
///
/// Only an explicit `platform.release` image is collected. Update channels
/// are accepted in the configuration but resolving them needs the update
/// graph service, so they are reported and skipped.
pub struct ReleaseCollector {
    config: Arc<ImageSetConfiguration>,
    opts: Arc<RunOptions>,
}

impl ReleaseCollector {
    pub fn new(config: Arc<ImageSetConfiguration>, opts: Arc<RunOptions>) -> Self {
        Self { config, opts }
    }
}

#[async_trait]
impl ImageCollector for ReleaseCollector {
    async fn collect(&self, cancel: &CancellationToken) -> Result<Vec<WorkItem>> {
        check_cancelled(cancel)?;
        let platform = &self.config.mirror.platform;

        for channel in &platform.channels {
            tracing::warn!(
                channel = %channel.name,
                "Release channel resolution is not supported, declare the release image explicitly"
            );
        }

        let Some(release) = platform.release.as_deref() else {
            return Ok(Vec::new());
        };

        let origin = parse_declared("release", release)?;
        let item = map_to_work_item(&self.opts, &origin, &origin.path_component(), release);
        tracing::debug!(source = %item.source, destination = %item.destination, "Release image");
        Ok(vec![item])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collect::test_support::run_options;
    use a3s_mirror_core::config::{Platform, ReleaseChannel};
    use a3s_mirror_core::error::MirrorError;
    use a3s_mirror_core::WorkflowMode;

    fn config(release: Option<&str>, channels: Vec<&str>) -> Arc<ImageSetConfiguration> {
        let mut cfg = ImageSetConfiguration::default();
        cfg.mirror.platform = Platform {
            release: release.map(str::to_string),
            channels: channels
                .into_iter()
                .map(|name| ReleaseChannel {
                    name: name.to_string(),
                    ..Default::default()
                })
                .collect(),
        };
        Arc::new(cfg)
    }

    #[tokio::test]
    async fn test_collects_explicit_release() {
        let collector = ReleaseCollector::new(
            config(Some("quay.io/openshift-release-dev/ocp-release:4.14.1-x86_64"), vec![]),
            Arc::new(run_options(WorkflowMode::MirrorToDisk)),
        );
        let items = collector.collect(&CancellationToken::new()).await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(
            items[0].destination,
            "docker://localhost:5000/openshift-release-dev/ocp-release:4.14.1-x86_64"
        );
    }

    #[tokio::test]
    async fn test_channels_only_yield_nothing() {
        let collector = ReleaseCollector::new(
            config(None, vec!["stable-4.14"]),
            Arc::new(run_options(WorkflowMode::MirrorToDisk)),
        );
        assert!(collector.collect(&CancellationToken::new()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_release_is_config_error() {
        let collector = ReleaseCollector::new(
            config(Some("quay.io/"), vec![]),
            Arc::new(run_options(WorkflowMode::MirrorToDisk)),
        );
        let err = collector.collect(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, MirrorError::Config(_)));
    }

    #[tokio::test]
    async fn test_honours_cancellation() {
        let collector = ReleaseCollector::new(
            config(Some("quay.io/org/release:1"), vec![]),
            Arc::new(run_options(WorkflowMode::MirrorToDisk)),
        );
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(matches!(
            collector.collect(&cancel).await,
            Err(MirrorError::Cancelled)
        ));
    }
}
