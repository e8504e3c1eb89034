use std::sync::Arc;

use a3s_mirror_core::config::Image;
use a3s_mirror_core::error::Result;
use a3s_mirror_core::{ImageSetConfiguration, RunOptions, WorkItem};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::{check_cancelled, map_to_work_item, parse_declared, ImageCollector};
use crate::reference::{strip_transport, ImageReference};

/// Collects `additionalImages`, skipping anything in `blockedImages`.
pub struct AdditionalCollector {
    config: Arc<ImageSetConfiguration>,
    opts: Arc<RunOptions>,
}

impl AdditionalCollector {
    pub fn new(config: Arc<ImageSetConfiguration>, opts: Arc<RunOptions>) -> Self {
        Self { config, opts }
    }
}

/// A blocked entry matches the exact reference or any repository below it.
fn is_blocked(declared: &str, image: &ImageReference, blocked: &[Image]) -> bool {
    let declared = strip_transport(declared);
    let repository = image.repository_path();
    blocked
        .iter()
        .map(|b| strip_transport(b.name.trim()).trim_end_matches('/'))
        .filter(|b| !b.is_empty())
        .any(|b| {
            declared == b
                || image.full_reference() == b
                || repository == b
                || repository.starts_with(&format!("{}/", b))
        })
}

#[async_trait]
impl ImageCollector for AdditionalCollector {
    async fn collect(&self, cancel: &CancellationToken) -> Result<Vec<WorkItem>> {
        let mirror = &self.config.mirror;
        let mut items = Vec::with_capacity(mirror.additional_images.len());

        for image in &mirror.additional_images {
            check_cancelled(cancel)?;
            let origin = parse_declared("additional", &image.name)?;
            if is_blocked(&image.name, &origin, &mirror.blocked_images) {
                tracing::info!(image = %image.name, "Skipping blocked image");
                continue;
            }
            items.push(map_to_work_item(
                &self.opts,
                &origin,
                &origin.path_component(),
                &image.name,
            ));
        }

        Ok(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collect::test_support::run_options;
    use a3s_mirror_core::WorkflowMode;

    fn images(names: &[&str]) -> Vec<Image> {
        names
            .iter()
            .map(|n| Image {
                name: n.to_string(),
            })
            .collect()
    }

    #[test]
    fn test_is_blocked() {
        let image = ImageReference::parse("quay.io/org/tools/cli:v1").unwrap();
        assert!(is_blocked("quay.io/org/tools/cli:v1", &image, &images(&["quay.io/org/tools/cli:v1"])));
        assert!(is_blocked("quay.io/org/tools/cli:v1", &image, &images(&["quay.io/org/tools/cli"])));
        assert!(is_blocked("quay.io/org/tools/cli:v1", &image, &images(&["docker://quay.io/org"])));
        assert!(!is_blocked("quay.io/org/tools/cli:v1", &image, &images(&["quay.io/or"])));
        assert!(!is_blocked("quay.io/org/tools/cli:v1", &image, &images(&["", "ghcr.io/org"])));
    }

    #[tokio::test]
    async fn test_filters_blocked_images() {
        let mut cfg = ImageSetConfiguration::default();
        cfg.mirror.additional_images = images(&[
            "registry.redhat.io/ubi9/ubi:latest",
            "quay.io/blocked/image:v1",
            "docker.io/library/busybox:1.36",
        ]);
        cfg.mirror.blocked_images = images(&["quay.io/blocked"]);

        let collector = AdditionalCollector::new(
            Arc::new(cfg),
            Arc::new(run_options(WorkflowMode::MirrorToDisk)),
        );
        let items = collector.collect(&CancellationToken::new()).await.unwrap();
        let destinations: Vec<_> = items.iter().map(|i| i.destination.as_str()).collect();
        assert_eq!(
            destinations,
            vec![
                "docker://localhost:5000/ubi9/ubi:latest",
                "docker://localhost:5000/library/busybox:1.36",
            ]
        );
    }
}
