use std::sync::Arc;

use a3s_mirror_core::config::Operator;
use a3s_mirror_core::error::Result;
use a3s_mirror_core::{ImageSetConfiguration, RunOptions, WorkItem};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::{check_cancelled, map_to_work_item, parse_declared, ImageCollector};
use crate::reference::ImageReference;

/// Collects operator catalog images.
///
/// Bundle and related images are resolved by the catalog tooling; this
/// collector mirrors the catalog images themselves, honouring
/// `targetCatalog` and `targetTag` on the destination side.
pub struct OperatorCollector {
    config: Arc<ImageSetConfiguration>,
    opts: Arc<RunOptions>,
}

impl OperatorCollector {
    pub fn new(config: Arc<ImageSetConfiguration>, opts: Arc<RunOptions>) -> Self {
        Self { config, opts }
    }
}

/// Path of a catalog inside the cache after applying target overrides.
fn target_path(origin: &ImageReference, operator: &Operator) -> String {
    if operator.target_catalog.is_none() && operator.target_tag.is_none() {
        return origin.path_component();
    }

    let repository = operator
        .target_catalog
        .as_deref()
        .map(|c| c.trim_matches('/').to_string())
        .unwrap_or_else(|| origin.repository.clone());
    let target = ImageReference {
        registry: origin.registry.clone(),
        repository,
        tag: operator.target_tag.clone().or_else(|| origin.tag.clone()),
        digest: if operator.target_tag.is_some() {
            None
        } else {
            origin.digest.clone()
        },
    };
    target.path_component()
}

#[async_trait]
impl ImageCollector for OperatorCollector {
    async fn collect(&self, cancel: &CancellationToken) -> Result<Vec<WorkItem>> {
        let mut items = Vec::with_capacity(self.config.mirror.operators.len());
        for operator in &self.config.mirror.operators {
            check_cancelled(cancel)?;
            let origin = parse_declared("operator", &operator.catalog)?;
            let path = target_path(&origin, operator);
            let item = map_to_work_item(&self.opts, &origin, &path, &operator.catalog);
            tracing::debug!(source = %item.source, destination = %item.destination, "Operator catalog");
            items.push(item);
        }
        Ok(items)
    }
}
