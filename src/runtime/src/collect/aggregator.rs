//! Sequential three-phase collection.

use a3s_mirror_core::error::{MirrorError, Result};
use a3s_mirror_core::{ImageType, WorkItem};
use tokio_util::sync::CancellationToken;

use super::ImageCollector;

/// Fold one collector batch into the accumulated list.
///
/// Appends in order and stamps every item of the batch with `image_type`.
pub fn merge(mut acc: Vec<WorkItem>, batch: Vec<WorkItem>, image_type: ImageType) -> Vec<WorkItem> {
    acc.extend(batch.into_iter().map(|item| item.with_type(image_type)));
    acc
}

/// Run the release, operator and additional collectors in that order.
///
/// Stops at the first failing collector; later collectors are not invoked.
/// The error records how many items had been collected before the failure.
pub async fn collect_all(
    release: &dyn ImageCollector,
    operator: &dyn ImageCollector,
    additional: &dyn ImageCollector,
    cancel: &CancellationToken,
) -> Result<Vec<WorkItem>> {
    let phases: [(ImageType, &dyn ImageCollector); 3] = [
        (ImageType::Release, release),
        (ImageType::Operator, operator),
        (ImageType::Additional, additional),
    ];

    let mut collected = Vec::new();
    for (image_type, collector) in phases {
        tracing::debug!(phase = %image_type, "Collecting images");
        let batch = match collector.collect(cancel).await {
            Ok(batch) => batch,
            Err(MirrorError::Cancelled) => return Err(MirrorError::Cancelled),
            Err(e) => {
                tracing::error!(phase = %image_type, collected = collected.len(), error = %e, "Collector failed");
                return Err(MirrorError::Collection {
                    phase: image_type.to_string(),
                    collected: collected.len(),
                    message: e.to_string(),
                });
            }
        };
        tracing::info!(phase = %image_type, images = batch.len(), "Collected images");
        collected = merge(collected, batch, image_type);
    }

    Ok(collected)
}
