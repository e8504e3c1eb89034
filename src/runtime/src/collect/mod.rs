//! Image collection.
//!
//! Three collectors turn the image set configuration into work items:
//!
//! ```text
//!   ImageSetConfiguration
//!     ├── platform.release   ──► ReleaseCollector     ─┐
//!     ├── operators[]        ──► OperatorCollector    ─┼─► collect_all ──► Vec<WorkItem>
//!     └── additionalImages[] ──► AdditionalCollector  ─┘
//! ```
//!
//! Every collector maps a declared image onto the local cache registry. For
//! mirror to disk and prepare the cache is the destination; for disk to
//! mirror it is the source and the user's registry is the destination.

mod additional;
mod aggregator;
mod operator;
mod release;

pub use additional::AdditionalCollector;
pub use aggregator::{collect_all, merge};
pub use operator::OperatorCollector;
pub use release::ReleaseCollector;

use a3s_mirror_core::error::{MirrorError, Result};
use a3s_mirror_core::options::DOCKER_PROTOCOL;
use a3s_mirror_core::{RunOptions, WorkItem, WorkflowMode};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::reference::ImageReference;

/// Produces the ordered work items of one content category.
#[async_trait]
pub trait ImageCollector: Send + Sync {
    /// Collect work items. The order of the returned items is preserved.
    async fn collect(&self, cancel: &CancellationToken) -> Result<Vec<WorkItem>>;
}

/// Map a declared image to a work item for the run mode.
///
/// `path` is the repository path (with tag or digest) the image has inside
/// the cache; it usually equals the origin's path component.
pub(crate) fn map_to_work_item(
    opts: &RunOptions,
    origin: &ImageReference,
    path: &str,
    declared: &str,
) -> WorkItem {
    let cache = format!("{}{}/{}", DOCKER_PROTOCOL, opts.local_storage_fqdn, path);
    match opts.mode {
        WorkflowMode::MirrorToDisk | WorkflowMode::Prepare => {
            WorkItem::new(origin.docker_reference(), cache, declared)
        }
        WorkflowMode::DiskToMirror => {
            let destination = format!("{}/{}", opts.destination.trim_end_matches('/'), path);
            WorkItem::new(cache, destination, declared)
        }
    }
}

/// Parse a declared image, naming the collector in the error.
pub(crate) fn parse_declared(collector: &str, declared: &str) -> Result<ImageReference> {
    ImageReference::parse(declared).map_err(|e| {
        MirrorError::Config(format!("{}: invalid image '{}': {}", collector, declared, e))
    })
}

pub(crate) fn check_cancelled(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        Err(MirrorError::Cancelled)
    } else {
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::path::PathBuf;

    use a3s_mirror_core::{GlobalOptions, RunOptions, WorkflowMode};

    pub fn run_options(mode: WorkflowMode) -> RunOptions {
        let global = GlobalOptions {
            from: Some("file:///data/archive".to_string()),
            ..Default::default()
        };
        let destination = match mode {
            WorkflowMode::MirrorToDisk => "file:///mnt/disk",
            WorkflowMode::DiskToMirror => "docker://mirror.example.com:8443/disconnected",
            WorkflowMode::Prepare => "",
        };
        RunOptions::resolve(&global, mode, destination, PathBuf::from("/cache")).unwrap()
    }
}
