//! A3S Mirror Runtime - engines behind the mirror workflows.
//!
//! This module provides the embedded local cache registry, image collection,
//! registry-to-registry transfer, the disk transport archive and cluster
//! resource generation.

#![allow(clippy::result_large_err)]

pub mod archive;
pub mod batch;
pub mod clusterresources;
pub mod collect;
pub mod mirror;
pub mod reference;
pub mod registry;

// Re-export common types
pub use archive::{Archiver, Extractor, Packager, UnArchiver};
pub use batch::{Batch, BatchWorker};
pub use clusterresources::{ClusterResources, ClusterResourcesGenerator};
pub use collect::{collect_all, AdditionalCollector, ImageCollector, OperatorCollector, ReleaseCollector};
pub use mirror::{CopyOptions, Mirror, OciMirror, RegistryAuth};
pub use reference::ImageReference;
pub use registry::{
    FaultHandler, LocalRegistry, RegistryConfig, RegistryHandle, RegistryLog, RegistryState,
    ShutdownKind, ShutdownReason,
};

/// A3S Mirror Runtime version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
