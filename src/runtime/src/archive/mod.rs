//! Disk transport artifact.
//!
//! A mirror to disk run packs the local cache and the working directory
//! into one or more tar chunks next to the working directory:
//!
//! ```text
//! <root>/
//! ├── working-dir/
//! ├── mirror_000001.tar
//! │   ├── imageset-config.yaml
//! │   ├── working-dir/...
//! │   └── docker/registry/v2/...
//! └── mirror_000002.tar          (only when archiveSize is exceeded)
//! ```
//!
//! A disk to mirror run restores `docker/` into the cache directory and
//! `working-dir/` into its own working directory before anything is served.

mod extractor;
mod packager;

pub use extractor::Extractor;
pub use packager::Packager;

use std::path::PathBuf;

use a3s_mirror_core::error::Result;
use a3s_mirror_core::WorkItem;
use tokio_util::sync::CancellationToken;

pub const ARCHIVE_PREFIX: &str = "mirror_";
pub const ARCHIVE_EXTENSION: &str = ".tar";

/// Name of the image set configuration inside the archive.
pub const IMAGESET_CONFIG_ENTRY: &str = "imageset-config.yaml";
/// Prefix of working directory entries.
pub const WORKING_DIR_ENTRY: &str = "working-dir";
/// Prefix of cache entries; also the top directory of the cache layout.
pub const CACHE_ENTRY: &str = "docker";

/// File name of the chunk with the given 1-based index.
pub fn chunk_name(index: usize) -> String {
    format!("{}{:06}{}", ARCHIVE_PREFIX, index, ARCHIVE_EXTENSION)
}

/// Whether `name` looks like an archive chunk file name.
pub fn is_chunk_name(name: &str) -> bool {
    name.starts_with(ARCHIVE_PREFIX) && name.ends_with(ARCHIVE_EXTENSION)
}

/// Builds the transport artifact after a mirror to disk transfer.
pub trait Archiver: Send {
    /// Pack the cache and metadata; returns the path of the first chunk.
    fn build_archive(&mut self, cancel: &CancellationToken, items: &[WorkItem]) -> Result<PathBuf>;

    /// Finish any chunk still open. Safe to call more than once.
    fn close(&mut self) -> Result<()>;
}

/// Restores the transport artifact before a disk to mirror run.
pub trait UnArchiver: Send {
    fn unarchive(&mut self) -> Result<()>;

    /// Release the open chunk. Safe to call more than once.
    fn close(&mut self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_name() {
        assert_eq!(chunk_name(1), "mirror_000001.tar");
        assert_eq!(chunk_name(42), "mirror_000042.tar");
    }
}
