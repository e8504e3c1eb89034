//! On-disk layout: working directory, logs directory and durable cache.
//!
//! ```text
//! <root>/working-dir/
//! ├── signatures/
//! ├── release-images/
//! ├── hold-release/
//! └── hold-operator/
//!
//! logs/                      (recreated on every run)
//! ├── registry.log
//! └── cached-images.txt      (prepare only)
//!
//! $HOME/.a3s/mirror/.cache/  (outlives every run)
//! ```

use std::path::{Path, PathBuf};

use crate::error::{MirrorError, Result};

pub const SIGNATURES_DIR: &str = "signatures";
pub const RELEASE_IMAGES_DIR: &str = "release-images";
pub const RELEASE_HOLD_DIR: &str = "hold-release";
pub const OPERATOR_HOLD_DIR: &str = "hold-operator";
pub const CLUSTER_RESOURCES_DIR: &str = "cluster-resources";

pub const LOGS_DIR: &str = "logs";
pub const REGISTRY_LOG_FILE: &str = "registry.log";
pub const CACHED_IMAGES_REPORT: &str = "cached-images.txt";

/// Environment variable overriding the cache root.
pub const CACHE_ENV_VAR: &str = "A3S_MIRROR_CACHE";

/// Cache location relative to the home directory (or the override root).
pub const CACHE_RELATIVE_PATH: &str = ".a3s/mirror/.cache";

/// Subdirectories of one run's working directory.
#[derive(Debug, Clone)]
pub struct WorkingDirLayout {
    root: PathBuf,
}

impl WorkingDirLayout {
    /// Create the working directory and its subdirectories.
    ///
    /// Idempotent: existing directories are left untouched.
    pub fn create(root: &Path) -> Result<Self> {
        let layout = Self {
            root: root.to_path_buf(),
        };

        for dir in [
            layout.root.clone(),
            layout.signatures_dir(),
            layout.release_images_dir(),
            layout.release_hold_dir(),
            layout.operator_hold_dir(),
        ] {
            tracing::trace!(dir = %dir.display(), "Creating working directory");
            std::fs::create_dir_all(&dir).map_err(|e| {
                MirrorError::Setup(format!(
                    "Failed to create directory {}: {}",
                    dir.display(),
                    e
                ))
            })?;
        }

        Ok(layout)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn signatures_dir(&self) -> PathBuf {
        self.root.join(SIGNATURES_DIR)
    }

    pub fn release_images_dir(&self) -> PathBuf {
        self.root.join(RELEASE_IMAGES_DIR)
    }

    pub fn release_hold_dir(&self) -> PathBuf {
        self.root.join(RELEASE_HOLD_DIR)
    }

    pub fn operator_hold_dir(&self) -> PathBuf {
        self.root.join(OPERATOR_HOLD_DIR)
    }
}

/// Compute the cache directory from an optional override root and the home
/// directory.
pub fn cache_dir_for(override_root: Option<&Path>, home: Option<PathBuf>) -> Result<PathBuf> {
    match override_root {
        Some(root) if !root.as_os_str().is_empty() => Ok(root.join(CACHE_RELATIVE_PATH)),
        _ => home
            .map(|h| h.join(CACHE_RELATIVE_PATH))
            .ok_or_else(|| MirrorError::Setup("unable to determine the home directory".to_string())),
    }
}

/// Resolve and create the durable cache directory.
pub fn setup_cache_dir(override_root: Option<&Path>) -> Result<PathBuf> {
    let dir = cache_dir_for(override_root, dirs::home_dir())?;
    std::fs::create_dir_all(&dir).map_err(|e| {
        MirrorError::Setup(format!(
            "unable to set up folder for local storage {}: {}",
            dir.display(),
            e
        ))
    })?;
    Ok(dir)
}

/// Remove and recreate the per-run logs directory.
pub fn reset_logs_dir(dir: &Path) -> Result<()> {
    if dir.exists() {
        std::fs::remove_dir_all(dir).map_err(|e| {
            MirrorError::Setup(format!("Failed to clean logs directory {}: {}", dir.display(), e))
        })?;
    }
    std::fs::create_dir_all(dir).map_err(|e| {
        MirrorError::Setup(format!("Failed to create logs directory {}: {}", dir.display(), e))
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_create_layout() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("working-dir");
        let layout = WorkingDirLayout::create(&root).unwrap();

        assert!(layout.signatures_dir().is_dir());
        assert!(layout.release_images_dir().is_dir());
        assert!(layout.release_hold_dir().is_dir());
        assert!(layout.operator_hold_dir().is_dir());
        assert_eq!(layout.root(), root.as_path());
    }

    #[test]
    fn test_create_layout_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("working-dir");
        WorkingDirLayout::create(&root).unwrap();
        std::fs::write(root.join(SIGNATURES_DIR).join("sig"), "x").unwrap();

        WorkingDirLayout::create(&root).unwrap();
        assert!(root.join(SIGNATURES_DIR).join("sig").exists());
    }

    #[test]
    fn test_create_layout_fails_on_file() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("blocker");
        std::fs::write(&root, "not a dir").unwrap();
        let err = WorkingDirLayout::create(&root).unwrap_err();
        assert!(matches!(err, MirrorError::Setup(_)));
    }

    #[test]
    fn test_cache_dir_for_override() {
        let dir = cache_dir_for(Some(Path::new("/srv/cache")), Some(PathBuf::from("/home/u")))
            .unwrap();
        assert_eq!(dir, PathBuf::from("/srv/cache/.a3s/mirror/.cache"));
    }

    #[test]
    fn test_cache_dir_for_home() {
        let dir = cache_dir_for(None, Some(PathBuf::from("/home/u"))).unwrap();
        assert_eq!(dir, PathBuf::from("/home/u/.a3s/mirror/.cache"));

        let empty = cache_dir_for(Some(Path::new("")), Some(PathBuf::from("/home/u"))).unwrap();
        assert_eq!(empty, dir);
    }

    #[test]
    fn test_cache_dir_for_without_home() {
        assert!(cache_dir_for(None, None).is_err());
    }

    #[test]
    fn test_setup_cache_dir_creates_directory() {
        let tmp = TempDir::new().unwrap();
        let dir = setup_cache_dir(Some(tmp.path())).unwrap();
        assert!(dir.is_dir());
        assert!(dir.ends_with(CACHE_RELATIVE_PATH));
    }

    #[test]
    fn test_reset_logs_dir_removes_previous_content() {
        let tmp = TempDir::new().unwrap();
        let logs = tmp.path().join(LOGS_DIR);
        std::fs::create_dir_all(&logs).unwrap();
        std::fs::write(logs.join("old.log"), "stale").unwrap();

        reset_logs_dir(&logs).unwrap();
        assert!(logs.is_dir());
        assert!(!logs.join("old.log").exists());
    }
}
