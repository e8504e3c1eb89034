//! Workflow mode resolution and run options.
//!
//! `GlobalOptions` mirrors the command-line flags verbatim. `RunOptions` is
//! the resolved, read-only view every collaborator receives once the mode,
//! working directory and cache directory are known.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::LogLevel;
use crate::error::{MirrorError, Result};

/// Transport prefix of a registry destination.
pub const DOCKER_PROTOCOL: &str = "docker://";

/// Transport prefix of an on-disk location.
pub const FILE_PROTOCOL: &str = "file://";

/// Default listen port of the local cache registry.
pub const DEFAULT_PORT: u16 = 5000;

/// Default name of the working directory under the run root.
pub const DEFAULT_WORKING_DIR: &str = "working-dir";

/// Operating mode of a run, derived once from the arguments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkflowMode {
    MirrorToDisk,
    DiskToMirror,
    Prepare,
}

impl WorkflowMode {
    /// Resolve the mode of the `mirror` command from its destination prefix.
    ///
    /// `Prepare` is never returned here; it is only reachable through the
    /// dedicated command.
    pub fn from_destination(destination: &str) -> Result<Self> {
        if destination.starts_with(FILE_PROTOCOL) {
            Ok(WorkflowMode::MirrorToDisk)
        } else if destination.starts_with(DOCKER_PROTOCOL) {
            Ok(WorkflowMode::DiskToMirror)
        } else {
            Err(MirrorError::Validation(
                "unable to determine the mode (the destination must be either file:// or docker://)"
                    .to_string(),
            ))
        }
    }
}

impl std::fmt::Display for WorkflowMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkflowMode::MirrorToDisk => write!(f, "mirrorToDisk"),
            WorkflowMode::DiskToMirror => write!(f, "diskToMirror"),
            WorkflowMode::Prepare => write!(f, "prepare"),
        }
    }
}

/// Which platforms of a multi-arch image are transferred.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MultiArch {
    /// Only the manifest matching the host platform
    #[default]
    System,
    /// Every manifest of an image index
    All,
}

impl std::fmt::Display for MultiArch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MultiArch::System => write!(f, "system"),
            MultiArch::All => write!(f, "all"),
        }
    }
}

/// Options as given on the command line.
#[derive(Debug, Clone)]
pub struct GlobalOptions {
    /// Path to the image set configuration file
    pub config_path: Option<PathBuf>,
    /// Working directory name under the run root
    pub working_dir: String,
    /// Disk source for disk to mirror and prepare (`file://<path>`)
    pub from: Option<String>,
    /// Listen port of the local cache registry
    pub port: u16,
    pub log_level: LogLevel,
    pub quiet: bool,
    /// Accepted for compatibility; no behaviour depends on it yet
    pub force: bool,
    /// Accepted for compatibility; signatures are not verified
    pub secure_policy: bool,
    pub src_tls_verify: bool,
    pub dest_tls_verify: bool,
    pub retry_times: u32,
    pub retry_delay: Duration,
    pub parallel_images: usize,
    /// Root overriding the home directory for the durable cache
    pub cache_root: Option<PathBuf>,
    /// Directory holding per-run logs, recreated on every run
    pub logs_dir: PathBuf,
}

impl Default for GlobalOptions {
    fn default() -> Self {
        Self {
            config_path: None,
            working_dir: DEFAULT_WORKING_DIR.to_string(),
            from: None,
            port: DEFAULT_PORT,
            log_level: LogLevel::Info,
            quiet: false,
            force: false,
            secure_policy: false,
            src_tls_verify: true,
            dest_tls_verify: true,
            retry_times: 2,
            retry_delay: Duration::from_secs(1),
            parallel_images: 4,
            cache_root: None,
            logs_dir: PathBuf::from(crate::layout::LOGS_DIR),
        }
    }
}

impl GlobalOptions {
    fn from_value(&self) -> &str {
        self.from.as_deref().unwrap_or("")
    }

    /// Validate the `mirror` command arguments.
    ///
    /// Pure function of the destination and the `--from` / `--config` flags.
    pub fn validate_mirror(&self, destination: &str) -> Result<()> {
        let from = self.from_value();

        if self.config_path.is_none() {
            return Err(MirrorError::Validation(
                "use the --config flag it is mandatory".to_string(),
            ));
        }
        if destination.starts_with(DOCKER_PROTOCOL) && from.is_empty() {
            return Err(MirrorError::Validation(
                "when destination is docker://, diskToMirror workflow is assumed, and the --from argument become mandatory"
                    .to_string(),
            ));
        }
        if destination.starts_with(FILE_PROTOCOL) && !from.is_empty() {
            return Err(MirrorError::Validation(
                "when destination is file://, mirrorToDisk workflow is assumed, and the --from argument is not needed"
                    .to_string(),
            ));
        }
        if !from.is_empty() && !from.starts_with(FILE_PROTOCOL) {
            return Err(MirrorError::Validation(
                "when --from is used, it must have file:// prefix".to_string(),
            ));
        }
        if destination.starts_with(FILE_PROTOCOL) || destination.starts_with(DOCKER_PROTOCOL) {
            Ok(())
        } else {
            Err(MirrorError::Validation(
                "destination must have either file:// (mirror to disk) or docker:// (diskToMirror) protocol prefixes"
                    .to_string(),
            ))
        }
    }

    /// Validate the `prepare` command arguments.
    /// Flags that are set but have no effect on the run.
    pub fn ignored_flags(&self) -> Vec<&'static str> {
        let mut flags = Vec::new();
        if self.force {
            flags.push("--force");
        }
        if self.secure_policy {
            flags.push("--secure-policy");
        }
        flags
    }

    pub fn validate_prepare(&self) -> Result<()> {
        let from = self.from_value();

        if self.config_path.is_none() {
            return Err(MirrorError::Validation(
                "use the --config flag it is mandatory".to_string(),
            ));
        }
        if from.is_empty() {
            return Err(MirrorError::Validation(
                "with prepare command, the --from argument become mandatory (prefix : file://)"
                    .to_string(),
            ));
        }
        if !from.starts_with(FILE_PROTOCOL) {
            return Err(MirrorError::Validation(
                "when --from is used, it must have file:// prefix".to_string(),
            ));
        }
        Ok(())
    }
}

/// Resolved configuration shared read-only by every collaborator.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub mode: WorkflowMode,
    /// Destination locator (empty for prepare)
    pub destination: String,
    /// Root of the run: the mirror to disk destination or the `--from` path
    pub root_dir: PathBuf,
    /// Working directory of this run
    pub working_dir: PathBuf,
    /// Durable cache directory served by the local registry
    pub cache_dir: PathBuf,
    /// `localhost:<port>` of the local cache registry
    pub local_storage_fqdn: String,
    pub multi_arch: MultiArch,
    pub global: GlobalOptions,
}

impl RunOptions {
    /// Resolve run options for a mode.
    ///
    /// The root directory is derived from the destination for mirror to disk
    /// and from `--from` for disk to mirror and prepare.
    pub fn resolve(
        global: &GlobalOptions,
        mode: WorkflowMode,
        destination: &str,
        cache_dir: PathBuf,
    ) -> Result<Self> {
        let root = match mode {
            WorkflowMode::MirrorToDisk => destination.strip_prefix(FILE_PROTOCOL),
            WorkflowMode::DiskToMirror | WorkflowMode::Prepare => {
                global.from_value().strip_prefix(FILE_PROTOCOL)
            }
        }
        .ok_or_else(|| {
            MirrorError::Validation(format!("unable to resolve the {} root directory", mode))
        })?;

        let root_dir = PathBuf::from(root);
        let working_dir = root_dir.join(&global.working_dir);

        Ok(Self {
            mode,
            destination: destination.to_string(),
            root_dir,
            working_dir,
            cache_dir,
            local_storage_fqdn: format!("localhost:{}", global.port),
            multi_arch: MultiArch::default(),
            global: global.clone(),
        })
    }

    pub fn is_mirror_to_disk(&self) -> bool {
        self.mode == WorkflowMode::MirrorToDisk
    }

    pub fn is_disk_to_mirror(&self) -> bool {
        self.mode == WorkflowMode::DiskToMirror
    }
}
