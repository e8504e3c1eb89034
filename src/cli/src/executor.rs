//! Workflow orchestration.
//!
//! An [`Executor`] drives one run through a fixed sequence:
//!
//! ```text
//!   validate ──► complete ──► prepare_storage_and_logs ──► run ──► cleanup
//!
//!   mirrorToDisk : start registry ─► collect ─► batch ─► stop registry ─► build archive
//!   diskToMirror : unarchive ─► start registry ─► collect ─► batch ─► cluster resources
//!   prepare      : start registry ─► collect ─► check each image ─► cached-images.txt
//! ```
//!
//! The registry is always stopped before cleanup, and cleanup runs exactly
//! once whether the run succeeds or fails.

use std::path::PathBuf;
use std::sync::Arc;

use a3s_mirror_core::error::{MirrorError, Result};
use a3s_mirror_core::layout::{self, CACHED_IMAGES_REPORT, REGISTRY_LOG_FILE};
use a3s_mirror_core::{
    GlobalOptions, ImageSetConfiguration, MultiArch, RunOptions, WorkItem, WorkingDirLayout,
    WorkflowMode,
};
use a3s_mirror_runtime::registry::exit_on_fault;
use a3s_mirror_runtime::{
    collect_all, AdditionalCollector, Archiver, Batch, BatchWorker, ClusterResources,
    ClusterResourcesGenerator, CopyOptions, Extractor, FaultHandler, ImageCollector,
    LocalRegistry, Mirror, OciMirror, OperatorCollector, Packager, RegistryAuth, RegistryConfig,
    RegistryHandle, RegistryLog, RegistryState, ReleaseCollector, UnArchiver,
};
use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Everything a run delegates to.
pub struct Collaborators {
    pub release: Box<dyn ImageCollector>,
    pub operator: Box<dyn ImageCollector>,
    pub additional: Box<dyn ImageCollector>,
    pub mirror: Arc<dyn Mirror>,
    pub batch: Box<dyn BatchWorker>,
    pub cluster_resources: Box<dyn ClusterResourcesGenerator>,
    /// Present only for mirror to disk
    pub archiver: Option<Box<dyn Archiver>>,
    /// Present only for disk to mirror
    pub unarchiver: Option<Box<dyn UnArchiver>>,
}

/// Builds the collaborators of a run once its options are resolved.
pub trait CollaboratorFactory {
    fn build(
        &self,
        config: Arc<ImageSetConfiguration>,
        opts: Arc<RunOptions>,
    ) -> Result<Collaborators>;
}

/// Production wiring: OCI transfer, built-in collectors, tar archives.
pub struct DefaultFactory;

impl CollaboratorFactory for DefaultFactory {
    fn build(
        &self,
        config: Arc<ImageSetConfiguration>,
        opts: Arc<RunOptions>,
    ) -> Result<Collaborators> {
        let mirror: Arc<dyn Mirror> = Arc::new(OciMirror::new(RegistryAuth::from_env())?);

        let archiver: Option<Box<dyn Archiver>> = if opts.is_mirror_to_disk() {
            let config_path = opts.global.config_path.clone().ok_or_else(|| {
                MirrorError::Validation("use the --config flag it is mandatory".to_string())
            })?;
            Some(Box::new(Packager::new(
                opts.root_dir.clone(),
                opts.working_dir.clone(),
                opts.cache_dir.clone(),
                config_path,
                config.archive_size_bytes(),
            )))
        } else {
            None
        };

        let unarchiver: Option<Box<dyn UnArchiver>> = if opts.is_disk_to_mirror() {
            Some(Box::new(Extractor::new(
                opts.root_dir.clone(),
                opts.working_dir.clone(),
                opts.cache_dir.clone(),
            )))
        } else {
            None
        };

        Ok(Collaborators {
            release: Box::new(ReleaseCollector::new(config.clone(), opts.clone())),
            operator: Box::new(OperatorCollector::new(config.clone(), opts.clone())),
            additional: Box::new(AdditionalCollector::new(config, opts.clone())),
            batch: Box::new(Batch::new(mirror.clone(), &opts.global)),
            cluster_resources: Box::new(ClusterResources::new(opts)),
            mirror,
            archiver,
            unarchiver,
        })
    }
}

/// Outcome of a successful run.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub mode: WorkflowMode,
    pub images: usize,
    pub started_at: DateTime<Utc>,
    pub collected_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// First archive chunk (mirror to disk)
    pub archive: Option<PathBuf>,
    /// Mirror set files (disk to mirror)
    pub cluster_resources: Vec<PathBuf>,
    /// Destination list (prepare)
    pub cached_images_report: Option<PathBuf>,
}

impl RunReport {
    fn new(mode: WorkflowMode, started_at: DateTime<Utc>) -> Self {
        Self {
            mode,
            images: 0,
            started_at,
            collected_at: started_at,
            finished_at: started_at,
            archive: None,
            cluster_resources: Vec::new(),
            cached_images_report: None,
        }
    }

    fn log_timings(&self) {
        tracing::info!(time = %self.started_at, "start time");
        tracing::info!(time = %self.collected_at, "collection time");
        tracing::info!(time = %self.finished_at, "mirror time");
    }
}

/// Orchestrates one mirror or prepare run.
pub struct Executor {
    opts: GlobalOptions,
    run_opts: RunOptions,
    collaborators: Collaborators,
    registry: Option<LocalRegistry>,
    handle: Option<RegistryHandle>,
    state: Option<watch::Receiver<RegistryState>>,
    cancel: CancellationToken,
    fault_handler: FaultHandler,
    cleaned: bool,
}

impl Executor {
    /// Check the flags of the `mirror` command. Never touches the filesystem.
    pub fn validate(opts: &GlobalOptions, destination: &str) -> Result<()> {
        opts.validate_mirror(destination)
    }

    /// Check the flags of the `prepare` command.
    pub fn validate_prepare(opts: &GlobalOptions) -> Result<()> {
        opts.validate_prepare()
    }

    /// Resolve the mode from `destination` and set up a `mirror` run.
    pub fn complete(opts: GlobalOptions, destination: &str) -> Result<Self> {
        Self::complete_with(opts, destination, &DefaultFactory)
    }

    pub fn complete_with(
        opts: GlobalOptions,
        destination: &str,
        factory: &dyn CollaboratorFactory,
    ) -> Result<Self> {
        let mode = WorkflowMode::from_destination(destination)?;
        Self::setup(opts, mode, destination, factory)
    }

    /// Set up a `prepare` run.
    pub fn complete_prepare(opts: GlobalOptions) -> Result<Self> {
        Self::complete_prepare_with(opts, &DefaultFactory)
    }

    pub fn complete_prepare_with(
        opts: GlobalOptions,
        factory: &dyn CollaboratorFactory,
    ) -> Result<Self> {
        Self::setup(opts, WorkflowMode::Prepare, "", factory)
    }

    fn setup(
        opts: GlobalOptions,
        mode: WorkflowMode,
        destination: &str,
        factory: &dyn CollaboratorFactory,
    ) -> Result<Self> {
        layout::reset_logs_dir(&opts.logs_dir)?;
        let logs_dir = opts.logs_dir.clone();

        // no executor exists yet to clean up after a failed setup
        Self::assemble(opts, mode, destination, factory).map_err(|e| {
            if let Err(rm) = std::fs::remove_dir_all(&logs_dir) {
                tracing::warn!(dir = %logs_dir.display(), error = %rm, "Failed to remove logs directory");
            }
            e
        })
    }

    fn assemble(
        opts: GlobalOptions,
        mode: WorkflowMode,
        destination: &str,
        factory: &dyn CollaboratorFactory,
    ) -> Result<Self> {
        for flag in opts.ignored_flags() {
            tracing::warn!(flag, "Flag is accepted but has no effect");
        }

        let config_path = opts.config_path.clone().ok_or_else(|| {
            MirrorError::Validation("use the --config flag it is mandatory".to_string())
        })?;
        tracing::debug!(path = %config_path.display(), "imagesetconfig file");
        let config = Arc::new(ImageSetConfiguration::read(&config_path)?);
        tracing::trace!(config = ?config, "imagesetconfig");

        let cache_dir = layout::setup_cache_dir(opts.cache_root.as_deref())?;
        let run_opts = RunOptions::resolve(&opts, mode, destination, cache_dir)?;
        tracing::info!(mode = %mode, "mode");
        tracing::debug!(
            root = %run_opts.root_dir.display(),
            working_dir = %run_opts.working_dir.display(),
            cache = %run_opts.cache_dir.display(),
            "Resolved run directories"
        );

        WorkingDirLayout::create(&run_opts.working_dir)?;
        let collaborators = factory.build(config, Arc::new(run_opts.clone()))?;

        Ok(Self {
            opts,
            run_opts,
            collaborators,
            registry: None,
            handle: None,
            state: None,
            cancel: CancellationToken::new(),
            fault_handler: exit_on_fault(),
            cleaned: false,
        })
    }

    /// Thread `cancel` through collection and transfer.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Replace the handler invoked when the registry dies unexpectedly.
    pub fn with_fault_handler(mut self, handler: FaultHandler) -> Self {
        self.fault_handler = handler;
        self
    }

    pub fn run_options(&self) -> &RunOptions {
        &self.run_opts
    }

    /// Registry state, available once storage is prepared.
    pub fn registry_state(&self) -> Option<watch::Receiver<RegistryState>> {
        self.state.clone()
    }

    /// Render the registry configuration and construct (not start) the
    /// registry with its own log file.
    pub fn prepare_storage_and_logs(&mut self) -> Result<()> {
        let cache_dir = &self.run_opts.cache_dir;
        if !cache_dir.is_dir() {
            return Err(MirrorError::Setup(format!(
                "error using the local storage folder for caching: {}",
                cache_dir.display()
            )));
        }

        let config = RegistryConfig::generate(cache_dir, self.opts.port, self.opts.log_level)?;

        let log_path = self.opts.logs_dir.join(REGISTRY_LOG_FILE);
        let log = RegistryLog::create(&log_path, self.opts.log_level);
        let shown = std::fs::canonicalize(&log_path).unwrap_or_else(|_| log_path.clone());
        tracing::info!(path = %shown.display(), "local storage registry will log to");

        let registry = LocalRegistry::new(config, log)?;
        self.state = Some(registry.subscribe());
        self.registry = Some(registry);
        Ok(())
    }

    /// Run the workflow of the resolved mode, then stop the registry and
    /// clean up regardless of the outcome.
    pub async fn run(&mut self) -> Result<RunReport> {
        // make sure we always get multi-arch images
        self.run_opts.multi_arch = MultiArch::All;

        let result = match self.run_opts.mode {
            WorkflowMode::MirrorToDisk => self.run_mirror_to_disk().await,
            WorkflowMode::DiskToMirror => self.run_disk_to_mirror().await,
            WorkflowMode::Prepare => self.run_prepare().await,
        };
        let stopped = self.stop_registry().await;
        self.cleanup();

        match (result, stopped) {
            (Ok(report), Ok(())) => Ok(report),
            (Ok(_), Err(e)) => Err(e),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(stop)) => {
                tracing::warn!(error = %stop, "Failed to stop local storage registry");
                Err(e)
            }
        }
    }

    async fn run_mirror_to_disk(&mut self) -> Result<RunReport> {
        let mut report = RunReport::new(WorkflowMode::MirrorToDisk, Utc::now());

        self.start_registry().await?;
        let items = self.collect_images().await?;
        report.images = items.len();
        report.collected_at = Utc::now();

        self.collaborators
            .batch
            .worker(&self.cancel, &items, &self.run_opts)
            .await?;

        // the cache must be quiescent before it is packed
        self.stop_registry().await?;

        let archiver = self.collaborators.archiver.as_mut().ok_or_else(|| {
            MirrorError::Other("no archiver configured for mirrorToDisk".to_string())
        })?;
        let built = archiver.build_archive(&self.cancel, &items);
        let closed = archiver.close();
        let archive = match (built, closed) {
            (Ok(archive), Ok(())) => archive,
            (Ok(_), Err(e)) => return Err(e),
            (Err(e), closed) => {
                if let Err(close) = closed {
                    tracing::warn!(error = %close, "Failed to close archive");
                }
                return Err(e);
            }
        };
        tracing::info!(file = %archive.display(), "archive file generated");

        report.archive = Some(archive);
        report.finished_at = Utc::now();
        report.log_timings();
        Ok(report)
    }

    async fn run_disk_to_mirror(&mut self) -> Result<RunReport> {
        let mut report = RunReport::new(WorkflowMode::DiskToMirror, Utc::now());

        let unarchiver = self.collaborators.unarchiver.as_mut().ok_or_else(|| {
            MirrorError::Other("no unarchiver configured for diskToMirror".to_string())
        })?;
        let unarchived = unarchiver.unarchive();
        let closed = unarchiver.close();
        if let Err(e) = unarchived {
            if let Err(close) = closed {
                tracing::warn!(error = %close, "Failed to close archive");
            }
            return Err(e);
        }
        closed?;

        self.start_registry().await?;
        let items = self.collect_images().await?;
        report.images = items.len();
        report.collected_at = Utc::now();

        self.collaborators
            .batch
            .worker(&self.cancel, &items, &self.run_opts)
            .await?;

        report.cluster_resources = self
            .collaborators
            .cluster_resources
            .idms_itms_generator(&items)?;

        report.finished_at = Utc::now();
        report.log_timings();
        Ok(report)
    }

    async fn run_prepare(&mut self) -> Result<RunReport> {
        let mut report = RunReport::new(WorkflowMode::Prepare, Utc::now());
        let report_path = self.opts.logs_dir.join(CACHED_IMAGES_REPORT);

        self.start_registry().await?;
        let items = self.collect_images().await?;
        report.images = items.len();
        report.collected_at = Utc::now();

        let copy_opts = CopyOptions::from_run(&self.run_opts);
        let mut listing = String::new();
        let mut missing: Vec<String> = Vec::new();
        for item in &items {
            if self.cancel.is_cancelled() {
                return Err(MirrorError::Cancelled);
            }
            listing.push_str(&item.destination);
            listing.push('\n');

            let present = match self.collaborators.mirror.check(&item.destination, &copy_opts).await {
                Ok(present) => present,
                Err(e) => {
                    tracing::warn!(image = %item.destination, error = %e, "unable to check existence in local cache");
                    false
                }
            };
            if !present && !missing.contains(&item.destination) {
                missing.push(item.destination.clone());
            }
        }

        std::fs::write(&report_path, listing).map_err(|e| {
            MirrorError::Setup(format!("Failed to write {}: {}", report_path.display(), e))
        })?;
        report.cached_images_report = Some(report_path.clone());

        if !missing.is_empty() {
            for image in &missing {
                tracing::error!(image = %image, "missing image");
            }
            tracing::error!("please re-run the mirror to disk process");
            return Err(MirrorError::CacheIncomplete { missing });
        }

        tracing::info!(
            images = items.len(),
            "all images required for mirroring are available in local cache; you may proceed with mirroring from disk to the disconnected registry"
        );
        tracing::info!(path = %report_path.display(), "full list");
        report.finished_at = Utc::now();
        Ok(report)
    }

    async fn collect_images(&self) -> Result<Vec<WorkItem>> {
        let c = &self.collaborators;
        collect_all(&*c.release, &*c.operator, &*c.additional, &self.cancel).await
    }

    async fn start_registry(&mut self) -> Result<()> {
        let registry = self.registry.take().ok_or_else(|| {
            MirrorError::Registry("local storage registry is not prepared".to_string())
        })?;
        tracing::info!(port = self.opts.port, "starting local storage on localhost");
        let handle = registry.start(self.fault_handler.clone()).await?;
        self.handle = Some(handle);
        Ok(())
    }

    /// Normal shutdown of the registry. A no-op when it never started or
    /// was already stopped.
    async fn stop_registry(&mut self) -> Result<()> {
        match self.handle.as_mut() {
            Some(handle) => handle.stop().await,
            None => Ok(()),
        }
    }

    /// Release the registry and its log file, then remove the logs
    /// directory. A prepare report keeps the directory alive.
    ///
    /// Returns `false` when cleanup had already run.
    pub fn cleanup(&mut self) -> bool {
        if self.cleaned {
            return false;
        }
        self.cleaned = true;

        // dropping the registry closes its log file
        self.handle = None;
        self.registry = None;

        let logs_dir = &self.opts.logs_dir;
        let log_file = logs_dir.join(REGISTRY_LOG_FILE);
        if let Err(e) = std::fs::remove_file(&log_file) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %log_file.display(), error = %e, "error removing registry log file");
            }
        }

        if logs_dir.join(CACHED_IMAGES_REPORT).exists() {
            tracing::debug!(dir = %logs_dir.display(), "Keeping logs directory for the cached images report");
        } else if let Err(e) = std::fs::remove_dir_all(logs_dir) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(dir = %logs_dir.display(), error = %e, "error removing logs directory");
            }
        }
        true
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        self.cleanup();
    }
}
