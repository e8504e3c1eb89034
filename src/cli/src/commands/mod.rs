//! CLI command definitions and dispatch.

mod mirror;
mod prepare;
mod version;

use std::path::PathBuf;
use std::time::Duration;

use a3s_mirror_core::layout::CACHE_ENV_VAR;
use a3s_mirror_core::options::{DEFAULT_PORT, DEFAULT_WORKING_DIR};
use a3s_mirror_core::{GlobalOptions, LogLevel};
use clap::{ArgAction, Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;

/// A3S Mirror - mirror container images to and from disconnected registries.
#[derive(Parser)]
#[command(name = "a3s-mirror", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

/// Available commands.
#[derive(Subcommand)]
pub enum Command {
    /// Mirror images to disk (file://) or from disk to a registry (docker://)
    Mirror(mirror::MirrorArgs),
    /// Verify that every image needed for mirroring is in the local cache
    Prepare(prepare::PrepareArgs),
    /// Show version information
    Version(version::VersionArgs),
}

impl Cli {
    /// Log level requested on the command line.
    pub fn log_level(&self) -> LogLevel {
        match &self.command {
            Command::Mirror(args) => args.shared.log_level,
            Command::Prepare(args) => args.shared.log_level,
            Command::Version(_) => LogLevel::Info,
        }
    }
}

/// Flags shared by `mirror` and `prepare`.
#[derive(Args, Debug, Clone)]
pub struct SharedArgs {
    /// Path to imageset configuration file
    #[arg(short = 'c', long)]
    pub config: Option<PathBuf>,

    /// Assets directory
    #[arg(long, default_value = DEFAULT_WORKING_DIR)]
    pub dir: String,

    /// Local storage directory for the disk to mirror workflow (file://<path>)
    #[arg(long)]
    pub from: Option<String>,

    /// HTTP port used by the local storage registry
    #[arg(short = 'p', long, default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Log level one of (info, debug, trace, error)
    #[arg(long = "loglevel", default_value = "info")]
    pub log_level: LogLevel,

    /// Suppress the run summary
    #[arg(short = 'q', long)]
    pub quiet: bool,

    /// Force the run (accepted; currently has no effect)
    #[arg(short = 'f', long)]
    pub force: bool,

    /// Enable the secure signature policy (accepted; signatures are not verified)
    #[arg(long)]
    pub secure_policy: bool,

    /// Require HTTPS and verify certificates when talking to source registries
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    pub src_tls_verify: bool,

    /// Require HTTPS and verify certificates when talking to destination registries
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    pub dest_tls_verify: bool,

    /// Number of times to retry a failed image copy
    #[arg(long, default_value_t = 2)]
    pub retry_times: u32,

    /// Delay between retries, in seconds
    #[arg(long, default_value_t = 1)]
    pub retry_delay: u64,

    /// Number of images copied concurrently
    #[arg(long, default_value_t = 4)]
    pub parallel_images: usize,

    /// Root of the local image cache
    #[arg(long = "cache-dir", env = CACHE_ENV_VAR, hide = true)]
    pub cache_dir: Option<PathBuf>,
}

impl SharedArgs {
    pub fn to_global(&self) -> GlobalOptions {
        GlobalOptions {
            config_path: self.config.clone(),
            working_dir: self.dir.clone(),
            from: self.from.clone().filter(|f| !f.is_empty()),
            port: self.port,
            log_level: self.log_level,
            quiet: self.quiet,
            force: self.force,
            secure_policy: self.secure_policy,
            src_tls_verify: self.src_tls_verify,
            dest_tls_verify: self.dest_tls_verify,
            retry_times: self.retry_times,
            retry_delay: Duration::from_secs(self.retry_delay),
            parallel_images: self.parallel_images.max(1),
            cache_root: self.cache_dir.clone(),
            ..Default::default()
        }
    }
}

/// Token cancelled on Ctrl-C.
pub(crate) fn interrupt_token() -> CancellationToken {
    let token = CancellationToken::new();
    let cancel = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, stopping");
            cancel.cancel();
        }
    });
    token
}

/// Dispatch a parsed CLI to the appropriate command handler.
pub async fn dispatch(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    match cli.command {
        Command::Mirror(args) => mirror::execute(args).await,
        Command::Prepare(args) => prepare::execute(args).await,
        Command::Version(args) => version::execute(args).await,
    }
}
