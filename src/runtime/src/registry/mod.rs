//! Embedded local cache registry.
//!
//! A filesystem-backed distribution registry used as the pull cache for
//! mirror to disk and as the push source for disk to mirror.
//!
//! ```text
//!  LocalRegistry::new ──► start() ──► RegistryHandle
//!    Constructed       Starting        Serving ──stop()──► ShuttingDown(Normal) ──► Stopped
//!                         │               │
//!                         │               └─ server error ─► ShuttingDown(Abnormal) ─► fault handler
//!                         └─ bind error ─► Err(Registry)
//! ```
//!
//! The serve task reports exactly one [`ShutdownReason`] to a watcher task.
//! A requested shutdown is the normal end of life; anything else is a fault
//! and is handed to the [`FaultHandler`], which by default terminates the
//! process.

pub mod config;
pub mod health;
pub mod log;
pub mod server;
pub mod storage;

pub use config::{render_config, RegistryConfig};
pub use log::RegistryLog;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use a3s_mirror_core::error::{MirrorError, Result};
use tokio::net::TcpListener;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::instrument::WithSubscriber;

use health::StorageHealth;
use server::ServerState;
use storage::Storage;

/// Bound on the wait for the listener to come up.
pub const READINESS_TIMEOUT: Duration = Duration::from_secs(10);

/// Exit status used when the registry dies unexpectedly.
pub const FAULT_EXIT_CODE: i32 = 2;

/// How the registry went down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownKind {
    Normal,
    Abnormal,
}

/// Lifecycle state of the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryState {
    Constructed,
    Starting,
    Serving,
    ShuttingDown(ShutdownKind),
    Stopped,
}

/// Terminal signal of the serve task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    /// Shutdown asked for by the owner of the handle
    Requested,
    /// The server stopped on its own
    Fault(String),
}

/// Callback invoked when the registry faults.
pub type FaultHandler = Arc<dyn Fn(String) + Send + Sync>;

/// Fault handler that logs and terminates the process.
///
/// A dead cache registry invalidates every in-flight transfer, so there is
/// nothing to recover.
pub fn exit_on_fault() -> FaultHandler {
    Arc::new(|details| {
        tracing::error!(details = %details, "Local storage registry stopped unexpectedly");
        eprintln!("Error: local storage registry stopped unexpectedly: {}", details);
        std::process::exit(FAULT_EXIT_CODE);
    })
}

/// Wait for the serve task to end and publish how it went down.
///
/// A fault moves the state to `ShuttingDown(Abnormal)` and runs `on_fault`
/// before `Stopped` is published. A panicked serve task is a fault.
fn spawn_watcher(
    serve_task: JoinHandle<Option<ShutdownReason>>,
    state: watch::Sender<RegistryState>,
    on_fault: FaultHandler,
) -> JoinHandle<Option<ShutdownReason>> {
    tokio::spawn(async move {
        let reason = match serve_task.await {
            Ok(reason) => reason,
            Err(e) => Some(ShutdownReason::Fault(format!("registry task failed: {}", e))),
        };
        match &reason {
            Some(ShutdownReason::Requested) => {
                tracing::debug!("Local storage registry stopped");
            }
            Some(ShutdownReason::Fault(details)) => {
                state.send_replace(RegistryState::ShuttingDown(ShutdownKind::Abnormal));
                on_fault(details.clone());
            }
            None => {}
        }
        state.send_replace(RegistryState::Stopped);
        reason
    })
}

/// A constructed, not yet started, registry.
pub struct LocalRegistry {
    config: RegistryConfig,
    log: RegistryLog,
    state_tx: watch::Sender<RegistryState>,
}

impl LocalRegistry {
    /// Construct a registry bound to `config`, logging through `log`.
    ///
    /// Fails when the storage root does not exist.
    pub fn new(config: RegistryConfig, log: RegistryLog) -> Result<Self> {
        let root = config.root_directory();
        if !root.is_dir() {
            return Err(MirrorError::Setup(format!(
                "local storage directory {} does not exist",
                root.display()
            )));
        }

        let (state_tx, _) = watch::channel(RegistryState::Constructed);
        Ok(Self {
            config,
            log,
            state_tx,
        })
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    pub fn log(&self) -> &RegistryLog {
        &self.log
    }

    pub fn state(&self) -> RegistryState {
        *self.state_tx.borrow()
    }

    /// Observe state transitions.
    pub fn subscribe(&self) -> watch::Receiver<RegistryState> {
        self.state_tx.subscribe()
    }

    /// Start serving and wait until the listener is bound.
    ///
    /// Consumes the registry: a stopped instance cannot be restarted.
    pub async fn start(self, on_fault: FaultHandler) -> Result<RegistryHandle> {
        let addr = self.config.listen_addr()?;
        let root = self.config.root_directory().to_path_buf();
        let health_cfg = self.config.health.storagedriver.clone();
        let health_interval = self.config.health_interval()?;

        let health = Arc::new(StorageHealth::new(root.clone(), health_cfg.threshold));
        let state = ServerState::new(
            Arc::new(Storage::new(&root)),
            Arc::clone(&health),
            self.log.clone(),
        );
        let router = server::router(state, &self.config)?;

        self.state_tx.send_replace(RegistryState::Starting);

        let (ready_tx, ready_rx) = oneshot::channel::<Result<SocketAddr>>();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let dispatch = self.log.dispatch().clone();
        let serve_state = self.state_tx.clone();

        let serve_task: JoinHandle<Option<ShutdownReason>> = tokio::spawn(
            async move {
                let listener = match TcpListener::bind(addr).await {
                    Ok(listener) => listener,
                    Err(e) => {
                        tracing::error!(addr = %addr, error = %e, "Failed to bind");
                        let _ = ready_tx.send(Err(MirrorError::Registry(format!(
                            "failed to bind local storage registry on {}: {}",
                            addr, e
                        ))));
                        return None;
                    }
                };
                let local_addr = match listener.local_addr() {
                    Ok(a) => a,
                    Err(e) => {
                        let _ = ready_tx.send(Err(MirrorError::Registry(format!(
                            "failed to read local storage registry address: {}",
                            e
                        ))));
                        return None;
                    }
                };

                let health_cancel = CancellationToken::new();
                if health_cfg.enabled {
                    tokio::spawn(
                        Arc::clone(&health)
                            .run(health_interval, health_cancel.clone())
                            .with_current_subscriber(),
                    );
                }

                tracing::info!(addr = %local_addr, root = %root.display(), "Listening");
                serve_state.send_replace(RegistryState::Serving);
                let _ = ready_tx.send(Ok(local_addr));

                let signal_state = serve_state.clone();
                let result = axum::serve(listener, router)
                    .with_graceful_shutdown(async move {
                        // a dropped handle is a shutdown request too
                        let _ = shutdown_rx.await;
                        signal_state.send_replace(RegistryState::ShuttingDown(ShutdownKind::Normal));
                        tracing::info!("Shutdown requested");
                    })
                    .await;
                health_cancel.cancel();

                match result {
                    Ok(()) => Some(ShutdownReason::Requested),
                    Err(e) => Some(ShutdownReason::Fault(format!("server error: {}", e))),
                }
            }
            .with_subscriber(dispatch),
        );

        let watcher = spawn_watcher(serve_task, self.state_tx.clone(), on_fault);

        let mut handle = RegistryHandle {
            addr,
            shutdown: Some(shutdown_tx),
            state: self.state_tx.subscribe(),
            watcher: Some(watcher),
        };

        match tokio::time::timeout(READINESS_TIMEOUT, ready_rx).await {
            Ok(Ok(Ok(local_addr))) => {
                tracing::info!(addr = %local_addr, "Local storage registry ready");
                handle.addr = local_addr;
                Ok(handle)
            }
            Ok(Ok(Err(e))) => {
                handle.shutdown.take();
                Err(e)
            }
            Ok(Err(_)) => Err(MirrorError::Registry(
                "local storage registry exited before becoming ready".to_string(),
            )),
            Err(_) => {
                handle.request_shutdown();
                Err(MirrorError::Timeout(format!(
                    "local storage registry not ready after {:?}",
                    READINESS_TIMEOUT
                )))
            }
        }
    }
}

impl std::fmt::Debug for LocalRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalRegistry")
            .field("addr", &self.config.http.addr)
            .field("root", &self.config.root_directory())
            .field("state", &self.state())
            .finish()
    }
}

/// Owner of a running registry.
///
/// Dropping the handle requests a normal shutdown.
#[derive(Debug)]
pub struct RegistryHandle {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    state: watch::Receiver<RegistryState>,
    watcher: Option<JoinHandle<Option<ShutdownReason>>>,
}

impl RegistryHandle {
    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn state(&self) -> RegistryState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<RegistryState> {
        self.state.clone()
    }

    /// Send the normal shutdown signal without waiting.
    pub fn request_shutdown(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }

    /// Request a normal shutdown and wait until the registry has stopped.
    ///
    /// Idempotent. Returns an error when the registry had faulted.
    pub async fn stop(&mut self) -> Result<()> {
        self.request_shutdown();
        let Some(watcher) = self.watcher.take() else {
            return Ok(());
        };
        match watcher.await {
            Ok(Some(ShutdownReason::Fault(details))) => Err(MirrorError::Registry(details)),
            Ok(_) => Ok(()),
            Err(e) => Err(MirrorError::Registry(format!(
                "local storage registry watcher failed: {}",
                e
            ))),
        }
    }
}

impl Drop for RegistryHandle {
    fn drop(&mut self) {
        self.request_shutdown();
    }
}
