//! Dedicated log destination of the local cache registry.
//!
//! The registry never writes through the process-wide subscriber. It owns a
//! [`tracing::Dispatch`] bound to its own log file; the file is closed when
//! the last clone of the [`RegistryLog`] is dropped.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use a3s_mirror_core::LogLevel;
use tracing::Dispatch;
use tracing_subscriber::fmt::writer::BoxMakeWriter;

/// File-backed logger owned by one registry instance.
#[derive(Clone)]
pub struct RegistryLog {
    dispatch: Dispatch,
    path: Option<PathBuf>,
}

impl RegistryLog {
    /// Create a logger writing to `path`.
    ///
    /// Falls back to stderr when the file cannot be created.
    pub fn create(path: &Path, level: LogLevel) -> Self {
        match std::fs::File::create(path) {
            Ok(file) => Self::build(BoxMakeWriter::new(Mutex::new(file)), level, Some(path)),
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "Failed to create log file for local storage registry, using default stderr"
                );
                Self::stderr(level)
            }
        }
    }

    /// Logger writing to stderr.
    pub fn stderr(level: LogLevel) -> Self {
        Self::build(BoxMakeWriter::new(std::io::stderr), level, None)
    }

    fn build(writer: BoxMakeWriter, level: LogLevel, path: Option<&Path>) -> Self {
        let subscriber = tracing_subscriber::fmt()
            .with_writer(writer)
            .with_ansi(false)
            .with_target(false)
            .with_max_level(tracing::Level::from(level))
            .finish();

        Self {
            dispatch: Dispatch::new(subscriber),
            path: path.map(Path::to_path_buf),
        }
    }

    /// The dispatcher to attach to registry tasks.
    pub fn dispatch(&self) -> &Dispatch {
        &self.dispatch
    }

    /// Log file path, `None` when logging to stderr.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Run `f` with this logger as the default subscriber.
    pub fn in_scope<T>(&self, f: impl FnOnce() -> T) -> T {
        tracing::dispatcher::with_default(&self.dispatch, f)
    }
}

impl std::fmt::Debug for RegistryLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryLog").field("path", &self.path).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_writes_to_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("registry.log");
        let log = RegistryLog::create(&path, LogLevel::Info);

        log.in_scope(|| tracing::info!(service = "registry", "listening"));
        drop(log);

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("listening"));
        assert!(content.contains("service=\"registry\""));
    }

    #[test]
    fn test_respects_level() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("registry.log");
        let log = RegistryLog::create(&path, LogLevel::Error);

        log.in_scope(|| {
            tracing::info!("hidden");
            tracing::error!("shown");
        });
        drop(log);

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(!content.contains("hidden"));
        assert!(content.contains("shown"));
    }

    #[test]
    fn test_falls_back_to_stderr() {
        let log = RegistryLog::create(Path::new("/nonexistent/dir/registry.log"), LogLevel::Info);
        assert!(log.path().is_none());
    }
}
