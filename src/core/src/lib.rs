//! A3S Mirror Core - Foundational Types and Abstractions
//!
//! This module provides the types shared by the mirror runtime and CLI:
//! the error taxonomy, the image set configuration, the resolved run
//! options and the unit of work that flows through collection and transfer.

pub mod config;
pub mod error;
pub mod image;
pub mod layout;
pub mod options;

// Re-export commonly used types
pub use config::{ImageSetConfiguration, LogLevel};
pub use error::{MirrorError, Result};
pub use image::{ImageType, WorkItem};
pub use layout::WorkingDirLayout;
pub use options::{GlobalOptions, MultiArch, RunOptions, WorkflowMode};

/// A3S Mirror version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
