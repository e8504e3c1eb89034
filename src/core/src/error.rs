use thiserror::Error;

/// A3S Mirror error types
#[derive(Error, Debug)]
pub enum MirrorError {
    /// Invalid flag or argument combination
    #[error("Validation error: {0}")]
    Validation(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Working directory, cache or registry setup failed
    #[error("Setup error: {0}")]
    Setup(String),

    /// A collector failed; `collected` items had been gathered before it
    #[error("Collection error: {phase} collector failed after {collected} images: {message}")]
    Collection {
        phase: String,
        collected: usize,
        message: String,
    },

    /// Local cache registry error
    #[error("Registry error: {0}")]
    Registry(String),

    /// One or more images could not be transferred
    #[error("Transfer error: {failed}/{total} images failed")]
    Transfer {
        failed: usize,
        total: usize,
        details: Vec<String>,
    },

    /// Single image copy or check failure
    #[error("Image error: {image} - {message}")]
    Image { image: String, message: String },

    /// Archive packaging or extraction error
    #[error("Archive error: {0}")]
    Archive(String),

    /// Images required for disk to mirror are absent from the cache
    #[error("Cache incomplete: {} images missing from the local cache: {}", .missing.len(), .missing.join(", "))]
    CacheIncomplete { missing: Vec<String> },

    /// Cluster resource generation error
    #[error("Cluster resources error: {0}")]
    ClusterResources(String),

    /// Timeout error
    #[error("Timeout: {0}")]
    Timeout(String),

    /// The run was cancelled
    #[error("Operation cancelled")]
    Cancelled,

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl From<serde_json::Error> for MirrorError {
    fn from(err: serde_json::Error) -> Self {
        MirrorError::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for MirrorError {
    fn from(err: serde_yaml::Error) -> Self {
        MirrorError::Serialization(err.to_string())
    }
}

/// Result type alias for A3S Mirror operations
pub type Result<T> = std::result::Result<T, MirrorError>;
