use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{MirrorError, Result};

/// Expected `kind` of an image set configuration document.
pub const IMAGE_SET_CONFIGURATION_KIND: &str = "ImageSetConfiguration";

/// Declarative description of the content to mirror.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageSetConfiguration {
    pub kind: String,

    #[serde(default)]
    pub api_version: String,

    /// Maximum size of a single archive chunk in GiB (unbounded when absent)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archive_size: Option<u64>,

    #[serde(default)]
    pub mirror: Mirror,
}

/// Content sets to mirror.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Mirror {
    #[serde(default)]
    pub platform: Platform,

    #[serde(default)]
    pub operators: Vec<Operator>,

    #[serde(default)]
    pub additional_images: Vec<Image>,

    #[serde(default)]
    pub blocked_images: Vec<Image>,
}

/// Platform release content.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Platform {
    /// Explicit release payload image
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release: Option<String>,

    /// Update channels (graph resolution is performed by an external service)
    #[serde(default)]
    pub channels: Vec<ReleaseChannel>,
}

/// A release update channel.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseChannel {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_version: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_version: Option<String>,
}

/// An operator catalog to mirror.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operator {
    /// Catalog image reference
    pub catalog: String,

    /// Repository path to use on the destination side
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_catalog: Option<String>,

    /// Tag to use on the destination side
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_tag: Option<String>,
}

/// A single image entry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Image {
    pub name: String,
}

impl ImageSetConfiguration {
    /// Read and validate a configuration file.
    pub fn read(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path).map_err(|e| {
            MirrorError::Config(format!(
                "Failed to read imageset configuration {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::parse(&data)
    }

    /// Parse and validate a configuration document.
    pub fn parse(data: &str) -> Result<Self> {
        let config: ImageSetConfiguration = serde_yaml::from_str(data).map_err(|e| {
            MirrorError::Config(format!("Failed to parse imageset configuration: {}", e))
        })?;

        if config.kind != IMAGE_SET_CONFIGURATION_KIND {
            return Err(MirrorError::Config(format!(
                "unexpected kind '{}' (expected {})",
                config.kind, IMAGE_SET_CONFIGURATION_KIND
            )));
        }

        Ok(config)
    }

    /// Maximum archive chunk size in bytes, if bounded.
    pub fn archive_size_bytes(&self) -> Option<u64> {
        self.archive_size
            .filter(|gib| *gib > 0)
            .map(|gib| gib.saturating_mul(1024 * 1024 * 1024))
    }
}

/// Log level
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Error => "error",
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "trace" => Ok(Self::Trace),
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "error" => Ok(Self::Error),
            _ => Err(format!(
                "unknown log level: '{}' (supported: info, debug, trace, error)",
                s
            )),
        }
    }
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => tracing::Level::TRACE,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Error => tracing::Level::ERROR,
        }
    }
}
