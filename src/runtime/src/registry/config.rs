//! Local cache registry configuration.
//!
//! The configuration is a fixed YAML template whose placeholders are
//! substituted with the resolved cache root, listen port and log level,
//! then parsed into [`RegistryConfig`].

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use a3s_mirror_core::error::{MirrorError, Result};
use a3s_mirror_core::LogLevel;
use serde::{Deserialize, Serialize};

const PLACEHOLDER_ACCESS_LOG_OFF: &str = "$$PLACEHOLDER_ACCESS_LOG_OFF$$";
const PLACEHOLDER_LOG_LEVEL: &str = "$$PLACEHOLDER_LOG_LEVEL$$";
const PLACEHOLDER_ROOT: &str = "$$PLACEHOLDER_ROOT$$";
const PLACEHOLDER_PORT: &str = "$$PLACEHOLDER_PORT$$";

const CONFIG_TEMPLATE: &str = r#"
version: 0.1
log:
  accesslog:
    disabled: $$PLACEHOLDER_ACCESS_LOG_OFF$$
  level: $$PLACEHOLDER_LOG_LEVEL$$
  formatter: text
  fields:
    service: registry
storage:
  cache:
    blobdescriptor: inmemory
  filesystem:
    rootdirectory: $$PLACEHOLDER_ROOT$$
http:
  addr: :$$PLACEHOLDER_PORT$$
  headers:
    X-Content-Type-Options: [nosniff]
health:
  storagedriver:
    enabled: true
    interval: 10s
    threshold: 3
"#;

/// Render the registry configuration document.
///
/// Access logging is enabled only for the `debug` log level.
pub fn render_config(root: &Path, port: u16, log_level: LogLevel) -> String {
    let access_log_off = if log_level == LogLevel::Debug {
        "false"
    } else {
        "true"
    };

    CONFIG_TEMPLATE
        .replacen(PLACEHOLDER_ROOT, &root.display().to_string(), 1)
        .replacen(PLACEHOLDER_PORT, &port.to_string(), 1)
        .replacen(PLACEHOLDER_LOG_LEVEL, log_level.as_str(), 1)
        .replacen(PLACEHOLDER_ACCESS_LOG_OFF, access_log_off, 1)
}

/// Parsed registry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    #[serde(deserialize_with = "scalar_as_string")]
    pub version: String,
    pub log: LogSection,
    pub storage: StorageSection,
    pub http: HttpSection,
    #[serde(default)]
    pub health: HealthSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSection {
    #[serde(default)]
    pub accesslog: AccessLog,
    pub level: LogLevel,
    #[serde(default)]
    pub formatter: String,
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccessLog {
    pub disabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSection {
    #[serde(default)]
    pub cache: BTreeMap<String, String>,
    pub filesystem: FilesystemStorage,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilesystemStorage {
    pub rootdirectory: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpSection {
    pub addr: String,
    #[serde(default)]
    pub headers: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HealthSection {
    #[serde(default)]
    pub storagedriver: StorageDriverHealth,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageDriverHealth {
    pub enabled: bool,
    pub interval: String,
    pub threshold: u32,
}

impl Default for StorageDriverHealth {
    fn default() -> Self {
        Self {
            enabled: false,
            interval: "10s".to_string(),
            threshold: 3,
        }
    }
}

impl RegistryConfig {
    /// Parse a rendered configuration document.
    pub fn parse(document: &str) -> Result<Self> {
        serde_yaml::from_str(document).map_err(|e| {
            MirrorError::Setup(format!(
                "error parsing local storage configuration : {}\n {}",
                e, document
            ))
        })
    }

    /// Render and parse the configuration for the given values.
    pub fn generate(root: &Path, port: u16, log_level: LogLevel) -> Result<Self> {
        Self::parse(&render_config(root, port, log_level))
    }

    /// Filesystem storage root.
    pub fn root_directory(&self) -> &Path {
        &self.storage.filesystem.rootdirectory
    }

    pub fn access_log_enabled(&self) -> bool {
        !self.log.accesslog.disabled
    }

    /// Socket address to bind; an empty host (`:5000`) binds every interface.
    pub fn listen_addr(&self) -> Result<SocketAddr> {
        let addr = self.http.addr.trim();
        let full = if addr.starts_with(':') {
            format!("0.0.0.0{}", addr)
        } else {
            addr.to_string()
        };
        full.parse().map_err(|e| {
            MirrorError::Setup(format!("invalid registry listen address '{}': {}", addr, e))
        })
    }

    /// Health check interval.
    pub fn health_interval(&self) -> Result<Duration> {
        parse_duration(&self.health.storagedriver.interval)
    }
}

/// Accept `version: 0.1` as well as `version: "0.1"`.
fn scalar_as_string<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    match serde_yaml::Value::deserialize(deserializer)? {
        serde_yaml::Value::String(s) => Ok(s),
        serde_yaml::Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected a scalar version, found {:?}",
            other
        ))),
    }
}

/// Parse a duration such as `10s`, `500ms` or `1m`.
pub fn parse_duration(s: &str) -> Result<Duration> {
    humantime::parse_duration(s.trim())
        .map_err(|e| MirrorError::Setup(format!("invalid duration '{}': {}", s, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_debug_enables_access_log() {
        let doc = render_config(Path::new("/cache"), 5000, LogLevel::Debug);
        assert!(doc.contains(":5000"));
        assert!(doc.contains("rootdirectory: /cache"));
        assert!(doc.contains("disabled: false"));
        assert!(doc.contains("level: debug"));
        assert!(!doc.contains("$$PLACEHOLDER"));
    }

    #[test]
    fn test_render_info_disables_access_log() {
        let doc = render_config(Path::new("/cache"), 5000, LogLevel::Info);
        assert!(doc.contains("disabled: true"));
        assert!(doc.contains("level: info"));
    }

    #[test]
    fn test_generate_parses_rendered_document() {
        let cfg = RegistryConfig::generate(Path::new("/cache"), 5000, LogLevel::Debug).unwrap();
        assert_eq!(cfg.version, "0.1");
        assert_eq!(cfg.root_directory(), Path::new("/cache"));
        assert!(cfg.access_log_enabled());
        assert_eq!(cfg.log.level, LogLevel::Debug);
        assert_eq!(cfg.http.addr, ":5000");
        assert_eq!(
            cfg.http.headers.get("X-Content-Type-Options"),
            Some(&vec!["nosniff".to_string()])
        );
        assert!(cfg.health.storagedriver.enabled);
        assert_eq!(cfg.health.storagedriver.threshold, 3);
        assert_eq!(cfg.health_interval().unwrap(), Duration::from_secs(10));
    }

    #[test]
    fn test_generate_info_disables_access_log() {
        let cfg = RegistryConfig::generate(Path::new("/cache"), 5000, LogLevel::Info).unwrap();
        assert!(!cfg.access_log_enabled());
    }

    #[test]
    fn test_listen_addr() {
        let cfg = RegistryConfig::generate(Path::new("/cache"), 5123, LogLevel::Info).unwrap();
        assert_eq!(cfg.listen_addr().unwrap(), "0.0.0.0:5123".parse().unwrap());
    }

    #[test]
    fn test_parse_error_includes_document() {
        let err = RegistryConfig::parse("version: [").unwrap_err();
        assert!(matches!(err, MirrorError::Setup(_)));
        assert!(err.to_string().contains("version: ["));
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("10s").unwrap(), Duration::from_secs(10));
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("2m").unwrap(), Duration::from_secs(120));
        assert_eq!(parse_duration(" 1h ").unwrap(), Duration::from_secs(3600));
        assert!(matches!(parse_duration("10"), Err(MirrorError::Setup(_))));
        assert!(matches!(parse_duration("abc"), Err(MirrorError::Setup(_))));
    }
}
