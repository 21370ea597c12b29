//! Configuration loading and validation.
//!
//! Mirrors the validate-on-load style of the sync plugin's `SyncFolder`,
//! but for the daemon's top-level `config.json`. The loader is pure: it
//! reads the file and validates it, performing no other I/O.

use crate::error::{AdapterError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const CURRENT_SCHEMA_VERSION: u32 = 1;

const MIN_SYNC_INTERVAL_SECS: u64 = 5;
const MAX_SYNC_INTERVAL_SECS: u64 = 3600;
const DEFAULT_SYNC_INTERVAL_SECS: u64 = 30;

const MIN_CONCURRENT_UPLOADS: u32 = 1;
const MAX_CONCURRENT_UPLOADS: u32 = 32;
const DEFAULT_MAX_CONCURRENT_UPLOADS: u32 = 4;

const MIN_UPLOAD_TIMEOUT_SECS: u64 = 5;
const MAX_UPLOAD_TIMEOUT_SECS: u64 = 600;
const DEFAULT_UPLOAD_TIMEOUT_SECS: u64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl Default for LogLevel {
    fn default() -> Self {
        Self::Info
    }
}

impl LogLevel {
    pub fn as_tracing_level(&self) -> tracing::Level {
        match self {
            Self::Debug => tracing::Level::DEBUG,
            Self::Info => tracing::Level::INFO,
            Self::Warning => tracing::Level::WARN,
            Self::Error => tracing::Level::ERROR,
        }
    }
}

/// The raw `config.json` document, deserialized as written.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawConfig {
    #[serde(default = "default_schema_version")]
    schema_version: u32,
    parent_folder: Option<String>,
    api_endpoint: Option<String>,
    api_key: Option<String>,
    #[serde(default)]
    sync_interval_seconds: Option<u64>,
    #[serde(default)]
    log_level: Option<LogLevel>,
    #[serde(default)]
    file_extensions: Option<Vec<String>>,
    #[serde(default)]
    max_concurrent_uploads: Option<u32>,
    #[serde(default)]
    upload_timeout_seconds: Option<u64>,
    #[serde(default)]
    delete_propagation: Option<bool>,
}

fn default_schema_version() -> u32 {
    CURRENT_SCHEMA_VERSION
}

/// Validated, defaulted configuration the rest of the daemon consumes.
#[derive(Debug, Clone)]
pub struct Config {
    pub schema_version: u32,
    pub parent_folder: String,
    pub api_endpoint: url::Url,
    pub api_key: String,
    pub sync_interval_seconds: u64,
    pub log_level: LogLevel,
    pub file_extensions: Vec<String>,
    pub max_concurrent_uploads: u32,
    pub upload_timeout_seconds: u64,
    pub delete_propagation: bool,
}

impl Config {
    /// Reads and validates `config.json` at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            AdapterError::config("config_path", format!("cannot read {}: {e}", path.display()))
        })?;
        Self::parse(&contents)
    }

    fn parse(contents: &str) -> Result<Self> {
        let raw: RawConfig = serde_json::from_str(contents)
            .map_err(|e| AdapterError::config("config.json", format!("invalid JSON: {e}")))?;

        if raw.schema_version > CURRENT_SCHEMA_VERSION {
            return Err(AdapterError::config(
                "schema_version",
                format!(
                    "config schema_version {} is newer than supported version {}",
                    raw.schema_version, CURRENT_SCHEMA_VERSION
                ),
            ));
        }

        let parent_folder = raw
            .parent_folder
            .filter(|s| !s.is_empty())
            .ok_or_else(|| AdapterError::config("parent_folder", "field is required"))?;

        let api_endpoint_str = raw
            .api_endpoint
            .filter(|s| !s.is_empty())
            .ok_or_else(|| AdapterError::config("api_endpoint", "field is required"))?;
        let api_endpoint = url::Url::parse(&api_endpoint_str)
            .map_err(|e| AdapterError::config("api_endpoint", format!("invalid URL: {e}")))?;
        validate_endpoint_scheme(&api_endpoint)?;

        let api_key = raw
            .api_key
            .filter(|s| !s.is_empty())
            .ok_or_else(|| AdapterError::config("api_key", "field is required"))?;

        let sync_interval_seconds = raw.sync_interval_seconds.unwrap_or(DEFAULT_SYNC_INTERVAL_SECS);
        if !(MIN_SYNC_INTERVAL_SECS..=MAX_SYNC_INTERVAL_SECS).contains(&sync_interval_seconds) {
            return Err(AdapterError::config(
                "sync_interval_seconds",
                format!(
                    "must be between {MIN_SYNC_INTERVAL_SECS} and {MAX_SYNC_INTERVAL_SECS}, got {sync_interval_seconds}"
                ),
            ));
        }

        let max_concurrent_uploads = raw
            .max_concurrent_uploads
            .unwrap_or(DEFAULT_MAX_CONCURRENT_UPLOADS);
        if !(MIN_CONCURRENT_UPLOADS..=MAX_CONCURRENT_UPLOADS).contains(&max_concurrent_uploads) {
            return Err(AdapterError::config(
                "max_concurrent_uploads",
                format!(
                    "must be between {MIN_CONCURRENT_UPLOADS} and {MAX_CONCURRENT_UPLOADS}, got {max_concurrent_uploads}"
                ),
            ));
        }

        let upload_timeout_seconds = raw.upload_timeout_seconds.unwrap_or(DEFAULT_UPLOAD_TIMEOUT_SECS);
        if !(MIN_UPLOAD_TIMEOUT_SECS..=MAX_UPLOAD_TIMEOUT_SECS).contains(&upload_timeout_seconds) {
            return Err(AdapterError::config(
                "upload_timeout_seconds",
                format!(
                    "must be between {MIN_UPLOAD_TIMEOUT_SECS} and {MAX_UPLOAD_TIMEOUT_SECS}, got {upload_timeout_seconds}"
                ),
            ));
        }

        // An empty file_extensions array is equivalent to the field being
        // absent: all extensions are eligible.
        let file_extensions = raw.file_extensions.unwrap_or_default();

        Ok(Self {
            schema_version: raw.schema_version,
            parent_folder,
            api_endpoint,
            api_key,
            sync_interval_seconds,
            log_level: raw.log_level.unwrap_or_default(),
            file_extensions,
            max_concurrent_uploads,
            upload_timeout_seconds,
            delete_propagation: raw.delete_propagation.unwrap_or(false),
        })
    }

    /// Resolves the watched root by joining the cloud-mount path for this
    /// OS with `parent_folder`. The caller (the daemon's startup routine)
    /// is responsible for checking the result exists.
    pub fn resolve_watched_root(&self) -> Result<PathBuf> {
        let cloud_mount = cloud_mount_root()
            .ok_or_else(|| AdapterError::config("parent_folder", "no cloud-drive mount point on this platform"))?;
        Ok(cloud_mount.join(&self.parent_folder))
    }
}

fn validate_endpoint_scheme(url: &url::Url) -> Result<()> {
    match url.scheme() {
        "https" => Ok(()),
        "http" if url.host_str() == Some("localhost") || url.host_str() == Some("127.0.0.1") => Ok(()),
        "http" => Err(AdapterError::config(
            "api_endpoint",
            "http is only permitted for loopback; use https",
        )),
        other => Err(AdapterError::config(
            "api_endpoint",
            format!("unsupported scheme `{other}`"),
        )),
    }
}

#[cfg(target_os = "macos")]
fn cloud_mount_root() -> Option<PathBuf> {
    dirs::home_dir().map(|home| {
        home.join("Library")
            .join("Mobile Documents")
            .join("com~apple~CloudDocs")
    })
}

#[cfg(not(target_os = "macos"))]
fn cloud_mount_root() -> Option<PathBuf> {
    dirs::home_dir()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_json() -> String {
        serde_json::json!({
            "parent_folder": "CASES",
            "api_endpoint": "https://legal.example.com/api/icloud/upload",
            "api_key": "opaque-bearer-token"
        })
        .to_string()
    }

    #[test]
    fn loads_minimal_config_with_defaults() {
        let cfg = Config::parse(&minimal_json()).unwrap();
        assert_eq!(cfg.parent_folder, "CASES");
        assert_eq!(cfg.sync_interval_seconds, DEFAULT_SYNC_INTERVAL_SECS);
        assert_eq!(cfg.max_concurrent_uploads, DEFAULT_MAX_CONCURRENT_UPLOADS);
        assert_eq!(cfg.upload_timeout_seconds, DEFAULT_UPLOAD_TIMEOUT_SECS);
        assert_eq!(cfg.log_level, LogLevel::Info);
        assert!(cfg.file_extensions.is_empty());
        assert!(!cfg.delete_propagation);
    }

    #[test]
    fn missing_required_field_is_rejected() {
        let json = serde_json::json!({
            "api_endpoint": "https://legal.example.com/upload",
            "api_key": "token"
        })
        .to_string();
        let err = Config::parse(&json).unwrap_err();
        match err {
            AdapterError::Config { field, .. } => assert_eq!(field, "parent_folder"),
            other => panic!("expected Config error, got {other:?}"),
        }
    }

    #[test]
    fn rejects_non_https_non_loopback_scheme() {
        let json = serde_json::json!({
            "parent_folder": "CASES",
            "api_endpoint": "http://legal.example.com/upload",
            "api_key": "token"
        })
        .to_string();
        assert!(Config::parse(&json).is_err());
    }

    #[test]
    fn permits_http_on_loopback() {
        let json = serde_json::json!({
            "parent_folder": "CASES",
            "api_endpoint": "http://127.0.0.1:8080/upload",
            "api_key": "token"
        })
        .to_string();
        assert!(Config::parse(&json).is_ok());
    }

    #[test]
    fn rejects_out_of_range_sync_interval() {
        let json = serde_json::json!({
            "parent_folder": "CASES",
            "api_endpoint": "https://legal.example.com/upload",
            "api_key": "token",
            "sync_interval_seconds": 1
        })
        .to_string();
        assert!(Config::parse(&json).is_err());
    }

    #[test]
    fn empty_extensions_array_equals_absent() {
        let json = serde_json::json!({
            "parent_folder": "CASES",
            "api_endpoint": "https://legal.example.com/upload",
            "api_key": "token",
            "file_extensions": []
        })
        .to_string();
        let cfg = Config::parse(&json).unwrap();
        assert!(cfg.file_extensions.is_empty());
    }

    #[test]
    fn rejects_future_schema_version() {
        let json = serde_json::json!({
            "schema_version": 99,
            "parent_folder": "CASES",
            "api_endpoint": "https://legal.example.com/upload",
            "api_key": "token"
        })
        .to_string();
        let err = Config::parse(&json).unwrap_err();
        match err {
            AdapterError::Config { field, .. } => assert_eq!(field, "schema_version"),
            other => panic!("expected Config error, got {other:?}"),
        }
    }
}
