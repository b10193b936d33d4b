//! TOML configuration for the device firmware.
//!
//! Every field has a serde default, so a missing file or a file written by an
//! older firmware still loads:
//!
//! ```toml
//! [device]
//! device_id = "NL-00A1"
//! log_level = "debug"
//!
//! [network]
//! discovery_port = 9000
//! stream_port = 4050
//!
//! [storage]
//! root = "/data"
//! ```

use std::path::{Path, PathBuf};

use netlight_core::protocol::frame::DEFAULT_MAX_PAYLOAD;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::dispatch::Verbosity;

/// Error type for configuration file operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error accessing config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),
}

// ── Config schema types ───────────────────────────────────────────────────────

/// Top-level device configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DeviceConfig {
    #[serde(default)]
    pub device: IdentityConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub render: RenderConfig,
}

/// Identity and diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IdentityConfig {
    /// Appended to the control URL offered by DISCOVER and sent in heartbeats.
    #[serde(default = "default_device_id")]
    pub device_id: String,
    #[serde(default = "default_name")]
    pub name: String,
    /// `tracing` level used when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub dispatch_verbosity: Verbosity,
}

/// Ports, timers, and the frame size limit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NetworkConfig {
    /// UDP port the device listens on for DISCOVER broadcasts.
    #[serde(default = "default_discovery_port")]
    pub discovery_port: u16,
    /// UDP port for STREAM_FRAME traffic, advertised in ANNOUNCE.
    #[serde(default = "default_stream_port")]
    pub stream_port: u16,
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    #[serde(default = "default_max_payload")]
    pub max_payload: usize,
}

/// Where files, schema overrides, and the status document live.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StorageConfig {
    /// Every FILE_BEGIN path is resolved below this directory.
    #[serde(default = "default_storage_root")]
    pub root: PathBuf,
    /// Directory of `*.json` schema documents merged over the built-in set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_dir: Option<PathBuf>,
    #[serde(default = "default_status_file")]
    pub status_file: PathBuf,
}

/// Local playback settings for the render loop.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RenderConfig {
    /// Raw frame file replayed in local mode, relative to the storage root.
    #[serde(default = "default_local_file")]
    pub local_file: PathBuf,
    /// Bytes per displayed frame in local mode.
    #[serde(default = "default_frame_bytes")]
    pub frame_bytes: usize,
    #[serde(default = "default_local_frame_ms")]
    pub local_frame_ms: u64,
}

// ── Default helpers ───────────────────────────────────────────────────────────

fn default_device_id() -> String {
    "NL-0001".to_string()
}
fn default_name() -> String {
    "Net-Light".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_discovery_port() -> u16 {
    9000
}
fn default_stream_port() -> u16 {
    4050
}
fn default_heartbeat_interval_ms() -> u64 {
    10_000
}
fn default_max_payload() -> usize {
    DEFAULT_MAX_PAYLOAD
}
fn default_storage_root() -> PathBuf {
    PathBuf::from("data")
}
fn default_status_file() -> PathBuf {
    PathBuf::from("system_status.json")
}
fn default_local_file() -> PathBuf {
    PathBuf::from("data.bin")
}
fn default_frame_bytes() -> usize {
    // 336 APA102 LEDs, 4 bytes each
    336 * 4
}
fn default_local_frame_ms() -> u64 {
    25
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            device_id: default_device_id(),
            name: default_name(),
            log_level: default_log_level(),
            dispatch_verbosity: Verbosity::default(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            discovery_port: default_discovery_port(),
            stream_port: default_stream_port(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            max_payload: default_max_payload(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: default_storage_root(),
            schema_dir: None,
            status_file: default_status_file(),
        }
    }
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            local_file: default_local_file(),
            frame_bytes: default_frame_bytes(),
            local_frame_ms: default_local_frame_ms(),
        }
    }
}

impl DeviceConfig {
    /// Absolute location of the status document.
    pub fn status_path(&self) -> PathBuf {
        self.storage.root.join(&self.storage.status_file)
    }

    /// Absolute location of the local playback file.
    pub fn local_file_path(&self) -> PathBuf {
        self.storage.root.join(&self.render.local_file)
    }
}

/// Loads a [`DeviceConfig`] from `path`, returning defaults if it does not exist.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system errors other than "not found",
/// and [`ConfigError::Parse`] if the TOML is malformed.
pub fn load_config(path: &Path) -> Result<DeviceConfig, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(toml::from_str(&content)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(DeviceConfig::default()),
        Err(source) => Err(ConfigError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_firmware_ports() {
        let cfg = DeviceConfig::default();
        assert_eq!(cfg.network.discovery_port, 9000);
        assert_eq!(cfg.network.stream_port, 4050);
        assert_eq!(cfg.network.heartbeat_interval_ms, 10_000);
        assert_eq!(cfg.network.max_payload, 8192);
    }

    #[test]
    fn test_partial_toml_fills_missing_fields() {
        // Arrange
        let text = r#"
            [device]
            device_id = "NL-ABCD"
            dispatch_verbosity = "full"

            [network]
            stream_port = 5000
        "#;

        // Act
        let cfg: DeviceConfig = toml::from_str(text).unwrap();

        // Assert
        assert_eq!(cfg.device.device_id, "NL-ABCD");
        assert_eq!(cfg.device.dispatch_verbosity, Verbosity::Full);
        assert_eq!(cfg.network.stream_port, 5000);
        assert_eq!(cfg.network.discovery_port, 9000);
        assert_eq!(cfg.storage, StorageConfig::default());
    }

    #[test]
    fn test_load_config_missing_file_yields_default() {
        let cfg = load_config(Path::new("/no/such/netlight.toml")).unwrap();
        assert_eq!(cfg, DeviceConfig::default());
    }

    #[test]
    fn test_load_config_rejects_malformed_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("device.toml");
        std::fs::write(&path, "[network\nport = ").unwrap();
        assert!(matches!(load_config(&path), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_status_path_is_under_storage_root() {
        let mut cfg = DeviceConfig::default();
        cfg.storage.root = PathBuf::from("/srv/nl");
        assert_eq!(cfg.status_path(), PathBuf::from("/srv/nl/system_status.json"));
    }
}
