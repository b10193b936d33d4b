//! TOML configuration for the host tool.
//!
//! ```toml
//! log_level = "info"
//!
//! [network]
//! ws_port = 8000
//! discovery_port = 9000
//!
//! [transfer]
//! chunk_size = 512
//! chunk_timeout_ms = 2000
//! max_attempts = 10
//! max_payload = 8192
//! ```

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use netlight_core::protocol::frame::DEFAULT_MAX_PAYLOAD;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error accessing config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Top-level host configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HostConfig {
    #[serde(default)]
    pub network: HostNetworkConfig,
    #[serde(default)]
    pub transfer: TransferConfig,
    /// Directory of `*.json` schema documents merged over the built-in set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_dir: Option<PathBuf>,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            network: HostNetworkConfig::default(),
            transfer: TransferConfig::default(),
            schema_dir: None,
            log_level: default_log_level(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HostNetworkConfig {
    /// Address the WebSocket listener binds.
    #[serde(default = "default_bind")]
    pub bind: IpAddr,
    #[serde(default = "default_ws_port")]
    pub ws_port: u16,
    /// Address advertised in DISCOVER; detected from the routing table if unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub advertise_ip: Option<IpAddr>,
    #[serde(default = "default_broadcast")]
    pub broadcast: IpAddr,
    #[serde(default = "default_discovery_port")]
    pub discovery_port: u16,
    #[serde(default = "default_stream_port")]
    pub stream_port: u16,
    /// How long ANNOUNCE replies are collected after a DISCOVER broadcast.
    #[serde(default = "default_discovery_window_ms")]
    pub discovery_window_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransferConfig {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Time to wait for each FILE_ACK before resending.
    #[serde(default = "default_chunk_timeout_ms")]
    pub chunk_timeout_ms: u64,
    /// Sends per step before the target is abandoned.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Time to wait for the END result (flush and hash on the device).
    #[serde(default = "default_end_timeout_ms")]
    pub end_timeout_ms: u64,
    /// Capacity of each endpoint's acknowledgement queue.
    #[serde(default = "default_ack_queue")]
    pub ack_queue: usize,
    /// Largest frame payload the devices accept; must match their
    /// `max_payload`.  FILE_CHUNK data is sized to fit it.
    #[serde(default = "default_max_payload")]
    pub max_payload: usize,
}

fn default_log_level() -> String {
    "info".to_string()
}
fn default_bind() -> IpAddr {
    IpAddr::from([0, 0, 0, 0])
}
fn default_ws_port() -> u16 {
    8000
}
fn default_broadcast() -> IpAddr {
    IpAddr::from([255, 255, 255, 255])
}
fn default_discovery_port() -> u16 {
    9000
}
fn default_stream_port() -> u16 {
    4050
}
fn default_discovery_window_ms() -> u64 {
    2000
}
fn default_chunk_size() -> usize {
    512
}
fn default_chunk_timeout_ms() -> u64 {
    2000
}
fn default_max_attempts() -> u32 {
    10
}
fn default_end_timeout_ms() -> u64 {
    10_000
}
fn default_ack_queue() -> usize {
    32
}
fn default_max_payload() -> usize {
    DEFAULT_MAX_PAYLOAD
}

impl Default for HostNetworkConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            ws_port: default_ws_port(),
            advertise_ip: None,
            broadcast: default_broadcast(),
            discovery_port: default_discovery_port(),
            stream_port: default_stream_port(),
            discovery_window_ms: default_discovery_window_ms(),
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            chunk_timeout_ms: default_chunk_timeout_ms(),
            max_attempts: default_max_attempts(),
            end_timeout_ms: default_end_timeout_ms(),
            ack_queue: default_ack_queue(),
            max_payload: default_max_payload(),
        }
    }
}

impl HostNetworkConfig {
    pub fn discovery_window(&self) -> Duration {
        Duration::from_millis(self.discovery_window_ms)
    }
}

impl TransferConfig {
    pub fn chunk_timeout(&self) -> Duration {
        Duration::from_millis(self.chunk_timeout_ms)
    }

    pub fn end_timeout(&self) -> Duration {
        Duration::from_millis(self.end_timeout_ms)
    }
}

/// Loads a [`HostConfig`] from `path`, returning defaults if it does not exist.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system errors other than "not found",
/// and [`ConfigError::Parse`] if the TOML is malformed.
pub fn load_host_config(path: &Path) -> Result<HostConfig, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(toml::from_str(&content)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HostConfig::default()),
        Err(source) => Err(ConfigError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_device_ports() {
        let cfg = HostConfig::default();
        assert_eq!(cfg.network.ws_port, 8000);
        assert_eq!(cfg.network.discovery_port, 9000);
        assert_eq!(cfg.network.stream_port, 4050);
        assert_eq!(cfg.transfer.max_attempts, 10);
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        // Arrange
        let text = "[transfer]\nchunk_size = 1024\n";

        // Act
        let cfg: HostConfig = toml::from_str(text).unwrap();

        // Assert
        assert_eq!(cfg.transfer.chunk_size, 1024);
        assert_eq!(cfg.transfer.chunk_timeout(), Duration::from_secs(2));
        assert_eq!(cfg.transfer.max_payload, DEFAULT_MAX_PAYLOAD);
        assert_eq!(cfg.network, HostNetworkConfig::default());
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let cfg = load_host_config(Path::new("/definitely/not/here.toml")).unwrap();
        assert_eq!(cfg, HostConfig::default());
    }
}
