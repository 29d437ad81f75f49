//! Engine configuration
//!
//! Timeouts, scan durations and the UDP protocol port, plus the optional
//! interface-preference file. The preference file is TOML with a single
//! key, `preferred_interfaces = ["eth0", ...]`; a missing file or key means
//! "use every active interface".

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Well-known UDP port of the discovery protocol. Devices answer from this
/// port; datagrams from any other source port are reflections of our own
/// broadcasts and are dropped.
pub const PROTOCOL_UDP_PORT: u16 = 52014;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

/// Engine-wide configuration with defaults matching the shipped tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// TCP connect attempt bound. Elapsing it is not an error; the remote
    /// may come up later.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Per request/response round trip on either driver.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Minimum duration of the enter-flashloader keep-alive loop.
    #[serde(default = "default_scan_time_ms")]
    pub default_scan_time_ms: u64,
    /// Keep-alive send period.
    #[serde(default = "default_keepalive_period_ms")]
    pub keepalive_period_ms: u64,
    /// Settle time after a reset-to-flashloader broadcast on CAN.
    #[serde(default = "default_can_settle_ms")]
    pub can_settle_time_ms: u64,
    /// Settle time after a reset-to-flashloader broadcast on Ethernet.
    /// Longer than CAN: an IP change restarts the device network stack.
    #[serde(default = "default_ethernet_settle_ms")]
    pub ethernet_settle_time_ms: u64,
    /// Bitrate the CAN transport is initialized to before a scan.
    #[serde(default = "default_can_bitrate")]
    pub can_bitrate: u32,
    /// UDP port of the discovery protocol.
    #[serde(default = "default_udp_port")]
    pub udp_port: u16,
    /// Optional TOML file naming the network interfaces to use.
    #[serde(default)]
    pub interface_preferences_path: Option<PathBuf>,
}

fn default_connect_timeout_ms() -> u64 {
    2000
}

fn default_request_timeout_ms() -> u64 {
    1000
}

fn default_scan_time_ms() -> u64 {
    2000
}

fn default_keepalive_period_ms() -> u64 {
    5
}

fn default_can_settle_ms() -> u64 {
    500
}

fn default_ethernet_settle_ms() -> u64 {
    3000
}

fn default_can_bitrate() -> u32 {
    500000
}

fn default_udp_port() -> u16 {
    PROTOCOL_UDP_PORT
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            default_scan_time_ms: default_scan_time_ms(),
            keepalive_period_ms: default_keepalive_period_ms(),
            can_settle_time_ms: default_can_settle_ms(),
            ethernet_settle_time_ms: default_ethernet_settle_ms(),
            can_bitrate: default_can_bitrate(),
            udp_port: default_udp_port(),
            interface_preferences_path: None,
        }
    }
}

impl EngineConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn default_scan_time(&self) -> Duration {
        Duration::from_millis(self.default_scan_time_ms)
    }

    pub fn keepalive_period(&self) -> Duration {
        Duration::from_millis(self.keepalive_period_ms)
    }

    pub fn settle_time(&self, ethernet: bool) -> Duration {
        if ethernet {
            Duration::from_millis(self.ethernet_settle_time_ms)
        } else {
            Duration::from_millis(self.can_settle_time_ms)
        }
    }

    /// Load the preferred-interface list, if a preference file is
    /// configured and present. An absent file is not an error.
    pub fn preferred_interfaces(&self) -> Result<Vec<String>, ConfigError> {
        match &self.interface_preferences_path {
            Some(path) if path.exists() => load_interface_preferences(path),
            _ => Ok(Vec::new()),
        }
    }
}

#[derive(Debug, Deserialize)]
struct PreferenceFile {
    #[serde(default)]
    preferred_interfaces: Vec<String>,
}

/// Parse a preference file. Missing keys mean "no preference".
pub fn load_interface_preferences(path: &Path) -> Result<Vec<String>, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let parsed: PreferenceFile = toml::from_str(&text).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(parsed.preferred_interfaces)
}
