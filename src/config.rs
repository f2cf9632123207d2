use crate::network::protocol::Size;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Connection configuration
    pub connection: ConnectionConfig,

    /// Video configuration
    pub video: VideoConfig,

    /// Audio configuration
    pub audio: AudioConfig,

    /// On-device agent
    pub agent: AgentConfig,

    /// Persisted state
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// adb binary; searched next to the executable and on PATH when unset
    pub adb_path: Option<PathBuf>,

    /// Device serial, for hosts with more than one device attached
    pub serial: Option<String>,

    /// Abstract socket name the agent connects to on the device
    pub socket_name: String,

    /// Time allowed for the whole connection sequence (ms)
    pub connect_timeout_ms: u64,

    /// Host address the agent's connections are accepted on
    pub host: IpAddr,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VideoConfig {
    /// Largest resolution requested from the device
    pub max_size: Option<Size>,

    /// Bit rate used until one is learned for the device type (bps)
    pub bit_rate: i32,

    /// Video codec
    pub codec: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Enable audio streaming
    pub enabled: bool,

    /// Sample rate (Hz)
    pub sample_rate: u32,

    /// Number of channels
    pub channels: u16,

    /// Audio codec
    pub codec: String,

    /// Decoded chunks buffered ahead of playback
    pub queue_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Directory on the device the agent is pushed to
    pub device_dir: String,

    /// Local agent jar; searched next to the executable when unset
    pub jar_path: Option<PathBuf>,

    /// Agent log level
    pub log_level: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Learned bit rates per device type
    pub bit_rate_table: Option<PathBuf>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        serde_json::from_str(&json).with_context(|| format!("Invalid config {}", path.display()))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connection.connect_timeout_ms)
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            adb_path: None,
            serial: None,
            socket_name: "device-mirror".to_string(),
            connect_timeout_ms: 10_000,
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
        }
    }
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            max_size: None,
            bit_rate: 8_000_000,
            codec: "avc".to_string(),
        }
    }
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            sample_rate: 48_000,
            channels: 2,
            codec: "opus".to_string(),
            queue_capacity: 16,
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            device_dir: "/data/local/tmp/.device-mirror".to_string(),
            jar_path: None,
            log_level: "info".to_string(),
        }
    }
}
