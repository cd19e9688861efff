//! Configuration file support for Tether CLI tools
//!
//! Durations are written in milliseconds. Every field is optional; missing
//! fields take the library defaults.

use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tether::{NetworkConfig, NetworkRole};
use tether_protocol::ack::MAX_ACK_COUNT;
use tether_protocol::packet::MAX_ACK_ONLY_IDS;
use tether_protocol::{ConnectionConfig, EncryptionMode};

/// Network role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoleSetting {
    Client,
    Server,
    Master,
}

impl From<RoleSetting> for NetworkRole {
    fn from(role: RoleSetting) -> Self {
        match role {
            RoleSetting::Client => NetworkRole::Client,
            RoleSetting::Server => NetworkRole::Server,
            RoleSetting::Master => NetworkRole::Master,
        }
    }
}

/// Encryption mode requested or announced during the handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EncryptionSetting {
    None,
    Standard,
}

impl From<EncryptionSetting> for EncryptionMode {
    fn from(setting: EncryptionSetting) -> Self {
        match setting {
            EncryptionSetting::None => EncryptionMode::None,
            EncryptionSetting::Standard => EncryptionMode::Standard,
        }
    }
}

impl From<EncryptionMode> for EncryptionSetting {
    fn from(mode: EncryptionMode) -> Self {
        match mode {
            EncryptionMode::None => EncryptionSetting::None,
            EncryptionMode::Standard => EncryptionSetting::Standard,
        }
    }
}

/// Socket and registry settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkSection {
    /// Local bind address
    #[serde(default = "default_bind")]
    pub bind: SocketAddr,
    #[serde(default = "default_role")]
    pub role: RoleSetting,
    /// Port used for host strings without one
    #[serde(default = "default_port")]
    pub default_port: u16,
    #[serde(default = "default_update_interval")]
    pub update_interval_ms: u64,
    #[serde(default = "default_receive_timeout")]
    pub receive_timeout_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recv_buffer_size: Option<usize>,
    /// Statistics interval in seconds, 0 disables
    #[serde(default = "default_stats_interval")]
    pub stats_interval_secs: u64,
    /// Worker threads for deferred responses
    #[serde(default = "default_workers")]
    pub workers: usize,
}

fn default_bind() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 0))
}

fn default_role() -> RoleSetting {
    RoleSetting::Client
}

fn default_port() -> u16 {
    NetworkConfig::default().default_port
}

fn default_update_interval() -> u64 {
    50
}

fn default_receive_timeout() -> u64 {
    100
}

fn default_stats_interval() -> u64 {
    5
}

fn default_workers() -> usize {
    2
}

impl Default for NetworkSection {
    fn default() -> Self {
        NetworkSection {
            bind: default_bind(),
            role: default_role(),
            default_port: default_port(),
            update_interval_ms: default_update_interval(),
            receive_timeout_ms: default_receive_timeout(),
            recv_buffer_size: None,
            stats_interval_secs: default_stats_interval(),
            workers: default_workers(),
        }
    }
}

/// Per-connection timing and handshake settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionSection {
    pub keepalive_interval_ms: u64,
    pub timeout_factor: f64,
    pub ack_flush_interval_ms: u64,
    pub packet_lost_after_ms: u64,
    pub packet_lost_after_newer: u64,
    pub critical_max_tries: u32,
    pub resend_once_max_tries: u32,
    pub ack_count: usize,
    pub ack_only_max: usize,
    pub double_send_ack_only: bool,
    pub duplicate_window: usize,
    pub punchthrough_probes: u32,
    pub punchthrough_interval_ms: u64,
    pub response_retention_ms: u64,
    pub encryption: EncryptionSetting,
    pub user_name: String,
}

impl From<&ConnectionConfig> for ConnectionSection {
    fn from(config: &ConnectionConfig) -> Self {
        ConnectionSection {
            keepalive_interval_ms: config.keepalive_interval.as_millis() as u64,
            timeout_factor: config.timeout_factor,
            ack_flush_interval_ms: config.ack_flush_interval.as_millis() as u64,
            packet_lost_after_ms: config.packet_lost_after.as_millis() as u64,
            packet_lost_after_newer: config.packet_lost_after_newer,
            critical_max_tries: config.critical_max_tries,
            resend_once_max_tries: config.resend_once_max_tries,
            ack_count: config.ack_count,
            ack_only_max: config.ack_only_max,
            double_send_ack_only: config.double_send_ack_only,
            duplicate_window: config.duplicate_window,
            punchthrough_probes: config.punchthrough_probes,
            punchthrough_interval_ms: config.punchthrough_interval.as_millis() as u64,
            response_retention_ms: config.response_retention.as_millis() as u64,
            encryption: config.encryption.into(),
            user_name: config.user_name.clone(),
        }
    }
}

impl Default for ConnectionSection {
    fn default() -> Self {
        ConnectionSection::from(&ConnectionConfig::default())
    }
}

/// Combined configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub network: NetworkSection,
    #[serde(default)]
    pub connection: ConnectionSection,
}

impl Config {
    /// Load configuration from TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let contents = toml::to_string_pretty(self)?;
        fs::write(path, contents)?;
        Ok(())
    }

    /// Example server configuration
    pub fn example_server() -> Self {
        Config {
            network: NetworkSection {
                bind: SocketAddr::from(([0, 0, 0, 0], default_port())),
                role: RoleSetting::Server,
                ..NetworkSection::default()
            },
            connection: ConnectionSection::default(),
        }
    }

    /// Example client configuration
    pub fn example_client() -> Self {
        Config {
            network: NetworkSection::default(),
            connection: ConnectionSection {
                user_name: "client".to_string(),
                ..ConnectionSection::default()
            },
        }
    }

    /// Reject settings the protocol cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        let c = &self.connection;

        if c.ack_count == 0 || c.ack_count > MAX_ACK_COUNT {
            return Err(ConfigError::Invalid(format!(
                "ack_count must be within 1..={}, got {}",
                MAX_ACK_COUNT, c.ack_count
            )));
        }
        if c.ack_only_max < 2 || c.ack_only_max > MAX_ACK_ONLY_IDS {
            return Err(ConfigError::Invalid(format!(
                "ack_only_max must be within 2..={}, got {}",
                MAX_ACK_ONLY_IDS, c.ack_only_max
            )));
        }
        if c.critical_max_tries == 0 || c.resend_once_max_tries == 0 {
            return Err(ConfigError::Invalid(
                "max tries must be at least 1".to_string(),
            ));
        }
        if !(c.timeout_factor.is_finite() && c.timeout_factor >= 1.0) {
            return Err(ConfigError::Invalid(format!(
                "timeout_factor must be at least 1.0, got {}",
                c.timeout_factor
            )));
        }
        if c.duplicate_window == 0 {
            return Err(ConfigError::Invalid(
                "duplicate_window must be at least 1".to_string(),
            ));
        }
        if self.network.update_interval_ms == 0 || self.network.receive_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "update and receive intervals must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Connection settings for the protocol layer
    pub fn connection_config(&self) -> ConnectionConfig {
        let c = &self.connection;
        ConnectionConfig {
            keepalive_interval: Duration::from_millis(c.keepalive_interval_ms),
            timeout_factor: c.timeout_factor,
            ack_flush_interval: Duration::from_millis(c.ack_flush_interval_ms),
            packet_lost_after: Duration::from_millis(c.packet_lost_after_ms),
            packet_lost_after_newer: c.packet_lost_after_newer,
            critical_max_tries: c.critical_max_tries,
            resend_once_max_tries: c.resend_once_max_tries,
            ack_count: c.ack_count,
            ack_only_max: c.ack_only_max,
            double_send_ack_only: c.double_send_ack_only,
            duplicate_window: c.duplicate_window,
            punchthrough_probes: c.punchthrough_probes,
            punchthrough_interval: Duration::from_millis(c.punchthrough_interval_ms),
            response_retention: Duration::from_millis(c.response_retention_ms),
            encryption: c.encryption.into(),
            user_name: c.user_name.clone(),
        }
    }

    /// Registry settings, validated
    pub fn network_config(&self) -> Result<NetworkConfig, ConfigError> {
        self.validate()?;
        let n = &self.network;
        Ok(NetworkConfig {
            bind: n.bind,
            role: n.role.into(),
            default_port: n.default_port,
            update_interval: Duration::from_millis(n.update_interval_ms),
            receive_timeout: Duration::from_millis(n.receive_timeout_ms),
            recv_buffer_size: n.recv_buffer_size,
            connection: self.connection_config(),
        })
    }

    /// Get statistics interval as Duration
    pub fn stats_interval(&self) -> Duration {
        Duration::from_secs(self.network.stats_interval_secs)
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
