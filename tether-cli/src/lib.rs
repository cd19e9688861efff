//! Tether CLI Library
//!
//! Shared functionality for Tether command-line tools.

pub mod config;
pub mod stats;

pub use config::{Config, ConfigError, ConnectionSection, EncryptionSetting, NetworkSection, RoleSetting};
pub use stats::{display_connection_stats, format_bytes, format_compact_stats, format_duration};

use tracing_subscriber::EnvFilter;

/// Install the global subscriber; `RUST_LOG` wins over `verbose`
pub fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
