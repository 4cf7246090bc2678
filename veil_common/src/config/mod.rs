//! Configuration management for VeilLink.
//!
//! This module provides functionality for loading, parsing, and managing
//! configuration settings for VeilLink components. It supports loading
//! configuration from TOML files and provides a structured representation
//! of the configuration settings.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Error reading configuration file
    #[error("Failed to read config file: {0}")]
    Io(#[from] io::Error),

    /// Error parsing TOML configuration
    #[error("Failed to parse TOML config: {0}")]
    Toml(#[from] toml::de::Error),

    /// Error serializing configuration to TOML
    #[error("Failed to serialize config to TOML: {0}")]
    TomlSer(#[from] toml::ser::Error),

    /// Invalid configuration value
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration file not found
    #[error("Configuration file not found at {0}")]
    FileNotFound(PathBuf),
}

/// Orchestrator timing settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OrchestratorConfig {
    /// Milliseconds to wait for a graceful disconnect confirmation
    /// before escalating (default: 3000)
    #[serde(default = "default_disconnect_timeout_ms")]
    pub disconnect_timeout_ms: u64,

    /// Milliseconds to wait after a force-stop before declaring the
    /// disconnect failed (default: 2000)
    #[serde(default = "default_force_disconnect_timeout_ms")]
    pub force_disconnect_timeout_ms: u64,
}

fn default_disconnect_timeout_ms() -> u64 {
    3000
}

fn default_force_disconnect_timeout_ms() -> u64 {
    2000
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        OrchestratorConfig {
            disconnect_timeout_ms: default_disconnect_timeout_ms(),
            force_disconnect_timeout_ms: default_force_disconnect_timeout_ms(),
        }
    }
}

/// OpenVPN backend settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OpenVpnConfig {
    /// Milliseconds to let an asynchronous engine teardown settle before
    /// starting a new session (default: 300)
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,
}

fn default_settle_delay_ms() -> u64 {
    300
}

impl Default for OpenVpnConfig {
    fn default() -> Self {
        OpenVpnConfig {
            settle_delay_ms: default_settle_delay_ms(),
        }
    }
}

/// WireGuard backend settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WireGuardConfig {
    /// Retries after an initialization-timeout failure (default: 3)
    #[serde(default = "default_init_retries")]
    pub init_retries: u32,

    /// Fixed backoff between retries, in milliseconds (default: 500)
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// Interval for polling byte counters while connected, in
    /// milliseconds (default: 1000)
    #[serde(default = "default_stats_interval_ms")]
    pub stats_interval_ms: u64,
}

fn default_init_retries() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    500
}

fn default_stats_interval_ms() -> u64 {
    1000
}

impl Default for WireGuardConfig {
    fn default() -> Self {
        WireGuardConfig {
            init_retries: default_init_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            stats_interval_ms: default_stats_interval_ms(),
        }
    }
}

/// Trust store settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TrustConfig {
    /// Path to the encrypted trust store file. Defaults to
    /// `trusted_servers.enc` under the VeilLink data directory.
    pub store_path: Option<PathBuf>,
}

impl Default for TrustConfig {
    fn default() -> Self {
        TrustConfig { store_path: None }
    }
}

impl TrustConfig {
    /// Resolve the effective store path.
    pub fn resolved_store_path(&self) -> PathBuf {
        if let Some(path) = &self.store_path {
            return path.clone();
        }
        default_data_dir().join("trusted_servers.enc")
    }
}

/// Logging settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error (default: info)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to also log to a rolling file (default: false)
    #[serde(default)]
    pub log_to_file: bool,

    /// Directory for log files (default: "./logs")
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_dir() -> String {
    "./logs".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: default_log_level(),
            log_to_file: false,
            log_dir: default_log_dir(),
        }
    }
}

/// Top-level client configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ClientConfig {
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,

    #[serde(default)]
    pub openvpn: OpenVpnConfig,

    #[serde(default)]
    pub wireguard: WireGuardConfig,

    #[serde(default)]
    pub trust: TrustConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl ClientConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.to_path_buf()));
        }
        let contents = fs::read_to_string(path)?;
        let config: ClientConfig = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from the default location, falling back to defaults when the
    /// file does not exist.
    pub fn load_or_default() -> Result<Self, ConfigError> {
        let path = default_config_path();
        match Self::load(&path) {
            Ok(config) => Ok(config),
            Err(ConfigError::FileNotFound(_)) => Ok(ClientConfig::default()),
            Err(e) => Err(e),
        }
    }

    /// Serialize the configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.orchestrator.disconnect_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue {
                key: "orchestrator.disconnect_timeout_ms".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }
        if self.orchestrator.force_disconnect_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue {
                key: "orchestrator.force_disconnect_timeout_ms".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }
        if self.wireguard.stats_interval_ms == 0 {
            return Err(ConfigError::InvalidValue {
                key: "wireguard.stats_interval_ms".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }
        match self.logging.level.as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            other => {
                return Err(ConfigError::InvalidValue {
                    key: "logging.level".to_string(),
                    message: format!("unknown log level '{}'", other),
                });
            }
        }
        Ok(())
    }

    /// Graceful disconnect confirmation window.
    pub fn disconnect_timeout(&self) -> Duration {
        Duration::from_millis(self.orchestrator.disconnect_timeout_ms)
    }

    /// Post-force-stop confirmation window.
    pub fn force_disconnect_timeout(&self) -> Duration {
        Duration::from_millis(self.orchestrator.force_disconnect_timeout_ms)
    }
}

/// Default configuration file path: `<config dir>/veillink/config.toml`.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("veillink")
        .join("config.toml")
}

/// Default data directory: `<data dir>/veillink`.
pub fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("veillink")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn defaults_are_valid() {
        let config = ClientConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.orchestrator.disconnect_timeout_ms, 3000);
        assert_eq!(config.orchestrator.force_disconnect_timeout_ms, 2000);
        assert_eq!(config.wireguard.init_retries, 3);
    }

    #[test]
    fn load_partial_file_fills_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[wireguard]\ninit_retries = 5\n\n[logging]\nlevel = \"debug\"\n"
        )
        .unwrap();

        let config = ClientConfig::load(file.path()).unwrap();
        assert_eq!(config.wireguard.init_retries, 5);
        assert_eq!(config.logging.level, "debug");
        // Untouched sections keep defaults
        assert_eq!(config.openvpn.settle_delay_ms, 300);
    }

    #[test]
    fn rejects_zero_timeout() {
        let config = ClientConfig {
            orchestrator: OrchestratorConfig {
                disconnect_timeout_ms: 0,
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_unknown_log_level() {
        let config = ClientConfig {
            logging: LoggingConfig {
                level: "verbose".to_string(),
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn missing_file_is_reported() {
        let result = ClientConfig::load("/nonexistent/veillink.toml");
        assert!(matches!(result, Err(ConfigError::FileNotFound(_))));
    }

    #[test]
    fn round_trips_through_toml() {
        let config = ClientConfig::default();
        let text = config.to_toml().unwrap();
        let parsed: ClientConfig = toml::from_str(&text).unwrap();
        assert_eq!(
            parsed.orchestrator.disconnect_timeout_ms,
            config.orchestrator.disconnect_timeout_ms
        );
    }
}
