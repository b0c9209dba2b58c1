//! Configuration management for the Portlink host.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/portlink/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default key the persisted address set is stored under.
pub const DEFAULT_STORAGE_KEY: &str = "portlink.connections";

/// File name of the file-backed store inside the data directory.
pub const STORE_FILE_NAME: &str = "connections.json";

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("eviction_interval_secs must be between 1 and 86400, got {0}")]
    InvalidEvictionInterval(u64),

    #[error("request_timeout_secs must be between 0 and 3600, got {0}")]
    InvalidRequestTimeout(u64),

    #[error("storage_key must not be empty")]
    EmptyStorageKey,

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Main configuration structure for the Portlink host.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// General host configuration.
    pub host: HostConfig,

    /// Connection registry configuration.
    pub registry: RegistryConfig,

    /// Per-connection settings.
    pub connection: ConnectionConfig,
}

/// General host configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HostConfig {
    /// Directory for storing host data (persisted connections).
    pub data_dir: PathBuf,

    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,
}

/// Connection registry configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RegistryConfig {
    /// Address connections by frame as well as logical name and session.
    pub multi_frame: bool,

    /// Seconds between sweeps for frame groups that lost their base frame.
    pub eviction_interval_secs: u64,

    /// Store key of the persisted address set.
    pub storage_key: String,

    /// Ping previously registered clients on start.
    pub restore_on_start: bool,
}

/// Per-connection settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Seconds to wait for a reply (0 = wait until the connection closes).
    pub request_timeout_secs: u64,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            log_level: "info".to_string(),
        }
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            multi_frame: true,
            eviction_interval_secs: 30,
            storage_key: DEFAULT_STORAGE_KEY.to_string(),
            restore_on_start: true,
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: 0,
        }
    }
}

impl RegistryConfig {
    pub fn eviction_interval(&self) -> Duration {
        Duration::from_secs(self.eviction_interval_secs)
    }
}

impl ConnectionConfig {
    /// The request timeout, `None` when disabled.
    pub fn request_timeout(&self) -> Option<Duration> {
        (self.request_timeout_secs > 0).then(|| Duration::from_secs(self.request_timeout_secs))
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("portlink")
        .join("config.toml")
}

/// Returns the default data directory path.
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("portlink")
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - PORTLINK_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    /// - PORTLINK_DATA_DIR: Override the data directory
    pub fn apply_env_overrides(&mut self) {
        if let Ok(level) = std::env::var("PORTLINK_LOG_LEVEL") {
            if !level.is_empty() {
                tracing::info!("Overriding log_level from environment: {}", level);
                self.host.log_level = level;
            }
        }

        if let Ok(dir) = std::env::var("PORTLINK_DATA_DIR") {
            if !dir.is_empty() {
                tracing::info!("Overriding data_dir from environment: {}", dir);
                self.host.data_dir = PathBuf::from(dir);
            }
        }
    }

    /// Validate the configuration values.
    ///
    /// Returns an error if any configuration value is outside the valid range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let interval = self.registry.eviction_interval_secs;
        if !(1..=86400).contains(&interval) {
            return Err(ConfigError::InvalidEvictionInterval(interval));
        }

        if self.connection.request_timeout_secs > 3600 {
            return Err(ConfigError::InvalidRequestTimeout(
                self.connection.request_timeout_secs,
            ));
        }

        if self.registry.storage_key.trim().is_empty() {
            return Err(ConfigError::EmptyStorageKey);
        }

        let level = self.host.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.host.log_level.clone()));
        }

        Ok(())
    }

    /// Path of the file-backed persistence store.
    pub fn store_path(&self) -> PathBuf {
        self.host.data_dir.join(STORE_FILE_NAME)
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
    /// If the file exists but is invalid TOML, returns an error with
    /// a helpful message.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self> {
        Self::load(default_config_path())
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", format_toml_error(&e)))
    }

    /// Save configuration to a file.
    ///
    /// Creates parent directories if they don't exist.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let contents = self.to_toml()?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::debug!("Configuration saved to {:?}", path);
        Ok(())
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}
