//! Configuration file model.
//!
//! The root controller reads a single file listing the bus controllers to
//! instantiate at startup and the devices to attach to them. JSON is the
//! default format; a path ending in `.toml` is read and written as TOML.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::retry::RetryPolicy;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "nvos_config.json";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("failed to serialize configuration: {0}")]
    Serialize(String),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Log output settings. `RUST_LOG` takes precedence over `level`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArbiterSettings {
    /// How long a driver waits for a bus resource held by someone else.
    pub acquire_timeout_ms: u64,
}

impl ArbiterSettings {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }
}

impl Default for ArbiterSettings {
    fn default() -> Self {
        Self {
            acquire_timeout_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverSettings {
    /// Attempts per hardware operation, including the first.
    pub retry_attempts: u32,
    pub retry_backoff_ms: u64,
    /// Upper bound on a single transport read or write.
    pub io_timeout_ms: u64,
}

impl DriverSettings {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retry_attempts,
            Duration::from_millis(self.retry_backoff_ms),
        )
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }
}

impl Default for DriverSettings {
    fn default() -> Self {
        Self {
            retry_attempts: 3,
            retry_backoff_ms: 50,
            io_timeout_ms: 500,
        }
    }
}

/// A bus controller to instantiate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControllerConfig {
    pub name: String,
    /// Transport kind, e.g. `i2c` or `pwm_sysfs`.
    pub kind: String,
    /// Channels the controller may hand out. `None` allows any channel.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<Vec<u32>>,
    /// Backend specific settings.
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub data: serde_json::Value,
}

impl ControllerConfig {
    pub fn new(name: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
            channels: None,
            data: serde_json::Value::Null,
        }
    }

    pub fn with_channels(mut self, channels: Vec<u32>) -> Self {
        self.channels = Some(channels);
        self
    }
}

/// A device to attach at startup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub address: String,
    pub driver: String,
    pub controller: String,
    /// Friendly name override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Capability tags to advertise. `None` advertises everything the driver implements.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<Vec<String>>,
    /// Driver specific settings.
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub data: serde_json::Value,
}

impl DeviceConfig {
    pub fn new(
        address: impl Into<String>,
        driver: impl Into<String>,
        controller: impl Into<String>,
    ) -> Self {
        Self {
            address: address.into(),
            driver: driver.into(),
            controller: controller.into(),
            name: None,
            capabilities: None,
            data: serde_json::Value::Null,
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }
}

/// Root configuration document.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Configuration {
    pub logging: LoggingSettings,
    pub arbiter: ArbiterSettings,
    pub driver: DriverSettings,
    pub controllers: Vec<ControllerConfig>,
    pub devices: Vec<DeviceConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Format {
    Json,
    Toml,
}

impl Format {
    fn for_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("toml") => Format::Toml,
            _ => Format::Json,
        }
    }
}

impl Configuration {
    /// Parse a configuration document and validate it.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let config: Configuration = match Format::for_path(path) {
            Format::Json => serde_json::from_str(&text).map_err(|e| ConfigError::Parse {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?,
            Format::Toml => toml::from_str(&text).map_err(|e| ConfigError::Parse {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Load `path`, writing a default document first if it does not exist.
    pub fn load_or_create(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            tracing::warn!(path = %path.display(), "configuration file missing, writing defaults");
            Configuration::default().save(path)?;
        }
        Self::load(path)
    }

    /// Write the configuration, keeping the previous file as `<path>.bak`.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let text = self.render(Format::for_path(path))?;

        if path.exists() {
            let backup = backup_path(path);
            std::fs::copy(path, &backup).map_err(|source| ConfigError::Io {
                path: backup.clone(),
                source,
            })?;
            tracing::debug!(backup = %backup.display(), "configuration backed up");
        }

        std::fs::write(path, text).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    fn render(&self, format: Format) -> Result<String, ConfigError> {
        match format {
            Format::Json => serde_json::to_string_pretty(self)
                .map_err(|e| ConfigError::Serialize(e.to_string())),
            Format::Toml => {
                toml::to_string_pretty(self).map_err(|e| ConfigError::Serialize(e.to_string()))
            }
        }
    }

    /// Check structural rules that parsing alone cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.driver.retry_attempts == 0 {
            return Err(ConfigError::Invalid(
                "driver.retry_attempts must be at least 1".to_string(),
            ));
        }

        let mut names = HashSet::new();
        for controller in &self.controllers {
            if controller.name.trim().is_empty() {
                return Err(ConfigError::Invalid(
                    "controller name cannot be empty".to_string(),
                ));
            }
            if !names.insert(controller.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate controller name '{}'",
                    controller.name
                )));
            }
        }

        let mut addresses = HashSet::new();
        for device in &self.devices {
            if device.address.trim().is_empty() {
                return Err(ConfigError::Invalid(
                    "device address cannot be empty".to_string(),
                ));
            }
            if !addresses.insert(device.address.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate device address '{}'",
                    device.address
                )));
            }
        }

        Ok(())
    }
}

fn backup_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".bak");
    PathBuf::from(name)
}
