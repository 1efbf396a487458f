//! Bridge configuration.
//!
//! Settings come from an optional TOML file and are then overridden by
//! command-line flags. [`Config::validate`] reports every problem at once.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use thingy_core::{ConnectionConfig, ReconcileOptions};

use crate::backoff::BackoffConfig;

/// Sensor address shipped in sample configurations; never a real device.
pub const PLACEHOLDER_ADDRESS: &str = "xx:XX:xx:XX:xx:XX";

/// Bridge configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Shadow service connection.
    pub shadow: ShadowConfig,
    /// Sensor settings.
    pub sensor: SensorConfig,
    /// Reconciliation loop timing.
    pub reconcile: ReconcileConfig,
    /// MQTT session tuning.
    pub mqtt: MqttConfig,
}

impl Config {
    /// Load configuration from the default path, or defaults if it is absent.
    pub fn load_default() -> Result<Self, ConfigError> {
        let path = default_config_path();
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load configuration from a file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Read {
            path: path.as_ref().to_path_buf(),
            source: e,
        })?;
        toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.as_ref().to_path_buf(),
            source: e,
        })
    }

    /// Save configuration to a file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self).map_err(ConfigError::Serialize)?;

        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::Write {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }

        std::fs::write(path.as_ref(), content).map_err(|e| ConfigError::Write {
            path: path.as_ref().to_path_buf(),
            source: e,
        })
    }

    /// Validate the configuration and return all errors found.
    ///
    /// This checks:
    /// - The shadow endpoint, root CA and thing name are present
    /// - Certificate and private key are both present
    /// - The sensor address is set and is not the sample placeholder
    /// - Port, intervals and timeouts are non-zero
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();
        errors.extend(self.shadow.validate());
        errors.extend(self.sensor.validate());
        errors.extend(self.reconcile.validate());
        errors.extend(self.mqtt.validate());

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(errors))
        }
    }

    /// Load and validate configuration from a file.
    pub fn load_validated<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config = Self::load(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Options for the reconciliation loop.
    pub fn reconcile_options(&self) -> ReconcileOptions {
        ReconcileOptions::builder()
            .wake_interval(Duration::from_secs(self.reconcile.wake_interval_secs))
            .update_timeout(Duration::from_secs(self.reconcile.update_timeout_secs))
            .build()
    }

    /// BLE connection settings.
    pub fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig::default()
            .connection_timeout(Duration::from_secs(self.sensor.connect_timeout_secs))
            .temperature_interval_ms(self.sensor.temperature_interval_ms)
    }

    /// Reconnect backoff for the MQTT session.
    pub fn backoff(&self) -> BackoffConfig {
        BackoffConfig {
            base: Duration::from_secs(self.mqtt.backoff_base_secs),
            max: Duration::from_secs(self.mqtt.backoff_max_secs),
            stable_after: Duration::from_secs(self.mqtt.backoff_stable_after_secs),
        }
    }
}

/// Shadow service connection settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShadowConfig {
    /// AWS IoT endpoint host, optionally with `:port`.
    pub endpoint: String,
    /// MQTT over TLS port.
    pub port: u16,
    /// Root CA certificate (PEM).
    pub root_ca: Option<PathBuf>,
    /// Client certificate (PEM).
    pub cert: Option<PathBuf>,
    /// Client private key (PEM).
    pub key: Option<PathBuf>,
    /// Thing whose shadow is updated.
    pub thing_name: String,
    /// MQTT client identifier.
    pub client_id: String,
}

impl Default for ShadowConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            port: 8883,
            root_ca: None,
            cert: None,
            key: None,
            thing_name: "Bot".to_string(),
            client_id: "basicShadowDeltaListener".to_string(),
        }
    }
}

impl ShadowConfig {
    /// Validate shadow connection settings.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if self.endpoint.trim().is_empty() {
            errors.push(ValidationError::new(
                "shadow.endpoint",
                "endpoint is required",
            ));
        }
        if self.port == 0 {
            errors.push(ValidationError::new("shadow.port", "port must be non-zero"));
        }
        if self.root_ca.is_none() {
            errors.push(ValidationError::new(
                "shadow.root_ca",
                "root CA certificate is required",
            ));
        }
        if self.cert.is_none() || self.key.is_none() {
            errors.push(ValidationError::new(
                "shadow.cert",
                "Missing credentials for authentication.",
            ));
        }
        if self.thing_name.trim().is_empty() {
            errors.push(ValidationError::new(
                "shadow.thing_name",
                "thing name cannot be empty",
            ));
        }
        if self.client_id.trim().is_empty() {
            errors.push(ValidationError::new(
                "shadow.client_id",
                "client id cannot be empty",
            ));
        }

        errors
    }
}

/// Sensor settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorConfig {
    /// MAC address (or CoreBluetooth UUID on macOS).
    pub address: String,
    /// Temperature sampling interval written to the sensor.
    pub temperature_interval_ms: u16,
    /// BLE connect timeout.
    pub connect_timeout_secs: u64,
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            address: PLACEHOLDER_ADDRESS.to_string(),
            temperature_interval_ms: thingy_core::device::DEFAULT_TEMPERATURE_INTERVAL_MS,
            connect_timeout_secs: 15,
        }
    }
}

impl SensorConfig {
    /// Validate sensor settings.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        let address = self.address.trim();
        if address.is_empty() {
            errors.push(ValidationError::new(
                "sensor.address",
                "sensor address is required",
            ));
        } else if address.eq_ignore_ascii_case(PLACEHOLDER_ADDRESS) {
            errors.push(ValidationError::new(
                "sensor.address",
                format!("'{}' is a placeholder, set the sensor's address", address),
            ));
        }

        let min = thingy_types::uuids::MIN_TEMPERATURE_INTERVAL_MS;
        let max = thingy_types::uuids::MAX_TEMPERATURE_INTERVAL_MS;
        if !(min..=max).contains(&self.temperature_interval_ms) {
            errors.push(ValidationError::new(
                "sensor.temperature_interval_ms",
                format!(
                    "interval {}ms is out of range ({}-{}ms)",
                    self.temperature_interval_ms, min, max
                ),
            ));
        }
        if self.connect_timeout_secs == 0 {
            errors.push(ValidationError::new(
                "sensor.connect_timeout_secs",
                "timeout must be non-zero",
            ));
        }

        errors
    }
}

/// Reconciliation loop timing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcileConfig {
    /// Upper bound on one event wait; also the retry cadence.
    pub wake_interval_secs: u64,
    /// Per-update acknowledgement timeout.
    pub update_timeout_secs: u64,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            wake_interval_secs: 10,
            update_timeout_secs: 5,
        }
    }
}

impl ReconcileConfig {
    /// Validate loop timing.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        if self.wake_interval_secs == 0 {
            errors.push(ValidationError::new(
                "reconcile.wake_interval_secs",
                "interval must be non-zero",
            ));
        }
        if self.update_timeout_secs == 0 {
            errors.push(ValidationError::new(
                "reconcile.update_timeout_secs",
                "timeout must be non-zero",
            ));
        }
        errors
    }
}

/// MQTT session tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    /// Keep-alive interval.
    pub keep_alive_secs: u64,
    /// Time allowed for the first CONNACK.
    pub connect_timeout_secs: u64,
    /// First reconnect delay.
    pub backoff_base_secs: u64,
    /// Longest reconnect delay.
    pub backoff_max_secs: u64,
    /// Connection lifetime after which the reconnect delay resets.
    pub backoff_stable_after_secs: u64,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            keep_alive_secs: 30,
            connect_timeout_secs: 10,
            backoff_base_secs: 1,
            backoff_max_secs: 32,
            backoff_stable_after_secs: 20,
        }
    }
}

impl MqttConfig {
    /// Validate session tuning.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if self.keep_alive_secs < 5 {
            errors.push(ValidationError::new(
                "mqtt.keep_alive_secs",
                format!("keep-alive {}s is too short (minimum 5s)", self.keep_alive_secs),
            ));
        }
        if self.connect_timeout_secs == 0 {
            errors.push(ValidationError::new(
                "mqtt.connect_timeout_secs",
                "timeout must be non-zero",
            ));
        }
        if self.backoff_base_secs == 0 {
            errors.push(ValidationError::new(
                "mqtt.backoff_base_secs",
                "backoff base must be non-zero",
            ));
        }
        if self.backoff_max_secs < self.backoff_base_secs {
            errors.push(ValidationError::new(
                "mqtt.backoff_max_secs",
                format!(
                    "backoff max {}s is below base {}s",
                    self.backoff_max_secs, self.backoff_base_secs
                ),
            ));
        }

        errors
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("Failed to serialize config: {0}")]
    Serialize(toml::ser::Error),
    #[error("Failed to write config file {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Configuration validation failed:\n{}", format_validation_errors(.0))]
    Validation(Vec<ValidationError>),
}

/// A single validation error with context.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationError {
    /// The field path (e.g., `shadow.endpoint`).
    pub field: String,
    /// Description of the validation failure.
    pub message: String,
}

impl ValidationError {
    fn new(field: &str, message: impl Into<String>) -> Self {
        Self {
            field: field.to_string(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

fn format_validation_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| format!("  - {}", e))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("thingy-shadow")
        .join("bridge.toml")
}
