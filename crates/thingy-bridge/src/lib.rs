//! Thingy:52 to AWS IoT device shadow bridge.
//!
//! This crate provides the pieces the `thingy-bridge` binary wires together:
//! - Configuration from a TOML file plus CLI overrides ([`config`])
//! - An MQTT shadow channel with mutual TLS, token-correlated responses and
//!   automatic reconnect ([`mqtt`])
//! - Reconnect backoff ([`backoff`])
//!
//! The reconciliation logic itself lives in `thingy-core`.
//!
//! # Configuration
//!
//! The bridge reads `~/.config/thingy-shadow/bridge.toml` (platform config
//! directory) when present:
//!
//! ```toml
//! [shadow]
//! endpoint = "abc123-ats.iot.eu-west-1.amazonaws.com"
//! root_ca = "/etc/thingy/AmazonRootCA1.pem"
//! cert = "/etc/thingy/device.pem.crt"
//! key = "/etc/thingy/private.pem.key"
//! thing_name = "Bot"
//!
//! [sensor]
//! address = "C8:2E:11:22:33:44"
//! temperature_interval_ms = 5000
//!
//! [reconcile]
//! wake_interval_secs = 10
//! update_timeout_secs = 5
//! ```

pub mod backoff;
pub mod config;
pub mod mqtt;

pub use backoff::{Backoff, BackoffConfig};
pub use config::{
    Config, ConfigError, MqttConfig, ReconcileConfig, SensorConfig, ShadowConfig, ValidationError,
};
pub use mqtt::{ChannelError, ChannelOptions, Credentials, MqttShadowChannel};
