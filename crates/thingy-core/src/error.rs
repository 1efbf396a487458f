//! Error types for thingy-core.
//!
//! This module defines the errors that can occur while talking to the
//! Thingy:52 over Bluetooth Low Energy and while handing updates to a
//! shadow channel.
//!
//! # Error Handling Policy
//!
//! | Error Type | Where it surfaces | Strategy |
//! |------------|-------------------|----------|
//! | [`Error::Bluetooth`] | connect, subscribe, configure | Fatal at startup |
//! | [`Error::DeviceNotFound`] | connect | Fatal at startup |
//! | [`Error::ConnectionFailed`] | connect | Fatal at startup |
//! | [`Error::Timeout`] | connect, characteristic I/O | Fatal at startup |
//! | [`Error::NotConnected`] | event wait after disconnect | Logged, loop keeps cycling |
//! | [`Error::Channel`] | shadow update publish | Logged, retried next cycle |
//! | [`Error::InvalidData`] | notification decode | Logged, frame discarded |
//! | [`Error::InvalidConfig`] | option validation | Fix configuration and restart |
//!
//! Steady-state errors never leave the reconciliation loop; only bootstrap
//! errors propagate to the caller.

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur in the sensor link or the reconciliation core.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new error variants
/// in future versions without breaking downstream code.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Bluetooth Low Energy error.
    #[error("Bluetooth error: {0}")]
    Bluetooth(#[from] btleplug::Error),

    /// Device not found during scan or connection.
    #[error("Device not found: {0}")]
    DeviceNotFound(DeviceNotFoundReason),

    /// Operation attempted while not connected to device.
    #[error("Not connected to device")]
    NotConnected,

    /// Required BLE characteristic not found on device.
    #[error("Characteristic not found: {uuid} (searched in {service_count} services)")]
    CharacteristicNotFound {
        /// The UUID that was not found.
        uuid: String,
        /// Number of services that were searched.
        service_count: usize,
    },

    /// Failed to parse data received from device.
    #[error("Invalid data: {0}")]
    InvalidData(String),

    /// Operation timed out.
    #[error("Operation '{operation}' timed out after {duration:?}")]
    Timeout {
        /// The operation that timed out.
        operation: String,
        /// The timeout duration.
        duration: Duration,
    },

    /// Operation was cancelled.
    #[error("Operation cancelled")]
    Cancelled,

    /// Connection failed with specific reason.
    #[error("Connection failed: {reason}")]
    ConnectionFailed {
        /// The device identifier that failed to connect.
        device_id: Option<String>,
        /// The structured reason for the failure.
        reason: ConnectionFailureReason,
    },

    /// The shadow channel could not accept a request.
    #[error("Shadow channel error: {0}")]
    Channel(String),

    /// Invalid configuration provided.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Structured reasons for connection failures.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new reasons
/// in future versions without breaking downstream code.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConnectionFailureReason {
    /// Bluetooth adapter not available or powered off.
    AdapterUnavailable,
    /// Connection attempt timed out.
    Timeout,
    /// The device does not expose the Thingy services.
    NotAThingy,
    /// Other/unknown error.
    Other(String),
}

impl std::fmt::Display for ConnectionFailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AdapterUnavailable => write!(f, "Bluetooth adapter unavailable"),
            Self::Timeout => write!(f, "connection timed out"),
            Self::NotAThingy => write!(f, "device does not expose Thingy:52 services"),
            Self::Other(msg) => write!(f, "{}", msg),
        }
    }
}

/// Reason why a device was not found.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum DeviceNotFoundReason {
    /// Device with specified address not found.
    NotFound { identifier: String },
    /// No Bluetooth adapter available.
    NoAdapter,
}

impl std::fmt::Display for DeviceNotFoundReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound { identifier } => write!(f, "device '{}' not found", identifier),
            Self::NoAdapter => write!(f, "no Bluetooth adapter available"),
        }
    }
}

impl Error {
    /// Create a device not found error for a specific identifier.
    pub fn device_not_found(identifier: impl Into<String>) -> Self {
        Self::DeviceNotFound(DeviceNotFoundReason::NotFound {
            identifier: identifier.into(),
        })
    }

    /// Create a timeout error with operation context.
    pub fn timeout(operation: impl Into<String>, duration: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            duration,
        }
    }

    /// Create a characteristic not found error.
    pub fn characteristic_not_found(uuid: impl Into<String>, service_count: usize) -> Self {
        Self::CharacteristicNotFound {
            uuid: uuid.into(),
            service_count,
        }
    }

    /// Create a shadow channel error.
    pub fn channel(message: impl Into<String>) -> Self {
        Self::Channel(message.into())
    }

    /// Create a configuration error.
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig(message.into())
    }

    /// Create a connection failure with structured reason.
    pub fn connection_failed(device_id: Option<String>, reason: ConnectionFailureReason) -> Self {
        Self::ConnectionFailed { device_id, reason }
    }
}

impl From<thingy_types::ParseError> for Error {
    fn from(err: thingy_types::ParseError) -> Self {
        Error::InvalidData(err.to_string())
    }
}

/// Result type alias using thingy-core's Error type.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::device_not_found("C8:2E:11:22:33:44");
        assert!(err.to_string().contains("C8:2E:11:22:33:44"));

        let err = Error::NotConnected;
        assert_eq!(err.to_string(), "Not connected to device");

        let err = Error::characteristic_not_found("ef680201", 4);
        assert!(err.to_string().contains("ef680201"));
        assert!(err.to_string().contains("4 services"));

        let err = Error::timeout("write characteristic", Duration::from_secs(10));
        assert!(err.to_string().contains("write characteristic"));
        assert!(err.to_string().contains("10s"));

        let err = Error::channel("client request queue closed");
        assert_eq!(
            err.to_string(),
            "Shadow channel error: client request queue closed"
        );
    }

    #[test]
    fn test_connection_failure_reasons() {
        let err = Error::connection_failed(None, ConnectionFailureReason::NotAThingy);
        assert!(err.to_string().contains("Thingy:52"));

        let err = Error::DeviceNotFound(DeviceNotFoundReason::NoAdapter);
        assert!(err.to_string().contains("no Bluetooth adapter"));
    }

    #[test]
    fn test_parse_error_conversion() {
        let parse = thingy_types::ParseError::invalid_length(2, 3);
        let err: Error = parse.into();
        assert!(matches!(err, Error::InvalidData(_)));
        assert!(err.to_string().contains("expected 2 bytes"));
    }

    #[test]
    fn test_btleplug_error_conversion() {
        fn _assert_from_impl<T: From<btleplug::Error>>() {}
        _assert_from_impl::<Error>();
    }
}
