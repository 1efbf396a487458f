//! Trait abstractions for the two collaborators of the reconciliation core.
//!
//! - [`SensorLink`] is implemented by [`crate::ThingyDevice`] (real BLE) and
//!   [`crate::MockSensorLink`] (tests).
//! - [`ShadowChannel`] is implemented by the MQTT channel in thingy-bridge and
//!   by [`crate::MockShadowChannel`] (tests).

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use thingy_types::NotificationKind;

use crate::error::Result;

/// A raw notification frame as delivered by the sensor link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawNotification {
    /// Which characteristic produced the frame.
    pub kind: NotificationKind,
    /// Undecoded frame bytes.
    pub data: Vec<u8>,
}

impl RawNotification {
    /// Create a new raw notification.
    pub fn new(kind: NotificationKind, data: impl Into<Vec<u8>>) -> Self {
        Self {
            kind,
            data: data.into(),
        }
    }
}

/// Trait abstracting the BLE sensor.
///
/// Notifications are queued by the link as they arrive and handed to the
/// caller's handler inside [`wait_for_events`](SensorLink::wait_for_events),
/// so the handler always runs on the caller's task.
///
/// # Example
///
/// ```ignore
/// use std::time::Duration;
/// use thingy_core::{SensorLink, RawNotification};
///
/// async fn drain<L: SensorLink>(link: &L) -> thingy_core::Result<usize> {
///     link.wait_for_events(Duration::from_secs(10), &|n: RawNotification| {
///         println!("{}: {:02X?}", n.kind, n.data);
///     })
///     .await
/// }
/// ```
#[async_trait]
pub trait SensorLink: Send + Sync {
    /// Get the device address or identifier.
    fn address(&self) -> &str;

    /// Enable notifications for the given kinds.
    async fn enable_notifications(&self, kinds: &[NotificationKind]) -> Result<()>;

    /// Wait until at least one notification is queued or `timeout` elapses,
    /// then dispatch every queued notification to `handler`.
    ///
    /// Returns the number of notifications dispatched (0 on timeout).
    async fn wait_for_events(
        &self,
        timeout: Duration,
        handler: &(dyn Fn(RawNotification) + Send + Sync),
    ) -> Result<usize>;

    /// Disconnect from the device.
    async fn disconnect(&self) -> Result<()>;
}

/// Outcome reported for a shadow request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResponseStatus {
    /// The shadow service stored the update.
    Accepted,
    /// The shadow service refused the update.
    Rejected,
    /// No response arrived within the request's timeout.
    Timeout,
    /// A desired-state push, not tied to any request.
    Delta,
}

impl fmt::Display for ResponseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResponseStatus::Accepted => write!(f, "accepted"),
            ResponseStatus::Rejected => write!(f, "rejected"),
            ResponseStatus::Timeout => write!(f, "timeout"),
            ResponseStatus::Delta => write!(f, "delta"),
        }
    }
}

/// A response delivered by a shadow channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShadowResponse {
    /// Raw JSON body (empty for timeouts).
    pub payload: String,
    /// Outcome of the request.
    pub status: ResponseStatus,
    /// Correlation token of the originating request (empty for deltas
    /// that carry none).
    pub token: String,
}

impl ShadowResponse {
    /// Create a new response.
    pub fn new(payload: impl Into<String>, status: ResponseStatus, token: impl Into<String>) -> Self {
        Self {
            payload: payload.into(),
            status,
            token: token.into(),
        }
    }

    /// Create a timeout response for a token.
    pub fn timeout(token: impl Into<String>) -> Self {
        Self::new(String::new(), ResponseStatus::Timeout, token)
    }
}

/// Callback invoked by a shadow channel on its own delivery path.
///
/// Handlers must not block.
pub type ShadowHandler = Arc<dyn Fn(ShadowResponse) + Send + Sync>;

/// Trait abstracting the shadow service connection.
///
/// Handlers are invoked asynchronously with respect to the calls that
/// register them, possibly on another task or thread, and in no particular
/// order. Responses to updates are identified by token only.
#[async_trait]
pub trait ShadowChannel: Send + Sync {
    /// Register a handler for desired-state deltas of `thing_name`.
    async fn subscribe_delta(&self, thing_name: &str, handler: ShadowHandler) -> Result<()>;

    /// Send an update document for `thing_name`.
    ///
    /// Returns the correlation token immediately; `handler` is invoked once
    /// with `Accepted`, `Rejected` or `Timeout` for that token.
    async fn update(
        &self,
        thing_name: &str,
        payload: &str,
        handler: ShadowHandler,
        timeout: Duration,
    ) -> Result<String>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_status_display() {
        assert_eq!(ResponseStatus::Accepted.to_string(), "accepted");
        assert_eq!(ResponseStatus::Rejected.to_string(), "rejected");
        assert_eq!(ResponseStatus::Timeout.to_string(), "timeout");
        assert_eq!(ResponseStatus::Delta.to_string(), "delta");
    }

    #[test]
    fn test_timeout_response_has_empty_payload() {
        let response = ShadowResponse::timeout("tok");
        assert_eq!(response.status, ResponseStatus::Timeout);
        assert!(response.payload.is_empty());
        assert_eq!(response.token, "tok");
    }
}
