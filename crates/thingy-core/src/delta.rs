//! Handling of desired-state pushes from the shadow service.
//!
//! The handler runs on the channel's delivery path. It logs each delta and
//! forwards the desired temperature to an optional [`DesiredStateSink`]; it
//! never touches the [`ShadowStateStore`](crate::ShadowStateStore).

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use thingy_types::DeltaPayload;

use crate::traits::{ResponseStatus, ShadowHandler, ShadowResponse};

/// A desired temperature pushed by the shadow service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DesiredTemperature {
    /// Desired value.
    pub temperature: i32,
    /// Shadow version that produced it.
    pub version: u64,
}

/// Receiver for desired values, e.g. an actuator.
///
/// Implementations are called on the channel's delivery path and must not
/// block.
pub trait DesiredStateSink: Send + Sync {
    /// Act on a desired temperature.
    fn apply_desired(&self, desired: DesiredTemperature);
}

/// Result of handling one delta.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeltaOutcome {
    /// The delta was logged and forwarded.
    Applied(DesiredTemperature),
    /// The delta's version was not newer than the last one seen.
    Stale {
        /// Version carried by the delta.
        version: u64,
    },
    /// The payload could not be interpreted.
    Malformed(String),
}

/// Handler for `update/delta` pushes.
pub struct DeltaHandler {
    sink: Option<Arc<dyn DesiredStateSink>>,
    last_version: Mutex<Option<u64>>,
}

impl std::fmt::Debug for DeltaHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeltaHandler")
            .field("has_sink", &self.sink.is_some())
            .field("last_version", &*self.last_version.lock())
            .finish()
    }
}

impl Default for DeltaHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl DeltaHandler {
    /// Create a handler that only logs.
    pub fn new() -> Self {
        Self {
            sink: None,
            last_version: Mutex::new(None),
        }
    }

    /// Create a handler that forwards desired values to `sink`.
    pub fn with_sink(sink: Arc<dyn DesiredStateSink>) -> Self {
        Self {
            sink: Some(sink),
            last_version: Mutex::new(None),
        }
    }

    /// Highest delta version seen so far, `None` before the first delta.
    pub fn last_version(&self) -> Option<u64> {
        *self.last_version.lock()
    }

    /// Handle one delta response.
    pub fn handle(&self, response: &ShadowResponse) -> DeltaOutcome {
        if response.status != ResponseStatus::Delta {
            debug!(status = %response.status, "Non-delta response delivered to delta handler");
        }

        let delta = match DeltaPayload::from_json(&response.payload) {
            Ok(delta) => delta,
            Err(e) => {
                warn!(error = %e, payload = %response.payload, "Malformed delta");
                return DeltaOutcome::Malformed(e.to_string());
            }
        };

        // Deltas may arrive out of order after a reconnect.
        {
            let mut last = self.last_version.lock();
            if let Some(previous) = *last
                && delta.version <= previous
            {
                debug!(version = delta.version, last_version = previous, "Ignoring stale delta");
                return DeltaOutcome::Stale {
                    version: delta.version,
                };
            }
            *last = Some(delta.version);
        }

        let temperature = match delta.desired_temperature() {
            Ok(temperature) => temperature,
            Err(e) => {
                warn!(version = delta.version, error = %e, "Delta carries no usable temperature");
                return DeltaOutcome::Malformed(e.to_string());
            }
        };

        let desired = DesiredTemperature {
            temperature,
            version: delta.version,
        };
        info!(temperature, version = delta.version, "Delta received");
        if let Some(sink) = &self.sink {
            sink.apply_desired(desired);
        }
        DeltaOutcome::Applied(desired)
    }

    /// Wrap the handler for [`ShadowChannel::subscribe_delta`](crate::ShadowChannel::subscribe_delta).
    pub fn into_handler(self: Arc<Self>) -> ShadowHandler {
        Arc::new(move |response: ShadowResponse| {
            self.handle(&response);
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct RecordingSink {
        seen: Mutex<Vec<DesiredTemperature>>,
    }

    impl DesiredStateSink for RecordingSink {
        fn apply_desired(&self, desired: DesiredTemperature) {
            self.seen.lock().push(desired);
        }
    }

    fn delta(payload: &str) -> ShadowResponse {
        ShadowResponse::new(payload, ResponseStatus::Delta, "")
    }

    #[test]
    fn test_delta_forwarded_to_sink() {
        let sink = Arc::new(RecordingSink::default());
        let handler = DeltaHandler::with_sink(sink.clone());

        let outcome = handler.handle(&delta(r#"{"state":{"temperature":25},"version":8}"#));
        let expected = DesiredTemperature {
            temperature: 25,
            version: 8,
        };
        assert_eq!(outcome, DeltaOutcome::Applied(expected));
        assert_eq!(*sink.seen.lock(), vec![expected]);
        assert_eq!(handler.last_version(), Some(8));
    }

    #[test]
    fn test_delta_string_temperature() {
        let handler = DeltaHandler::new();
        let outcome = handler.handle(&delta(r#"{"state":{"temperature":"-4"},"version":2}"#));
        assert!(matches!(
            outcome,
            DeltaOutcome::Applied(DesiredTemperature { temperature: -4, .. })
        ));
    }

    #[test]
    fn test_stale_delta_ignored() {
        let sink = Arc::new(RecordingSink::default());
        let handler = DeltaHandler::with_sink(sink.clone());

        handler.handle(&delta(r#"{"state":{"temperature":25},"version":8}"#));
        let outcome = handler.handle(&delta(r#"{"state":{"temperature":19},"version":7}"#));
        assert_eq!(outcome, DeltaOutcome::Stale { version: 7 });
        let outcome = handler.handle(&delta(r#"{"state":{"temperature":19},"version":8}"#));
        assert_eq!(outcome, DeltaOutcome::Stale { version: 8 });
        assert_eq!(sink.seen.lock().len(), 1);
    }

    #[test]
    fn test_first_delta_at_version_zero_applied() {
        let sink = Arc::new(RecordingSink::default());
        let handler = DeltaHandler::with_sink(sink.clone());
        assert_eq!(handler.last_version(), None);

        let outcome = handler.handle(&delta(r#"{"state":{"temperature":21},"version":0}"#));
        assert!(matches!(
            outcome,
            DeltaOutcome::Applied(DesiredTemperature { temperature: 21, version: 0 })
        ));
        assert_eq!(handler.last_version(), Some(0));

        let outcome = handler.handle(&delta(r#"{"state":{"temperature":22},"version":0}"#));
        assert_eq!(outcome, DeltaOutcome::Stale { version: 0 });
        assert_eq!(sink.seen.lock().len(), 1);
    }

    #[test]
    fn test_malformed_delta_does_not_panic() {
        let handler = DeltaHandler::new();
        assert!(matches!(
            handler.handle(&delta("{")),
            DeltaOutcome::Malformed(_)
        ));
        assert!(matches!(
            handler.handle(&delta(r#"{"state":{"temperature":25}}"#)),
            DeltaOutcome::Malformed(_)
        ));
        assert!(matches!(
            handler.handle(&delta(r#"{"state":{"led":"on"},"version":3}"#)),
            DeltaOutcome::Malformed(_)
        ));
        assert_eq!(handler.last_version(), Some(3));
    }

    #[test]
    fn test_into_handler() {
        let sink = Arc::new(RecordingSink::default());
        let handler = Arc::new(DeltaHandler::with_sink(sink.clone()));
        let callback = Arc::clone(&handler).into_handler();

        callback(delta(r#"{"state":{"temperature":30},"version":1}"#));
        assert_eq!(sink.seen.lock().len(), 1);
        assert_eq!(handler.last_version(), Some(1));
    }
}
