//! Platform-agnostic types for the Thingy:52 shadow bridge.
//!
//! This crate provides the types shared by the BLE side (thingy-core) and the
//! shadow transport (thingy-bridge) without pulling in either stack.
//!
//! # Features
//!
//! - Notification frame decoding (temperature, button)
//! - Device shadow documents (update, accepted, rejected, delta)
//! - UUID constants for Thingy:52 services and characteristics
//! - Error types for parsing
//!
//! # Example
//!
//! ```
//! use thingy_types::{ShadowDocument, TemperatureReading};
//!
//! let reading = TemperatureReading::from_bytes(&[0x15, 0x32]).unwrap();
//! let doc = ShadowDocument::reported_temperature(reading.celsius());
//! assert_eq!(
//!     doc.to_json().unwrap(),
//!     r#"{"state":{"reported":{"temperature":"21"}}}"#
//! );
//! ```

pub mod error;
pub mod shadow;
pub mod types;
pub mod uuid;

pub use error::{ParseError, ParseResult};
pub use shadow::{DeltaPayload, RejectedPayload, ShadowDocument, ShadowState};
pub use types::{ButtonState, NotificationKind, TemperatureReading, decode_temperature_byte};
pub use uuid as uuids;
