//! Device shadow documents.
//!
//! Only the `temperature` property is interpreted; every other field of a
//! shadow document is carried through untouched.
//!
//! # Wire Formats
//!
//! | Document | Shape |
//! |----------|-------|
//! | Update request | `{"state":{"reported":{"temperature":"22"}}}` |
//! | Update accepted | `{"state":{"reported":{"temperature":"22"}},"version":7,"timestamp":1700000000}` |
//! | Update rejected | `{"code":400,"message":"Invalid JSON"}` |
//! | Delta | `{"state":{"temperature":25},"version":8}` |
//!
//! Temperatures are sent as strings. Incoming documents may carry either a
//! string or a JSON number.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use time::OffsetDateTime;

use crate::error::{ParseError, ParseResult};

/// Name of the only shadow property this system interprets.
pub const TEMPERATURE_FIELD: &str = "temperature";

/// A shadow document as sent in an update request or received in an
/// `accepted` response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShadowDocument {
    /// Reported and desired sections.
    pub state: ShadowState,
    /// Correlation token echoed back by the shadow service.
    #[serde(
        rename = "clientToken",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub client_token: Option<String>,
    /// Document version assigned by the shadow service.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
    /// Server timestamp (Unix seconds).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

/// The `state` section of a shadow document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ShadowState {
    /// Properties the device reports.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reported: Option<Map<String, Value>>,
    /// Properties the cloud side wants the device to adopt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub desired: Option<Map<String, Value>>,
}

impl ShadowDocument {
    /// Build an update request that asserts a reported temperature.
    ///
    /// # Examples
    ///
    /// ```
    /// use thingy_types::ShadowDocument;
    ///
    /// let doc = ShadowDocument::reported_temperature(22);
    /// assert_eq!(
    ///     doc.to_json().unwrap(),
    ///     r#"{"state":{"reported":{"temperature":"22"}}}"#
    /// );
    /// ```
    #[must_use]
    pub fn reported_temperature(value: i32) -> Self {
        let mut reported = Map::new();
        reported.insert(TEMPERATURE_FIELD.to_string(), Value::String(value.to_string()));
        Self {
            state: ShadowState {
                reported: Some(reported),
                desired: None,
            },
            client_token: None,
            version: None,
            timestamp: None,
        }
    }

    /// Parse a shadow document from JSON.
    pub fn from_json(payload: &str) -> ParseResult<Self> {
        Ok(serde_json::from_str(payload)?)
    }

    /// Serialize the document to compact JSON.
    pub fn to_json(&self) -> ParseResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Read `state.reported.temperature`.
    ///
    /// # Errors
    ///
    /// Returns [`ParseError::MissingField`] if the field is absent, or
    /// [`ParseError::InvalidValue`] if it is not an integer.
    pub fn reported_temperature_value(&self) -> ParseResult<i32> {
        let value = self
            .state
            .reported
            .as_ref()
            .and_then(|reported| reported.get(TEMPERATURE_FIELD))
            .ok_or(ParseError::MissingField("state.reported.temperature"))?;
        parse_temperature_value(value)
    }

    /// Server timestamp as a UTC date-time, if present and in range.
    #[must_use]
    pub fn timestamp_utc(&self) -> Option<OffsetDateTime> {
        self.timestamp
            .and_then(|ts| OffsetDateTime::from_unix_timestamp(ts).ok())
    }
}

/// Body of an `update/rejected` response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectedPayload {
    /// HTTP-style error code.
    #[serde(default)]
    pub code: Option<u16>,
    /// Human-readable reason.
    #[serde(default)]
    pub message: Option<String>,
    /// Correlation token of the rejected request.
    #[serde(rename = "clientToken", default)]
    pub client_token: Option<String>,
}

impl RejectedPayload {
    /// Parse a rejection body from JSON.
    pub fn from_json(payload: &str) -> ParseResult<Self> {
        Ok(serde_json::from_str(payload)?)
    }
}

/// Body of an `update/delta` push.
///
/// Unlike update documents, the delta `state` holds the desired properties
/// directly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeltaPayload {
    /// Properties whose desired value differs from the reported one.
    pub state: Map<String, Value>,
    /// Shadow version that produced this delta.
    pub version: u64,
    /// Server timestamp (Unix seconds).
    #[serde(default)]
    pub timestamp: Option<i64>,
}

impl DeltaPayload {
    /// Parse a delta body from JSON.
    pub fn from_json(payload: &str) -> ParseResult<Self> {
        Ok(serde_json::from_str(payload)?)
    }

    /// Read the desired `state.temperature`.
    pub fn desired_temperature(&self) -> ParseResult<i32> {
        let value = self
            .state
            .get(TEMPERATURE_FIELD)
            .ok_or(ParseError::MissingField("state.temperature"))?;
        parse_temperature_value(value)
    }
}

/// Extract the `clientToken` from any shadow response body.
///
/// Returns `None` when the body is not JSON or carries no token.
#[must_use]
pub fn client_token(payload: &[u8]) -> Option<String> {
    #[derive(Deserialize)]
    struct TokenOnly {
        #[serde(rename = "clientToken")]
        client_token: Option<String>,
    }

    serde_json::from_slice::<TokenOnly>(payload)
        .ok()
        .and_then(|t| t.client_token)
}

/// Interpret a shadow temperature value.
///
/// Accepts a JSON integer or a string holding a signed integer.
pub fn parse_temperature_value(value: &Value) -> ParseResult<i32> {
    match value {
        Value::String(s) => s
            .trim()
            .parse::<i32>()
            .map_err(|_| ParseError::InvalidValue(format!("temperature '{s}' is not an integer"))),
        Value::Number(n) => n
            .as_i64()
            .and_then(|v| i32::try_from(v).ok())
            .ok_or_else(|| ParseError::InvalidValue(format!("temperature {n} is out of range"))),
        other => Err(ParseError::InvalidValue(format!(
            "temperature has unsupported type: {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_update_payload_exact_format() {
        let doc = ShadowDocument::reported_temperature(22);
        assert_eq!(
            doc.to_json().unwrap(),
            r#"{"state":{"reported":{"temperature":"22"}}}"#
        );

        let doc = ShadowDocument::reported_temperature(-5);
        assert_eq!(
            doc.to_json().unwrap(),
            r#"{"state":{"reported":{"temperature":"-5"}}}"#
        );
    }

    #[test]
    fn test_update_payload_with_token() {
        let mut doc = ShadowDocument::reported_temperature(21);
        doc.client_token = Some("abc".to_string());
        assert_eq!(
            doc.to_json().unwrap(),
            r#"{"state":{"reported":{"temperature":"21"}},"clientToken":"abc"}"#
        );
    }

    #[test]
    fn test_accepted_payload_string_temperature() {
        let payload = r#"{"state":{"reported":{"temperature":"21"}},"version":7,"timestamp":1700000000,"clientToken":"t-1"}"#;
        let doc = ShadowDocument::from_json(payload).unwrap();
        assert_eq!(doc.reported_temperature_value().unwrap(), 21);
        assert_eq!(doc.version, Some(7));
        assert_eq!(doc.client_token.as_deref(), Some("t-1"));
        assert_eq!(doc.timestamp_utc().unwrap().unix_timestamp(), 1_700_000_000);
    }

    #[test]
    fn test_accepted_payload_numeric_temperature() {
        let doc = ShadowDocument::from_json(r#"{"state":{"reported":{"temperature":-3}}}"#).unwrap();
        assert_eq!(doc.reported_temperature_value().unwrap(), -3);
        assert_eq!(doc.version, None);
    }

    #[test]
    fn test_accepted_payload_missing_temperature() {
        let doc = ShadowDocument::from_json(r#"{"state":{"reported":{"humidity":"40"}}}"#).unwrap();
        assert!(matches!(
            doc.reported_temperature_value(),
            Err(ParseError::MissingField(_))
        ));

        let doc = ShadowDocument::from_json(r#"{"state":{}}"#).unwrap();
        assert!(doc.reported_temperature_value().is_err());
    }

    #[test]
    fn test_accepted_payload_not_a_document() {
        assert!(matches!(
            ShadowDocument::from_json("not json"),
            Err(ParseError::Json(_))
        ));
        assert!(ShadowDocument::from_json(r#"{"version":3}"#).is_err());
    }

    #[test]
    fn test_parse_temperature_value_variants() {
        assert_eq!(parse_temperature_value(&json!("22")).unwrap(), 22);
        assert_eq!(parse_temperature_value(&json!(" -7 ")).unwrap(), -7);
        assert_eq!(parse_temperature_value(&json!(30)).unwrap(), 30);
        assert!(parse_temperature_value(&json!("22.5")).is_err());
        assert!(parse_temperature_value(&json!(22.5)).is_err());
        assert!(parse_temperature_value(&json!(null)).is_err());
        assert!(parse_temperature_value(&json!(i64::MAX)).is_err());
    }

    #[test]
    fn test_delta_payload() {
        let delta = DeltaPayload::from_json(r#"{"state":{"temperature":25},"version":8}"#).unwrap();
        assert_eq!(delta.desired_temperature().unwrap(), 25);
        assert_eq!(delta.version, 8);

        let delta = DeltaPayload::from_json(r#"{"state":{"led":"on"},"version":9}"#).unwrap();
        assert!(delta.desired_temperature().is_err());

        assert!(DeltaPayload::from_json(r#"{"state":{"temperature":25}}"#).is_err());
    }

    #[test]
    fn test_rejected_payload() {
        let rejected =
            RejectedPayload::from_json(r#"{"code":409,"message":"Version conflict","clientToken":"t-9"}"#)
                .unwrap();
        assert_eq!(rejected.code, Some(409));
        assert_eq!(rejected.message.as_deref(), Some("Version conflict"));
        assert_eq!(rejected.client_token.as_deref(), Some("t-9"));
    }

    #[test]
    fn test_client_token_extraction() {
        assert_eq!(
            client_token(br#"{"clientToken":"tok","state":{}}"#),
            Some("tok".to_string())
        );
        assert_eq!(client_token(br#"{"state":{}}"#), None);
        assert_eq!(client_token(b"garbage"), None);
    }
}
