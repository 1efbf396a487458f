//! Error types for frame and payload parsing in thingy-types.

use thiserror::Error;

/// Errors that can occur when parsing sensor frames or shadow documents.
///
/// This error type is platform-agnostic and does not include
/// BLE-specific or transport errors (those belong in thingy-core).
///
/// This enum is marked `#[non_exhaustive]` to allow adding new error variants
/// in future versions without breaking downstream code.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ParseError {
    /// A notification frame had an unexpected length.
    #[error("Invalid frame length: expected {expected} bytes, got {actual}")]
    InvalidLength {
        /// Expected frame size.
        expected: usize,
        /// Actual frame size received.
        actual: usize,
    },

    /// A field was present but held an unusable value.
    #[error("Invalid value: {0}")]
    InvalidValue(String),

    /// A field required by the caller was absent from a shadow document.
    #[error("Missing field: {0}")]
    MissingField(&'static str),

    /// The payload was not valid JSON or did not match the document shape.
    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

impl ParseError {
    /// Create an invalid length error.
    pub fn invalid_length(expected: usize, actual: usize) -> Self {
        Self::InvalidLength { expected, actual }
    }
}

/// Result type alias using thingy-types' ParseError type.
pub type ParseResult<T> = std::result::Result<T, ParseError>;
