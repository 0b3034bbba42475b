//! Error types for the wire codec.

use thiserror::Error;

/// Errors raised while encoding or decoding protocol messages.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireError {
    /// A header the message type requires is absent.
    #[error("missing header: {0}")]
    MissingHeader(String),

    /// A header value is outside the recognized set or unparseable.
    #[error("unexpected value for {header}: '{value}'")]
    UnexpectedValue { header: String, value: String },

    /// The caller asked to encode something the protocol cannot express.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The frame itself could not be parsed.
    #[error("malformed frame: {0}")]
    Malformed(String),
}

impl WireError {
    pub(crate) fn unexpected(header: &str, value: impl Into<String>) -> Self {
        WireError::UnexpectedValue {
            header: header.to_string(),
            value: value.into(),
        }
    }
}

/// Result type for codec operations.
pub type Result<T> = std::result::Result<T, WireError>;
