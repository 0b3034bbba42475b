//! Error types for the JALoP core.

use thiserror::Error;

/// Core errors raised by value constructors and the digest engine.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A caller supplied a blank, unset or out-of-range argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The digest algorithm is not one of the supported SHA-2 variants.
    #[error("unsupported digest: {0}")]
    UnsupportedDigest(String),

    /// A digest for this nonce is already pending acknowledgment.
    #[error("duplicate nonce: {0}")]
    DuplicateNonce(String),

    /// Reading a record segment failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;
