//! Error types for JALoP nodes.

use jalop_core::CoreError;
use jalop_session::SessionError;
use jalop_store::StoreError;
use jalop_wire::WireError;
use thiserror::Error;

/// Errors that can occur while configuring or running a node.
#[derive(Debug, Error)]
pub enum JalopError {
    #[error("core error: {0}")]
    Core(#[from] CoreError),

    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    /// Storage error.
    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    #[error("session error: {0}")]
    Session(#[from] SessionError),

    /// Invalid node configuration.
    #[error("configuration error: {0}")]
    Config(String),

    #[error("configuration parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for node operations.
pub type Result<T> = std::result::Result<T, JalopError>;
