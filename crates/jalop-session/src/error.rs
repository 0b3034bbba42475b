//! Error types for the session layer.

use std::collections::BTreeSet;

use jalop_core::{ConnectError, CoreError};
use jalop_wire::WireError;
use thiserror::Error;

/// Errors that can occur while negotiating or running a session.
#[derive(Debug, Error)]
pub enum SessionError {
    /// A message could not be encoded or decoded.
    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    /// Digest engine or value construction failed.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// Reading a record segment failed.
    #[error("record I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The byte-stream layer failed.
    #[error("transport error: {0}")]
    Transport(String),

    /// The channel has been closed.
    #[error("channel closed")]
    Closed,

    /// Timeout waiting for the peer.
    #[error("timeout: {0}")]
    Timeout(String),

    /// No session is registered for this channel.
    #[error("no session for channel {0}")]
    SessionInvalid(u64),

    /// Negotiation ended with an init-nack.
    #[error("connection rejected: {0:?}")]
    Rejected(BTreeSet<ConnectError>),

    /// The peer replied with a protocol error.
    #[error("peer error: {0}")]
    PeerError(String),

    /// A configuration or call argument is out of range.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

/// Result type for session operations.
pub type Result<T> = std::result::Result<T, SessionError>;
