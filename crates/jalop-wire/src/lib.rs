//! # JALoP Wire
//!
//! Frame format and typed message codec for the JALoP record transfer
//! protocol.
//!
//! A [`Message`] is one frame: a kind (`MSG`, `ERR`, `NUL`), a
//! case-insensitive [`Headers`] block and a body. The [`codec`] module maps
//! frames to typed messages and back; every decoder validates the
//! `JAL-Message` tag and keeps unrecognized headers in `other_headers`.

pub mod codec;
pub mod error;
pub mod frame;
pub mod headers;

pub use codec::{
    decode_journal_missing, journal_missing, payload_length_header, DigestMessage,
    DigestResponse, InitAck, InitMessage, InitNack, JournalResume, RecordHeader, RecordMessage,
    Subscribe, SyncMessage, WireMessage, BREAK, PROTOCOL_VERSION,
};
pub use error::{Result, WireError};
pub use frame::{FrameKind, Message, MessageType};
pub use headers::{names, Headers};
