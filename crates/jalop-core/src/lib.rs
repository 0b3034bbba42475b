//! # JALoP Core
//!
//! Pure primitives shared by every JALoP layer: record types, roles, modes,
//! negotiation outcomes, the streaming digest engine and record descriptors.
//!
//! This crate performs no networking and holds no session state.
//!
//! ## Key Types
//!
//! - [`RecordType`], [`Role`], [`Mode`] - what a session carries and how
//! - [`DigestMethod`] / [`Digester`] - SHA-256/384/512 streaming digests
//! - [`SourceRecord`] / [`RecordInfo`] - one record's three segments
//! - [`DigestPair`] - local vs. peer digest with the peer's verdict
//! - [`ConnectError`] - connection policy outcomes

pub mod digest;
pub mod error;
pub mod record;
pub mod types;

pub use digest::{DigestMethod, DigestPair, DigestReader, DigestValue, Digester, CHUNK_SIZE};
pub use error::{CoreError, Result};
pub use record::{digest_source_record, record_digest, RecordInfo, RecordStream, SourceRecord};
pub use types::{ConnectError, DigestStatus, Mode, Nonce, RecordType, Role, XmlEncoding};
