//! Record source and sink traits.
//!
//! A publishing node reads records from a [`RecordSource`]; a subscribing
//! node writes what it receives into a [`RecordSink`]. Both are keyed by
//! `(record type, nonce)` and keep insertion order per record type.

use async_trait::async_trait;
use bytes::Bytes;

use jalop_core::{DigestStatus, DigestValue, Nonce, RecordType, SourceRecord};

use crate::error::Result;

/// One record as held by a store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRecord {
    pub record_type: RecordType,
    pub nonce: Nonce,
    pub sys_metadata: Bytes,
    pub app_metadata: Bytes,
    pub payload: Bytes,
}

impl StoredRecord {
    pub fn new(
        record_type: RecordType,
        nonce: Nonce,
        sys_metadata: impl Into<Bytes>,
        app_metadata: impl Into<Bytes>,
        payload: impl Into<Bytes>,
    ) -> Self {
        Self {
            record_type,
            nonce,
            sys_metadata: sys_metadata.into(),
            app_metadata: app_metadata.into(),
            payload: payload.into(),
        }
    }

    /// Streamable view for the publisher engine.
    pub fn into_source(self) -> SourceRecord {
        SourceRecord::from_bytes(self.nonce, self.sys_metadata, self.app_metadata, self.payload)
    }
}

/// Result of inserting a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertResult {
    Inserted,
    /// A complete record with this nonce is already stored (idempotent).
    AlreadyExists,
}

/// Bookkeeping kept next to a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordState {
    /// False for a journal whose payload is only partly stored.
    pub complete: bool,
    pub digest: Option<DigestValue>,
    /// Verdict the publisher returned for our digest.
    pub status: Option<DigestStatus>,
    /// The subscriber confirmed it holds this record.
    pub synced: bool,
}

/// Where a publisher takes records from.
#[async_trait]
pub trait RecordSource: Send + Sync {
    /// First complete record of `record_type` stored after `after`, or the
    /// first one overall when `after` is `None` or unknown.
    async fn next_record(
        &self,
        record_type: RecordType,
        after: Option<&Nonce>,
    ) -> Result<Option<StoredRecord>>;

    /// A complete record by nonce.
    async fn get_record(&self, record_type: RecordType, nonce: &Nonce) -> Result<Option<StoredRecord>>;

    /// Remember the digest computed while sending.
    async fn set_digest(&self, record_type: RecordType, nonce: &Nonce, digest: &DigestValue) -> Result<()>;

    /// The subscriber confirmed `nonce`.
    async fn mark_synced(&self, record_type: RecordType, nonce: &Nonce) -> Result<()>;
}

/// Where a subscriber puts records.
#[async_trait]
pub trait RecordSink: Send + Sync {
    /// Store a complete record. Replaces a partial journal with the same
    /// nonce.
    async fn insert_record(&self, record: &StoredRecord, digest: Option<&DigestValue>) -> Result<InsertResult>;

    /// Store the received prefix of a journal record.
    async fn insert_partial(&self, record: &StoredRecord) -> Result<()>;

    /// The oldest partial journal, if any.
    async fn partial_journal(&self) -> Result<Option<StoredRecord>>;

    /// Drop a partial journal that can no longer be resumed. Complete
    /// records are left alone.
    async fn remove_partial(&self, nonce: &Nonce) -> Result<()>;

    /// Record the publisher's verdict for `nonce`.
    async fn set_status(&self, record_type: RecordType, nonce: &Nonce, status: DigestStatus) -> Result<()>;

    /// Nonce of the newest complete record of `record_type`.
    async fn last_nonce(&self, record_type: RecordType) -> Result<Option<Nonce>>;

    async fn record_state(&self, record_type: RecordType, nonce: &Nonce) -> Result<Option<RecordState>>;
}
