//! Record descriptors.
//!
//! A JALoP record is three independent byte segments: system metadata,
//! application metadata and payload. Declared lengths are authoritative; the
//! transfer engines frame the segments by them and fail a record whose
//! streams run short.

use bytes::Bytes;
use std::fmt;
use std::io::Cursor;

use tokio::io::AsyncRead;

use crate::digest::{DigestMethod, DigestValue};
use crate::error::Result;
use crate::types::Nonce;

/// A readable record segment.
pub type RecordStream = Box<dyn AsyncRead + Send + Unpin>;

/// Identity and segment lengths of one record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordInfo {
    pub nonce: Nonce,
    pub sys_metadata_len: u64,
    pub app_metadata_len: u64,
    pub payload_len: u64,
}

impl RecordInfo {
    pub fn new(nonce: Nonce, sys_metadata_len: u64, app_metadata_len: u64, payload_len: u64) -> Self {
        Self {
            nonce,
            sys_metadata_len,
            app_metadata_len,
            payload_len,
        }
    }

    /// Sum of all three segment lengths, saturating on hostile input.
    pub fn total_len(&self) -> u64 {
        self.sys_metadata_len
            .saturating_add(self.app_metadata_len)
            .saturating_add(self.payload_len)
    }
}

/// A record ready to be streamed by a publisher.
pub struct SourceRecord {
    pub info: RecordInfo,
    pub sys_metadata: RecordStream,
    pub app_metadata: RecordStream,
    pub payload: RecordStream,
}

impl SourceRecord {
    pub fn new(
        info: RecordInfo,
        sys_metadata: RecordStream,
        app_metadata: RecordStream,
        payload: RecordStream,
    ) -> Self {
        Self {
            info,
            sys_metadata,
            app_metadata,
            payload,
        }
    }

    /// Build a record from in-memory segments.
    pub fn from_bytes(
        nonce: Nonce,
        sys_metadata: impl Into<Bytes>,
        app_metadata: impl Into<Bytes>,
        payload: impl Into<Bytes>,
    ) -> Self {
        let sys = sys_metadata.into();
        let app = app_metadata.into();
        let payload = payload.into();
        let info = RecordInfo::new(nonce, sys.len() as u64, app.len() as u64, payload.len() as u64);
        Self {
            info,
            sys_metadata: Box::new(Cursor::new(sys)),
            app_metadata: Box::new(Cursor::new(app)),
            payload: Box::new(Cursor::new(payload)),
        }
    }

    pub fn nonce(&self) -> &Nonce {
        &self.info.nonce
    }
}

impl fmt::Debug for SourceRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceRecord").field("info", &self.info).finish_non_exhaustive()
    }
}

/// Digest of a whole record held in memory.
///
/// Equivalent to streaming the three segments through one digester in order.
pub fn record_digest(method: DigestMethod, sys_metadata: &[u8], app_metadata: &[u8], payload: &[u8]) -> DigestValue {
    let mut d = method.digester();
    d.update(sys_metadata);
    d.update(app_metadata);
    d.update(payload);
    d.finish()
}

/// Digest a [`SourceRecord`] by draining its streams, skipping nothing.
pub async fn digest_source_record(method: DigestMethod, record: &mut SourceRecord) -> Result<DigestValue> {
    let mut d = method.digester();
    d.absorb(&mut record.sys_metadata, record.info.sys_metadata_len).await?;
    d.absorb(&mut record.app_metadata, record.info.app_metadata_len).await?;
    d.absorb(&mut record.payload, record.info.payload_len).await?;
    Ok(d.finish())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_bytes_sets_lengths() {
        let rec = SourceRecord::from_bytes(Nonce::new("7").unwrap(), "sys", "app!", "payload");
        assert_eq!(rec.info.sys_metadata_len, 3);
        assert_eq!(rec.info.app_metadata_len, 4);
        assert_eq!(rec.info.payload_len, 7);
        assert_eq!(rec.info.total_len(), 14);
    }

    #[tokio::test]
    async fn test_streamed_digest_matches_in_memory() {
        let mut rec = SourceRecord::from_bytes(Nonce::new("1").unwrap(), "a", "b", "c");
        let streamed = digest_source_record(DigestMethod::Sha256, &mut rec).await.unwrap();
        assert_eq!(streamed, record_digest(DigestMethod::Sha256, b"a", b"b", b"c"));
        assert_eq!(streamed, DigestMethod::Sha256.digest(b"abc"));
    }
}
