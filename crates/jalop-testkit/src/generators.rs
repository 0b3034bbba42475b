//! Proptest generators for property-based testing.

use std::collections::BTreeMap;

use bytes::Bytes;
use proptest::prelude::*;

use jalop_core::{DigestMethod, DigestStatus, DigestValue, Nonce, RecordInfo, RecordType};
use jalop_wire::{RecordHeader, RecordMessage};

pub fn record_type() -> impl Strategy<Value = RecordType> {
    prop_oneof![
        Just(RecordType::Journal),
        Just(RecordType::Audit),
        Just(RecordType::Log),
    ]
}

pub fn digest_method() -> impl Strategy<Value = DigestMethod> {
    prop_oneof![
        Just(DigestMethod::Sha256),
        Just(DigestMethod::Sha384),
        Just(DigestMethod::Sha512),
    ]
}

pub fn digest_status() -> impl Strategy<Value = DigestStatus> {
    prop_oneof![
        Just(DigestStatus::Confirmed),
        Just(DigestStatus::Invalid),
        Just(DigestStatus::Unknown),
    ]
}

/// Nonces as peers send them: printable, no separators.
pub fn nonce() -> impl Strategy<Value = Nonce> {
    "[A-Za-z0-9_.-]{1,24}".prop_filter_map("valid nonce", |s| Nonce::new(s).ok())
}

/// Segment bytes of at most `max_len` bytes, including `BREAK` look-alikes.
pub fn segment(max_len: usize) -> impl Strategy<Value = Vec<u8>> {
    prop_oneof![
        3 => prop::collection::vec(any::<u8>(), 0..=max_len),
        1 => Just(b"BREAK".to_vec()),
        1 => Just(b"xxBREAKBREAK".to_vec()),
    ]
}

pub fn digest_value() -> impl Strategy<Value = DigestValue> {
    (digest_method(), prop::collection::vec(any::<u8>(), 0..64)).prop_map(|(m, data)| m.digest(&data))
}

/// A non-empty digest batch.
pub fn digest_batch(max: usize) -> impl Strategy<Value = BTreeMap<Nonce, DigestValue>> {
    prop::collection::btree_map(nonce(), digest_value(), 1..=max.max(1))
}

/// A non-empty status batch.
pub fn status_batch(max: usize) -> impl Strategy<Value = BTreeMap<Nonce, DigestStatus>> {
    prop::collection::btree_map(nonce(), digest_status(), 1..=max.max(1))
}

/// Parameters for one record.
#[derive(Debug, Clone)]
pub struct RecordParams {
    pub record_type: RecordType,
    pub nonce: Nonce,
    pub sys_metadata: Vec<u8>,
    pub app_metadata: Vec<u8>,
    pub payload: Vec<u8>,
}

impl Arbitrary for RecordParams {
    type Parameters = ();
    type Strategy = BoxedStrategy<Self>;

    fn arbitrary_with(_: Self::Parameters) -> Self::Strategy {
        (record_type(), nonce(), segment(256), segment(256), segment(4096))
            .prop_map(|(record_type, nonce, sys_metadata, app_metadata, payload)| RecordParams {
                record_type,
                nonce,
                sys_metadata,
                app_metadata,
                payload,
            })
            .boxed()
    }
}

impl RecordParams {
    pub fn to_message(&self) -> RecordMessage {
        RecordMessage {
            header: RecordHeader::new(
                self.record_type,
                RecordInfo::new(
                    self.nonce.clone(),
                    self.sys_metadata.len() as u64,
                    self.app_metadata.len() as u64,
                    self.payload.len() as u64,
                ),
            ),
            sys_metadata: Bytes::from(self.sys_metadata.clone()),
            app_metadata: Bytes::from(self.app_metadata.clone()),
            payload: Bytes::from(self.payload.clone()),
        }
    }
}
