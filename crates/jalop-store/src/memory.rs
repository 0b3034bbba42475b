//! In-memory record store.
//!
//! Same semantics as the SQLite store with no persistence. Used by tests and
//! by nodes that only relay.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;

use jalop_core::{DigestStatus, DigestValue, Nonce, RecordType};

use crate::error::{Result, StoreError};
use crate::traits::{InsertResult, RecordSink, RecordSource, RecordState, StoredRecord};

struct Entry {
    record: StoredRecord,
    state: RecordState,
}

/// In-memory store. All data is lost when the store is dropped.
#[derive(Default)]
pub struct MemoryRecordStore {
    inner: RwLock<HashMap<RecordType, Vec<Entry>>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<RecordType, Vec<Entry>>> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<RecordType, Vec<Entry>>> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of complete records of `record_type`.
    pub fn count(&self, record_type: RecordType) -> usize {
        self.read()
            .get(&record_type)
            .map_or(0, |entries| entries.iter().filter(|e| e.state.complete).count())
    }

    fn update<F>(&self, record_type: RecordType, nonce: &Nonce, f: F) -> Result<()>
    where
        F: FnOnce(&mut RecordState),
    {
        let mut inner = self.write();
        let entry = inner
            .get_mut(&record_type)
            .and_then(|entries| entries.iter_mut().find(|e| e.record.nonce == *nonce))
            .ok_or_else(|| StoreError::NotFound(format!("{record_type} {nonce}")))?;
        f(&mut entry.state);
        Ok(())
    }
}

#[async_trait]
impl RecordSource for MemoryRecordStore {
    async fn next_record(
        &self,
        record_type: RecordType,
        after: Option<&Nonce>,
    ) -> Result<Option<StoredRecord>> {
        let inner = self.read();
        let Some(entries) = inner.get(&record_type) else {
            return Ok(None);
        };
        let start = after
            .and_then(|n| entries.iter().position(|e| e.record.nonce == *n))
            .map_or(0, |i| i + 1);
        Ok(entries[start..]
            .iter()
            .find(|e| e.state.complete)
            .map(|e| e.record.clone()))
    }

    async fn get_record(&self, record_type: RecordType, nonce: &Nonce) -> Result<Option<StoredRecord>> {
        Ok(self.read().get(&record_type).and_then(|entries| {
            entries
                .iter()
                .find(|e| e.state.complete && e.record.nonce == *nonce)
                .map(|e| e.record.clone())
        }))
    }

    async fn set_digest(&self, record_type: RecordType, nonce: &Nonce, digest: &DigestValue) -> Result<()> {
        self.update(record_type, nonce, |s| s.digest = Some(digest.clone()))
    }

    async fn mark_synced(&self, record_type: RecordType, nonce: &Nonce) -> Result<()> {
        self.update(record_type, nonce, |s| s.synced = true)
    }
}

#[async_trait]
impl RecordSink for MemoryRecordStore {
    async fn insert_record(&self, record: &StoredRecord, digest: Option<&DigestValue>) -> Result<InsertResult> {
        let mut inner = self.write();
        let entries = inner.entry(record.record_type).or_default();
        let state = RecordState {
            complete: true,
            digest: digest.cloned(),
            status: None,
            synced: false,
        };
        match entries.iter_mut().find(|e| e.record.nonce == record.nonce) {
            Some(e) if e.state.complete => Ok(InsertResult::AlreadyExists),
            Some(e) => {
                e.record = record.clone();
                e.state = state;
                Ok(InsertResult::Inserted)
            }
            None => {
                entries.push(Entry {
                    record: record.clone(),
                    state,
                });
                Ok(InsertResult::Inserted)
            }
        }
    }

    async fn insert_partial(&self, record: &StoredRecord) -> Result<()> {
        if record.record_type != RecordType::Journal {
            return Err(StoreError::InvalidData(format!(
                "only journal records can be partial, got {}",
                record.record_type
            )));
        }
        let mut inner = self.write();
        let entries = inner.entry(RecordType::Journal).or_default();
        match entries.iter_mut().find(|e| e.record.nonce == record.nonce) {
            Some(e) if e.state.complete => {}
            Some(e) => e.record = record.clone(),
            None => entries.push(Entry {
                record: record.clone(),
                state: RecordState {
                    complete: false,
                    digest: None,
                    status: None,
                    synced: false,
                },
            }),
        }
        Ok(())
    }

    async fn partial_journal(&self) -> Result<Option<StoredRecord>> {
        Ok(self.read().get(&RecordType::Journal).and_then(|entries| {
            entries.iter().find(|e| !e.state.complete).map(|e| e.record.clone())
        }))
    }

    async fn remove_partial(&self, nonce: &Nonce) -> Result<()> {
        if let Some(entries) = self.write().get_mut(&RecordType::Journal) {
            entries.retain(|e| e.state.complete || e.record.nonce != *nonce);
        }
        Ok(())
    }

    async fn set_status(&self, record_type: RecordType, nonce: &Nonce, status: DigestStatus) -> Result<()> {
        self.update(record_type, nonce, |s| s.status = Some(status))
    }

    async fn last_nonce(&self, record_type: RecordType) -> Result<Option<Nonce>> {
        Ok(self.read().get(&record_type).and_then(|entries| {
            entries
                .iter()
                .rev()
                .find(|e| e.state.complete)
                .map(|e| e.record.nonce.clone())
        }))
    }

    async fn record_state(&self, record_type: RecordType, nonce: &Nonce) -> Result<Option<RecordState>> {
        Ok(self.read().get(&record_type).and_then(|entries| {
            entries
                .iter()
                .find(|e| e.record.nonce == *nonce)
                .map(|e| e.state.clone())
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(rt: RecordType, nonce: &str, payload: &'static str) -> StoredRecord {
        StoredRecord::new(rt, Nonce::new(nonce).unwrap(), "sys", "app", payload)
    }

    #[tokio::test]
    async fn test_order_and_cursor() {
        let store = MemoryRecordStore::new();
        for n in ["a", "b", "c"] {
            store.insert_record(&rec(RecordType::Log, n, "p"), None).await.unwrap();
        }
        let first = store.next_record(RecordType::Log, None).await.unwrap().unwrap();
        assert_eq!(first.nonce.as_str(), "a");
        let next = store.next_record(RecordType::Log, Some(&first.nonce)).await.unwrap().unwrap();
        assert_eq!(next.nonce.as_str(), "b");
        let c = Nonce::new("c").unwrap();
        assert!(store.next_record(RecordType::Log, Some(&c)).await.unwrap().is_none());
        assert!(store.next_record(RecordType::Audit, None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_idempotent_insert() {
        let store = MemoryRecordStore::new();
        let r = rec(RecordType::Audit, "1", "x");
        assert_eq!(store.insert_record(&r, None).await.unwrap(), InsertResult::Inserted);
        assert_eq!(store.insert_record(&r, None).await.unwrap(), InsertResult::AlreadyExists);
        assert_eq!(store.count(RecordType::Audit), 1);
    }

    #[tokio::test]
    async fn test_partial_journal_completed() {
        let store = MemoryRecordStore::new();
        let partial = rec(RecordType::Journal, "j", "01");
        store.insert_partial(&partial).await.unwrap();
        assert_eq!(store.partial_journal().await.unwrap(), Some(partial.clone()));
        assert!(store.next_record(RecordType::Journal, None).await.unwrap().is_none());

        let full = rec(RecordType::Journal, "j", "0123");
        let digest = DigestValue(vec![1, 2, 3]);
        store.insert_record(&full, Some(&digest)).await.unwrap();
        assert!(store.partial_journal().await.unwrap().is_none());
        let state = store.record_state(RecordType::Journal, &full.nonce).await.unwrap().unwrap();
        assert!(state.complete);
        assert_eq!(state.digest, Some(digest));

        store.remove_partial(&full.nonce).await.unwrap();
        assert_eq!(store.count(RecordType::Journal), 1);
    }

    #[tokio::test]
    async fn test_remove_partial() {
        let store = MemoryRecordStore::new();
        let partial = rec(RecordType::Journal, "gone", "01");
        store.insert_partial(&partial).await.unwrap();
        store.remove_partial(&partial.nonce).await.unwrap();
        assert!(store.partial_journal().await.unwrap().is_none());
        assert!(store.record_state(RecordType::Journal, &partial.nonce).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_partial_rejects_non_journal() {
        let store = MemoryRecordStore::new();
        assert!(matches!(
            store.insert_partial(&rec(RecordType::Log, "l", "x")).await,
            Err(StoreError::InvalidData(_))
        ));
    }

    #[tokio::test]
    async fn test_status_and_sync() {
        let store = MemoryRecordStore::new();
        let r = rec(RecordType::Log, "1", "x");
        store.insert_record(&r, None).await.unwrap();
        store.set_status(RecordType::Log, &r.nonce, DigestStatus::Confirmed).await.unwrap();
        store.mark_synced(RecordType::Log, &r.nonce).await.unwrap();
        let state = store.record_state(RecordType::Log, &r.nonce).await.unwrap().unwrap();
        assert_eq!(state.status, Some(DigestStatus::Confirmed));
        assert!(state.synced);

        let missing = Nonce::new("nope").unwrap();
        assert!(matches!(
            store.mark_synced(RecordType::Log, &missing).await,
            Err(StoreError::NotFound(_))
        ));
        assert_eq!(store.last_nonce(RecordType::Log).await.unwrap(), Some(r.nonce));
    }

    proptest::proptest! {
        #[test]
        fn test_cursor_walk_follows_first_insert(
            nonces in proptest::collection::vec("[a-z0-9]{1,4}", 0..24)
        ) {
            let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
            runtime.block_on(async {
                let store = MemoryRecordStore::new();
                let mut expected: Vec<String> = Vec::new();
                for n in &nonces {
                    let result = store.insert_record(&rec(RecordType::Log, n, "p"), None).await.unwrap();
                    if expected.contains(n) {
                        assert_eq!(result, InsertResult::AlreadyExists);
                    } else {
                        assert_eq!(result, InsertResult::Inserted);
                        expected.push(n.clone());
                    }
                }
                let mut seen = Vec::new();
                let mut cursor: Option<Nonce> = None;
                while let Some(r) = store.next_record(RecordType::Log, cursor.as_ref()).await.unwrap() {
                    seen.push(r.nonce.as_str().to_owned());
                    cursor = Some(r.nonce);
                }
                assert_eq!(seen, expected);
            });
        }
    }
}
