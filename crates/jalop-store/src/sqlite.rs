//! SQLite record store.
//!
//! Uses rusqlite with bundled SQLite, wrapped in async via
//! `tokio::task::spawn_blocking`.

use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use bytes::Bytes;
use rusqlite::{params, Connection, OptionalExtension};

use jalop_core::{DigestStatus, DigestValue, Nonce, RecordType};

use crate::error::{Result, StoreError};
use crate::migration::{self, now_millis};
use crate::traits::{InsertResult, RecordSink, RecordSource, RecordState, StoredRecord};

/// SQLite-backed record store.
///
/// One connection behind a mutex; every call runs on the blocking pool.
#[derive(Clone)]
pub struct SqliteRecordStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteRecordStore {
    /// Open (creating if needed) and migrate the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut conn = Connection::open(path)?;
        migration::migrate(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory SQLite database.
    pub fn open_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory()?;
        migration::migrate(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` against the connection on the blocking pool.
    async fn call<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().unwrap_or_else(PoisonError::into_inner);
            f(&mut conn)
        })
        .await
        .map_err(|e| StoreError::Io(std::io::Error::other(e)))?
    }
}

type RawRecord = (String, String, Vec<u8>, Vec<u8>, Vec<u8>);

const RECORD_COLUMNS: &str = "record_type, nonce, sys_metadata, app_metadata, payload";

fn read_raw(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRecord> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
}

fn to_record(raw: RawRecord) -> Result<StoredRecord> {
    let (record_type, nonce, sys_metadata, app_metadata, payload) = raw;
    let record_type = RecordType::parse(&record_type)
        .ok_or_else(|| StoreError::InvalidData(format!("unknown record type {record_type:?}")))?;
    let nonce = Nonce::new(nonce).map_err(|e| StoreError::InvalidData(e.to_string()))?;
    Ok(StoredRecord {
        record_type,
        nonce,
        sys_metadata: Bytes::from(sys_metadata),
        app_metadata: Bytes::from(app_metadata),
        payload: Bytes::from(payload),
    })
}

fn changed_one(rows: usize, record_type: RecordType, nonce: &Nonce) -> Result<()> {
    if rows == 0 {
        return Err(StoreError::NotFound(format!("{record_type} {nonce}")));
    }
    Ok(())
}

#[async_trait]
impl RecordSource for SqliteRecordStore {
    async fn next_record(
        &self,
        record_type: RecordType,
        after: Option<&Nonce>,
    ) -> Result<Option<StoredRecord>> {
        let after = after.map(|n| n.as_str().to_owned());
        self.call(move |conn| {
            let raw = conn
                .query_row(
                    &format!(
                        "SELECT {RECORD_COLUMNS} FROM records
                         WHERE record_type = ?1 AND complete = 1
                           AND seq > COALESCE(
                               (SELECT seq FROM records WHERE record_type = ?1 AND nonce = ?2), 0)
                         ORDER BY seq LIMIT 1"
                    ),
                    params![record_type.as_str(), after],
                    read_raw,
                )
                .optional()?;
            raw.map(to_record).transpose()
        })
        .await
    }

    async fn get_record(&self, record_type: RecordType, nonce: &Nonce) -> Result<Option<StoredRecord>> {
        let nonce = nonce.clone();
        self.call(move |conn| {
            let raw = conn
                .query_row(
                    &format!(
                        "SELECT {RECORD_COLUMNS} FROM records
                         WHERE record_type = ?1 AND nonce = ?2 AND complete = 1"
                    ),
                    params![record_type.as_str(), nonce.as_str()],
                    read_raw,
                )
                .optional()?;
            raw.map(to_record).transpose()
        })
        .await
    }

    async fn set_digest(&self, record_type: RecordType, nonce: &Nonce, digest: &DigestValue) -> Result<()> {
        let nonce = nonce.clone();
        let digest = digest.clone();
        self.call(move |conn| {
            let rows = conn.execute(
                "UPDATE records SET digest = ?3 WHERE record_type = ?1 AND nonce = ?2",
                params![record_type.as_str(), nonce.as_str(), digest.as_bytes()],
            )?;
            changed_one(rows, record_type, &nonce)
        })
        .await
    }

    async fn mark_synced(&self, record_type: RecordType, nonce: &Nonce) -> Result<()> {
        let nonce = nonce.clone();
        self.call(move |conn| {
            let rows = conn.execute(
                "UPDATE records SET synced = 1 WHERE record_type = ?1 AND nonce = ?2",
                params![record_type.as_str(), nonce.as_str()],
            )?;
            changed_one(rows, record_type, &nonce)
        })
        .await
    }
}

#[async_trait]
impl RecordSink for SqliteRecordStore {
    async fn insert_record(&self, record: &StoredRecord, digest: Option<&DigestValue>) -> Result<InsertResult> {
        let record = record.clone();
        let digest = digest.map(|d| d.as_bytes().to_vec());
        self.call(move |conn| {
            let tx = conn.transaction()?;
            let existing: Option<bool> = tx
                .query_row(
                    "SELECT complete FROM records WHERE record_type = ?1 AND nonce = ?2",
                    params![record.record_type.as_str(), record.nonce.as_str()],
                    |row| row.get(0),
                )
                .optional()?;
            let result = match existing {
                Some(true) => InsertResult::AlreadyExists,
                Some(false) => {
                    tx.execute(
                        "UPDATE records
                         SET sys_metadata = ?3, app_metadata = ?4, payload = ?5,
                             complete = 1, digest = ?6, status = NULL, synced = 0, stored_at = ?7
                         WHERE record_type = ?1 AND nonce = ?2",
                        params![
                            record.record_type.as_str(),
                            record.nonce.as_str(),
                            &record.sys_metadata[..],
                            &record.app_metadata[..],
                            &record.payload[..],
                            digest,
                            now_millis(),
                        ],
                    )?;
                    InsertResult::Inserted
                }
                None => {
                    tx.execute(
                        "INSERT INTO records
                         (record_type, nonce, sys_metadata, app_metadata, payload, complete, digest, stored_at)
                         VALUES (?1, ?2, ?3, ?4, ?5, 1, ?6, ?7)",
                        params![
                            record.record_type.as_str(),
                            record.nonce.as_str(),
                            &record.sys_metadata[..],
                            &record.app_metadata[..],
                            &record.payload[..],
                            digest,
                            now_millis(),
                        ],
                    )?;
                    InsertResult::Inserted
                }
            };
            tx.commit()?;
            Ok(result)
        })
        .await
    }

    async fn insert_partial(&self, record: &StoredRecord) -> Result<()> {
        if record.record_type != RecordType::Journal {
            return Err(StoreError::InvalidData(format!(
                "only journal records can be partial, got {}",
                record.record_type
            )));
        }
        let record = record.clone();
        self.call(move |conn| {
            // A complete row with the same nonce is left alone.
            conn.execute(
                "INSERT INTO records
                 (record_type, nonce, sys_metadata, app_metadata, payload, complete, stored_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6)
                 ON CONFLICT(record_type, nonce) DO UPDATE SET
                     sys_metadata = excluded.sys_metadata,
                     app_metadata = excluded.app_metadata,
                     payload = excluded.payload,
                     stored_at = excluded.stored_at
                 WHERE records.complete = 0",
                params![
                    RecordType::Journal.as_str(),
                    record.nonce.as_str(),
                    &record.sys_metadata[..],
                    &record.app_metadata[..],
                    &record.payload[..],
                    now_millis(),
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn partial_journal(&self) -> Result<Option<StoredRecord>> {
        self.call(|conn| {
            let raw = conn
                .query_row(
                    &format!(
                        "SELECT {RECORD_COLUMNS} FROM records
                         WHERE record_type = ?1 AND complete = 0
                         ORDER BY seq LIMIT 1"
                    ),
                    params![RecordType::Journal.as_str()],
                    read_raw,
                )
                .optional()?;
            raw.map(to_record).transpose()
        })
        .await
    }

    async fn remove_partial(&self, nonce: &Nonce) -> Result<()> {
        let nonce = nonce.clone();
        self.call(move |conn| {
            conn.execute(
                "DELETE FROM records WHERE record_type = ?1 AND nonce = ?2 AND complete = 0",
                params![RecordType::Journal.as_str(), nonce.as_str()],
            )?;
            Ok(())
        })
        .await
    }

    async fn set_status(&self, record_type: RecordType, nonce: &Nonce, status: DigestStatus) -> Result<()> {
        let nonce = nonce.clone();
        self.call(move |conn| {
            let rows = conn.execute(
                "UPDATE records SET status = ?3 WHERE record_type = ?1 AND nonce = ?2",
                params![record_type.as_str(), nonce.as_str(), status.as_str()],
            )?;
            changed_one(rows, record_type, &nonce)
        })
        .await
    }

    async fn last_nonce(&self, record_type: RecordType) -> Result<Option<Nonce>> {
        self.call(move |conn| {
            let nonce: Option<String> = conn
                .query_row(
                    "SELECT nonce FROM records WHERE record_type = ?1 AND complete = 1
                     ORDER BY seq DESC LIMIT 1",
                    params![record_type.as_str()],
                    |row| row.get(0),
                )
                .optional()?;
            nonce
                .map(|n| Nonce::new(n).map_err(|e| StoreError::InvalidData(e.to_string())))
                .transpose()
        })
        .await
    }

    async fn record_state(&self, record_type: RecordType, nonce: &Nonce) -> Result<Option<RecordState>> {
        let nonce = nonce.clone();
        self.call(move |conn| {
            let row: Option<(bool, Option<Vec<u8>>, Option<String>, bool)> = conn
                .query_row(
                    "SELECT complete, digest, status, synced FROM records
                     WHERE record_type = ?1 AND nonce = ?2",
                    params![record_type.as_str(), nonce.as_str()],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
                )
                .optional()?;
            let Some((complete, digest, status, synced)) = row else {
                return Ok(None);
            };
            let status = status
                .map(|s| {
                    DigestStatus::parse(&s)
                        .ok_or_else(|| StoreError::InvalidData(format!("unknown digest status {s:?}")))
                })
                .transpose()?;
            Ok(Some(RecordState {
                complete,
                digest: digest.map(DigestValue),
                status,
                synced,
            }))
        })
        .await
    }
}
