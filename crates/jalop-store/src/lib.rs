//! # JALoP Store
//!
//! Record persistence for JALoP nodes. A publishing node reads from a
//! [`RecordSource`], a subscribing node writes into a [`RecordSink`].
//!
//! ## Key Types
//!
//! - [`SqliteRecordStore`] - SQLite storage with versioned migrations
//! - [`MemoryRecordStore`] - in-memory storage for tests and relays
//! - [`StoredRecord`] - one record's three segments keyed by type and nonce
//! - [`RecordState`] - digest, verdict and sync flags kept beside a record
//!
//! ## Usage
//!
//! ```rust,no_run
//! use jalop_core::{Nonce, RecordType};
//! use jalop_store::{RecordSink, RecordSource, SqliteRecordStore, StoredRecord};
//!
//! async fn example() -> jalop_store::Result<()> {
//!     let store = SqliteRecordStore::open("records.db")?;
//!     let nonce = Nonce::new("1").expect("valid nonce");
//!     let record = StoredRecord::new(RecordType::Log, nonce, "<sys/>", "", "entry");
//!     store.insert_record(&record, None).await?;
//!     let first = store.next_record(RecordType::Log, None).await?;
//!     assert!(first.is_some());
//!     Ok(())
//! }
//! ```
//!
//! Journal records may be stored partially (`complete = false`) so a
//! subscriber can resume them after an interrupted transfer.

pub mod error;
pub mod memory;
pub mod migration;
pub mod sqlite;
pub mod traits;

pub use error::{Result, StoreError};
pub use memory::MemoryRecordStore;
pub use sqlite::SqliteRecordStore;
pub use traits::{InsertResult, RecordSink, RecordSource, RecordState, StoredRecord};
