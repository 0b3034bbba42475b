//! # JALoP Testkit
//!
//! Testing utilities for the JALoP crates.
//!
//! - **Vectors**: known record digests and frame encodings
//! - **Generators**: proptest strategies for records, nonces and digest batches
//! - **Fixtures**: a listener and a connector wired over an in-memory network
//!
//! ## Vectors
//!
//! ```rust
//! use jalop_testkit::vectors::digest_vectors;
//!
//! for vector in digest_vectors() {
//!     assert_eq!(vector.compute().to_hex(), vector.expected);
//! }
//! ```
//!
//! ## Fixtures
//!
//! ```rust,ignore
//! use jalop::{Mode, RecordType};
//! use jalop_testkit::fixtures::{seed, NodePair};
//!
//! let pair = NodePair::publishing(RecordType::Log, Mode::Archive).await?;
//! seed(pair.connector_store.as_ref(), RecordType::Log, 3).await?;
//! pair.run_to_completion().await?;
//! assert_eq!(pair.listener_store.count(RecordType::Log), 3);
//! ```

pub mod fixtures;
pub mod generators;
pub mod vectors;

pub use fixtures::{init_tracing, record, seed, NodePair};
pub use generators::RecordParams;
pub use vectors::{digest_vectors, frame_vectors, verify_digest_vectors, DigestVector, FrameVector};
