//! # JALoP Session
//!
//! Sessions, negotiation and the two record-transfer engines.
//!
//! ## Overview
//!
//! A peer opens a [`Channel`], negotiates it into a [`Session`] with a
//! [`Negotiator`], then runs either [`run_publisher`] or [`run_subscriber`]
//! depending on [`Session::local_role`]. The application plugs in through
//! the [`Publisher`], [`Subscriber`] and [`ConnectionHandler`] traits.
//!
//! ## Message Flow
//!
//! ```text
//! Subscriber                          Publisher
//!   |-------- init ------------------->|
//!   |<------- init-ack ----------------|
//!   |-------- subscribe -------------->|
//!   |<------- record ------------------|  (repeated)
//!   |-------- digest ----------------->|  (batched)
//!   |<------- digest-response ---------|
//!   |-------- sync ------------------->|  (per confirmed record)
//!   |<------- NUL ---------------------|  (archive mode, after the last record)
//! ```
//!
//! [`transport::memory`] provides an in-process channel implementation used
//! by tests and by single-process deployments.

pub mod digests;
pub mod error;
pub mod negotiation;
pub mod publisher;
pub mod registry;
pub mod session;
pub mod subscriber;
pub mod transport;

pub use digests::{DigestTable, PendingDigests};
pub use error::{Result, SessionError};
pub use negotiation::{
    AcceptAll, ConnectionHandler, ConnectionRequest, NegotiationConfig, Negotiator,
    SUPPORTED_VERSIONS,
};
pub use publisher::{complete, run_publisher, Publisher, PublisherConfig};
pub use registry::SessionRegistry;
pub use session::{Session, SessionId, SessionParams, SessionState};
pub use subscriber::{run_subscriber, SubscribeRequest, Subscriber, SubscriberConfig};
pub use transport::memory::{MemoryChannel, MemoryListener, MemoryNetwork};
pub use transport::{BodyWriter, Channel, ChannelId, IncomingFrame};
