//! # JALoP
//!
//! Nodes that move journal, audit and log records between peers with the
//! JALoP record transfer protocol.
//!
//! ## Overview
//!
//! A [`Node`] negotiates channels, keeps a registry of live sessions and
//! runs the publisher or subscriber engine on each. Applications either
//! implement [`Publisher`](jalop_session::Publisher) and
//! [`Subscriber`](jalop_session::Subscriber) themselves or let the node
//! serve from and store into a record store.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use jalop::{Node, NodeConfig};
//! use jalop::session::MemoryNetwork;
//!
//! async fn example() -> jalop::Result<()> {
//!     let network = MemoryNetwork::new();
//!     let config = NodeConfig::from_json(r#"{
//!         "role": "listener",
//!         "address": "collector",
//!         "peers": [{ "address": "host-a", "publish_allowed": ["audit"] }]
//!     }"#)?;
//!     let node = Node::from_config(config)?;
//!     let listener = network.listen("collector").await;
//!     node.serve(listener).await
//! }
//! ```
//!
//! ## Re-exports
//!
//! - `jalop::core` - record types, digests, record descriptors
//! - `jalop::wire` - frames and message codec
//! - `jalop::store` - record sources and sinks
//! - `jalop::session` - channels, negotiation and the two engines

pub mod adapters;
pub mod config;
pub mod error;
pub mod handler;
pub mod node;

pub use jalop_core as core;
pub use jalop_session as session;
pub use jalop_store as store;
pub use jalop_wire as wire;

pub use adapters::{StorePublisher, StoreSubscriber};
pub use config::{NodeConfig, NodeRole, PeerConfig, SessionConfig};
pub use error::{JalopError, Result};
pub use handler::AllowListHandler;
pub use node::{Node, NodeBuilder, SessionTask};

pub use jalop_core::{DigestMethod, DigestPair, DigestStatus, Mode, Nonce, RecordType, Role};
