//! Node configuration, loaded from JSON.
//!
//! ```json
//! {
//!   "role": "listener",
//!   "address": "collector",
//!   "peers": [
//!     { "address": "host-a", "subscribe_allowed": ["audit", "log"] }
//!   ],
//!   "digests": ["sha256"],
//!   "pending_digest_max": 128,
//!   "database": "records.db"
//! }
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use jalop_core::{DigestMethod, Mode, RecordType, Role, XmlEncoding};
use jalop_session::{NegotiationConfig, PublisherConfig, SubscriberConfig};

use crate::error::{JalopError, Result};

/// Whether the node waits for peers or dials them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    Listener,
    Connector,
}

/// One session a connector opens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SessionConfig {
    pub record_type: RecordType,
    /// Our role on the session.
    pub role: Role,
    #[serde(default = "default_mode")]
    pub mode: Mode,
}

/// A known peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PeerConfig {
    pub address: String,
    /// Record types this peer may publish to us.
    #[serde(default)]
    pub publish_allowed: Vec<RecordType>,
    /// Record types this peer may subscribe to from us.
    #[serde(default)]
    pub subscribe_allowed: Vec<RecordType>,
    /// Sessions to open when this node is a connector.
    #[serde(default)]
    pub sessions: Vec<SessionConfig>,
}

/// Configuration for one [`Node`](crate::Node).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeConfig {
    pub role: NodeRole,
    pub address: String,
    #[serde(default)]
    pub peers: Vec<PeerConfig>,
    /// Digest names or URIs, most preferred first.
    #[serde(default = "default_digests")]
    pub digests: Vec<String>,
    /// XML encodings, most preferred first.
    #[serde(default = "default_encodings")]
    pub encodings: Vec<String>,
    #[serde(default = "default_pending_digest_max")]
    pub pending_digest_max: usize,
    #[serde(default = "default_pending_digest_timeout_secs")]
    pub pending_digest_timeout_secs: u64,
    #[serde(default = "default_message_timeout_ms")]
    pub message_timeout_ms: u64,
    #[serde(default = "default_live_poll_interval_ms")]
    pub live_poll_interval_ms: u64,
    #[serde(default)]
    pub agent: Option<String>,
    /// SQLite record store. Records are kept in memory when absent.
    #[serde(default)]
    pub database: Option<PathBuf>,
}

fn default_mode() -> Mode {
    Mode::Archive
}

fn default_digests() -> Vec<String> {
    vec![DigestMethod::Sha256.name().to_string()]
}

fn default_encodings() -> Vec<String> {
    vec![XmlEncoding::DEFAULT.to_string()]
}

fn default_pending_digest_max() -> usize {
    128
}

fn default_pending_digest_timeout_secs() -> u64 {
    30
}

fn default_message_timeout_ms() -> u64 {
    30_000
}

fn default_live_poll_interval_ms() -> u64 {
    250
}

impl NodeConfig {
    /// A listener at `address` with defaults everywhere else.
    pub fn listener(address: impl Into<String>) -> Self {
        Self::with_role(NodeRole::Listener, address.into())
    }

    /// A connector at `address` with defaults everywhere else.
    pub fn connector(address: impl Into<String>) -> Self {
        Self::with_role(NodeRole::Connector, address.into())
    }

    fn with_role(role: NodeRole, address: String) -> Self {
        Self {
            role,
            address,
            peers: Vec::new(),
            digests: default_digests(),
            encodings: default_encodings(),
            pending_digest_max: default_pending_digest_max(),
            pending_digest_timeout_secs: default_pending_digest_timeout_secs(),
            message_timeout_ms: default_message_timeout_ms(),
            live_poll_interval_ms: default_live_poll_interval_ms(),
            agent: None,
            database: None,
        }
    }

    /// Parse and validate a JSON document.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    pub fn validate(&self) -> Result<()> {
        if self.address.is_empty() {
            return Err(JalopError::Config("address must not be empty".into()));
        }
        self.negotiation_config()?;
        self.subscriber_config()?;
        self.publisher_config()?;
        for peer in &self.peers {
            if peer.address.is_empty() {
                return Err(JalopError::Config("peer address must not be empty".into()));
            }
            if let Some(s) = peer.sessions.iter().find(|s| !s.mode.is_set()) {
                return Err(JalopError::Config(format!(
                    "session {} to {} needs a mode",
                    s.record_type, peer.address
                )));
            }
        }
        if self.role == NodeRole::Connector && self.peers.iter().all(|p| p.sessions.is_empty()) {
            return Err(JalopError::Config("a connector needs at least one session".into()));
        }
        Ok(())
    }

    pub fn negotiation_config(&self) -> Result<NegotiationConfig> {
        let digests = self
            .digests
            .iter()
            .map(|d| DigestMethod::from_name_or_uri(d))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let encodings = self
            .encodings
            .iter()
            .map(XmlEncoding::new)
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let config = NegotiationConfig {
            encodings,
            digests,
            agent: self.agent.clone(),
            message_timeout: Duration::from_millis(self.message_timeout_ms),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn subscriber_config(&self) -> Result<SubscriberConfig> {
        Ok(SubscriberConfig::new(
            self.pending_digest_max,
            Duration::from_secs(self.pending_digest_timeout_secs),
        )?)
    }

    pub fn publisher_config(&self) -> Result<PublisherConfig> {
        Ok(PublisherConfig::new(Duration::from_millis(self.live_poll_interval_ms))?)
    }

    pub fn peer(&self, address: &str) -> Option<&PeerConfig> {
        self.peers.iter().find(|p| p.address == address)
    }
}
