//! Connection policy driven by the configured peer list.

use std::collections::{BTreeSet, HashMap, HashSet};

use tracing::info;

use jalop_core::{ConnectError, RecordType, Role};
use jalop_session::{ConnectionHandler, ConnectionRequest};

use crate::config::NodeConfig;

#[derive(Debug, Default, Clone)]
struct Allowed {
    publish: HashSet<RecordType>,
    subscribe: HashSet<RecordType>,
}

/// Accepts a peer only for the record types and directions configured for
/// its address.
///
/// Unknown peers and disallowed directions get `UnsupportedMode`.
#[derive(Debug, Default, Clone)]
pub struct AllowListHandler {
    peers: HashMap<String, Allowed>,
}

impl AllowListHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &NodeConfig) -> Self {
        let mut handler = Self::new();
        for peer in &config.peers {
            for rt in &peer.publish_allowed {
                handler = handler.allow(&peer.address, Role::Publisher, *rt);
            }
            for rt in &peer.subscribe_allowed {
                handler = handler.allow(&peer.address, Role::Subscriber, *rt);
            }
        }
        handler
    }

    /// Let `peer` take `role` for `record_type`.
    pub fn allow(mut self, peer: &str, role: Role, record_type: RecordType) -> Self {
        let allowed = self.peers.entry(peer.to_string()).or_default();
        match role {
            Role::Publisher => allowed.publish.insert(record_type),
            Role::Subscriber => allowed.subscribe.insert(record_type),
        };
        self
    }

    fn permits(&self, peer: &str, role: Role, record_type: RecordType) -> bool {
        self.peers.get(peer).is_some_and(|a| match role {
            Role::Publisher => a.publish.contains(&record_type),
            Role::Subscriber => a.subscribe.contains(&record_type),
        })
    }
}

impl ConnectionHandler for AllowListHandler {
    fn handle_connection_request(&self, request: &mut ConnectionRequest) -> BTreeSet<ConnectError> {
        let mut errors = BTreeSet::new();
        if !self.permits(&request.peer_addr, request.role, request.record_type) {
            info!(
                peer = %request.peer_addr,
                role = %request.role,
                record_type = %request.record_type,
                "peer not allowed"
            );
            errors.insert(ConnectError::UnsupportedMode);
        }
        errors
    }
}
