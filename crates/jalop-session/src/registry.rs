//! Channel-to-session registry shared by all sessions of a node.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::error::{Result, SessionError};
use crate::session::Session;
use crate::transport::ChannelId;

/// Concurrent map from channel ids to live sessions.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<ChannelId, Arc<Session>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session under its channel id. Returns the session it
    /// replaced, if any.
    pub async fn insert(&self, session: Arc<Session>) -> Option<Arc<Session>> {
        self.sessions
            .write()
            .await
            .insert(session.channel_id(), session)
    }

    pub async fn get(&self, channel: ChannelId) -> Result<Arc<Session>> {
        self.sessions
            .read()
            .await
            .get(&channel)
            .cloned()
            .ok_or(SessionError::SessionInvalid(channel))
    }

    pub async fn remove(&self, channel: ChannelId) -> Result<Arc<Session>> {
        self.sessions
            .write()
            .await
            .remove(&channel)
            .ok_or(SessionError::SessionInvalid(channel))
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    /// Snapshot of every registered session.
    pub async fn sessions(&self) -> Vec<Arc<Session>> {
        self.sessions.read().await.values().cloned().collect()
    }

    /// Close every session and empty the registry.
    pub async fn close_all(&self) {
        let drained: Vec<_> = self.sessions.write().await.drain().map(|(_, s)| s).collect();
        for session in drained {
            session.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::tests::params;
    use crate::transport::memory::pair;
    use jalop_core::{Mode, Role};

    #[tokio::test]
    async fn test_insert_get_remove() {
        let registry = SessionRegistry::new();
        let (a, _b) = pair("x", "y");
        let session = Arc::new(Session::new(params(Role::Publisher, Mode::Live, true), Arc::new(a)));
        let id = session.channel_id();

        assert!(registry.insert(Arc::clone(&session)).await.is_none());
        assert_eq!(registry.len().await, 1);
        assert_eq!(registry.get(id).await.unwrap().id(), session.id());

        registry.remove(id).await.unwrap();
        assert!(matches!(registry.get(id).await, Err(SessionError::SessionInvalid(c)) if c == id));
        assert!(registry.remove(id).await.is_err());
    }

    #[tokio::test]
    async fn test_concurrent_inserts() {
        let registry = Arc::new(SessionRegistry::new());
        let mut handles = Vec::new();
        for _ in 0..16 {
            let registry = Arc::clone(&registry);
            handles.push(tokio::spawn(async move {
                let (a, _b) = pair("x", "y");
                let s = Arc::new(Session::new(params(Role::Subscriber, Mode::Archive, false), Arc::new(a)));
                registry.insert(s).await;
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(registry.len().await, 16);
        registry.close_all().await;
        assert!(registry.is_empty().await);
    }
}
