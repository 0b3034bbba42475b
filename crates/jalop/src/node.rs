//! The node: negotiates channels and runs one engine per session.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn, Instrument};

use jalop_core::{Mode, RecordType, Role};
use jalop_session::{
    run_publisher, run_subscriber, Channel, ConnectionHandler, MemoryListener, MemoryNetwork,
    Negotiator, Publisher, PublisherConfig, Session, SessionRegistry, Subscriber, SubscriberConfig,
};
use jalop_store::{MemoryRecordStore, RecordSink, RecordSource, SqliteRecordStore};

use crate::adapters::{StorePublisher, StoreSubscriber};
use crate::config::NodeConfig;
use crate::error::{JalopError, Result};
use crate::handler::AllowListHandler;

/// Handle to a session's engine task.
pub type SessionTask = JoinHandle<Result<()>>;

/// Builds a [`Node`] from a config and application callbacks.
pub struct NodeBuilder {
    config: NodeConfig,
    handler: Option<Arc<dyn ConnectionHandler>>,
    publisher: Option<Arc<dyn Publisher>>,
    subscriber: Option<Arc<dyn Subscriber>>,
}

impl NodeBuilder {
    pub fn new(config: NodeConfig) -> Self {
        Self {
            config,
            handler: None,
            publisher: None,
            subscriber: None,
        }
    }

    /// Connection policy. Defaults to an [`AllowListHandler`] built from
    /// the configured peers.
    pub fn handler(mut self, handler: Arc<dyn ConnectionHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    pub fn publisher(mut self, publisher: Arc<dyn Publisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    pub fn subscriber(mut self, subscriber: Arc<dyn Subscriber>) -> Self {
        self.subscriber = Some(subscriber);
        self
    }

    /// Serve from and store into `store`.
    pub fn store<S>(self, store: Arc<S>) -> Self
    where
        S: RecordSource + RecordSink + 'static,
    {
        self.publisher(Arc::new(StorePublisher::new(Arc::clone(&store))))
            .subscriber(Arc::new(StoreSubscriber::new(store)))
    }

    pub fn build(self) -> Result<Node> {
        self.config.validate()?;
        let mut local_roles = Vec::new();
        if self.publisher.is_some() {
            local_roles.push(Role::Publisher);
        }
        if self.subscriber.is_some() {
            local_roles.push(Role::Subscriber);
        }
        if local_roles.is_empty() {
            return Err(JalopError::Config("node needs a publisher or a subscriber".into()));
        }
        let handler = self
            .handler
            .unwrap_or_else(|| Arc::new(AllowListHandler::from_config(&self.config)));
        let negotiator = Negotiator::new(self.config.negotiation_config()?, handler, local_roles)?;
        let (shutdown, _) = watch::channel(false);
        Ok(Node {
            inner: Arc::new(Inner {
                publisher_config: self.config.publisher_config()?,
                subscriber_config: self.config.subscriber_config()?,
                config: self.config,
                negotiator,
                registry: SessionRegistry::new(),
                publisher: self.publisher,
                subscriber: self.subscriber,
                shutdown,
            }),
        })
    }
}

struct Inner {
    config: NodeConfig,
    negotiator: Negotiator,
    registry: SessionRegistry,
    publisher: Option<Arc<dyn Publisher>>,
    subscriber: Option<Arc<dyn Subscriber>>,
    publisher_config: PublisherConfig,
    subscriber_config: SubscriberConfig,
    shutdown: watch::Sender<bool>,
}

/// A JALoP peer. Cheap to clone.
#[derive(Clone)]
pub struct Node {
    inner: Arc<Inner>,
}

impl Node {
    pub fn builder(config: NodeConfig) -> NodeBuilder {
        NodeBuilder::new(config)
    }

    /// A node serving and storing records in the configured store: SQLite
    /// at `database` if set, memory otherwise.
    pub fn from_config(config: NodeConfig) -> Result<Self> {
        match config.database.clone() {
            Some(path) => {
                let store = Arc::new(SqliteRecordStore::open(path)?);
                NodeBuilder::new(config).store(store).build()
            }
            None => NodeBuilder::new(config).store(Arc::new(MemoryRecordStore::new())).build(),
        }
    }

    pub fn config(&self) -> &NodeConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.inner.registry
    }

    /// Accept channels from `listener` until it closes or the node shuts
    /// down. Each channel is negotiated and run on its own task.
    pub async fn serve(&self, mut listener: MemoryListener) -> Result<()> {
        info!(address = %listener.local_addr(), "node listening");
        let mut shutdown = self.inner.shutdown.subscribe();
        loop {
            let channel = tokio::select! {
                c = listener.accept() => c,
                _ = shutdown.wait_for(|s| *s) => None,
            };
            let Some(channel) = channel else {
                break;
            };
            let node = self.clone();
            tokio::spawn(async move {
                let peer = channel.peer_addr().to_string();
                if let Err(e) = node.accept(Arc::new(channel)).await {
                    warn!(peer = %peer, error = %e, "inbound channel failed");
                }
            });
        }
        info!(address = %listener.local_addr(), "node stopped listening");
        Ok(())
    }

    /// Negotiate an inbound channel and start its engine.
    pub async fn accept(&self, channel: Arc<dyn Channel>) -> Result<SessionTask> {
        let session = self.inner.negotiator.accept(channel).await?;
        Ok(self.spawn_session(session).await)
    }

    /// Negotiate an outbound channel where we take `role`.
    pub async fn open(
        &self,
        channel: Arc<dyn Channel>,
        record_type: RecordType,
        role: Role,
        mode: Mode,
    ) -> Result<SessionTask> {
        let session = self.inner.negotiator.connect(channel, role, mode, record_type).await?;
        Ok(self.spawn_session(session).await)
    }

    /// Dial every configured peer and open its sessions.
    pub async fn connect_all(&self, network: &MemoryNetwork) -> Result<Vec<SessionTask>> {
        let mut tasks = Vec::new();
        for peer in &self.inner.config.peers {
            for s in &peer.sessions {
                let channel = network.connect(&self.inner.config.address, &peer.address).await?;
                tasks.push(self.open(Arc::new(channel), s.record_type, s.role, s.mode).await?);
            }
        }
        Ok(tasks)
    }

    /// Close every session and stop [`Node::serve`].
    pub async fn shutdown(&self) {
        self.inner.shutdown.send_replace(true);
        self.inner.registry.close_all().await;
    }

    async fn spawn_session(&self, session: Arc<Session>) -> SessionTask {
        self.inner.registry.insert(Arc::clone(&session)).await;
        let inner = Arc::clone(&self.inner);
        let span = session.span().clone();
        tokio::spawn(
            async move {
                let result = inner.run_engine(Arc::clone(&session)).await;
                if let Err(e) = &result {
                    warn!(error = %e, "session ended with an error");
                }
                let _ = inner.registry.remove(session.channel_id()).await;
                result
            }
            .instrument(span),
        )
    }
}

impl Inner {
    async fn run_engine(&self, session: Arc<Session>) -> Result<()> {
        match session.local_role() {
            Role::Publisher => {
                let publisher = self
                    .publisher
                    .clone()
                    .ok_or_else(|| JalopError::Config("no publisher registered".into()))?;
                run_publisher(session, publisher, self.publisher_config.clone()).await?;
            }
            Role::Subscriber => {
                let subscriber = self
                    .subscriber
                    .clone()
                    .ok_or_else(|| JalopError::Config("no subscriber registered".into()))?;
                run_subscriber(session, subscriber, self.subscriber_config.clone()).await?;
            }
        }
        Ok(())
    }
}
