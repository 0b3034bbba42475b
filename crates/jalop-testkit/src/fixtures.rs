//! Test fixtures and helpers.
//!
//! Common setup code for integration tests.

use std::sync::Arc;

use tokio::task::JoinHandle;

use jalop::session::MemoryNetwork;
use jalop::store::{MemoryRecordStore, RecordSink, StoredRecord};
use jalop::{Mode, Node, NodeConfig, Nonce, PeerConfig, RecordType, Result, Role, SessionConfig, SessionTask};

/// Address the listening node serves on.
pub const LISTENER_ADDR: &str = "collector";
/// Address the connecting node dials from.
pub const CONNECTOR_ADDR: &str = "host-a";

/// A listener and a connector on one in-memory network, each backed by
/// its own memory store.
pub struct NodePair {
    pub network: Arc<MemoryNetwork>,
    pub listener: Node,
    pub listener_store: Arc<MemoryRecordStore>,
    pub connector: Node,
    pub connector_store: Arc<MemoryRecordStore>,
    serve: JoinHandle<Result<()>>,
}

impl NodePair {
    /// Start the listener. Nothing is dialled until [`NodePair::connect`].
    pub async fn new(listener_config: NodeConfig, connector_config: NodeConfig) -> Result<Self> {
        let network = MemoryNetwork::new();
        let listener_store = Arc::new(MemoryRecordStore::new());
        let connector_store = Arc::new(MemoryRecordStore::new());
        let listener = Node::builder(listener_config)
            .store(Arc::clone(&listener_store))
            .build()?;
        let connector = Node::builder(connector_config)
            .store(Arc::clone(&connector_store))
            .build()?;

        let incoming = network.listen(LISTENER_ADDR).await;
        let serving = listener.clone();
        let serve = tokio::spawn(async move { serving.serve(incoming).await });

        Ok(Self {
            network,
            listener,
            listener_store,
            connector,
            connector_store,
            serve,
        })
    }

    /// The connector publishes `record_type` to the listener.
    pub async fn publishing(record_type: RecordType, mode: Mode) -> Result<Self> {
        let (listener, connector) = configs(record_type, Role::Publisher, mode);
        Self::new(listener, connector).await
    }

    /// The connector subscribes to `record_type` from the listener.
    pub async fn subscribing(record_type: RecordType, mode: Mode) -> Result<Self> {
        let (listener, connector) = configs(record_type, Role::Subscriber, mode);
        Self::new(listener, connector).await
    }

    /// Dial the listener and open every configured session.
    pub async fn connect(&self) -> Result<Vec<SessionTask>> {
        self.connector.connect_all(&self.network).await
    }

    /// Open every session and wait for all of them to end.
    pub async fn run_to_completion(&self) -> Result<()> {
        for task in self.connect().await? {
            task.await.map_err(std::io::Error::from)??;
        }
        Ok(())
    }

    pub async fn shutdown(self) {
        self.connector.shutdown().await;
        self.listener.shutdown().await;
        self.serve.abort();
    }
}

/// Configs for a listener at [`LISTENER_ADDR`] and a connector at
/// [`CONNECTOR_ADDR`] that opens one session where it takes `connector_role`.
///
/// The listener allows the connector both directions for `record_type`.
pub fn configs(record_type: RecordType, connector_role: Role, mode: Mode) -> (NodeConfig, NodeConfig) {
    let mut listener = NodeConfig::listener(LISTENER_ADDR);
    listener.peers.push(PeerConfig {
        address: CONNECTOR_ADDR.to_string(),
        publish_allowed: vec![record_type],
        subscribe_allowed: vec![record_type],
        sessions: Vec::new(),
    });

    let mut connector = NodeConfig::connector(CONNECTOR_ADDR);
    connector.peers.push(PeerConfig {
        address: LISTENER_ADDR.to_string(),
        publish_allowed: Vec::new(),
        subscribe_allowed: Vec::new(),
        sessions: vec![SessionConfig {
            record_type,
            role: connector_role,
            mode,
        }],
    });
    (listener, connector)
}

/// A record with fixed metadata and `payload`.
///
/// # Panics
///
/// Panics if `nonce` is blank.
pub fn record(record_type: RecordType, nonce: &str, payload: impl Into<bytes::Bytes>) -> StoredRecord {
    let nonce = Nonce::new(nonce).expect("fixture nonce must not be blank");
    StoredRecord::new(
        record_type,
        nonce,
        "<sys-metadata/>",
        "<app-metadata/>",
        payload.into(),
    )
}

/// Store `count` records named `1..=count`.
pub async fn seed<K: RecordSink>(sink: &K, record_type: RecordType, count: usize) -> Result<()> {
    for i in 1..=count {
        let payload = format!("record {i} of {count}");
        sink.insert_record(&record(record_type, &i.to_string(), payload), None)
            .await?;
    }
    Ok(())
}

/// Send `tracing` output to the test harness. Safe to call repeatedly.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .try_init();
}
