//! shardkv node assembly.
//!
//! Wires storage, cluster view, anti-entropy engine, peer handlers and the
//! HTTP API onto one TCP listener.

pub mod api;
pub mod handlers;
pub mod service;

use api::NodeApi;
use service::KvService;
use shardkv_cluster::{MembershipView, ShardTopology};
use shardkv_config::{ConfigError, NodeConfig};
use shardkv_gossip::{AntiEntropyEngine, GossipConfig};
use shardkv_net::{Endpoint, NetError, TcpPeerClient};
use shardkv_storage::{FsyncPolicy, StorageEngine, StorageError};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("server error: {0}")]
    Net(#[from] NetError),
}

pub type Engine = AntiEntropyEngine<TcpPeerClient>;

/// A running node. Dropping it does not stop the background tasks; call
/// [`Node::shutdown`].
pub struct Node {
    identity: String,
    local_addr: SocketAddr,
    storage: Arc<StorageEngine>,
    topology: Arc<ShardTopology>,
    membership: Arc<MembershipView>,
    engine: Arc<Engine>,
    service: Arc<KvService<TcpPeerClient>>,
    server: JoinHandle<Result<(), NetError>>,
    gossip: JoinHandle<()>,
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("identity", &self.identity)
            .field("local_addr", &self.local_addr)
            .finish_non_exhaustive()
    }
}

impl Node {
    /// Bind `config.listen` and start.
    pub async fn start(config: NodeConfig) -> Result<Self, NodeError> {
        let listener = TcpListener::bind(config.listen).await?;
        Self::start_with_listener(config, listener).await
    }

    /// Start on an already bound listener.
    pub async fn start_with_listener(
        config: NodeConfig,
        listener: TcpListener,
    ) -> Result<Self, NodeError> {
        config.validate()?;
        let identity = config.identity();
        let local_addr = listener.local_addr()?;

        let storage = Arc::new(StorageEngine::open(
            &config.storage.data_dir,
            FsyncPolicy::from_str_config(&config.storage.fsync),
        )?);
        let topology = Arc::new(ShardTopology::new(
            identity.clone(),
            config.peers.as_slice(),
            config.shards,
            config.hasher()?,
        ));
        let membership = Arc::new(MembershipView::new(
            identity.clone(),
            config.peers.iter().cloned(),
        ));
        let client = Arc::new(TcpPeerClient::new(config.gossip.rpc_timeout()));

        let engine = Arc::new(AntiEntropyEngine::new(
            storage.clone(),
            topology.clone(),
            membership.clone(),
            client.clone(),
            GossipConfig {
                interval: config.gossip.interval(),
                tick: config.gossip.tick(),
                fanout: config.gossip.fanout,
            },
        ));
        let service = Arc::new(KvService::new(storage.clone(), topology.clone(), client));

        let endpoint = Arc::new(Endpoint::new());
        handlers::register(&endpoint, engine.clone(), service.clone());
        endpoint.set_http(Arc::new(NodeApi::new(
            service.clone(),
            topology.clone(),
            membership.clone(),
        )));

        let server = tokio::spawn(endpoint.serve(listener));
        let gossip = engine.spawn();

        tracing::info!(
            node = %identity,
            addr = %local_addr,
            shard = ?topology.my_shard(),
            peers = config.peers.len(),
            "node started"
        );

        Ok(Self {
            identity,
            local_addr,
            storage,
            topology,
            membership,
            engine,
            service,
            server,
            gossip,
        })
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn storage(&self) -> &Arc<StorageEngine> {
        &self.storage
    }

    pub fn topology(&self) -> &Arc<ShardTopology> {
        &self.topology
    }

    pub fn membership(&self) -> &Arc<MembershipView> {
        &self.membership
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    pub fn service(&self) -> &Arc<KvService<TcpPeerClient>> {
        &self.service
    }

    /// Resolves when the accept loop exits, which only happens on error.
    pub async fn serve_until_error(&mut self) -> Result<(), NodeError> {
        match (&mut self.server).await {
            Ok(result) => result.map_err(NodeError::from),
            Err(e) => Err(NodeError::Io(std::io::Error::other(e))),
        }
    }

    /// Stop the anti-entropy loop and the listener, then flush storage.
    pub async fn shutdown(self) -> Result<(), NodeError> {
        self.engine.shutdown();
        if let Err(e) = self.gossip.await {
            tracing::warn!(error = %e, "anti-entropy task ended abnormally");
        }
        self.server.abort();
        self.storage.sync()?;
        tracing::info!(node = %self.identity, "node stopped");
        Ok(())
    }
}
