//! Single-key operations: serve locally when this node's shard owns the key,
//! otherwise forward to a member of the owning shard.

use shardkv_cluster::Topology;
use shardkv_common::{now_ms, ShardId, VClock};
use shardkv_net::protocol::{
    ContainsRequest, ContainsResponse, DeleteRequest, DeleteResponse, GetRequest, GetResponse,
    PutRequest, PutResponse,
};
use shardkv_net::{NetError, TcpPeerClient};
use shardkv_storage::{StorageContract, StorageError};
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum KvError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("no reachable peer in shard {0}")]
    NoPeer(ShardId),
    #[error("forward to {peer} failed: {source}")]
    Forward {
        peer: String,
        #[source]
        source: NetError,
    },
}

/// Transport for operations forwarded to the owning shard.
///
/// A trait so that tests can route straight into another service.
#[async_trait::async_trait]
pub trait Forwarder: Send + Sync + 'static {
    async fn contains(&self, peer: &str, req: &ContainsRequest) -> Result<ContainsResponse, NetError>;
    async fn get(&self, peer: &str, req: &GetRequest) -> Result<GetResponse, NetError>;
    async fn put(&self, peer: &str, req: &PutRequest) -> Result<PutResponse, NetError>;
    async fn delete(&self, peer: &str, req: &DeleteRequest) -> Result<DeleteResponse, NetError>;
}

#[async_trait::async_trait]
impl Forwarder for TcpPeerClient {
    async fn contains(&self, peer: &str, req: &ContainsRequest) -> Result<ContainsResponse, NetError> {
        self.forward_contains(peer, req).await
    }

    async fn get(&self, peer: &str, req: &GetRequest) -> Result<GetResponse, NetError> {
        self.forward_get(peer, req).await
    }

    async fn put(&self, peer: &str, req: &PutRequest) -> Result<PutResponse, NetError> {
        self.forward_put(peer, req).await
    }

    async fn delete(&self, peer: &str, req: &DeleteRequest) -> Result<DeleteResponse, NetError> {
        self.forward_delete(peer, req).await
    }
}

pub struct KvService<F: Forwarder> {
    storage: Arc<dyn StorageContract>,
    topology: Arc<dyn Topology>,
    forwarder: Arc<F>,
}

impl<F: Forwarder> std::fmt::Debug for KvService<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KvService")
            .field("local", &self.topology.local())
            .finish_non_exhaustive()
    }
}

impl<F: Forwarder> KvService<F> {
    pub fn new(
        storage: Arc<dyn StorageContract>,
        topology: Arc<dyn Topology>,
        forwarder: Arc<F>,
    ) -> Self {
        Self {
            storage,
            topology,
            forwarder,
        }
    }

    pub fn local(&self) -> &str {
        self.topology.local()
    }

    /// `None` when this node should serve `key` itself, otherwise the peer
    /// to forward to. An uninitialized topology serves everything locally.
    pub fn route(&self, key: &str) -> Result<Option<String>, KvError> {
        let Some(owner) = self.topology.shard_for_key(key) else {
            return Ok(None);
        };
        if self.topology.my_shard() == Some(owner) {
            return Ok(None);
        }
        self.topology
            .find_peer_in_shard(owner)
            .map(Some)
            .ok_or(KvError::NoPeer(owner))
    }

    fn forwarded(op: &str, peer: &str) {
        shardkv_metrics::metrics()
            .kv_forwarded
            .with_label_values(&[op])
            .inc();
        tracing::debug!(op, peer = %peer, "forwarding to owning shard");
    }

    fn forward_error(peer: String) -> impl FnOnce(NetError) -> KvError {
        move |source| KvError::Forward { peer, source }
    }

    // ── Routed operations ──

    pub async fn contains(&self, key: &str) -> Result<ContainsResponse, KvError> {
        shardkv_metrics::metrics().kv_ops.with_label_values(&["contains"]).inc();
        let req = ContainsRequest { key: key.to_string() };
        match self.route(key)? {
            None => Ok(self.local_contains(&req)),
            Some(peer) => {
                Self::forwarded("contains", &peer);
                let result = self.forwarder.contains(&peer, &req).await;
                result.map_err(Self::forward_error(peer))
            }
        }
    }

    pub async fn get(&self, key: &str, context: VClock) -> Result<GetResponse, KvError> {
        let _timer = shardkv_metrics::start_kv_timer("get");
        shardkv_metrics::metrics().kv_ops.with_label_values(&["get"]).inc();
        let req = GetRequest {
            key: key.to_string(),
            clock: context,
        };
        match self.route(key)? {
            None => Ok(self.local_get(&req)),
            Some(peer) => {
                Self::forwarded("get", &peer);
                let result = self.forwarder.get(&peer, &req).await;
                result.map_err(Self::forward_error(peer))
            }
        }
    }

    pub async fn put(&self, key: &str, value: Vec<u8>, context: VClock) -> Result<PutResponse, KvError> {
        let _timer = shardkv_metrics::start_kv_timer("put");
        shardkv_metrics::metrics().kv_ops.with_label_values(&["put"]).inc();
        let req = PutRequest {
            key: key.to_string(),
            value,
            clock: context,
            timestamp: now_ms(),
        };
        match self.route(key)? {
            None => self.local_put(req),
            Some(peer) => {
                Self::forwarded("put", &peer);
                let result = self.forwarder.put(&peer, &req).await;
                result.map_err(Self::forward_error(peer))
            }
        }
    }

    pub async fn delete(&self, key: &str, context: VClock) -> Result<DeleteResponse, KvError> {
        let _timer = shardkv_metrics::start_kv_timer("delete");
        shardkv_metrics::metrics().kv_ops.with_label_values(&["delete"]).inc();
        let req = DeleteRequest {
            key: key.to_string(),
            clock: context,
            timestamp: now_ms(),
        };
        match self.route(key)? {
            None => self.local_delete(&req),
            Some(peer) => {
                Self::forwarded("delete", &peer);
                let result = self.forwarder.delete(&peer, &req).await;
                result.map_err(Self::forward_error(peer))
            }
        }
    }

    // ── Local operations (also the targets of forwarded requests) ──

    pub fn local_contains(&self, req: &ContainsRequest) -> ContainsResponse {
        let (alive, version) = self.storage.contains(&req.key);
        ContainsResponse { alive, version }
    }

    pub fn local_get(&self, req: &GetRequest) -> GetResponse {
        match self.storage.get(&req.key, &req.clock) {
            Some((value, clock)) => GetResponse {
                value: Some(value),
                clock,
            },
            None => GetResponse {
                value: None,
                clock: self.storage.clock_of(&req.key).merge(&req.clock),
            },
        }
    }

    /// Write with `stored.merge(caller).increment(self)` as the new clock.
    pub fn local_put(&self, req: PutRequest) -> Result<PutResponse, KvError> {
        let outcome =
            self.storage
                .put_causal(&req.key, req.value, req.timestamp, &req.clock, self.local())?;
        Ok(PutResponse {
            applied: outcome.applied,
            replaced: outcome.applied && outcome.replaced,
            clock: outcome.clock,
        })
    }

    pub fn local_delete(&self, req: &DeleteRequest) -> Result<DeleteResponse, KvError> {
        let outcome =
            self.storage
                .delete_causal(&req.key, req.timestamp, &req.clock, self.local())?;
        Ok(DeleteResponse {
            applied: outcome.applied,
            clock: outcome.clock,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::RwLock;
    use shardkv_cluster::ShardTopology;
    use shardkv_ring::PositionHasher;
    use shardkv_storage::{FsyncPolicy, StorageEngine};
    use std::collections::HashMap;
    use tempfile::TempDir;

    type Services = RwLock<HashMap<String, Arc<KvService<LocalForwarder>>>>;

    /// Routes forwarded calls straight into another in-process service.
    #[derive(Default)]
    struct LocalForwarder {
        services: Services,
    }

    impl LocalForwarder {
        fn target(&self, peer: &str) -> Result<Arc<KvService<LocalForwarder>>, NetError> {
            self.services.read().get(peer).cloned().ok_or(NetError::Closed)
        }
    }

    #[async_trait::async_trait]
    impl Forwarder for LocalForwarder {
        async fn contains(&self, peer: &str, req: &ContainsRequest) -> Result<ContainsResponse, NetError> {
            Ok(self.target(peer)?.local_contains(req))
        }
        async fn get(&self, peer: &str, req: &GetRequest) -> Result<GetResponse, NetError> {
            Ok(self.target(peer)?.local_get(req))
        }
        async fn put(&self, peer: &str, req: &PutRequest) -> Result<PutResponse, NetError> {
            self.target(peer)?
                .local_put(req.clone())
                .map_err(|e| NetError::Handler(e.to_string()))
        }
        async fn delete(&self, peer: &str, req: &DeleteRequest) -> Result<DeleteResponse, NetError> {
            self.target(peer)?
                .local_delete(req)
                .map_err(|e| NetError::Handler(e.to_string()))
        }
    }

    const PEERS: [&str; 4] = ["p0", "p1", "p2", "p3"];

    struct Cluster {
        _dirs: Vec<TempDir>,
        storages: HashMap<String, Arc<StorageEngine>>,
        services: HashMap<String, Arc<KvService<LocalForwarder>>>,
    }

    /// Four peers in two shards: {p0, p2} and {p1, p3}.
    fn cluster() -> Cluster {
        let forwarder = Arc::new(LocalForwarder::default());
        let mut dirs = Vec::new();
        let mut storages = HashMap::new();
        let mut services = HashMap::new();
        for peer in PEERS {
            let dir = TempDir::new().unwrap();
            let storage = Arc::new(StorageEngine::open(dir.path(), FsyncPolicy::None).unwrap());
            let topology = Arc::new(ShardTopology::new(peer, &PEERS, 2, PositionHasher::default()));
            let service = Arc::new(KvService::new(
                storage.clone(),
                topology,
                forwarder.clone(),
            ));
            forwarder.services.write().insert(peer.to_string(), service.clone());
            storages.insert(peer.to_string(), storage);
            services.insert(peer.to_string(), service);
            dirs.push(dir);
        }
        Cluster {
            _dirs: dirs,
            storages,
            services,
        }
    }

    /// A key owned by `shard` under the modulo rule.
    fn key_in_shard(shard: u32) -> String {
        let hasher = PositionHasher::default();
        (0..)
            .map(|i| format!("key-{i}"))
            .find(|k| hasher.key_position(k) % 2 == u64::from(shard))
            .unwrap()
    }

    fn standalone() -> (TempDir, KvService<LocalForwarder>) {
        let dir = TempDir::new().unwrap();
        let storage = Arc::new(StorageEngine::open(dir.path(), FsyncPolicy::None).unwrap());
        let topology = Arc::new(ShardTopology::new("solo", &["solo"], 1, PositionHasher::default()));
        let service = KvService::new(storage, topology, Arc::new(LocalForwarder::default()));
        (dir, service)
    }

    #[tokio::test]
    async fn test_local_put_get_delete() {
        let (_dir, svc) = standalone();

        let put = svc.put("k", b"v1".to_vec(), VClock::new()).await.unwrap();
        assert!(put.applied);
        assert!(!put.replaced);
        assert_eq!(put.clock.get("solo"), 1);

        let put = svc.put("k", b"v2".to_vec(), put.clock).await.unwrap();
        assert!(put.replaced);
        assert_eq!(put.clock.get("solo"), 2);

        let got = svc.get("k", VClock::new()).await.unwrap();
        assert_eq!(got.value.as_deref(), Some(&b"v2"[..]));
        assert_eq!(got.clock, put.clock);

        let del = svc.delete("k", got.clock).await.unwrap();
        assert!(del.applied);
        assert_eq!(del.clock.get("solo"), 3);

        let got = svc.get("k", VClock::new()).await.unwrap();
        assert_eq!(got.value, None);
        assert_eq!(got.clock, del.clock);
        assert!(!svc.contains("k").await.unwrap().alive);
    }

    #[tokio::test]
    async fn test_write_merges_caller_context() {
        let (_dir, svc) = standalone();
        let context = VClock::from_pairs([("other", 4)]);
        let put = svc.put("k", b"v".to_vec(), context).await.unwrap();
        assert_eq!(put.clock.get("other"), 4);
        assert_eq!(put.clock.get("solo"), 1);
    }

    #[test]
    fn test_concurrent_local_puts_never_share_a_clock() {
        let (_dir, svc) = standalone();
        let mut counters: Vec<u64> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..4)
                .map(|t| {
                    let svc = &svc;
                    scope.spawn(move || {
                        (0..20)
                            .map(|i| {
                                let req = PutRequest {
                                    key: "k".into(),
                                    value: format!("{t}-{i}").into_bytes(),
                                    clock: VClock::new(),
                                    timestamp: 1_000,
                                };
                                svc.local_put(req).unwrap().clock.get("solo")
                            })
                            .collect::<Vec<_>>()
                    })
                })
                .collect();
            handles.into_iter().flat_map(|h| h.join().unwrap()).collect()
        });
        counters.sort_unstable();
        assert_eq!(counters, (1..=80).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_delete_missing_key_not_applied() {
        let (_dir, svc) = standalone();
        let del = svc.delete("nope", VClock::new()).await.unwrap();
        assert!(!del.applied);
        assert!(del.clock.is_empty());
    }

    #[tokio::test]
    async fn test_oversized_put_refused() {
        let (_dir, svc) = standalone();
        let key = "k".repeat(shardkv_storage::MAX_KEY_LEN + 1);
        let put = svc.put(&key, b"v".to_vec(), VClock::new()).await.unwrap();
        assert!(!put.applied);
        assert!(!svc.contains(&key).await.unwrap().alive);
    }

    #[tokio::test]
    async fn test_foreign_key_is_forwarded_to_owner() {
        let c = cluster();
        let key = key_in_shard(1);

        // p0 lives in shard 0, so the write lands in shard 1.
        let put = c.services["p0"].put(&key, b"v".to_vec(), VClock::new()).await.unwrap();
        assert!(put.applied);
        assert!(c.storages["p0"].entry(&key).is_none());

        let holders: Vec<&str> = ["p1", "p3"]
            .into_iter()
            .filter(|p| c.storages[*p].entry(&key).is_some())
            .collect();
        assert_eq!(holders.len(), 1);
        assert_eq!(put.clock.get(holders[0]), 1);

        let holder = &c.services[holders[0]];
        let got = holder.get(&key, VClock::new()).await.unwrap();
        assert_eq!(got.value.as_deref(), Some(&b"v"[..]));
    }

    #[tokio::test]
    async fn test_owned_key_is_served_locally() {
        let c = cluster();
        let key = key_in_shard(0);
        assert_eq!(c.services["p2"].route(&key).unwrap(), None);

        c.services["p2"].put(&key, b"v".to_vec(), VClock::new()).await.unwrap();
        assert!(c.storages["p2"].entry(&key).is_some());
        assert!(c.storages["p0"].entry(&key).is_none());
    }

    #[tokio::test]
    async fn test_unreachable_owner_is_an_error() {
        let c = cluster();
        c.services["p1"].forwarder.services.write().clear();
        let key = key_in_shard(0);
        let err = c.services["p1"].get(&key, VClock::new()).await.unwrap_err();
        assert!(matches!(err, KvError::Forward { .. }));
    }
}
