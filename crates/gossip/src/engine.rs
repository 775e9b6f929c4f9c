//! The anti-entropy background loop and its receiving side.

use crate::conflict::remote_wins;
use crate::transport::{GossipTransport, PeerError};
use parking_lot::Mutex;
use shardkv_cluster::{Membership, Topology};
use shardkv_common::{EntryBatch, ShardId, ShardSnapshot, TimeDigest};
use shardkv_storage::StorageContract;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{Duration, Instant, MissedTickBehavior};

/// Scheduling knobs for the anti-entropy loop.
#[derive(Debug, Clone)]
pub struct GossipConfig {
    /// Time between regular rounds.
    pub interval: Duration,
    /// How often the loop wakes to check the deadline and help flag.
    pub tick: Duration,
    /// Partners contacted per round.
    pub fanout: usize,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            tick: Duration::from_millis(50),
            fanout: 2,
        }
    }
}

/// Per-node anti-entropy state.
///
/// The deadline starts at `now + interval`. A round runs when the deadline
/// passes or a peer asked for help, and resets both afterwards.
pub struct AntiEntropyEngine<T: GossipTransport> {
    storage: Arc<dyn StorageContract>,
    topology: Arc<dyn Topology>,
    membership: Arc<dyn Membership>,
    transport: Arc<T>,
    config: GossipConfig,
    deadline: Mutex<Instant>,
    help_requested: AtomicBool,
    shutdown: watch::Sender<bool>,
}

impl<T: GossipTransport> std::fmt::Debug for AntiEntropyEngine<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AntiEntropyEngine")
            .field("local", &self.topology.local())
            .field("config", &self.config)
            .field("help_requested", &self.help_requested())
            .finish_non_exhaustive()
    }
}

impl<T: GossipTransport> AntiEntropyEngine<T> {
    pub fn new(
        storage: Arc<dyn StorageContract>,
        topology: Arc<dyn Topology>,
        membership: Arc<dyn Membership>,
        transport: Arc<T>,
        config: GossipConfig,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            deadline: Mutex::new(Instant::now() + config.interval),
            storage,
            topology,
            membership,
            transport,
            config,
            help_requested: AtomicBool::new(false),
            shutdown,
        }
    }

    pub fn config(&self) -> &GossipConfig {
        &self.config
    }

    // ── Receiving side ──

    /// Ask for a round on the next tick.
    pub fn request_help(&self) {
        self.help_requested.store(true, Ordering::Release);
    }

    pub fn help_requested(&self) -> bool {
        self.help_requested.load(Ordering::Acquire)
    }

    /// Drop every digest entry whose timestamp matches ours exactly. Anything
    /// else stays, including keys where we are newer, so that content rather
    /// than timestamps settles the conflict.
    pub fn prune_digest(&self, digest: &TimeDigest) -> TimeDigest {
        let local = self.storage.digest();
        digest
            .iter()
            .filter(|(key, ts)| local.get(*key) != Some(*ts))
            .map(|(k, ts)| (k.clone(), *ts))
            .collect()
    }

    /// Merge remote entries into local storage. Returns how many replaced
    /// the local copy.
    pub fn merge_entries(&self, batch: EntryBatch) -> usize {
        let m = shardkv_metrics::metrics();
        let mut applied = 0;
        for (key, remote) in batch {
            match self.storage.merge_entry(&key, remote, &remote_wins) {
                Ok(true) => {
                    applied += 1;
                    m.entries_merged.inc();
                }
                Ok(false) => m.entries_discarded.inc(),
                Err(e) => tracing::warn!(key = %key, error = %e, "failed to store merged entry"),
            }
        }
        if applied > 0 {
            tracing::debug!(applied, "merged remote entries");
        }
        applied
    }

    /// Adopt a peer's shard layout and the peer set it implies.
    pub fn apply_snapshot(&self, snapshot: &ShardSnapshot) -> bool {
        let changed = self.topology.overwrite(snapshot);
        self.membership.overwrite(&snapshot.peers());
        changed
    }

    // ── Sending side ──

    /// Whether a round should run now.
    pub fn is_due(&self) -> bool {
        self.help_requested() || Instant::now() >= *self.deadline.lock()
    }

    fn partners(&self) -> Vec<String> {
        if self.topology.my_shard().is_some() {
            self.topology.random_local(self.config.fanout)
        } else {
            self.membership.random(self.config.fanout)
        }
    }

    /// Digest exchange then entry push with a single partner.
    /// Returns the number of entries shipped.
    pub async fn exchange_with(&self, peer: &str) -> Result<usize, PeerError> {
        let digest = self.storage.digest();
        let wanted = self.transport.exchange_digest(peer, &digest).await?;
        if wanted.is_empty() {
            return Ok(0);
        }
        let batch = self.storage.bulk_fetch(&wanted);
        if batch.is_empty() {
            return Ok(0);
        }
        self.transport.send_entries(peer, &batch).await?;
        Ok(batch.len())
    }

    /// Push the current layout to every other peer.
    async fn broadcast_snapshot(&self) {
        let snapshot = self.topology.snapshot();
        for peer in self.topology.everyone_else() {
            if let Err(e) = self.transport.send_shards(&peer, &snapshot).await {
                shardkv_metrics::metrics().gossip_partner_failures.inc();
                tracing::warn!(peer = %peer, error = %e, "failed to send shard layout");
            }
        }
    }

    /// Hand keys this shard no longer owns to a member of the owning shard.
    /// Local copies stay.
    async fn redistribute(&self) {
        let mine = self.topology.my_shard();
        let mut moving: HashMap<ShardId, TimeDigest> = HashMap::new();
        for (key, ts) in self.storage.digest() {
            match self.topology.shard_for_key(&key) {
                Some(owner) if Some(owner) != mine => {
                    moving.entry(owner).or_default().insert(key, ts);
                }
                _ => {}
            }
        }

        for (shard, keys) in moving {
            let Some(peer) = self.topology.find_peer_in_shard(shard) else {
                tracing::debug!(%shard, "no peer to receive moved keys");
                continue;
            };
            let batch = self.storage.bulk_fetch(&keys);
            match self.transport.send_entries(&peer, &batch).await {
                Ok(()) => tracing::info!(%shard, peer = %peer, keys = batch.len(), "moved keys to owning shard"),
                Err(e) => {
                    shardkv_metrics::metrics().gossip_partner_failures.inc();
                    tracing::warn!(%shard, peer = %peer, error = %e, "failed to move keys");
                }
            }
        }
    }

    /// One full round: data exchange with partners, topology propagation if
    /// the layout or the membership view changed, then reset the deadline
    /// and help flag.
    pub async fn run_round(&self) {
        let m = shardkv_metrics::metrics();
        m.gossip_rounds.inc();

        for peer in self.partners() {
            match self.exchange_with(&peer).await {
                Ok(sent) => tracing::debug!(peer = %peer, sent, "gossip exchange complete"),
                Err(e) => {
                    m.gossip_partner_failures.inc();
                    tracing::warn!(peer = %peer, error = %e, "gossip exchange failed");
                }
            }
        }

        let layout_changed = self.topology.take_change();
        let view_changed = self.membership.take_change();
        if layout_changed {
            m.topology_changes.inc();
        }
        if layout_changed || view_changed {
            tracing::debug!(layout_changed, view_changed, "propagating cluster change");
            self.broadcast_snapshot().await;
            self.redistribute().await;
        }

        *self.deadline.lock() = Instant::now() + self.config.interval;
        self.help_requested.store(false, Ordering::Release);
    }

    /// Ask local partners to push to us. Sent once at startup.
    pub async fn announce(&self) {
        for peer in self.partners() {
            if let Err(e) = self.transport.request_help(&peer).await {
                tracing::debug!(peer = %peer, error = %e, "help request failed");
            }
        }
    }

    /// Start the background loop.
    pub fn spawn(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let engine = Arc::clone(self);
        let mut stop = self.shutdown.subscribe();
        tokio::spawn(async move {
            engine.announce().await;
            let mut tick = tokio::time::interval(engine.config.tick);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            tracing::info!(
                interval_ms = engine.config.interval.as_millis() as u64,
                fanout = engine.config.fanout,
                "anti-entropy loop started"
            );
            while !*stop.borrow() {
                tokio::select! {
                    _ = tick.tick() => {
                        if engine.is_due() {
                            engine.run_round().await;
                        }
                    }
                    res = stop.changed() => {
                        if res.is_err() {
                            break;
                        }
                    }
                }
            }
            tracing::info!("anti-entropy loop stopped");
        })
    }

    /// Stop the background loop after its current round.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use shardkv_cluster::{MembershipView, ShardTopology};
    use shardkv_common::{Entry, VClock};
    use shardkv_ring::PositionHasher;
    use shardkv_storage::{FsyncPolicy, StorageEngine};
    use std::collections::HashSet;
    use std::sync::atomic::AtomicUsize;
    use tempfile::TempDir;

    type Engine = AntiEntropyEngine<LocalTransport>;

    /// Routes gossip calls straight into other in-process engines.
    #[derive(Default)]
    struct LocalTransport {
        peers: parking_lot::RwLock<HashMap<String, Arc<Engine>>>,
        unreachable: parking_lot::RwLock<HashSet<String>>,
        helps: AtomicUsize,
        layouts_sent: AtomicUsize,
    }

    impl LocalTransport {
        fn target(&self, peer: &str) -> Result<Arc<Engine>, PeerError> {
            if self.unreachable.read().contains(peer) {
                return Err(PeerError::RpcFailed {
                    peer: peer.to_string(),
                    reason: "connection refused".into(),
                });
            }
            self.peers
                .read()
                .get(peer)
                .cloned()
                .ok_or_else(|| PeerError::Timeout {
                    peer: peer.to_string(),
                })
        }
    }

    #[async_trait::async_trait]
    impl GossipTransport for LocalTransport {
        async fn exchange_digest(
            &self,
            peer: &str,
            digest: &TimeDigest,
        ) -> Result<TimeDigest, PeerError> {
            Ok(self.target(peer)?.prune_digest(digest))
        }

        async fn send_entries(&self, peer: &str, batch: &EntryBatch) -> Result<(), PeerError> {
            self.target(peer)?.merge_entries(batch.clone());
            Ok(())
        }

        async fn send_shards(
            &self,
            peer: &str,
            snapshot: &ShardSnapshot,
        ) -> Result<(), PeerError> {
            self.target(peer)?.apply_snapshot(snapshot);
            self.layouts_sent.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn request_help(&self, peer: &str) -> Result<(), PeerError> {
            self.target(peer)?.request_help();
            self.helps.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct TestNode {
        engine: Arc<Engine>,
        storage: Arc<StorageEngine>,
        topology: Arc<ShardTopology>,
        view: Arc<MembershipView>,
        _dir: TempDir,
    }

    fn cluster(peers: &[&str], shards: usize, config: GossipConfig) -> (Arc<LocalTransport>, Vec<TestNode>) {
        let transport = Arc::new(LocalTransport::default());
        let hasher = PositionHasher::new(1 << 20, 4).unwrap();
        let mut nodes = Vec::new();
        for addr in peers {
            let dir = TempDir::new().unwrap();
            let storage = Arc::new(StorageEngine::open(dir.path(), FsyncPolicy::None).unwrap());
            let topology = Arc::new(ShardTopology::new(*addr, peers, shards, hasher));
            let view = Arc::new(MembershipView::new(*addr, peers.iter().copied()));
            let engine = Arc::new(AntiEntropyEngine::new(
                storage.clone(),
                topology.clone(),
                view.clone(),
                transport.clone(),
                config.clone(),
            ));
            transport.peers.write().insert(addr.to_string(), engine.clone());
            nodes.push(TestNode {
                engine,
                storage,
                topology,
                view,
                _dir: dir,
            });
        }
        (transport, nodes)
    }

    fn clock(pairs: &[(&str, u64)]) -> VClock {
        VClock::from_pairs(pairs.iter().copied())
    }

    #[tokio::test]
    async fn test_write_replicates_after_one_round() {
        let (_t, nodes) = cluster(&["a", "b"], 1, GossipConfig::default());
        let (a, b) = (&nodes[0], &nodes[1]);

        a.storage
            .put("k", b"v1".to_vec(), 100, clock(&[("a", 1)]))
            .unwrap();
        a.engine.run_round().await;

        let (value, got) = b.storage.get("k", &VClock::new()).unwrap();
        assert_eq!(value, b"v1");
        assert_eq!(got, clock(&[("a", 1)]));
    }

    #[tokio::test]
    async fn test_concurrent_writes_converge_to_later_timestamp() {
        let (_t, nodes) = cluster(&["a", "b"], 1, GossipConfig::default());
        let (a, b) = (&nodes[0], &nodes[1]);

        a.storage
            .put("k", b"from-a".to_vec(), 100, clock(&[("a", 1)]))
            .unwrap();
        b.storage
            .put("k", b"from-b".to_vec(), 200, clock(&[("b", 1)]))
            .unwrap();

        a.engine.run_round().await;
        b.engine.run_round().await;

        for node in [a, b] {
            let (value, got) = node.storage.get("k", &VClock::new()).unwrap();
            assert_eq!(value, b"from-b");
            assert_eq!(got, clock(&[("b", 1)]));
        }
    }

    #[tokio::test]
    async fn test_prune_digest_exact_equality_only() {
        let (_t, nodes) = cluster(&["a", "b"], 1, GossipConfig::default());
        let b = &nodes[1];
        b.storage.put("same", b"v".to_vec(), 10, clock(&[("b", 1)])).unwrap();
        b.storage.put("newer", b"v".to_vec(), 50, clock(&[("b", 1)])).unwrap();

        let mut digest = TimeDigest::new();
        digest.insert("same".into(), 10);
        digest.insert("newer".into(), 20);
        digest.insert("unknown".into(), 5);

        let pruned = b.engine.prune_digest(&digest);
        assert_eq!(pruned.len(), 2);
        assert!(!pruned.contains_key("same"));
        assert_eq!(pruned["newer"], 20);
        assert_eq!(pruned["unknown"], 5);
    }

    #[tokio::test]
    async fn test_merge_discards_dominated_entry() {
        let (_t, nodes) = cluster(&["a", "b"], 1, GossipConfig::default());
        let a = &nodes[0];
        a.storage
            .put("k", b"new".to_vec(), 10, clock(&[("a", 2)]))
            .unwrap();

        let mut batch = EntryBatch::new();
        batch.insert("k".into(), Entry::live(b"old".to_vec(), 1, clock(&[("a", 1)]), 999));
        batch.insert("fresh".into(), Entry::live(b"x".to_vec(), 1, clock(&[("b", 1)]), 1));
        assert_eq!(a.engine.merge_entries(batch), 1);

        assert_eq!(a.storage.get("k", &VClock::new()).unwrap().0, b"new");
        assert_eq!(a.storage.get("fresh", &VClock::new()).unwrap().0, b"x");
    }

    /// Storage that commits a client write right before the first merge
    /// reaches the inner engine.
    struct RacingStorage {
        inner: StorageEngine,
        pending: parking_lot::Mutex<Option<(String, Vec<u8>, u64, VClock)>>,
    }

    impl StorageContract for RacingStorage {
        fn contains(&self, key: &str) -> (bool, u64) {
            self.inner.contains(key)
        }
        fn get(&self, key: &str, known: &VClock) -> Option<(Vec<u8>, VClock)> {
            self.inner.get(key, known)
        }
        fn put(&self, key: &str, value: Vec<u8>, ts: u64, clock: VClock) -> Result<bool, shardkv_storage::StorageError> {
            self.inner.put(key, value, ts, clock)
        }
        fn delete(&self, key: &str, ts: u64, clock: VClock) -> Result<bool, shardkv_storage::StorageError> {
            self.inner.delete(key, ts, clock)
        }
        fn clock_of(&self, key: &str) -> VClock {
            self.inner.clock_of(key)
        }
        fn timestamp_of(&self, key: &str) -> u64 {
            self.inner.timestamp_of(key)
        }
        fn overwrite_entry(&self, key: &str, entry: Entry) -> Result<(), shardkv_storage::StorageError> {
            self.inner.overwrite_entry(key, entry)
        }
        fn merge_entry(
            &self,
            key: &str,
            entry: Entry,
            wins: &shardkv_storage::MergeRule,
        ) -> Result<bool, shardkv_storage::StorageError> {
            if let Some((k, value, ts, clock)) = self.pending.lock().take() {
                self.inner.put(&k, value, ts, clock)?;
            }
            self.inner.merge_entry(key, entry, wins)
        }
        fn put_causal(
            &self,
            key: &str,
            value: Vec<u8>,
            ts: u64,
            context: &VClock,
            node: &str,
        ) -> Result<shardkv_storage::WriteOutcome, shardkv_storage::StorageError> {
            self.inner.put_causal(key, value, ts, context, node)
        }
        fn delete_causal(
            &self,
            key: &str,
            ts: u64,
            context: &VClock,
            node: &str,
        ) -> Result<shardkv_storage::WriteOutcome, shardkv_storage::StorageError> {
            self.inner.delete_causal(key, ts, context, node)
        }
        fn digest(&self) -> TimeDigest {
            self.inner.digest()
        }
        fn bulk_fetch(&self, digest: &TimeDigest) -> EntryBatch {
            self.inner.bulk_fetch(digest)
        }
    }

    #[tokio::test]
    async fn test_merge_sees_write_that_lands_first() {
        let dir = TempDir::new().unwrap();
        let storage = Arc::new(RacingStorage {
            inner: StorageEngine::open(dir.path(), FsyncPolicy::None).unwrap(),
            pending: parking_lot::Mutex::new(None),
        });
        storage.put("k", b"old".to_vec(), 100, clock(&[("a", 1)])).unwrap();
        *storage.pending.lock() = Some(("k".into(), b"client".to_vec(), 500, clock(&[("a", 2)])));

        let peers = ["a", "b"];
        let engine = AntiEntropyEngine::new(
            storage.clone(),
            Arc::new(ShardTopology::new("a", &peers, 1, PositionHasher::default())),
            Arc::new(MembershipView::new("a", peers)),
            Arc::new(LocalTransport::default()),
            GossipConfig::default(),
        );

        // Concurrent with {a:2} and older, so it must lose to the client write.
        let mut batch = EntryBatch::new();
        batch.insert("k".into(), Entry::live(b"remote".to_vec(), 1, clock(&[("a", 1), ("b", 1)]), 200));
        assert_eq!(engine.merge_entries(batch), 0);

        let (value, stored) = storage.get("k", &VClock::new()).unwrap();
        assert_eq!(value, b"client");
        assert_eq!(stored, clock(&[("a", 2)]));
    }

    #[tokio::test]
    async fn test_failing_partner_does_not_abort_round() {
        let (t, nodes) = cluster(&["a", "b", "c"], 1, GossipConfig::default());
        t.unreachable.write().insert("b".into());
        let (a, c) = (&nodes[0], &nodes[2]);

        a.storage.put("k", b"v".to_vec(), 1, clock(&[("a", 1)])).unwrap();
        a.engine.request_help();
        assert!(a.engine.is_due());

        a.engine.run_round().await;

        assert!(c.storage.get("k", &VClock::new()).is_some());
        assert!(!a.engine.help_requested());
        assert!(!a.engine.is_due());
    }

    #[tokio::test]
    async fn test_topology_change_propagates_and_moves_keys() {
        let (_t, nodes) = cluster(&["a", "b"], 1, GossipConfig::default());
        let (a, b) = (&nodes[0], &nodes[1]);

        // Under the two-shard layout "a" owns shard 0 and "b" owns shard 1.
        let two = ShardSnapshot::from_peers(&["a", "b"], 2);
        let hasher = PositionHasher::new(1 << 20, 4).unwrap();
        let moved_key = (0..100)
            .map(|i| format!("key-{i}"))
            .find(|k| hasher.key_position(k) % 2 == 1)
            .unwrap();
        a.storage
            .put(&moved_key, b"v".to_vec(), 1, clock(&[("a", 1)]))
            .unwrap();

        assert!(a.topology.overwrite(&two));
        a.engine.run_round().await;

        assert_eq!(b.topology.snapshot(), two);
        assert_eq!(b.topology.my_shard(), Some(ShardId(1)));
        assert!(b.storage.get(&moved_key, &VClock::new()).is_some());
        // The sender keeps its own copy.
        assert!(a.storage.get(&moved_key, &VClock::new()).is_some());
    }

    #[tokio::test]
    async fn test_view_change_triggers_layout_broadcast() {
        let (t, nodes) = cluster(&["a", "b", "c"], 1, GossipConfig::default());
        let a = &nodes[0];

        a.engine.run_round().await;
        assert_eq!(t.layouts_sent.load(Ordering::SeqCst), 0);

        assert!(a.view.remove("c"));
        a.engine.run_round().await;
        assert_eq!(t.layouts_sent.load(Ordering::SeqCst), 2);
        assert!(!a.view.take_change());

        a.engine.run_round().await;
        assert_eq!(t.layouts_sent.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_loop_runs_and_stops() {
        let config = GossipConfig {
            interval: Duration::from_secs(1),
            tick: Duration::from_millis(50),
            fanout: 2,
        };
        let (t, nodes) = cluster(&["a", "b"], 1, config);
        let (a, b) = (&nodes[0], &nodes[1]);
        a.storage.put("k", b"v".to_vec(), 1, clock(&[("a", 1)])).unwrap();

        let handle = a.engine.spawn();
        tokio::time::sleep(Duration::from_millis(1500)).await;

        assert!(b.storage.get("k", &VClock::new()).is_some());
        // Startup announcement asked "b" for help.
        assert!(t.helps.load(Ordering::SeqCst) >= 1);
        assert!(b.engine.help_requested());

        a.engine.shutdown();
        handle.await.unwrap();
    }
}
