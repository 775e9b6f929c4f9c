//! Shard layout: which peers form which shard, and where each shard's
//! virtual nodes sit on the hash ring.

use crate::Topology;
use parking_lot::RwLock;
use rand::seq::SliceRandom;
use shardkv_common::{ShardId, ShardSnapshot};
use shardkv_ring::{HashRing, PositionHasher};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

struct Layout {
    snapshot: ShardSnapshot,
    mine: Option<ShardId>,
    collisions: usize,
}

impl Layout {
    fn others(&self, local: &str) -> Vec<String> {
        self.snapshot
            .peers()
            .into_iter()
            .filter(|p| p != local)
            .collect()
    }
}

/// Partition of the membership into shards.
///
/// Lock order is layout first, then ring. Every ring rebuild happens while
/// the layout write lock is held, so readers never see a ring that disagrees
/// with the layout.
pub struct ShardTopology {
    local: String,
    hasher: PositionHasher,
    initial_shards: usize,
    layout: RwLock<Option<Layout>>,
    ring: HashRing<ShardId>,
    changed: AtomicBool,
}

impl ShardTopology {
    /// Place the sorted `peers` round-robin into `shard_count` shards.
    ///
    /// An empty peer list or a zero shard count leaves the topology
    /// uninitialized until the first `overwrite`.
    pub fn new<S: AsRef<str>>(
        local: impl Into<String>,
        peers: &[S],
        shard_count: usize,
        hasher: PositionHasher,
    ) -> Self {
        let topo = Self {
            local: local.into(),
            hasher,
            initial_shards: shard_count,
            layout: RwLock::new(None),
            ring: HashRing::new(),
            changed: AtomicBool::new(false),
        };
        if !peers.is_empty() && shard_count > 0 {
            let snapshot = ShardSnapshot::from_peers(peers, shard_count);
            let mut guard = topo.layout.write();
            topo.install(&mut guard, snapshot);
        }
        topo
    }

    /// Swap in `snapshot` and rebuild the ring. Caller holds the layout lock.
    fn install(&self, guard: &mut Option<Layout>, snapshot: ShardSnapshot) {
        let mine = snapshot.shard_of(&self.local);
        let mut placed: HashMap<u64, ShardId> = HashMap::new();
        let mut collisions = 0;
        for shard in snapshot.shards.keys() {
            for pos in self.hasher.virtual_node_positions(*shard) {
                if let Some(prev) = placed.insert(pos, *shard) {
                    collisions += 1;
                    tracing::warn!(
                        position = pos,
                        shard = %shard,
                        displaced = %prev,
                        "virtual node position collision"
                    );
                }
            }
        }
        self.ring.rebuild(placed);
        *guard = Some(Layout {
            snapshot,
            mine,
            collisions,
        });
    }

    /// Install `snapshot` unless it equals the current layout.
    fn apply(&self, guard: &mut Option<Layout>, snapshot: ShardSnapshot) -> bool {
        if guard.as_ref().map(|l| &l.snapshot) == Some(&snapshot) {
            return false;
        }
        self.install(guard, snapshot);
        self.changed.store(true, Ordering::Release);
        if let Some(layout) = guard.as_ref() {
            tracing::info!(
                shards = layout.snapshot.shards.len(),
                mine = ?layout.mine,
                "shard topology changed"
            );
        }
        true
    }

    fn current_shard_count(&self, guard: &Option<Layout>) -> usize {
        guard
            .as_ref()
            .map(|l| l.snapshot.shards.len())
            .filter(|n| *n > 0)
            .unwrap_or(self.initial_shards)
    }

    pub fn local(&self) -> &str {
        &self.local
    }

    pub fn hasher(&self) -> &PositionHasher {
        &self.hasher
    }

    pub fn is_initialized(&self) -> bool {
        self.layout.read().is_some()
    }

    pub fn shard_count(&self) -> usize {
        self.layout
            .read()
            .as_ref()
            .map_or(0, |l| l.snapshot.shards.len())
    }

    pub fn shard_ids(&self) -> Vec<ShardId> {
        self.layout
            .read()
            .as_ref()
            .map(|l| l.snapshot.shards.keys().copied().collect())
            .unwrap_or_default()
    }

    pub fn members(&self, shard: ShardId) -> Vec<String> {
        self.layout
            .read()
            .as_ref()
            .and_then(|l| l.snapshot.shards.get(&shard).cloned())
            .unwrap_or_default()
    }

    pub fn my_shard(&self) -> Option<ShardId> {
        self.layout.read().as_ref().and_then(|l| l.mine)
    }

    pub fn contains_peer(&self, peer: &str) -> bool {
        self.layout
            .read()
            .as_ref()
            .map_or(false, |l| l.snapshot.shard_of(peer).is_some())
    }

    pub fn contains_shard(&self, shard: ShardId) -> bool {
        self.layout
            .read()
            .as_ref()
            .map_or(false, |l| l.snapshot.shards.contains_key(&shard))
    }

    /// Sorted list of every peer in every shard.
    pub fn peers(&self) -> Vec<String> {
        self.layout
            .read()
            .as_ref()
            .map(|l| l.snapshot.peers())
            .unwrap_or_default()
    }

    pub fn snapshot(&self) -> ShardSnapshot {
        self.layout
            .read()
            .as_ref()
            .map(|l| l.snapshot.clone())
            .unwrap_or_default()
    }

    /// Every virtual-node position on the ring with its shard.
    pub fn ring_positions(&self) -> Vec<(u64, ShardId)> {
        let _layout = self.layout.read();
        self.ring.entries()
    }

    /// Virtual nodes that landed on a position already taken during the last
    /// ring rebuild.
    pub fn ring_collisions(&self) -> usize {
        self.layout.read().as_ref().map_or(0, |l| l.collisions)
    }

    /// The shard whose virtual node is first at or after `position`.
    pub fn ring_shard_for(&self, position: u64) -> Option<ShardId> {
        let _layout = self.layout.read();
        self.ring.successor(position)
    }

    /// Owning shard of a key: the sorted shard ids indexed by the key's ring
    /// position modulo the shard count.
    pub fn shard_for_key(&self, key: &str) -> Option<ShardId> {
        let guard = self.layout.read();
        let layout = guard.as_ref()?;
        let count = layout.snapshot.shards.len() as u64;
        if count == 0 {
            return None;
        }
        let idx = self.hasher.key_position(key) % count;
        layout.snapshot.shards.keys().nth(idx as usize).copied()
    }

    /// First listed member of a shard.
    pub fn owner_of(&self, shard: ShardId) -> Option<String> {
        self.members(shard).into_iter().next()
    }

    /// A random member of `shard`, preferring peers other than this node.
    pub fn find_peer_in_shard(&self, shard: ShardId) -> Option<String> {
        let members = self.members(shard);
        let others: Vec<&String> = members.iter().filter(|p| **p != self.local).collect();
        let mut rng = rand::thread_rng();
        others
            .choose(&mut rng)
            .map(|p| (*p).clone())
            .or_else(|| members.choose(&mut rng).cloned())
    }

    /// Up to `n` distinct members of the local shard, never this node.
    pub fn random_local(&self, n: usize) -> Vec<String> {
        let guard = self.layout.read();
        let Some(layout) = guard.as_ref() else {
            return Vec::new();
        };
        let Some(members) = layout.mine.and_then(|s| layout.snapshot.shards.get(&s)) else {
            return Vec::new();
        };
        let others: Vec<&String> = members.iter().filter(|p| **p != self.local).collect();
        others
            .choose_multiple(&mut rand::thread_rng(), n)
            .map(|p| (*p).clone())
            .collect()
    }

    /// Up to `n` distinct peers from any shard, never this node.
    pub fn random_global(&self, n: usize) -> Vec<String> {
        let others = self.everyone_else();
        others
            .choose_multiple(&mut rand::thread_rng(), n)
            .cloned()
            .collect()
    }

    /// Every peer except this node.
    pub fn everyone_else(&self) -> Vec<String> {
        self.layout
            .read()
            .as_ref()
            .map(|l| l.others(&self.local))
            .unwrap_or_default()
    }

    /// Replace the layout wholesale. A snapshot equal to the current layout
    /// is ignored, leaving ring and maps untouched.
    pub fn overwrite(&self, snapshot: &ShardSnapshot) -> bool {
        let mut guard = self.layout.write();
        self.apply(&mut guard, snapshot.clone())
    }

    /// Register an empty shard. The membership split is left alone; the
    /// change flag tells the anti-entropy loop to propagate it.
    ///
    /// Keys can route to the new shard before it has members, and requests
    /// for them fail with no peer to serve them. Follow with [`reshard`]
    /// to give it members.
    ///
    /// [`reshard`]: Self::reshard
    pub fn add(&self, shard: ShardId) -> bool {
        let mut guard = self.layout.write();
        let Some(layout) = guard.as_ref() else {
            return false;
        };
        if layout.snapshot.shards.contains_key(&shard) {
            return false;
        }
        let mut next = layout.snapshot.clone();
        next.shards.insert(shard, Vec::new());
        self.apply(&mut guard, next)
    }

    /// Drop a shard and its virtual nodes.
    pub fn remove(&self, shard: ShardId) -> bool {
        let mut guard = self.layout.write();
        let Some(layout) = guard.as_ref() else {
            return false;
        };
        if !layout.snapshot.shards.contains_key(&shard) {
            return false;
        }
        let mut next = layout.snapshot.clone();
        next.shards.remove(&shard);
        self.apply(&mut guard, next)
    }

    /// Add a peer and re-partition the sorted peer list.
    pub fn add_peer(&self, peer: &str) -> bool {
        let mut guard = self.layout.write();
        let mut peers = guard
            .as_ref()
            .map(|l| l.snapshot.peers())
            .unwrap_or_default();
        if peers.iter().any(|p| p == peer) {
            return false;
        }
        peers.push(peer.to_string());
        let count = self.current_shard_count(&guard);
        if count == 0 {
            return false;
        }
        self.apply(&mut guard, ShardSnapshot::from_peers(&peers, count))
    }

    /// Remove a peer and re-partition the sorted peer list.
    pub fn remove_peer(&self, peer: &str) -> bool {
        let mut guard = self.layout.write();
        let Some(layout) = guard.as_ref() else {
            return false;
        };
        let peers = layout.snapshot.peers();
        if !peers.iter().any(|p| p == peer) {
            return false;
        }
        let remaining: Vec<String> = peers.into_iter().filter(|p| p != peer).collect();
        let count = self.current_shard_count(&guard);
        self.apply(&mut guard, ShardSnapshot::from_peers(&remaining, count))
    }

    /// Re-partition the current peers into `shard_count` shards. Refused
    /// unless every shard would get at least two peers.
    pub fn reshard(&self, shard_count: usize) -> bool {
        let mut guard = self.layout.write();
        let peers = guard
            .as_ref()
            .map(|l| l.snapshot.peers())
            .unwrap_or_default();
        if shard_count == 0 || peers.len() / shard_count < 2 {
            tracing::warn!(
                shard_count,
                peers = peers.len(),
                "not enough peers to reshard"
            );
            return false;
        }
        self.apply(&mut guard, ShardSnapshot::from_peers(&peers, shard_count));
        true
    }

    /// Read and clear the change flag.
    pub fn take_change(&self) -> bool {
        self.changed.swap(false, Ordering::AcqRel)
    }
}

impl std::fmt::Debug for ShardTopology {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardTopology")
            .field("local", &self.local)
            .field("my_shard", &self.my_shard())
            .field("shards", &self.shard_count())
            .finish_non_exhaustive()
    }
}

impl Topology for ShardTopology {
    fn local(&self) -> &str {
        ShardTopology::local(self)
    }

    fn my_shard(&self) -> Option<ShardId> {
        ShardTopology::my_shard(self)
    }

    fn shard_for_key(&self, key: &str) -> Option<ShardId> {
        ShardTopology::shard_for_key(self, key)
    }

    fn owner_of(&self, shard: ShardId) -> Option<String> {
        ShardTopology::owner_of(self, shard)
    }

    fn find_peer_in_shard(&self, shard: ShardId) -> Option<String> {
        ShardTopology::find_peer_in_shard(self, shard)
    }

    fn random_local(&self, n: usize) -> Vec<String> {
        ShardTopology::random_local(self, n)
    }

    fn random_global(&self, n: usize) -> Vec<String> {
        ShardTopology::random_global(self, n)
    }

    fn everyone_else(&self) -> Vec<String> {
        ShardTopology::everyone_else(self)
    }

    fn snapshot(&self) -> ShardSnapshot {
        ShardTopology::snapshot(self)
    }

    fn overwrite(&self, snapshot: &ShardSnapshot) -> bool {
        ShardTopology::overwrite(self, snapshot)
    }

    fn take_change(&self) -> bool {
        ShardTopology::take_change(self)
    }
}
