//! shardkv-common: shared types for the shardkv project.
//!
//! Provides the replicated data model (`Entry`, `VClock`), the ephemeral
//! gossip payloads (`TimeDigest`, `EntryBatch`) and the transmissible shard
//! layout (`ShardSnapshot`).

pub mod vclock;

pub use vclock::{VClock, VClockOrder};

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

// ---------------------------------------------------------------------------
// ShardId
// ---------------------------------------------------------------------------

/// Dense shard index in `0..shard_count`.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
pub struct ShardId(pub u32);

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Entry
// ---------------------------------------------------------------------------

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// A versioned value as held by local storage and shipped during gossip.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    /// Value bytes (empty for tombstones).
    pub value: Vec<u8>,
    /// Local write counter, bumped on every accepted write.
    pub version: u64,
    pub clock: VClock,
    /// Wall-clock write time (millis since epoch).
    pub timestamp: u64,
    /// Logical deletion marker.
    pub tombstone: bool,
}

impl Entry {
    /// A live entry.
    pub fn live(value: Vec<u8>, version: u64, clock: VClock, timestamp: u64) -> Self {
        Self {
            value,
            version,
            clock,
            timestamp,
            tombstone: false,
        }
    }

    /// A deletion marker that keeps the clock and timestamp for ordering.
    pub fn tombstone(version: u64, clock: VClock, timestamp: u64) -> Self {
        Self {
            value: Vec::new(),
            version,
            clock,
            timestamp,
            tombstone: true,
        }
    }

    /// An entry carrying only ordering metadata. Used when the caller only
    /// knows a key's clock and timestamp.
    pub fn metadata_only(clock: VClock, timestamp: u64) -> Self {
        Self {
            clock,
            timestamp,
            ..Self::default()
        }
    }
}

// ---------------------------------------------------------------------------
// Gossip payloads
// ---------------------------------------------------------------------------

/// key -> timestamp summary of everything a node holds.
pub type TimeDigest = HashMap<String, u64>;

/// key -> entry payload shipped after pruning.
pub type EntryBatch = HashMap<String, Entry>;

// ---------------------------------------------------------------------------
// ShardSnapshot
// ---------------------------------------------------------------------------

/// Full description of shard membership: shard id -> ordered peer list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardSnapshot {
    pub shards: BTreeMap<ShardId, Vec<String>>,
}

impl ShardSnapshot {
    /// Partition peers deterministically: after sorting, the peer at index
    /// `i` lands in shard `i mod shard_count`.
    ///
    /// Returns an empty snapshot when `shard_count` is zero.
    pub fn from_peers<S: AsRef<str>>(peers: &[S], shard_count: usize) -> Self {
        let mut sorted: Vec<String> = peers.iter().map(|p| p.as_ref().to_string()).collect();
        sorted.sort();
        sorted.dedup();

        let mut shards: BTreeMap<ShardId, Vec<String>> = BTreeMap::new();
        if shard_count == 0 {
            return Self { shards };
        }
        for (i, peer) in sorted.into_iter().enumerate() {
            shards
                .entry(ShardId((i % shard_count) as u32))
                .or_default()
                .push(peer);
        }
        Self { shards }
    }

    /// Sorted union of all shard members.
    pub fn peers(&self) -> Vec<String> {
        let mut all: Vec<String> = self
            .shards
            .values()
            .flatten()
            .filter(|p| !p.is_empty())
            .cloned()
            .collect();
        all.sort();
        all.dedup();
        all
    }

    /// The shard a peer belongs to, if any.
    pub fn shard_of(&self, peer: &str) -> Option<ShardId> {
        self.shards
            .iter()
            .find(|(_, members)| members.iter().any(|m| m == peer))
            .map(|(id, _)| *id)
    }

    pub fn is_empty(&self) -> bool {
        self.shards.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_peers_partitions_by_sorted_index() {
        let snap = ShardSnapshot::from_peers(&["p3", "p1", "p0", "p2"], 2);
        assert_eq!(snap.shards[&ShardId(0)], vec!["p0", "p2"]);
        assert_eq!(snap.shards[&ShardId(1)], vec!["p1", "p3"]);
    }

    #[test]
    fn test_from_peers_is_order_independent() {
        let a = ShardSnapshot::from_peers(&["c", "a", "b"], 2);
        let b = ShardSnapshot::from_peers(&["b", "c", "a"], 2);
        assert_eq!(a, b);
    }

    #[test]
    fn test_from_peers_zero_shards_is_empty() {
        let snap = ShardSnapshot::from_peers(&["a", "b"], 0);
        assert!(snap.is_empty());
        assert!(snap.peers().is_empty());
    }

    #[test]
    fn test_shard_of_and_peers() {
        let snap = ShardSnapshot::from_peers(&["a", "b", "c"], 2);
        assert_eq!(snap.shard_of("b"), Some(ShardId(1)));
        assert_eq!(snap.shard_of("zzz"), None);
        assert_eq!(snap.peers(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_entry_constructors() {
        let clock = VClock::new().increment("a");
        let live = Entry::live(b"v".to_vec(), 1, clock.clone(), 10);
        assert!(!live.tombstone);
        let dead = Entry::tombstone(2, clock.clone(), 11);
        assert!(dead.tombstone);
        assert!(dead.value.is_empty());
        assert_eq!(dead.clock, clock);
    }

    #[test]
    fn test_snapshot_serde_roundtrip() {
        let snap = ShardSnapshot::from_peers(&["x:1", "y:2"], 1);
        let json = serde_json::to_string(&snap).unwrap();
        let back: ShardSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(snap, back);
    }
}
