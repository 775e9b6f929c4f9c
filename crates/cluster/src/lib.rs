//! Cluster bookkeeping for shardkv: who is in the cluster (`MembershipView`)
//! and how those peers are split into shards (`ShardTopology`).
//!
//! Both structures are shared between request handlers and the anti-entropy
//! loop, so each owns its own lock. The `Membership` and `Topology` traits
//! are the capability surfaces the rest of the system depends on.

pub mod topology;
pub mod view;

pub use topology::ShardTopology;
pub use view::MembershipView;

use shardkv_common::{ShardId, ShardSnapshot};

/// Peer-set operations consumed by the gossip engine and the API layer.
pub trait Membership: Send + Sync + 'static {
    /// This node's own address.
    fn primary(&self) -> &str;
    fn contains(&self, peer: &str) -> bool;
    fn add(&self, peer: &str) -> bool;
    fn remove(&self, peer: &str) -> bool;
    /// Up to `n` distinct peers, never including the primary.
    fn random(&self, n: usize) -> Vec<String>;
    fn list(&self) -> Vec<String>;
    /// Replace the peer set. Returns `true` if it differed.
    fn overwrite(&self, peers: &[String]) -> bool;
    /// Read and clear the "view changed" flag.
    fn take_change(&self) -> bool;
}

/// Shard-layout operations consumed by the gossip engine and key routing.
pub trait Topology: Send + Sync + 'static {
    fn local(&self) -> &str;
    fn my_shard(&self) -> Option<ShardId>;
    fn shard_for_key(&self, key: &str) -> Option<ShardId>;
    fn owner_of(&self, shard: ShardId) -> Option<String>;
    fn find_peer_in_shard(&self, shard: ShardId) -> Option<String>;
    fn random_local(&self, n: usize) -> Vec<String>;
    fn random_global(&self, n: usize) -> Vec<String>;
    fn everyone_else(&self) -> Vec<String>;
    fn snapshot(&self) -> ShardSnapshot;
    /// Replace the layout wholesale. Returns `true` if it differed.
    fn overwrite(&self, snapshot: &ShardSnapshot) -> bool;
    /// Read and clear the "topology changed" flag.
    fn take_change(&self) -> bool;
}
