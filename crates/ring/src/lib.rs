//! Consistent-hash ring for shardkv.
//!
//! `RingTree` is a left-leaning red-black tree keyed by ring position,
//! `HashRing` puts it behind a single read-write lock, and `PositionHasher`
//! maps keys and shard ids onto ring positions.

pub mod hash_ring;
pub mod hasher;
pub mod llrb;

pub use hash_ring::HashRing;
pub use hasher::{primes, PositionHasher, RingError};
pub use llrb::RingTree;
