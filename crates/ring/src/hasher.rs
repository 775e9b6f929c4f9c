//! Deterministic mapping of keys and shard ids onto ring positions.

use shardkv_common::ShardId;
use std::sync::OnceLock;

/// Default number of positions on the ring.
pub const DEFAULT_RING_SIZE: u64 = 1 << 20;

/// Default number of virtual nodes per shard.
pub const DEFAULT_VIRTUAL_NODES: usize = 16;

/// Primes are sieved below this bound.
pub const PRIME_BOUND: usize = 1000;

static PRIMES: OnceLock<Vec<u64>> = OnceLock::new();

/// Ascending primes below [`PRIME_BOUND`], generated once per process.
pub fn primes() -> &'static [u64] {
    PRIMES.get_or_init(|| sieve(PRIME_BOUND))
}

fn sieve(bound: usize) -> Vec<u64> {
    let mut composite = vec![false; bound];
    let mut out = Vec::new();
    for i in 2..bound {
        if composite[i] {
            continue;
        }
        out.push(i as u64);
        let mut j = i * i;
        while j < bound {
            composite[j] = true;
            j += i;
        }
    }
    out
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RingError {
    #[error("ring size must be non-zero")]
    ZeroRingSize,

    #[error("virtual node count must be in 1..={max}, got {got}")]
    VirtualNodes { got: usize, max: usize },
}

/// Maps keys and shard ids to positions in `0..ring_size`.
///
/// Pure function of its inputs: two nodes configured alike always agree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PositionHasher {
    ring_size: u64,
    virtual_nodes: usize,
}

impl Default for PositionHasher {
    fn default() -> Self {
        Self {
            ring_size: DEFAULT_RING_SIZE,
            virtual_nodes: DEFAULT_VIRTUAL_NODES,
        }
    }
}

impl PositionHasher {
    pub fn new(ring_size: u64, virtual_nodes: usize) -> Result<Self, RingError> {
        if ring_size == 0 {
            return Err(RingError::ZeroRingSize);
        }
        let max = primes().len();
        if virtual_nodes == 0 || virtual_nodes > max {
            return Err(RingError::VirtualNodes {
                got: virtual_nodes,
                max,
            });
        }
        Ok(Self {
            ring_size,
            virtual_nodes,
        })
    }

    pub fn ring_size(&self) -> u64 {
        self.ring_size
    }

    pub fn virtual_nodes(&self) -> usize {
        self.virtual_nodes
    }

    /// CRC-32 of the key reduced modulo the ring size.
    pub fn key_position(&self, key: &str) -> u64 {
        u64::from(crc32fast::hash(key.as_bytes())) % self.ring_size
    }

    /// One position per virtual node: the shard checksum times the i-th prime,
    /// reduced modulo the ring size.
    pub fn virtual_node_positions(&self, shard: ShardId) -> Vec<u64> {
        let sum = u64::from(crc32fast::hash(shard.to_string().as_bytes()));
        primes()
            .iter()
            .take(self.virtual_nodes)
            .map(|p| sum.wrapping_mul(*p) % self.ring_size)
            .collect()
    }
}
