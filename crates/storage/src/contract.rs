//! The narrow storage surface the rest of the node depends on.

use crate::engine::StorageError;
use shardkv_common::{Entry, EntryBatch, TimeDigest, VClock};

/// Result of a client write that derived its clock from the stored one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteOutcome {
    pub applied: bool,
    /// The key held a live value before the write.
    pub replaced: bool,
    /// The clock written, or the stored clock merged with the caller's
    /// context when nothing was written.
    pub clock: VClock,
}

/// Decides whether an incoming entry replaces the stored one. The stored
/// side is an empty entry when the key was never written.
pub type MergeRule = dyn Fn(&Entry, &Entry) -> bool + Send + Sync;

/// Local key-value backend. Implementations handle their own locking.
pub trait StorageContract: Send + Sync + 'static {
    /// `(live, version)`; a tombstoned key reports `false` with its version.
    fn contains(&self, key: &str) -> (bool, u64);

    /// Value and the stored clock merged with `known`, or `None` if absent
    /// or deleted.
    fn get(&self, key: &str, known: &VClock) -> Option<(Vec<u8>, VClock)>;

    /// Store a live value. `Ok(false)` if the write was refused.
    fn put(&self, key: &str, value: Vec<u8>, timestamp: u64, clock: VClock)
        -> Result<bool, StorageError>;

    /// Tombstone a key. `Ok(false)` if it was absent or already deleted.
    fn delete(&self, key: &str, timestamp: u64, clock: VClock) -> Result<bool, StorageError>;

    /// Stored clock, empty if the key was never written.
    fn clock_of(&self, key: &str) -> VClock;

    /// Stored timestamp, 0 if the key was never written.
    fn timestamp_of(&self, key: &str) -> u64;

    /// Replace the stored entry wholesale.
    fn overwrite_entry(&self, key: &str, entry: Entry) -> Result<(), StorageError>;

    /// Replace the stored entry with `entry` if `wins(stored, entry)`. The
    /// check and the write happen under one lock.
    fn merge_entry(&self, key: &str, entry: Entry, wins: &MergeRule) -> Result<bool, StorageError>;

    /// Store a live value whose clock is the stored clock merged with
    /// `context` and incremented for `node`, atomically.
    fn put_causal(
        &self,
        key: &str,
        value: Vec<u8>,
        timestamp: u64,
        context: &VClock,
        node: &str,
    ) -> Result<WriteOutcome, StorageError>;

    /// Tombstone counterpart of [`put_causal`](Self::put_causal).
    fn delete_causal(
        &self,
        key: &str,
        timestamp: u64,
        context: &VClock,
        node: &str,
    ) -> Result<WriteOutcome, StorageError>;

    /// key -> timestamp for everything held, tombstones included.
    fn digest(&self) -> TimeDigest;

    /// Entries for the digest's keys that are held locally.
    fn bulk_fetch(&self, digest: &TimeDigest) -> EntryBatch;
}
