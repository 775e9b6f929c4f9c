//! Storage engine: WAL + memtable behind one mutex.
//!
//! Every write is appended to the WAL before it is applied to the memtable.

use crate::contract::{MergeRule, StorageContract, WriteOutcome};
use crate::memtable::Memtable;
use crate::record::WalRecord;
use crate::wal::{FsyncPolicy, Wal, WalError};
use parking_lot::Mutex;
use shardkv_common::{Entry, EntryBatch, TimeDigest, VClock};
use std::path::Path;

/// Longest accepted key, in bytes.
pub const MAX_KEY_LEN: usize = 200;

/// Largest accepted value, in bytes.
pub const MAX_VALUE_LEN: usize = 1 << 20;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("WAL error: {0}")]
    Wal(#[from] WalError),
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug)]
struct Inner {
    memtable: Memtable,
    wal: Wal,
}

impl Inner {
    fn write(&mut self, key: &str, entry: Entry) -> Result<(), StorageError> {
        self.wal.append(&WalRecord::new(key, entry.clone()))?;
        self.memtable.insert(key.to_string(), entry);
        Ok(())
    }

    fn version_of(&self, key: &str) -> u64 {
        self.memtable.get(key).map_or(0, |e| e.version)
    }

    /// `(live, stored clock merged with context)` for a client write.
    fn known(&self, key: &str, context: &VClock) -> (bool, VClock) {
        match self.memtable.get(key) {
            Some(e) => (!e.tombstone, e.clock.merge(context)),
            None => (false, context.clone()),
        }
    }
}

fn oversized(key: &str, value: &[u8]) -> bool {
    if key.len() > MAX_KEY_LEN || value.len() > MAX_VALUE_LEN {
        tracing::debug!(key_len = key.len(), value_len = value.len(), "put refused: too large");
        return true;
    }
    false
}

#[derive(Debug)]
pub struct StorageEngine {
    inner: Mutex<Inner>,
}

impl StorageEngine {
    /// Open or create an engine in `data_dir`, replaying its WAL.
    pub fn open(data_dir: &Path, fsync: FsyncPolicy) -> Result<Self, StorageError> {
        std::fs::create_dir_all(data_dir)?;
        let wal_path = data_dir.join("wal.log");

        let mut memtable = Memtable::new();
        for record in Wal::replay(&wal_path)? {
            memtable.insert(record.key, record.entry);
        }
        let wal = Wal::open(&wal_path, fsync)?;

        tracing::info!(
            keys = memtable.len(),
            path = %wal_path.display(),
            "storage engine opened"
        );

        Ok(Self {
            inner: Mutex::new(Inner { memtable, wal }),
        })
    }

    /// Number of stored keys, tombstones included.
    pub fn key_count(&self) -> usize {
        self.inner.lock().memtable.len()
    }

    /// Keys that currently hold a live value.
    pub fn live_keys(&self) -> Vec<String> {
        self.inner.lock().memtable.live_keys()
    }

    /// Every stored key, tombstones included.
    pub fn keys(&self) -> Vec<String> {
        self.inner.lock().memtable.keys()
    }

    /// Full stored entry for a key.
    pub fn entry(&self, key: &str) -> Option<Entry> {
        self.inner.lock().memtable.get(key).cloned()
    }

    /// Force the WAL to disk (for `Batch` fsync).
    pub fn sync(&self) -> Result<(), StorageError> {
        self.inner.lock().wal.sync()?;
        Ok(())
    }
}

impl StorageContract for StorageEngine {
    fn contains(&self, key: &str) -> (bool, u64) {
        match self.inner.lock().memtable.get(key) {
            Some(e) => (!e.tombstone, e.version),
            None => (false, 0),
        }
    }

    fn get(&self, key: &str, known: &VClock) -> Option<(Vec<u8>, VClock)> {
        let inner = self.inner.lock();
        let entry = inner.memtable.get(key).filter(|e| !e.tombstone)?;
        Some((entry.value.clone(), entry.clock.merge(known)))
    }

    fn put(
        &self,
        key: &str,
        value: Vec<u8>,
        timestamp: u64,
        clock: VClock,
    ) -> Result<bool, StorageError> {
        if oversized(key, &value) {
            return Ok(false);
        }
        let mut inner = self.inner.lock();
        let version = inner.version_of(key) + 1;
        inner.write(key, Entry::live(value, version, clock, timestamp))?;
        Ok(true)
    }

    fn delete(&self, key: &str, timestamp: u64, clock: VClock) -> Result<bool, StorageError> {
        let mut inner = self.inner.lock();
        let version = match inner.memtable.get(key) {
            Some(e) if !e.tombstone => e.version + 1,
            _ => return Ok(false),
        };
        inner.write(key, Entry::tombstone(version, clock, timestamp))?;
        Ok(true)
    }

    fn clock_of(&self, key: &str) -> VClock {
        self.inner
            .lock()
            .memtable
            .get(key)
            .map(|e| e.clock.clone())
            .unwrap_or_default()
    }

    fn timestamp_of(&self, key: &str) -> u64 {
        self.inner.lock().memtable.get(key).map_or(0, |e| e.timestamp)
    }

    fn overwrite_entry(&self, key: &str, entry: Entry) -> Result<(), StorageError> {
        self.inner.lock().write(key, entry)
    }

    fn merge_entry(&self, key: &str, entry: Entry, wins: &MergeRule) -> Result<bool, StorageError> {
        let mut inner = self.inner.lock();
        let stored = inner.memtable.get(key).cloned().unwrap_or_default();
        if !wins(&stored, &entry) {
            return Ok(false);
        }
        inner.write(key, entry)?;
        Ok(true)
    }

    fn put_causal(
        &self,
        key: &str,
        value: Vec<u8>,
        timestamp: u64,
        context: &VClock,
        node: &str,
    ) -> Result<WriteOutcome, StorageError> {
        let mut inner = self.inner.lock();
        let (live, known) = inner.known(key, context);
        if oversized(key, &value) {
            return Ok(WriteOutcome {
                applied: false,
                replaced: false,
                clock: known,
            });
        }
        let clock = known.increment(node);
        let version = inner.version_of(key) + 1;
        inner.write(key, Entry::live(value, version, clock.clone(), timestamp))?;
        Ok(WriteOutcome {
            applied: true,
            replaced: live,
            clock,
        })
    }

    fn delete_causal(
        &self,
        key: &str,
        timestamp: u64,
        context: &VClock,
        node: &str,
    ) -> Result<WriteOutcome, StorageError> {
        let mut inner = self.inner.lock();
        let (live, known) = inner.known(key, context);
        if !live {
            return Ok(WriteOutcome {
                applied: false,
                replaced: false,
                clock: known,
            });
        }
        let clock = known.increment(node);
        let version = inner.version_of(key) + 1;
        inner.write(key, Entry::tombstone(version, clock.clone(), timestamp))?;
        Ok(WriteOutcome {
            applied: true,
            replaced: true,
            clock,
        })
    }

    fn digest(&self) -> TimeDigest {
        self.inner.lock().memtable.digest()
    }

    fn bulk_fetch(&self, digest: &TimeDigest) -> EntryBatch {
        self.inner.lock().memtable.fetch(digest)
    }
}
