//! In-memory table holding the current entry of every key.

use shardkv_common::{Entry, EntryBatch, TimeDigest};
use std::collections::HashMap;

/// key -> latest entry, tombstones included.
#[derive(Debug, Default)]
pub struct Memtable {
    data: HashMap<String, Entry>,
}

impl Memtable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&Entry> {
        self.data.get(key)
    }

    /// Store `entry` as the whole state of `key`.
    pub fn insert(&mut self, key: String, entry: Entry) -> Option<Entry> {
        self.data.insert(key, entry)
    }

    /// Number of keys, tombstones included.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Keys whose entry is not a tombstone.
    pub fn live_keys(&self) -> Vec<String> {
        self.data
            .iter()
            .filter(|(_, e)| !e.tombstone)
            .map(|(k, _)| k.clone())
            .collect()
    }

    pub fn keys(&self) -> Vec<String> {
        self.data.keys().cloned().collect()
    }

    pub fn digest(&self) -> TimeDigest {
        self.data
            .iter()
            .map(|(k, e)| (k.clone(), e.timestamp))
            .collect()
    }

    /// Entries for every key of `wanted` that is held locally.
    pub fn fetch(&self, wanted: &TimeDigest) -> EntryBatch {
        wanted
            .keys()
            .filter_map(|k| self.data.get(k).map(|e| (k.clone(), e.clone())))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shardkv_common::VClock;

    fn live(ts: u64) -> Entry {
        Entry::live(b"v".to_vec(), 1, VClock::new().increment("n"), ts)
    }

    #[test]
    fn test_insert_replaces_whole_entry() {
        let mut mt = Memtable::new();
        assert!(mt.insert("k".into(), live(1)).is_none());
        let prev = mt.insert("k".into(), Entry::tombstone(2, VClock::new(), 2));
        assert_eq!(prev, Some(live(1)));
        assert!(mt.get("k").unwrap().tombstone);
        assert_eq!(mt.len(), 1);
        assert!(mt.live_keys().is_empty());
    }

    #[test]
    fn test_digest_and_fetch() {
        let mut mt = Memtable::new();
        mt.insert("a".into(), live(10));
        mt.insert("b".into(), Entry::tombstone(1, VClock::new(), 20));

        let digest = mt.digest();
        assert_eq!(digest.len(), 2);
        assert_eq!(digest["a"], 10);
        assert_eq!(digest["b"], 20);

        let mut wanted = TimeDigest::new();
        wanted.insert("b".into(), 0);
        wanted.insert("missing".into(), 0);
        let batch = mt.fetch(&wanted);
        assert_eq!(batch.len(), 1);
        assert!(batch["b"].tombstone);
    }
}
