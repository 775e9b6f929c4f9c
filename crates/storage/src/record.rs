//! On-disk record format.

use serde::{Deserialize, Serialize};
use shardkv_common::Entry;

/// One WAL record: the complete state of a key after a write.
///
/// Replay keeps the last record per key, so every record carries the whole
/// entry rather than a delta.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WalRecord {
    pub key: String,
    pub entry: Entry,
}

impl WalRecord {
    pub fn new(key: impl Into<String>, entry: Entry) -> Self {
        Self {
            key: key.into(),
            entry,
        }
    }
}
