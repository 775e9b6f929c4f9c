//! Local storage for shardkv: one `Entry` per key in memory, made durable by
//! a write-ahead log.
//!
//! The rest of the system only sees the `StorageContract` trait.

pub mod contract;
pub mod engine;
pub mod memtable;
pub mod record;
pub mod wal;

pub use contract::{MergeRule, StorageContract, WriteOutcome};
pub use engine::{StorageEngine, StorageError, MAX_KEY_LEN, MAX_VALUE_LEN};
pub use record::WalRecord;
pub use wal::{FsyncPolicy, Wal, WalError};
