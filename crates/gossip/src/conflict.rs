//! Deterministic conflict resolution between two copies of one key.

use shardkv_common::{Entry, VClockOrder};

/// Whether `remote` should replace `local`.
///
/// A local entry with an empty clock always loses. Otherwise the clocks
/// decide; identical or concurrent clocks fall back to last-write-wins on the
/// wall-clock timestamp, with ties keeping the local copy.
pub fn remote_wins(local: &Entry, remote: &Entry) -> bool {
    if local.clock.is_empty() {
        return true;
    }
    match remote.clock.compare(&local.clock) {
        VClockOrder::Dominates => true,
        VClockOrder::DominatedBy => false,
        VClockOrder::Equal | VClockOrder::Concurrent => remote.timestamp > local.timestamp,
    }
}
