//! Vector clock used to order versions of a single key.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A vector clock: maps node identifiers (`ip:port`) to monotonic counters.
///
/// Backed by a `BTreeMap` so that two equal clocks always encode to the
/// same bytes on the wire and in the WAL.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VClock {
    entries: BTreeMap<String, u64>,
}

impl VClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a clock from `(node, counter)` pairs.
    pub fn from_pairs<I, S>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (S, u64)>,
        S: Into<String>,
    {
        Self {
            entries: pairs.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }

    /// Get the counter for a node (0 if not present).
    pub fn get(&self, node: &str) -> u64 {
        self.entries.get(node).copied().unwrap_or(0)
    }

    /// Return a copy with `node`'s counter bumped by one.
    pub fn increment(&self, node: &str) -> Self {
        let mut next = self.clone();
        *next.entries.entry(node.to_string()).or_insert(0) += 1;
        next
    }

    /// Element-wise max of two clocks.
    pub fn merge(&self, other: &Self) -> Self {
        let mut merged = self.entries.clone();
        for (k, &v) in &other.entries {
            let slot = merged.entry(k.clone()).or_insert(0);
            *slot = (*slot).max(v);
        }
        Self { entries: merged }
    }

    /// Compare over the union of both clocks' components.
    pub fn compare(&self, other: &Self) -> VClockOrder {
        let mut self_ahead = false;
        let mut other_ahead = false;

        for node in self.entries.keys().chain(other.entries.keys()) {
            let (s, o) = (self.get(node), other.get(node));
            if s > o {
                self_ahead = true;
            }
            if o > s {
                other_ahead = true;
            }
        }

        match (self_ahead, other_ahead) {
            (false, false) => VClockOrder::Equal,
            (true, false) => VClockOrder::Dominates,
            (false, true) => VClockOrder::DominatedBy,
            (true, true) => VClockOrder::Concurrent,
        }
    }

    /// `true` when no component has ever been recorded.
    pub fn is_empty(&self) -> bool {
        self.entries.values().all(|&v| v == 0)
    }

    pub fn entries(&self) -> &BTreeMap<String, u64> {
        &self.entries
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VClockOrder {
    Equal,
    Dominates,
    DominatedBy,
    Concurrent,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vc(entries: &[(&str, u64)]) -> VClock {
        VClock::from_pairs(entries.iter().map(|(k, v)| (*k, *v)))
    }

    #[test]
    fn test_increment() {
        let c1 = VClock::new().increment("a");
        assert_eq!(c1.get("a"), 1);
        let c2 = c1.increment("a").increment("b");
        assert_eq!(c2.get("a"), 2);
        assert_eq!(c2.get("b"), 1);
        assert_eq!(c1.get("a"), 1, "increment must not mutate the receiver");
    }

    #[test]
    fn test_merge_takes_max() {
        let a = vc(&[("n1", 3), ("n2", 1)]);
        let b = vc(&[("n1", 1), ("n2", 5), ("n3", 2)]);
        let merged = a.merge(&b);
        assert_eq!(merged, vc(&[("n1", 3), ("n2", 5), ("n3", 2)]));
    }

    #[test]
    fn test_compare() {
        let base = vc(&[("n1", 1), ("n2", 2)]);
        assert_eq!(base.compare(&base.clone()), VClockOrder::Equal);
        assert_eq!(
            vc(&[("n1", 2), ("n2", 2)]).compare(&base),
            VClockOrder::Dominates
        );
        assert_eq!(
            vc(&[("n1", 1)]).compare(&vc(&[("n1", 2)])),
            VClockOrder::DominatedBy
        );
        assert_eq!(
            vc(&[("n1", 1)]).compare(&vc(&[("n2", 1)])),
            VClockOrder::Concurrent
        );
    }

    #[test]
    fn test_missing_components_read_as_zero() {
        let a = vc(&[("n1", 1), ("n2", 0)]);
        let b = vc(&[("n1", 1)]);
        assert_eq!(a.compare(&b), VClockOrder::Equal);
        assert!(vc(&[("n1", 0)]).is_empty());
        assert!(!b.is_empty());
    }
}
