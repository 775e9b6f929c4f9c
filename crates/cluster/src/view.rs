//! The set of known peer addresses.

use crate::Membership;
use parking_lot::RwLock;
use rand::seq::SliceRandom;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};

/// Known peers plus this node's own address.
///
/// Built from an empty list the view is uninitialized: reads return empty
/// results and `add`/`remove` do nothing until an `overwrite` arrives.
pub struct MembershipView {
    primary: String,
    peers: RwLock<Option<BTreeSet<String>>>,
    changed: AtomicBool,
}

impl MembershipView {
    pub fn new<I, S>(primary: impl Into<String>, peers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let set: BTreeSet<String> = peers
            .into_iter()
            .map(Into::into)
            .filter(|p: &String| !p.is_empty())
            .collect();
        Self {
            primary: primary.into(),
            peers: RwLock::new(if set.is_empty() { None } else { Some(set) }),
            changed: AtomicBool::new(false),
        }
    }

    pub fn primary(&self) -> &str {
        &self.primary
    }

    pub fn is_initialized(&self) -> bool {
        self.peers.read().is_some()
    }

    pub fn count(&self) -> usize {
        self.peers.read().as_ref().map_or(0, BTreeSet::len)
    }

    pub fn contains(&self, peer: &str) -> bool {
        self.peers
            .read()
            .as_ref()
            .map_or(false, |set| set.contains(peer))
    }

    /// Returns `true` if the peer was newly added.
    pub fn add(&self, peer: &str) -> bool {
        let mut guard = self.peers.write();
        let Some(set) = guard.as_mut() else {
            return false;
        };
        let added = set.insert(peer.to_string());
        if added {
            self.changed.store(true, Ordering::Release);
        }
        added
    }

    /// Returns `true` if the peer was present.
    pub fn remove(&self, peer: &str) -> bool {
        let mut guard = self.peers.write();
        let Some(set) = guard.as_mut() else {
            return false;
        };
        let removed = set.remove(peer);
        if removed {
            self.changed.store(true, Ordering::Release);
        }
        removed
    }

    /// Up to `n` distinct peers chosen uniformly, never the primary.
    pub fn random(&self, n: usize) -> Vec<String> {
        let guard = self.peers.read();
        let Some(set) = guard.as_ref() else {
            return Vec::new();
        };
        let others: Vec<&String> = set.iter().filter(|p| **p != self.primary).collect();
        others
            .choose_multiple(&mut rand::thread_rng(), n)
            .map(|p| (*p).clone())
            .collect()
    }

    /// All peers in sorted order.
    pub fn list(&self) -> Vec<String> {
        self.peers
            .read()
            .as_ref()
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Replace the peer set. Only flags a change if the new set differs.
    pub fn overwrite(&self, peers: &[String]) -> bool {
        let next: BTreeSet<String> = peers.iter().filter(|p| !p.is_empty()).cloned().collect();
        let mut guard = self.peers.write();
        if guard.as_ref() == Some(&next) {
            return false;
        }
        tracing::debug!(peers = next.len(), "membership view overwritten");
        *guard = Some(next);
        self.changed.store(true, Ordering::Release);
        true
    }

    /// Read and clear the change flag.
    pub fn take_change(&self) -> bool {
        self.changed.swap(false, Ordering::AcqRel)
    }
}

impl std::fmt::Debug for MembershipView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MembershipView")
            .field("primary", &self.primary)
            .field("count", &self.count())
            .finish_non_exhaustive()
    }
}

impl Membership for MembershipView {
    fn primary(&self) -> &str {
        MembershipView::primary(self)
    }

    fn contains(&self, peer: &str) -> bool {
        MembershipView::contains(self, peer)
    }

    fn add(&self, peer: &str) -> bool {
        MembershipView::add(self, peer)
    }

    fn remove(&self, peer: &str) -> bool {
        MembershipView::remove(self, peer)
    }

    fn random(&self, n: usize) -> Vec<String> {
        MembershipView::random(self, n)
    }

    fn list(&self) -> Vec<String> {
        MembershipView::list(self)
    }

    fn overwrite(&self, peers: &[String]) -> bool {
        MembershipView::overwrite(self, peers)
    }

    fn take_change(&self) -> bool {
        MembershipView::take_change(self)
    }
}
