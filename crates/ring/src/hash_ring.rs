//! `RingTree` behind one coarse read-write lock.
//!
//! Mutation is rare (topology changes), so a single lock over the whole tree
//! is enough: readers share it, writers exclude everyone.

use crate::llrb::RingTree;
use parking_lot::RwLock;

#[derive(Debug)]
pub struct HashRing<V> {
    tree: RwLock<RingTree<V>>,
}

impl<V> Default for HashRing<V> {
    fn default() -> Self {
        Self {
            tree: RwLock::new(RingTree::new()),
        }
    }
}

impl<V: Clone> HashRing<V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, position: u64, value: V) {
        self.tree.write().put(position, value);
    }

    pub fn delete(&self, position: u64) -> bool {
        self.tree.write().delete(position)
    }

    pub fn delete_min(&self) -> Option<(u64, V)> {
        self.tree.write().delete_min()
    }

    pub fn clear(&self) {
        self.tree.write().clear();
    }

    /// Replace the whole ring with `entries` under a single write lock, so
    /// readers never see a partial rebuild.
    pub fn rebuild<I>(&self, entries: I)
    where
        I: IntoIterator<Item = (u64, V)>,
    {
        let mut tree = self.tree.write();
        tree.clear();
        for (position, value) in entries {
            tree.put(position, value);
        }
    }

    /// Run `f` with exclusive access to the tree.
    pub fn update<R>(&self, f: impl FnOnce(&mut RingTree<V>) -> R) -> R {
        f(&mut self.tree.write())
    }

    pub fn get(&self, position: u64) -> Option<V> {
        self.tree.read().get(position).cloned()
    }

    pub fn contains(&self, position: u64) -> bool {
        self.tree.read().contains(position)
    }

    pub fn floor(&self, position: u64) -> Option<u64> {
        self.tree.read().floor(position)
    }

    pub fn ceil(&self, position: u64) -> Option<u64> {
        self.tree.read().ceil(position)
    }

    pub fn min(&self) -> Option<u64> {
        self.tree.read().min()
    }

    pub fn max(&self) -> Option<u64> {
        self.tree.read().max()
    }

    pub fn successor(&self, position: u64) -> Option<V> {
        self.tree.read().successor(position).cloned()
    }

    pub fn predecessor(&self, position: u64) -> Option<V> {
        self.tree.read().predecessor(position).cloned()
    }

    pub fn rank(&self, position: u64) -> usize {
        self.tree.read().rank(position)
    }

    pub fn select(&self, k: usize) -> Option<u64> {
        self.tree.read().select(k)
    }

    pub fn len(&self) -> usize {
        self.tree.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.read().is_empty()
    }

    pub fn keys(&self) -> Vec<u64> {
        self.tree.read().keys()
    }

    pub fn entries(&self) -> Vec<(u64, V)> {
        self.tree
            .read()
            .entries()
            .into_iter()
            .map(|(k, v)| (k, v.clone()))
            .collect()
    }
}
