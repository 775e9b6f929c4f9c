//! Left-leaning red-black tree keyed by ring position.
//!
//! Every recursive step takes ownership of a subtree and hands back the
//! (possibly different) root of the rebalanced subtree. Each node carries the
//! size of its subtree so `rank` and `select` run in O(log n).

use std::cmp::Ordering;

type Link<V> = Option<Box<Node<V>>>;

#[derive(Debug)]
struct Node<V> {
    key: u64,
    value: V,
    red: bool,
    weight: usize,
    left: Link<V>,
    right: Link<V>,
}

impl<V> Node<V> {
    fn new(key: u64, value: V) -> Box<Self> {
        Box::new(Self {
            key,
            value,
            red: true,
            weight: 1,
            left: None,
            right: None,
        })
    }

    fn update(&mut self) {
        self.weight = 1 + weight(&self.left) + weight(&self.right);
    }
}

fn is_red<V>(link: &Link<V>) -> bool {
    link.as_ref().map_or(false, |n| n.red)
}

fn weight<V>(link: &Link<V>) -> usize {
    link.as_ref().map_or(0, |n| n.weight)
}

fn is_red_left_left<V>(h: &Node<V>) -> bool {
    h.left.as_ref().map_or(false, |l| is_red(&l.left))
}

fn is_red_right_left<V>(h: &Node<V>) -> bool {
    h.right.as_ref().map_or(false, |r| is_red(&r.left))
}

// ---------------------------------------------------------------------------
// Rebalancing primitives
// ---------------------------------------------------------------------------

fn rotate_left<V>(mut h: Box<Node<V>>) -> Box<Node<V>> {
    let Some(mut x) = h.right.take() else {
        return h;
    };
    h.right = x.left.take();
    x.red = h.red;
    h.red = true;
    h.update();
    x.left = Some(h);
    x.update();
    x
}

fn rotate_right<V>(mut h: Box<Node<V>>) -> Box<Node<V>> {
    let Some(mut x) = h.left.take() else {
        return h;
    };
    h.left = x.right.take();
    x.red = h.red;
    h.red = true;
    h.update();
    x.right = Some(h);
    x.update();
    x
}

fn flip_colors<V>(h: &mut Node<V>) {
    h.red = !h.red;
    if let Some(l) = h.left.as_mut() {
        l.red = !l.red;
    }
    if let Some(r) = h.right.as_mut() {
        r.red = !r.red;
    }
}

/// Assuming `h` is red and both `h.left` and `h.left.left` are black,
/// make `h.left` or one of its children red.
fn move_red_left<V>(mut h: Box<Node<V>>) -> Box<Node<V>> {
    flip_colors(&mut h);
    if is_red_right_left(&h) {
        h.right = h.right.take().map(rotate_right);
        h = rotate_left(h);
        flip_colors(&mut h);
    }
    h
}

/// Assuming `h` is red and both `h.right` and `h.right.left` are black,
/// make `h.right` or one of its children red.
fn move_red_right<V>(mut h: Box<Node<V>>) -> Box<Node<V>> {
    flip_colors(&mut h);
    if is_red_left_left(&h) {
        h = rotate_right(h);
        flip_colors(&mut h);
    }
    h
}

/// Restore the left-leaning invariants on the way back up.
fn balance<V>(mut h: Box<Node<V>>) -> Box<Node<V>> {
    if is_red(&h.right) && !is_red(&h.left) {
        h = rotate_left(h);
    }
    if is_red(&h.left) && is_red_left_left(&h) {
        h = rotate_right(h);
    }
    if is_red(&h.left) && is_red(&h.right) {
        flip_colors(&mut h);
    }
    h.update();
    h
}

// ---------------------------------------------------------------------------
// Recursive mutation
// ---------------------------------------------------------------------------

fn insert<V>(h: Link<V>, key: u64, value: V) -> Box<Node<V>> {
    let Some(mut h) = h else {
        return Node::new(key, value);
    };
    match key.cmp(&h.key) {
        Ordering::Less => h.left = Some(insert(h.left.take(), key, value)),
        Ordering::Greater => h.right = Some(insert(h.right.take(), key, value)),
        Ordering::Equal => h.value = value,
    }
    balance(h)
}

/// Detach the minimum of the subtree. Returns the new subtree root and the
/// removed `(key, value)`.
fn remove_min<V>(mut h: Box<Node<V>>) -> (Link<V>, (u64, V)) {
    if h.left.is_none() {
        let Node {
            key, value, right, ..
        } = *h;
        return (right, (key, value));
    }
    if !is_red(&h.left) && !is_red_left_left(&h) {
        h = move_red_left(h);
    }
    // `move_red_left` never empties the left link.
    let Some(left) = h.left.take() else {
        let Node {
            key, value, right, ..
        } = *h;
        return (right, (key, value));
    };
    let (rest, min) = remove_min(left);
    h.left = rest;
    (Some(balance(h)), min)
}

/// Remove `key` from the subtree. The key must be present.
fn remove<V>(mut h: Box<Node<V>>, key: u64) -> Link<V> {
    if key < h.key {
        if !is_red(&h.left) && !is_red_left_left(&h) {
            h = move_red_left(h);
        }
        h.left = h.left.take().and_then(|l| remove(l, key));
    } else {
        if is_red(&h.left) {
            h = rotate_right(h);
        }
        if key == h.key && h.right.is_none() {
            return h.left.take();
        }
        if !is_red(&h.right) && !is_red_right_left(&h) {
            h = move_red_right(h);
        }
        if key == h.key {
            if let Some(right) = h.right.take() {
                let (rest, (k, v)) = remove_min(right);
                h.key = k;
                h.value = v;
                h.right = rest;
            }
        } else {
            h.right = h.right.take().and_then(|r| remove(r, key));
        }
    }
    Some(balance(h))
}

// ---------------------------------------------------------------------------
// RingTree
// ---------------------------------------------------------------------------

/// Ordered map from ring position to value.
///
/// Not synchronized; see [`crate::HashRing`] for the shared version.
#[derive(Debug)]
pub struct RingTree<V> {
    root: Link<V>,
}

impl<V> Default for RingTree<V> {
    fn default() -> Self {
        Self { root: None }
    }
}

impl<V> RingTree<V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        weight(&self.root)
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    pub fn clear(&mut self) {
        self.root = None;
    }

    /// Insert or overwrite the value at `key`.
    pub fn put(&mut self, key: u64, value: V) {
        let mut root = insert(self.root.take(), key, value);
        root.red = false;
        self.root = Some(root);
    }

    /// Remove `key`. Returns `false` (and leaves the tree untouched) when the
    /// key is absent.
    pub fn delete(&mut self, key: u64) -> bool {
        if !self.contains(key) {
            return false;
        }
        let Some(mut root) = self.root.take() else {
            return false;
        };
        if !is_red(&root.left) && !is_red(&root.right) {
            root.red = true;
        }
        self.root = remove(root, key);
        if let Some(r) = self.root.as_mut() {
            r.red = false;
        }
        true
    }

    /// Remove and return the smallest entry.
    pub fn delete_min(&mut self) -> Option<(u64, V)> {
        let mut root = self.root.take()?;
        if !is_red(&root.left) && !is_red(&root.right) {
            root.red = true;
        }
        let (rest, min) = remove_min(root);
        self.root = rest;
        if let Some(r) = self.root.as_mut() {
            r.red = false;
        }
        Some(min)
    }

    pub fn get(&self, key: u64) -> Option<&V> {
        let mut cur = self.root.as_deref();
        while let Some(n) = cur {
            match key.cmp(&n.key) {
                Ordering::Less => cur = n.left.as_deref(),
                Ordering::Greater => cur = n.right.as_deref(),
                Ordering::Equal => return Some(&n.value),
            }
        }
        None
    }

    pub fn contains(&self, key: u64) -> bool {
        self.get(key).is_some()
    }

    pub fn min(&self) -> Option<u64> {
        let mut cur = self.root.as_deref()?;
        while let Some(l) = cur.left.as_deref() {
            cur = l;
        }
        Some(cur.key)
    }

    pub fn max(&self) -> Option<u64> {
        let mut cur = self.root.as_deref()?;
        while let Some(r) = cur.right.as_deref() {
            cur = r;
        }
        Some(cur.key)
    }

    /// Largest stored key `<= key`.
    pub fn floor(&self, key: u64) -> Option<u64> {
        let mut best = None;
        let mut cur = self.root.as_deref();
        while let Some(n) = cur {
            match key.cmp(&n.key) {
                Ordering::Equal => return Some(n.key),
                Ordering::Less => cur = n.left.as_deref(),
                Ordering::Greater => {
                    best = Some(n.key);
                    cur = n.right.as_deref();
                }
            }
        }
        best
    }

    /// Smallest stored key `>= key`.
    pub fn ceil(&self, key: u64) -> Option<u64> {
        let mut best = None;
        let mut cur = self.root.as_deref();
        while let Some(n) = cur {
            match key.cmp(&n.key) {
                Ordering::Equal => return Some(n.key),
                Ordering::Greater => cur = n.right.as_deref(),
                Ordering::Less => {
                    best = Some(n.key);
                    cur = n.left.as_deref();
                }
            }
        }
        best
    }

    /// Value at the first position clockwise from `key` (inclusive),
    /// wrapping around to the minimum.
    pub fn successor(&self, key: u64) -> Option<&V> {
        let at = self.ceil(key).or_else(|| self.min())?;
        self.get(at)
    }

    /// Value at the first position counter-clockwise from `key` (inclusive),
    /// wrapping around to the maximum.
    pub fn predecessor(&self, key: u64) -> Option<&V> {
        let at = self.floor(key).or_else(|| self.max())?;
        self.get(at)
    }

    /// Number of stored keys strictly less than `key`.
    pub fn rank(&self, key: u64) -> usize {
        let mut rank = 0;
        let mut cur = self.root.as_deref();
        while let Some(n) = cur {
            match key.cmp(&n.key) {
                Ordering::Less => cur = n.left.as_deref(),
                Ordering::Greater => {
                    rank += 1 + weight(&n.left);
                    cur = n.right.as_deref();
                }
                Ordering::Equal => return rank + weight(&n.left),
            }
        }
        rank
    }

    /// The key of rank `k` (0-based), if `k < len()`.
    pub fn select(&self, mut k: usize) -> Option<u64> {
        let mut cur = self.root.as_deref();
        while let Some(n) = cur {
            let lw = weight(&n.left);
            match k.cmp(&lw) {
                Ordering::Less => cur = n.left.as_deref(),
                Ordering::Greater => {
                    k -= lw + 1;
                    cur = n.right.as_deref();
                }
                Ordering::Equal => return Some(n.key),
            }
        }
        None
    }

    /// All keys in ascending order.
    pub fn keys(&self) -> Vec<u64> {
        self.entries().into_iter().map(|(k, _)| k).collect()
    }

    /// All `(key, value)` pairs in ascending key order.
    pub fn entries(&self) -> Vec<(u64, &V)> {
        let mut out = Vec::with_capacity(self.len());
        let mut stack: Vec<&Node<V>> = Vec::new();
        let mut cur = self.root.as_deref();
        while cur.is_some() || !stack.is_empty() {
            while let Some(n) = cur {
                stack.push(n);
                cur = n.left.as_deref();
            }
            if let Some(n) = stack.pop() {
                out.push((n.key, &n.value));
                cur = n.right.as_deref();
            }
        }
        out
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
