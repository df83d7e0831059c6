//! [`ChromaticTree`] is a concurrent, capacity-bounded, leaf-oriented relaxed red-black tree.

mod discipline;
mod error;
mod lock_set;
mod node;
mod pool;
mod rebalance;
mod rotation;

pub use discipline::{Coarse, Discipline, Fine};
pub use error::Exhausted;

use std::fmt;
use std::sync::Arc;

#[cfg(feature = "loom")]
use loom::thread::yield_now;
#[cfg(not(feature = "loom"))]
use std::thread::yield_now;

use equivalent::Comparable;
use sdd::{Guard, Shared};

use crate::tracing_helpers::{debug_log, trace_log, warn_log};
use error::Abort;
use lock_set::LockSet;
use node::{lighter, Node, Side, Weight};
use pool::{NodePool, PERMANENT_NODES};

/// A concurrent ordered map with a fixed capacity.
///
/// [`ChromaticTree`] is a chromatic tree: a leaf-oriented binary search tree whose nodes carry a
/// weight instead of a color. Updates only touch a few nodes next to the affected leaf and may
/// leave local balance violations behind; the updating thread then repairs them on its own
/// search path with rotations that replace small groups of nodes by new nodes.
///
/// ## The key features of [`ChromaticTree`]
/// * Fixed capacity: every node comes from a pool sized when the tree is created.
/// * Two synchronization disciplines: [`Coarse`] guards the whole tree with a single
///   reader-writer lock, and [`Fine`] lets readers run without locks while writers latch only the
///   nodes they replace.
/// * Logarithmic height once every pending repair has finished.
///
/// ## The key statistics for [`ChromaticTree`]
/// * The number of nodes per entry: 2.
/// * The number of nodes replaced by a rebalancing step: at most 5.
/// * Exactly `capacity` distinct keys fit; an insertion waits for unlinked nodes to be reclaimed
///   instead of failing early.
pub struct ChromaticTree<K, V, D = Coarse>
where
    K: 'static + Clone + Ord + Send + Sync,
    V: 'static + Clone + Send + Sync,
    D: Discipline,
{
    entry: Shared<Node<K, V>>,
    pool: Arc<NodePool>,
    discipline: D,
}

/// [`ChromaticTree`] guarded by a single reader-writer lock.
pub type CglChromaticTree<K, V> = ChromaticTree<K, V, Coarse>;

/// [`ChromaticTree`] with per-node latches and lock-free readers.
pub type FglChromaticTree<K, V> = ChromaticTree<K, V, Fine>;

/// The last three nodes on a search path.
struct Path<'g, K, V> {
    grandparent: &'g Node<K, V>,
    parent: &'g Node<K, V>,
    leaf: &'g Node<K, V>,
}

impl<K, V, D> ChromaticTree<K, V, D>
where
    K: 'static + Clone + Ord + Send + Sync,
    V: 'static + Clone + Send + Sync,
    D: Discipline,
{
    /// Creates an empty [`ChromaticTree`] that can hold `capacity` entries.
    ///
    /// # Examples
    ///
    /// ```
    /// use chromatic::CglChromaticTree;
    ///
    /// let tree: CglChromaticTree<u64, u32> = CglChromaticTree::new(16);
    ///
    /// assert_eq!(tree.capacity(), 16);
    /// assert!(tree.is_empty());
    /// ```
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let pool = NodePool::new(
            capacity,
            NodePool::slots_for(capacity, D::retired_margin()),
        );
        let mut permits = pool.acquire_permanent(PERMANENT_NODES);
        let first = permits.node(None, None, Weight::Sentinel, None);
        let entry = permits.entry(first);
        debug_log!(capacity, slots = pool.slots(), "chromatic tree created");
        Self {
            entry,
            pool,
            discipline: D::default(),
        }
    }

    /// Returns the maximum number of entries the [`ChromaticTree`] was created for.
    ///
    /// # Examples
    ///
    /// ```
    /// use chromatic::FglChromaticTree;
    ///
    /// let tree: FglChromaticTree<u64, u32> = FglChromaticTree::new(1024);
    /// assert_eq!(tree.capacity(), 1024);
    /// ```
    #[inline]
    pub fn capacity(&self) -> usize {
        self.pool.capacity()
    }

    /// Reads the entry associated with the key.
    ///
    /// Returns `None` if the key is not present.
    ///
    /// # Examples
    ///
    /// ```
    /// use chromatic::FglChromaticTree;
    ///
    /// let tree: FglChromaticTree<u64, u32> = FglChromaticTree::new(4);
    ///
    /// assert!(tree.read(&1, |_, v| *v).is_none());
    /// assert!(tree.insert(1, 10).is_ok());
    /// assert_eq!(tree.read(&1, |_, v| *v).unwrap(), 10);
    /// ```
    #[inline]
    pub fn read<Q, R, F: FnOnce(&K, &V) -> R>(&self, key: &Q, reader: F) -> Option<R>
    where
        Q: ?Sized + Comparable<K>,
    {
        self.discipline.shared(|| {
            let guard = Guard::new();
            let leaf = self.search(key, &guard).leaf;
            if leaf.matches(key) {
                leaf.key().zip(leaf.value()).map(|(k, v)| reader(k, v))
            } else {
                None
            }
        })
    }

    /// Returns a clone of the value associated with the key.
    ///
    /// # Examples
    ///
    /// ```
    /// use chromatic::CglChromaticTree;
    ///
    /// let tree: CglChromaticTree<u64, u32> = CglChromaticTree::new(4);
    ///
    /// assert!(tree.get(&1).is_none());
    /// assert!(tree.insert(1, 10).is_ok());
    /// assert_eq!(tree.get(&1), Some(10));
    /// ```
    #[inline]
    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where
        Q: ?Sized + Comparable<K>,
    {
        self.read(key, |_, v| v.clone())
    }

    /// Returns `true` if the key is present.
    ///
    /// # Examples
    ///
    /// ```
    /// use chromatic::CglChromaticTree;
    ///
    /// let tree: CglChromaticTree<u64, u32> = CglChromaticTree::new(4);
    ///
    /// assert!(!tree.contains(&1));
    /// assert!(tree.insert(1, 0).is_ok());
    /// assert!(tree.contains(&1));
    /// ```
    #[inline]
    pub fn contains<Q>(&self, key: &Q) -> bool
    where
        Q: ?Sized + Comparable<K>,
    {
        self.read(key, |_, _| ()).is_some()
    }

    /// Inserts a key-value pair, replacing the value if the key is present.
    ///
    /// Returns the previous value if the key was present.
    ///
    /// # Errors
    ///
    /// Returns the key-value pair back if the key is not present and the tree already holds
    /// `capacity` entries; the tree is left unchanged in that case.
    ///
    /// # Examples
    ///
    /// ```
    /// use chromatic::CglChromaticTree;
    ///
    /// let tree: CglChromaticTree<u64, u32> = CglChromaticTree::new(1);
    ///
    /// assert_eq!(tree.insert(1, 10), Ok(None));
    /// assert_eq!(tree.insert(1, 11), Ok(Some(10)));
    /// assert_eq!(tree.insert(2, 20), Err((2, 20)));
    /// assert_eq!(tree.get(&1), Some(11));
    /// ```
    pub fn insert(&self, key: K, value: V) -> Result<Option<V>, (K, V)> {
        self.discipline.exclusive(|| {
            let mut value = value;
            loop {
                // The guard is dropped before backing off so reclamation can proceed.
                let attempt = self.try_insert(&key, value, &Guard::new());
                match attempt {
                    Ok((old_value, violation)) => {
                        if violation {
                            self.repair(&key);
                        }
                        return Ok(old_value);
                    }
                    Err((abort, rejected)) => {
                        if !Self::back_off(abort) {
                            warn_log!(?abort, in_use = self.pool.in_use(), "insert rejected");
                            return Err((key, rejected));
                        }
                        value = rejected;
                    }
                }
            }
        })
    }

    /// Removes the key, returning the value it was associated with.
    ///
    /// Returns `Ok(None)` if the key was not present.
    ///
    /// # Errors
    ///
    /// Returns [`Exhausted`] if the replacement node cannot be allocated even though retired
    /// nodes have had the chance to be reclaimed; the tree is left unchanged in that case.
    ///
    /// # Examples
    ///
    /// ```
    /// use chromatic::FglChromaticTree;
    ///
    /// let tree: FglChromaticTree<u64, u32> = FglChromaticTree::new(4);
    ///
    /// assert_eq!(tree.remove(&1), Ok(None));
    /// assert!(tree.insert(1, 10).is_ok());
    /// assert_eq!(tree.remove(&1), Ok(Some(10)));
    /// assert!(tree.get(&1).is_none());
    /// ```
    pub fn remove<Q>(&self, key: &Q) -> Result<Option<V>, Exhausted>
    where
        Q: ?Sized + Comparable<K>,
    {
        self.discipline.exclusive(|| loop {
            let attempt = self.try_remove(key, &Guard::new());
            match attempt {
                Ok((old_value, overweight)) => {
                    if overweight {
                        self.repair(key);
                    }
                    return Ok(old_value);
                }
                Err(abort) => {
                    if !Self::back_off(abort) {
                        warn_log!(?abort, in_use = self.pool.in_use(), "remove rejected");
                        return Err(Exhausted);
                    }
                }
            }
        })
    }

    /// Returns `true` if the [`ChromaticTree`] is empty.
    ///
    /// # Examples
    ///
    /// ```
    /// use chromatic::CglChromaticTree;
    ///
    /// let tree: CglChromaticTree<u64, u32> = CglChromaticTree::new(4);
    ///
    /// assert!(tree.is_empty());
    /// assert!(tree.insert(1, 0).is_ok());
    /// assert!(!tree.is_empty());
    /// ```
    pub fn is_empty(&self) -> bool {
        self.discipline.shared(|| {
            let guard = Guard::new();
            self.entry
                .child(Side::Left, &guard)
                .map_or(true, Node::is_leaf)
        })
    }

    /// Returns the number of entries.
    ///
    /// The result is exact when no update runs concurrently.
    ///
    /// # Examples
    ///
    /// ```
    /// use chromatic::FglChromaticTree;
    ///
    /// let tree: FglChromaticTree<u64, u32> = FglChromaticTree::new(4);
    ///
    /// assert!(tree.insert(1, 0).is_ok());
    /// assert!(tree.insert(2, 0).is_ok());
    /// assert_eq!(tree.len(), 2);
    /// ```
    pub fn len(&self) -> usize {
        self.fold(0, |len, node, _| {
            if node.is_leaf() && !node.is_sentinel() && node.key().is_some() {
                len + 1
            } else {
                len
            }
        })
    }

    /// Returns the number of nodes on the longest path below the entry sentinel.
    ///
    /// An empty tree has height `1`.
    ///
    /// # Examples
    ///
    /// ```
    /// use chromatic::CglChromaticTree;
    ///
    /// let tree: CglChromaticTree<u64, u32> = CglChromaticTree::new(64);
    /// assert_eq!(tree.height(), 1);
    ///
    /// for k in 0..64 {
    ///     assert!(tree.insert(k, 0).is_ok());
    /// }
    /// assert!(tree.height() <= 16);
    /// ```
    pub fn height(&self) -> usize {
        self.fold(0, |height, _, depth| height.max(depth))
    }

    /// Returns `true` if the tree satisfies the red-black conditions.
    ///
    /// No node may be overweight and no two nodes of weight `0` may be linked. Every update
    /// restores this before returning unless a repair was abandoned, so the result is `true`
    /// whenever no update runs concurrently.
    ///
    /// # Examples
    ///
    /// ```
    /// use chromatic::CglChromaticTree;
    ///
    /// let tree: CglChromaticTree<u64, u32> = CglChromaticTree::new(128);
    ///
    /// for k in 0..128 {
    ///     assert!(tree.insert(k, 0).is_ok());
    /// }
    /// for k in (0..128).step_by(3) {
    ///     assert!(tree.remove(&k).is_ok());
    /// }
    /// assert!(tree.is_balanced());
    /// ```
    pub fn is_balanced(&self) -> bool {
        self.discipline.shared(|| {
            let guard = Guard::new();
            let Some(root) = self.entry.child(Side::Left, &guard) else {
                return true;
            };
            let mut stack = vec![root];
            while let Some(node) = stack.pop() {
                if node.weight() > 1 {
                    return false;
                }
                for side in [Side::Left, Side::Right] {
                    if let Some(child) = node.child(side, &guard) {
                        if node.weight() == 0 && child.weight() == 0 {
                            return false;
                        }
                        stack.push(child);
                    }
                }
            }
            true
        })
    }

    /// Visits every node below the entry together with its depth.
    fn fold<R, F: FnMut(R, &Node<K, V>, usize) -> R>(&self, init: R, mut f: F) -> R {
        self.discipline.shared(|| {
            let guard = Guard::new();
            let mut acc = init;
            let mut stack = Vec::new();
            if let Some(root) = self.entry.child(Side::Left, &guard) {
                stack.push((root, 1));
            }
            while let Some((node, depth)) = stack.pop() {
                acc = f(acc, node, depth);
                for side in [Side::Left, Side::Right] {
                    if let Some(child) = node.child(side, &guard) {
                        stack.push((child, depth + 1));
                    }
                }
            }
            acc
        })
    }

    /// Descends from the entry towards `key` until a leaf is reached.
    ///
    /// The search restarts whenever it steps onto a node that has already been unlinked.
    fn search<'g, Q>(&'g self, key: &Q, guard: &'g Guard) -> Path<'g, K, V>
    where
        Q: ?Sized + Comparable<K>,
    {
        let entry: &'g Node<K, V> = &self.entry;
        'restart: loop {
            let mut grandparent = entry;
            let mut parent = entry;
            let Some(mut leaf) = entry.child(Side::Left, guard) else {
                continue;
            };
            while !leaf.is_leaf() {
                let Some(next) = leaf.child(leaf.towards(key), guard) else {
                    continue 'restart;
                };
                grandparent = parent;
                parent = leaf;
                leaf = next;
                if parent.is_retired() {
                    trace_log!("search: stepped onto a retired node, restarting");
                    continue 'restart;
                }
            }
            return Path {
                grandparent,
                parent,
                leaf,
            };
        }
    }

    /// Replaces the leaf for `key` with a leaf holding `value`, or with a new internal node
    /// above the old leaf and a new one.
    ///
    /// Returns the old value and whether the tree needs repairing, or hands `value` back.
    fn try_insert(
        &self,
        key: &K,
        value: V,
        guard: &Guard,
    ) -> Result<(Option<V>, bool), (Abort, V)> {
        let Path { parent, leaf, .. } = self.search(key, guard);
        let mut locks = LockSet::<K, V, D>::new();
        if !locks.protect(parent) || !parent.has_child(leaf, guard) || !locks.protect(leaf) {
            return Err((Abort::Busy, value));
        }

        let (replacement, old_value) = if leaf.matches(key) {
            let Some(mut permits) = self.pool.acquire(1) else {
                return Err((Abort::Exhausted, value));
            };
            let old_value = leaf.value().cloned();
            let updated = permits.node(Some(key.clone()), Some(value), leaf.kind(), None);
            (updated, old_value)
        } else {
            let Some(admission) = self.pool.admit() else {
                return Err((Abort::Full, value));
            };
            let Some(mut permits) = self.pool.acquire(3) else {
                return Err((Abort::Exhausted, value));
            };
            let weight = if leaf.is_sentinel() {
                Weight::Sentinel
            } else if parent.is_sentinel() {
                Weight::Of(1)
            } else {
                Weight::Of(lighter(leaf.weight()))
            };
            let towards = leaf.towards(key);
            let sibling = permits.copy(leaf, Weight::Of(1), None);
            let router = if towards == Side::Left {
                leaf.key().cloned()
            } else {
                Some(key.clone())
            };
            let inserted = permits.node(Some(key.clone()), Some(value), Weight::Of(1), None);
            let children = towards.arrange(inserted, sibling);
            admission.commit();
            (permits.node(router, None, weight, Some(children)), None)
        };

        let violation = parent.weight() == 0 && replacement.weight() == 0;
        leaf.retire();
        let replaced = parent.replace_child(leaf, replacement, guard);
        debug_assert!(replaced.is_some());
        drop(locks);
        // SAFETY: a coarse tree is exclusively locked; a fine tree only defers release.
        unsafe { Node::reclaim::<D>(replaced) };
        Ok((old_value, violation))
    }

    /// Replaces the parent of the leaf for `key` with a copy of the leaf's sibling.
    ///
    /// Returns the removed value and whether the copy is overweight.
    fn try_remove<Q>(&self, key: &Q, guard: &Guard) -> Result<(Option<V>, bool), Abort>
    where
        Q: ?Sized + Comparable<K>,
    {
        let Path {
            grandparent,
            parent,
            leaf,
        } = self.search(key, guard);
        if !leaf.matches(key) {
            return Ok((None, false));
        }

        let mut locks = LockSet::<K, V, D>::new();
        let sibling = if locks.protect(grandparent)
            && grandparent.has_child(parent, guard)
            && locks.protect(parent)
        {
            parent
                .side_of(leaf, guard)
                .and_then(|side| parent.child(side.opposite(), guard))
        } else {
            None
        };
        let Some(sibling) = sibling.filter(|s| locks.protect(*s) && locks.protect(leaf)) else {
            return Err(Abort::Busy);
        };

        let weight = if parent.is_sentinel() {
            Weight::Sentinel
        } else if grandparent.is_sentinel() {
            Weight::Of(1)
        } else {
            Weight::Of(parent.weight() + sibling.weight())
        };
        let mut permits = self.pool.acquire(1).ok_or(Abort::Exhausted)?;
        let replacement = permits.copy(sibling, weight, sibling.children(guard));
        let old_value = leaf.value().cloned();

        parent.retire();
        leaf.retire();
        sibling.retire();
        let replaced = grandparent.replace_child(parent, replacement, guard);
        debug_assert!(replaced.is_some());
        drop(locks);
        self.pool.evict();
        // SAFETY: a coarse tree is exclusively locked; a fine tree only defers release.
        unsafe { Node::reclaim::<D>(replaced) };
        Ok((old_value, weight.get() > 1))
    }

    /// Waits before an aborted attempt is retried; must be called without a [`Guard`].
    ///
    /// Returns `false` if retrying cannot succeed: the tree is full, or a coarse tree ran out of
    /// node slots which no other thread can be about to free.
    fn back_off(abort: Abort) -> bool {
        match abort {
            Abort::Busy => {
                trace_log!("attempt conflicted with another thread, retrying");
                yield_now();
                true
            }
            Abort::Exhausted if D::FINE_GRAINED => {
                trace_log!("waiting for retired nodes to be reclaimed");
                Guard::new().accelerate();
                yield_now();
                true
            }
            Abort::Exhausted | Abort::Full => false,
        }
    }

    /// Repairs the violations on the search path of `key`, logging if the repair is abandoned.
    fn repair<Q>(&self, key: &Q)
    where
        Q: ?Sized + Comparable<K>,
    {
        if self.clean_up(key).is_err() {
            warn_log!(
                in_use = self.pool.in_use(),
                "rebalancing abandoned: pool exhausted"
            );
        }
    }
}

impl<K, V, D> Drop for ChromaticTree<K, V, D>
where
    K: 'static + Clone + Ord + Send + Sync,
    V: 'static + Clone + Send + Sync,
    D: Discipline,
{
    fn drop(&mut self) {
        if let Some(root) = self.entry.detach_left() {
            // SAFETY: `&mut self` guarantees that no operation is in progress, and retired nodes
            // still awaiting reclamation keep their own references.
            unsafe { Node::dismantle(root, |_| true) };
        }
    }
}

impl<K, V, D> fmt::Debug for ChromaticTree<K, V, D>
where
    K: 'static + Clone + fmt::Debug + Ord + Send + Sync,
    V: 'static + Clone + fmt::Debug + Send + Sync,
    D: Discipline,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.discipline.shared(|| {
            let guard = Guard::new();
            let mut entries = Vec::new();
            let mut stack = Vec::new();
            if let Some(root) = self.entry.child(Side::Left, &guard) {
                stack.push(root);
            }
            while let Some(node) = stack.pop() {
                if node.is_leaf() {
                    if let (Some(k), Some(v)) = (node.key(), node.value()) {
                        entries.push((k, v));
                    }
                    continue;
                }
                for side in [Side::Right, Side::Left] {
                    if let Some(child) = node.child(side, &guard) {
                        stack.push(child);
                    }
                }
            }
            f.debug_map().entries(entries).finish()
        })
    }
}
