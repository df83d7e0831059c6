//! Fixed-capacity accounting of tree entries and nodes.
//!
//! The number of entries is bounded by the capacity of the tree through [`Admission`]. Nodes are
//! bounded separately: every [`Node`] owns a [`Permit`] that returns its slot to the
//! [`NodePool`] when the node is physically dropped, so retired nodes awaiting reclamation still
//! hold their slots until they are freed.

use std::mem::forget;
#[cfg(not(feature = "loom"))]
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering::{AcqRel, Acquire, Relaxed, Release};
use std::sync::Arc;

#[cfg(feature = "loom")]
use loom::sync::atomic::AtomicUsize;
use sdd::Shared;

use super::node::{Children, Node, Weight};

/// Nodes that exist for the whole lifetime of a tree: the entry and its first child.
pub(super) const PERMANENT_NODES: usize = 2;

/// The largest number of nodes a single rebalancing step builds.
pub(super) const REBALANCE_RESERVE: usize = 5;

/// An insertion holds the replaced leaf and its three replacements at the same time.
const TRANSIENT_NODES: usize = 1;

/// Per-thread allowance for retired nodes not yet reclaimed.
pub(super) const RETIRED_MARGIN: usize = 64;

/// [`NodePool`] bounds the number of entries and the number of live nodes.
#[derive(Debug)]
pub(super) struct NodePool {
    capacity: usize,
    entries: AtomicUsize,
    slots: usize,
    in_use: AtomicUsize,
}

/// A reserved entry; released unless committed.
#[derive(Debug)]
pub(super) struct Admission<'p>(&'p NodePool);

/// A single slot held by a live node.
#[derive(Debug)]
pub(super) struct Permit(Arc<NodePool>);

/// Slots acquired at once and not yet turned into nodes.
#[derive(Debug)]
pub(super) struct Permits {
    pool: Arc<NodePool>,
    remaining: usize,
}

impl NodePool {
    /// Returns the number of slots required to hold `capacity` entries.
    ///
    /// A tree of `n` entries consists of `2 * n + 2` nodes; the rest covers the nodes an update
    /// builds before the nodes it replaces are freed, and `margin` covers retired nodes awaiting
    /// reclamation.
    pub(super) const fn slots_for(capacity: usize, margin: usize) -> usize {
        capacity
            .saturating_mul(2)
            .saturating_add(PERMANENT_NODES + TRANSIENT_NODES + REBALANCE_RESERVE)
            .saturating_add(margin)
    }

    pub(super) fn new(capacity: usize, slots: usize) -> Arc<Self> {
        Arc::new(Self {
            capacity,
            entries: AtomicUsize::new(0),
            slots,
            in_use: AtomicUsize::new(0),
        })
    }

    #[inline]
    pub(super) fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    pub(super) fn slots(&self) -> usize {
        self.slots
    }

    #[inline]
    pub(super) fn in_use(&self) -> usize {
        self.in_use.load(Relaxed)
    }

    /// Reserves room for one more entry; `None` if the pool is at capacity.
    pub(super) fn admit(&self) -> Option<Admission<'_>> {
        let mut current = self.entries.load(Relaxed);
        loop {
            if current >= self.capacity {
                return None;
            }
            match self
                .entries
                .compare_exchange_weak(current, current + 1, AcqRel, Relaxed)
            {
                Ok(_) => return Some(Admission(self)),
                Err(actual) => current = actual,
            }
        }
    }

    /// Gives back the room of an entry that has been removed.
    #[inline]
    pub(super) fn evict(&self) {
        let previous = self.entries.fetch_sub(1, Release);
        debug_assert!(previous > 0, "entry count underflow");
    }

    /// Acquires `count` node slots; either all or none.
    ///
    /// `None` means every slot is held by a node, live or retired.
    pub(super) fn acquire(self: &Arc<Self>, count: usize) -> Option<Permits> {
        let mut current = self.in_use.load(Relaxed);
        loop {
            let next = current.checked_add(count).filter(|n| *n <= self.slots)?;
            match self
                .in_use
                .compare_exchange_weak(current, next, AcqRel, Relaxed)
            {
                Ok(_) => {
                    return Some(Permits {
                        pool: self.clone(),
                        remaining: count,
                    })
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// Acquires `count` slots regardless of the limit; only for the permanent nodes.
    pub(super) fn acquire_permanent(self: &Arc<Self>, count: usize) -> Permits {
        self.in_use.fetch_add(count, Acquire);
        Permits {
            pool: self.clone(),
            remaining: count,
        }
    }
}

impl Admission<'_> {
    /// Keeps the entry; it is given back by [`NodePool::evict`].
    #[inline]
    pub(super) fn commit(self) {
        forget(self);
    }
}

impl Drop for Admission<'_> {
    #[inline]
    fn drop(&mut self) {
        self.0.evict();
    }
}

impl Drop for Permit {
    #[inline]
    fn drop(&mut self) {
        self.0.in_use.fetch_sub(1, Release);
    }
}

impl Permits {
    #[inline]
    fn take(&mut self) -> Permit {
        debug_assert!(self.remaining > 0, "more nodes built than acquired");
        self.remaining = self.remaining.saturating_sub(1);
        Permit(self.pool.clone())
    }

    /// Builds a new node out of an acquired slot.
    pub(super) fn node<K: 'static, V: 'static>(
        &mut self,
        key: Option<K>,
        value: Option<V>,
        weight: Weight,
        children: Option<Children<K, V>>,
    ) -> Shared<Node<K, V>> {
        let permit = self.take();
        Shared::new(Node::new(key, value, weight, children, permit))
    }

    /// Builds the entry sentinel above `first`.
    pub(super) fn entry<K: 'static, V: 'static>(
        &mut self,
        first: Shared<Node<K, V>>,
    ) -> Shared<Node<K, V>> {
        let permit = self.take();
        Shared::new(Node::entry(first, permit))
    }

    /// Builds a copy of `source` carrying a new weight and new children.
    pub(super) fn copy<K: 'static + Clone, V: 'static + Clone>(
        &mut self,
        source: &Node<K, V>,
        weight: Weight,
        children: Option<Children<K, V>>,
    ) -> Shared<Node<K, V>> {
        self.node(
            source.key().cloned(),
            source.value().cloned(),
            weight,
            children,
        )
    }
}

impl Drop for Permits {
    #[inline]
    fn drop(&mut self) {
        if self.remaining != 0 {
            self.pool.in_use.fetch_sub(self.remaining, Release);
        }
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod test {
    use super::*;

    #[test]
    fn all_or_nothing() {
        let pool = NodePool::new(0, 10);
        let first = pool.acquire(4);
        assert!(first.is_some());
        assert_eq!(pool.in_use(), 4);
        assert!(pool.acquire(7).is_none());
        assert_eq!(pool.in_use(), 4);
        let second = pool.acquire(4);
        assert!(second.is_some());
        assert!(pool.acquire(3).is_none());
        assert!(pool.acquire(2).is_some());
        assert_eq!(pool.in_use(), 8);
        drop(first);
        drop(second);
        assert_eq!(pool.in_use(), 0);
    }

    #[test]
    fn admission() {
        let pool = NodePool::new(2, 0);
        let first = pool.admit();
        assert!(first.is_some());
        let second = pool.admit();
        assert!(second.is_some());
        assert!(pool.admit().is_none());

        // An admission that is not committed gives its entry back.
        drop(second);
        let third = pool.admit();
        assert!(third.is_some());
        first.into_iter().chain(third).for_each(Admission::commit);
        assert!(pool.admit().is_none());

        pool.evict();
        assert!(pool.admit().is_some());
        assert!(NodePool::new(0, 8).admit().is_none());
    }

    #[test]
    fn slot_per_node() {
        let pool = NodePool::new(0, 8);
        let mut permits = pool.acquire(3).unwrap();
        let left = permits.node::<usize, usize>(Some(1), Some(1), Weight::Of(1), None);
        let right = permits.node(Some(2), Some(2), Weight::Of(1), None);
        let parent = permits.node(Some(2), None, Weight::Sentinel, Some((left, right)));
        drop(permits);
        assert_eq!(pool.in_use(), 3);
        assert!(parent.is_sentinel());
        assert!(!parent.is_leaf());
        assert_eq!(parent.weight(), 1);
        // SAFETY: the nodes were never shared.
        unsafe { Node::dismantle(parent, |_| true) };
        assert_eq!(pool.in_use(), 0);
    }

    #[test]
    fn sizing() {
        assert_eq!(NodePool::slots_for(0, 0), 8);
        assert_eq!(NodePool::slots_for(16, 0), 40);
        assert_eq!(NodePool::slots_for(usize::MAX, 1), usize::MAX);
    }
}
