//! [`Node`] is the only building block of a chromatic tree.
//!
//! The key, value, weight and kind of a node never change once it is published; structural
//! changes replace nodes with freshly built copies. Only the two child links and the latch
//! mutate.

use std::ptr;
#[cfg(not(feature = "loom"))]
use std::sync::atomic::AtomicU8;
use std::sync::atomic::Ordering::{AcqRel, Acquire, Relaxed, Release};

use equivalent::Comparable;
#[cfg(feature = "loom")]
use loom::sync::atomic::AtomicU8;
use sdd::{AtomicShared, Guard, Shared, Tag};

use super::discipline::Discipline;
use super::pool::Permit;

/// The latch is held by a writer.
pub(super) const LOCKED: u8 = 1_u8;

/// The node has been unlinked from the tree; the state is final.
pub(super) const RETIRED: u8 = 1_u8 << 1;

/// Which child link of an internal node.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(super) enum Side {
    Left,
    Right,
}

impl Side {
    /// Returns the other side.
    #[inline]
    pub(super) const fn opposite(self) -> Self {
        match self {
            Side::Left => Side::Right,
            Side::Right => Side::Left,
        }
    }

    /// Places `near` on this side and `far` on the other, returning `(left, right)`.
    #[inline]
    pub(super) fn arrange<T>(self, near: T, far: T) -> (T, T) {
        match self {
            Side::Left => (near, far),
            Side::Right => (far, near),
        }
    }
}

/// Weight assigned to a node when it is built.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(super) enum Weight {
    /// Sentinel node; weighs `1` and bounds the key space from above.
    Sentinel,
    /// Regular node of the given weight.
    Of(u32),
}

impl Weight {
    /// Returns the numeric weight.
    #[inline]
    pub(super) const fn get(self) -> u32 {
        match self {
            Weight::Sentinel => 1,
            Weight::Of(weight) => weight,
        }
    }
}

/// Returns `weight - 1`; leaves and overweight nodes always weigh at least `1`.
#[inline]
pub(super) fn lighter(weight: u32) -> u32 {
    debug_assert!(weight > 0, "weight underflow");
    weight.saturating_sub(1)
}

/// Two child links handed over to a new internal node.
pub(super) type Children<K, V> = (Shared<Node<K, V>>, Shared<Node<K, V>>);

/// [`Node`] is either a leaf carrying an entry, or an internal routing node with exactly two
/// children.
pub(super) struct Node<K, V> {
    /// `None` only for sentinels and the placeholder leaf that is never visited.
    key: Option<K>,
    /// `None` for internal nodes.
    value: Option<V>,
    weight: u32,
    leaf: bool,
    sentinel: bool,
    left: AtomicShared<Node<K, V>>,
    right: AtomicShared<Node<K, V>>,
    latch: AtomicU8,
    _permit: Permit,
}

impl<K, V> Node<K, V> {
    /// Creates a new [`Node`]; it is a leaf if `children` is `None`.
    pub(super) fn new(
        key: Option<K>,
        value: Option<V>,
        weight: Weight,
        children: Option<Children<K, V>>,
        permit: Permit,
    ) -> Self {
        let (left, right, leaf) = match children {
            Some((left, right)) => (AtomicShared::from(left), AtomicShared::from(right), false),
            None => (AtomicShared::null(), AtomicShared::null(), true),
        };
        Self {
            key,
            value,
            weight: weight.get(),
            leaf,
            sentinel: matches!(weight, Weight::Sentinel),
            left,
            right,
            latch: AtomicU8::new(0),
            _permit: permit,
        }
    }

    /// Creates the entry sentinel; only its left link is ever used.
    pub(super) fn entry(first: Shared<Node<K, V>>, permit: Permit) -> Self {
        Self {
            key: None,
            value: None,
            weight: 1,
            leaf: false,
            sentinel: true,
            left: AtomicShared::from(first),
            right: AtomicShared::null(),
            latch: AtomicU8::new(0),
            _permit: permit,
        }
    }

    #[inline]
    pub(super) fn key(&self) -> Option<&K> {
        self.key.as_ref()
    }

    #[inline]
    pub(super) fn value(&self) -> Option<&V> {
        self.value.as_ref()
    }

    #[inline]
    pub(super) fn weight(&self) -> u32 {
        self.weight
    }

    #[inline]
    pub(super) fn is_leaf(&self) -> bool {
        self.leaf
    }

    #[inline]
    pub(super) fn is_sentinel(&self) -> bool {
        self.sentinel
    }

    /// Returns the weight in the form accepted by [`Node::new`].
    #[inline]
    pub(super) fn kind(&self) -> Weight {
        if self.sentinel {
            Weight::Sentinel
        } else {
            Weight::Of(self.weight)
        }
    }

    /// Returns the side a search for `key` descends to.
    #[inline]
    pub(super) fn towards<Q>(&self, key: &Q) -> Side
    where
        Q: ?Sized + Comparable<K>,
    {
        match self.key.as_ref() {
            Some(k) if !self.sentinel && !key.compare(k).is_lt() => Side::Right,
            _ => Side::Left,
        }
    }

    /// Returns `true` if the node is a leaf holding `key`.
    #[inline]
    pub(super) fn matches<Q>(&self, key: &Q) -> bool
    where
        Q: ?Sized + Comparable<K>,
    {
        self.leaf && !self.sentinel && self.key.as_ref().map_or(false, |k| key.equivalent(k))
    }

    #[inline]
    fn link(&self, side: Side) -> &AtomicShared<Node<K, V>> {
        match side {
            Side::Left => &self.left,
            Side::Right => &self.right,
        }
    }

    /// Loads the child on the given side.
    #[inline]
    pub(super) fn child<'g>(&self, side: Side, guard: &'g Guard) -> Option<&'g Node<K, V>> {
        self.link(side).load(Acquire, guard).as_ref()
    }

    /// Returns a strong reference to the child on the given side.
    #[inline]
    pub(super) fn child_shared(&self, side: Side, guard: &Guard) -> Option<Shared<Node<K, V>>> {
        self.link(side).get_shared(Acquire, guard)
    }

    /// Returns strong references to both children, or `None` for a leaf.
    #[inline]
    pub(super) fn children(&self, guard: &Guard) -> Option<Children<K, V>> {
        if self.leaf {
            return None;
        }
        self.child_shared(Side::Left, guard)
            .zip(self.child_shared(Side::Right, guard))
    }

    /// Returns the side on which `child` is currently linked.
    #[inline]
    pub(super) fn side_of(&self, child: &Node<K, V>, guard: &Guard) -> Option<Side> {
        if ptr::eq(self.left.load(Acquire, guard).as_ptr(), child) {
            Some(Side::Left)
        } else if ptr::eq(self.right.load(Acquire, guard).as_ptr(), child) {
            Some(Side::Right)
        } else {
            None
        }
    }

    /// Returns `true` if `child` is currently one of the children.
    #[inline]
    pub(super) fn has_child(&self, child: &Node<K, V>, guard: &Guard) -> bool {
        self.side_of(child, guard).is_some()
    }

    /// Swings the link pointing to `old` over to `new`, returning the detached node.
    ///
    /// Returns `None` and drops `new` if `old` is not a child.
    pub(super) fn replace_child(
        &self,
        old: &Node<K, V>,
        new: Shared<Node<K, V>>,
        guard: &Guard,
    ) -> Option<Shared<Node<K, V>>> {
        let side = self.side_of(old, guard)?;
        self.link(side).swap((Some(new), Tag::None), AcqRel).0
    }

    /// Tries to acquire the latch without blocking.
    #[inline]
    pub(super) fn try_lock(&self) -> bool {
        let mut state = self.latch.load(Relaxed);
        loop {
            if state & LOCKED == LOCKED {
                return false;
            }
            match self
                .latch
                .compare_exchange_weak(state, state | LOCKED, Acquire, Relaxed)
            {
                Ok(_) => return true,
                Err(actual) => state = actual,
            }
        }
    }

    #[inline]
    pub(super) fn unlock(&self) {
        debug_assert_eq!(self.latch.load(Relaxed) & LOCKED, LOCKED);
        self.latch.fetch_and(!LOCKED, Release);
    }

    /// Marks the node unlinked; must be called before the node leaves the tree.
    #[inline]
    pub(super) fn retire(&self) {
        self.latch.fetch_or(RETIRED, Release);
    }

    #[inline]
    pub(super) fn is_retired(&self) -> bool {
        self.latch.load(Acquire) & RETIRED == RETIRED
    }

    /// Detaches and returns the left child.
    pub(super) fn detach_left(&self) -> Option<Shared<Node<K, V>>> {
        self.left.swap((None, Tag::None), Acquire).0
    }

    /// Detaches and returns both children.
    fn take_children(&self) -> [Option<Shared<Node<K, V>>>; 2] {
        [
            self.left.swap((None, Tag::None), Acquire).0,
            self.right.swap((None, Tag::None), Acquire).0,
        ]
    }

    /// Frees `node` and every descendant reached through nodes satisfying `follow`.
    ///
    /// Descendants not followed only lose the reference held by their parent.
    ///
    /// # Safety
    ///
    /// No other thread may hold or be able to obtain a reference to any node that is freed.
    pub(super) unsafe fn dismantle<F: Fn(&Node<K, V>) -> bool>(
        node: Shared<Node<K, V>>,
        follow: F,
    ) {
        let mut stack = vec![node];
        while let Some(node) = stack.pop() {
            for child in node.take_children().into_iter().flatten() {
                if follow(&child) {
                    stack.push(child);
                } else {
                    drop(child);
                }
            }
            let _: bool = node.drop_in_place();
        }
    }

    /// Disposes of a subtree that has just been unlinked from the tree.
    ///
    /// Under a coarse discipline the retired nodes are freed right away, while the nodes adopted
    /// by the replacement only lose a reference. Otherwise reclamation is deferred until no
    /// reader can reach the subtree.
    ///
    /// # Safety
    ///
    /// Under a coarse discipline the exclusive lock must be held.
    pub(super) unsafe fn reclaim<D: Discipline>(unlinked: Option<Shared<Node<K, V>>>) {
        if let Some(unlinked) = unlinked {
            if D::FINE_GRAINED {
                let _: bool = unlinked.release();
            } else {
                Self::dismantle(unlinked, Node::is_retired);
            }
        }
    }
}
