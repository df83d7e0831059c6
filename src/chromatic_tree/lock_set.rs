//! Nodes latched by one update attempt, released together when the attempt ends.

use std::marker::PhantomData;

use super::discipline::Discipline;
use super::node::Node;

/// The largest number of nodes a rebalancing step latches.
const MAX_LOCKED: usize = 7;

/// [`LockSet`] unlocks every node it latched when dropped, whichever way the attempt ends.
///
/// Under a coarse discipline nothing is latched.
pub(super) struct LockSet<'g, K, V, D: Discipline> {
    locked: [Option<&'g Node<K, V>>; MAX_LOCKED],
    len: usize,
    _discipline: PhantomData<D>,
}

impl<'g, K, V, D: Discipline> LockSet<'g, K, V, D> {
    #[inline]
    pub(super) fn new() -> Self {
        Self {
            locked: [None; MAX_LOCKED],
            len: 0,
            _discipline: PhantomData,
        }
    }

    /// Latches `node` and makes sure it is still linked.
    ///
    /// Returns `false` if the latch is held by another thread or the node has been retired; the
    /// caller is expected to give up the attempt.
    #[inline]
    pub(super) fn protect(&mut self, node: &'g Node<K, V>) -> bool {
        if !D::FINE_GRAINED {
            return true;
        }
        debug_assert!(self.len < MAX_LOCKED, "too many nodes latched");
        let Some(slot) = self.locked.get_mut(self.len) else {
            return false;
        };
        if !node.try_lock() {
            return false;
        }
        *slot = Some(node);
        self.len += 1;
        !node.is_retired()
    }

    #[cfg(all(test, not(feature = "loom")))]
    pub(super) fn len(&self) -> usize {
        self.len
    }
}

impl<'g, K, V, D: Discipline> Drop for LockSet<'g, K, V, D> {
    #[inline]
    fn drop(&mut self) {
        for node in self.locked[..self.len].iter_mut().filter_map(Option::take) {
            node.unlock();
        }
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod test {
    use super::super::discipline::{Coarse, Fine};
    use super::super::node::Weight;
    use super::super::pool::NodePool;
    use super::*;

    #[test]
    fn release_on_drop() {
        let pool = NodePool::new(0, 4);
        let mut permits = pool.acquire(2).unwrap();
        let a = permits.node::<u8, u8>(Some(1), Some(1), Weight::Of(1), None);
        let b = permits.node::<u8, u8>(Some(2), Some(2), Weight::Of(1), None);

        let mut locks = LockSet::<u8, u8, Fine>::new();
        assert!(locks.protect(&a));
        assert!(!locks.protect(&a));
        b.retire();
        assert!(!locks.protect(&b));
        assert_eq!(locks.len(), 2);
        assert!(!a.try_lock());
        drop(locks);
        assert!(a.try_lock());
        assert!(b.try_lock());
        a.unlock();
        b.unlock();

        let mut locks = LockSet::<u8, u8, Coarse>::new();
        assert!(locks.protect(&b));
        assert_eq!(locks.len(), 0);
    }
}
