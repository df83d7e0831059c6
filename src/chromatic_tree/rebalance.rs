//! Violation repair.
//!
//! A violation is either an overweight node, or a node of weight `0` under a parent of weight
//! `0`. [`ChromaticTree::clean_up`] walks the search path of a key and, at the first violation
//! found, hands a window of four consecutive nodes to [`Rebalancer::rebalance`] which selects the
//! rotation that fixes or moves the violation up. The walk then starts over from the entry until
//! the path is clean.

use std::sync::Arc;

use equivalent::Comparable;
use sdd::Guard;

use super::discipline::Discipline;
use super::error::{Abort, Exhausted};
use super::lock_set::LockSet;
use super::node::{Node, Side};
use super::pool::{NodePool, Permits};
use super::ChromaticTree;
use crate::tracing_helpers::trace_log;

/// [`Rebalancer`] performs a single rebalancing step.
///
/// Nodes it reads fields of are latched first; all latches are released when it is dropped.
pub(super) struct Rebalancer<'g, K, V, D: Discipline> {
    pool: &'g Arc<NodePool>,
    pub(super) guard: &'g Guard,
    locks: LockSet<'g, K, V, D>,
}

impl<K, V, D> ChromaticTree<K, V, D>
where
    K: 'static + Clone + Ord + Send + Sync,
    V: 'static + Clone + Send + Sync,
    D: Discipline,
{
    /// Removes every violation on the search path of `key`.
    ///
    /// Steps that conflict with other threads, or wait for retired nodes to be reclaimed, are
    /// retried without holding a [`Guard`].
    ///
    /// # Errors
    ///
    /// Returns [`Exhausted`] if a rotation could not allocate its nodes and waiting cannot help;
    /// the remaining violations are left in place.
    pub(super) fn clean_up<Q>(&self, key: &Q) -> Result<(), Exhausted>
    where
        Q: ?Sized + Comparable<K>,
    {
        loop {
            let step = self.rebalance_path(key, &Guard::new());
            match step {
                Ok(false) => return Ok(()),
                Ok(true) => (),
                Err(abort) => {
                    if !Self::back_off(abort) {
                        return Err(Exhausted);
                    }
                }
            }
        }
    }

    /// Walks the search path of `key` and fixes the first violation found.
    ///
    /// Returns `false` if the path is free of violations.
    fn rebalance_path<'g, Q>(&'g self, key: &Q, guard: &'g Guard) -> Result<bool, Abort>
    where
        Q: ?Sized + Comparable<K>,
    {
        let entry: &'g Node<K, V> = &self.entry;
        let (mut ggp, mut gp, mut parent) = (entry, entry, entry);
        let Some(mut leaf) = entry.child(Side::Left, guard) else {
            return Ok(false);
        };
        while !leaf.is_leaf() {
            let next = leaf.child(leaf.towards(key), guard).ok_or(Abort::Busy)?;
            ggp = gp;
            gp = parent;
            parent = leaf;
            leaf = next;
            if parent.is_retired() {
                trace_log!("clean-up: stepped onto a retired node, restarting");
                return Err(Abort::Busy);
            }
            if leaf.weight() > 1 || (leaf.weight() == 0 && parent.weight() == 0) {
                Rebalancer::<K, V, D>::new(&self.pool, guard).rebalance(ggp, gp, parent, leaf)?;
                return Ok(true);
            }
        }
        Ok(false)
    }
}

impl<'g, K, V, D> Rebalancer<'g, K, V, D>
where
    K: 'static + Clone + Ord + Send + Sync,
    V: 'static + Clone + Send + Sync,
    D: Discipline,
{
    pub(super) fn new(pool: &'g Arc<NodePool>, guard: &'g Guard) -> Self {
        Self {
            pool,
            guard,
            locks: LockSet::new(),
        }
    }

    /// Latches `node` unless it is latched by another thread or has been retired.
    #[inline]
    pub(super) fn protect(&mut self, node: &'g Node<K, V>) -> Result<(), Abort> {
        if self.locks.protect(node) {
            Ok(())
        } else {
            Err(Abort::Busy)
        }
    }

    /// Loads a child of a latched node.
    #[inline]
    pub(super) fn child(
        &self,
        node: &'g Node<K, V>,
        side: Side,
    ) -> Result<&'g Node<K, V>, Abort> {
        node.child(side, self.guard).ok_or(Abort::Busy)
    }

    /// Acquires the slots for the nodes a rotation builds.
    #[inline]
    pub(super) fn allocate(&self, count: usize) -> Result<Permits, Abort> {
        self.pool.acquire(count).ok_or_else(|| {
            trace_log!(count, in_use = self.pool.in_use(), "rotation is short of nodes");
            Abort::Exhausted
        })
    }

    /// Fixes the violation at `uxxx`, the last node of the window `u`, `ux`, `uxx`, `uxxx`.
    ///
    /// `uxxx` is either overweight, or of weight `0` under `uxx` of weight `0`.
    pub(super) fn rebalance(
        mut self,
        u: &'g Node<K, V>,
        ux: &'g Node<K, V>,
        uxx: &'g Node<K, V>,
        uxxx: &'g Node<K, V>,
    ) -> Result<(), Abort> {
        self.protect(u)?;
        if !u.has_child(ux, self.guard) {
            return Err(Abort::Busy);
        }
        self.protect(ux)?;
        let uxl = self.child(ux, Side::Left)?;
        let uxr = self.child(ux, Side::Right)?;
        let Some(uxx_side) = ux.side_of(uxx, self.guard) else {
            return Err(Abort::Busy);
        };
        self.protect(uxx)?;
        let Some(uxxx_side) = uxx.side_of(uxxx, self.guard) else {
            return Err(Abort::Busy);
        };

        if uxxx.weight() > 1 {
            self.protect(uxxx)?;
            let far = self.child(uxx, uxxx_side.opposite())?;
            return self.overweight(uxxx_side, u, ux, (uxl, uxr), uxx, uxx_side, uxxx, far);
        }

        // Two consecutive nodes of weight `0`.
        let side = uxx_side;
        let sibling = if side == Side::Left { uxr } else { uxl };
        if sibling.weight() == 0 {
            self.protect(sibling)?;
            self.blk(u, ux, uxl, uxr)
        } else if uxxx_side == side {
            self.rb1(side, u, ux, uxx)
        } else {
            let inner = self.child(uxx, side.opposite())?;
            self.protect(inner)?;
            self.rb2(side, u, ux, uxx, inner)
        }
    }

    /// Fixes the overweight node `heavy` linked on `side` of `uxx`; `far` is its sibling.
    #[allow(clippy::too_many_arguments)]
    fn overweight(
        mut self,
        side: Side,
        u: &'g Node<K, V>,
        ux: &'g Node<K, V>,
        (uxl, uxr): (&'g Node<K, V>, &'g Node<K, V>),
        uxx: &'g Node<K, V>,
        uxx_side: Side,
        heavy: &'g Node<K, V>,
        far: &'g Node<K, V>,
    ) -> Result<(), Abort> {
        let opposite = side.opposite();
        let child_of_ux = |s: Side| if s == Side::Left { uxl } else { uxr };

        if far.weight() == 0 {
            if uxx.weight() == 0 {
                // `uxx` and `far` form a pair of weight `0` that has to go first.
                if uxx_side == side {
                    let sibling = child_of_ux(opposite);
                    if sibling.weight() == 0 {
                        self.protect(sibling)?;
                        return self.blk(u, ux, uxl, uxr);
                    }
                    self.protect(far)?;
                    return self.rb2(side, u, ux, uxx, far);
                }
                let sibling = child_of_ux(side);
                if sibling.weight() == 0 {
                    self.protect(sibling)?;
                    return self.blk(u, ux, uxl, uxr);
                }
                return self.rb1(opposite, u, ux, uxx);
            }

            self.protect(far)?;
            let far_near = self.child(far, side)?;
            self.protect(far_near)?;
            return match far_near.weight() {
                0 => self.rb2(opposite, ux, uxx, far, far_near),
                1 => {
                    let far_near_far = self.child(far_near, opposite)?;
                    if far_near_far.weight() == 0 {
                        self.protect(far_near_far)?;
                        return self.w4(side, ux, uxx, heavy, far, far_near, far_near_far);
                    }
                    let far_near_near = self.child(far_near, side)?;
                    if far_near_near.weight() == 0 {
                        self.protect(far_near_near)?;
                        self.w3(side, ux, uxx, heavy, far, far_near, far_near_near)
                    } else {
                        self.w2(side, ux, uxx, heavy, far, far_near)
                    }
                }
                _ => self.w1(side, ux, uxx, heavy, far, far_near),
            };
        }

        self.protect(far)?;
        if far.weight() == 1 {
            let far_near = self.child(far, side)?;
            let far_far = self.child(far, opposite)?;
            if far_far.weight() == 0 {
                self.protect(far_far)?;
                self.w5(side, ux, uxx, heavy, far, far_far)
            } else if far_near.weight() == 0 {
                self.protect(far_near)?;
                self.w6(side, ux, uxx, heavy, far, far_near)
            } else {
                self.push(side, ux, uxx, heavy, far)
            }
        } else {
            let (left, right) = side.arrange(heavy, far);
            self.w7(ux, uxx, left, right)
        }
    }
}
