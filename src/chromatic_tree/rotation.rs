//! Rebalancing rotations.
//!
//! Every rotation replaces the subtree rooted at `ux`, a child of `u`, with new nodes built from
//! copies of the replaced ones, then retires the replaced nodes. Each rotation comes in two
//! mirror images selected by a [`Side`]; `side` names the side the rotation's leading node is
//! on, and the new top node inherits the weight of `ux` unless noted otherwise. No rotation
//! changes the number of nodes or the weighted depth of any leaf.

use sdd::Shared;

use super::discipline::Discipline;
use super::error::Abort;
use super::node::{lighter, Node, Side, Weight};
use super::pool::Permits;
use super::rebalance::Rebalancer;
use crate::tracing_helpers::debug_log;

type Step = Result<(), Abort>;

impl<'g, K, V, D> Rebalancer<'g, K, V, D>
where
    K: 'static + Clone + Ord + Send + Sync,
    V: 'static + Clone + Send + Sync,
    D: Discipline,
{
    /// Recolors `ux` and both its children, moving one unit of weight down from `ux`.
    pub(super) fn blk(
        self,
        u: &'g Node<K, V>,
        ux: &'g Node<K, V>,
        uxl: &'g Node<K, V>,
        uxr: &'g Node<K, V>,
    ) -> Step {
        let mut permits = self.allocate(3)?;
        let nxl = permits.copy(uxl, Weight::Of(1), uxl.children(self.guard));
        let nxr = permits.copy(uxr, Weight::Of(1), uxr.children(self.guard));
        let nx = permits.copy(ux, top(u, lighter(ux.weight())), Some((nxl, nxr)));
        self.commit("BLK", u, ux, nx, &[ux, uxl, uxr])
    }

    /// Pushes one unit of weight from the overweight `heavy` and its sibling `far` up to `ux`.
    pub(super) fn push(
        self,
        side: Side,
        u: &'g Node<K, V>,
        ux: &'g Node<K, V>,
        heavy: &'g Node<K, V>,
        far: &'g Node<K, V>,
    ) -> Step {
        let mut permits = self.allocate(3)?;
        let nh = self.lighten(&mut permits, heavy);
        let nf = permits.copy(far, Weight::Of(0), far.children(self.guard));
        let nx = permits.copy(ux, top(u, ux.weight() + 1), Some(side.arrange(nh, nf)));
        self.commit("PUSH", u, ux, nx, &[ux, heavy, far])
    }

    /// Single rotation lifting `near`, the child of `ux` on `side`, whose child on `side` has
    /// weight `0` like `near` itself.
    pub(super) fn rb1(
        self,
        side: Side,
        u: &'g Node<K, V>,
        ux: &'g Node<K, V>,
        near: &'g Node<K, V>,
    ) -> Step {
        let opposite = side.opposite();
        let outer = self.adopt(near, side)?;
        let inner = self.adopt(near, opposite)?;
        let rest = self.adopt(ux, opposite)?;
        let mut permits = self.allocate(2)?;
        let no = permits.copy(ux, Weight::Of(0), Some(side.arrange(inner, rest)));
        let nx = permits.copy(near, Weight::Of(ux.weight()), Some(side.arrange(outer, no)));
        self.commit("RB1", u, ux, nx, &[ux, near])
    }

    /// Double rotation lifting `inner`, the child of `near` facing away from `side`.
    pub(super) fn rb2(
        self,
        side: Side,
        u: &'g Node<K, V>,
        ux: &'g Node<K, V>,
        near: &'g Node<K, V>,
        inner: &'g Node<K, V>,
    ) -> Step {
        let opposite = side.opposite();
        let outer = self.adopt(near, side)?;
        let inner_near = self.adopt(inner, side)?;
        let inner_far = self.adopt(inner, opposite)?;
        let rest = self.adopt(ux, opposite)?;
        let mut permits = self.allocate(3)?;
        let ns = permits.copy(near, Weight::Of(0), Some(side.arrange(outer, inner_near)));
        let no = permits.copy(ux, Weight::Of(0), Some(side.arrange(inner_far, rest)));
        let nx = permits.copy(inner, Weight::Of(ux.weight()), Some(side.arrange(ns, no)));
        self.commit("RB2", u, ux, nx, &[ux, near, inner])
    }

    /// `heavy` is on `side` of `ux`; `far` weighs `0` and its child `far_near` weighs more
    /// than `1`.
    #[allow(clippy::too_many_arguments)]
    pub(super) fn w1(
        self,
        side: Side,
        u: &'g Node<K, V>,
        ux: &'g Node<K, V>,
        heavy: &'g Node<K, V>,
        far: &'g Node<K, V>,
        far_near: &'g Node<K, V>,
    ) -> Step {
        let weight = lighter(far_near.weight());
        self.lift_far(side, u, ux, heavy, far, far_near, weight, "W1")
    }

    /// Like [`Self::w1`] with `far_near` weighing exactly `1` over two children heavier than `0`.
    #[allow(clippy::too_many_arguments)]
    pub(super) fn w2(
        self,
        side: Side,
        u: &'g Node<K, V>,
        ux: &'g Node<K, V>,
        heavy: &'g Node<K, V>,
        far: &'g Node<K, V>,
        far_near: &'g Node<K, V>,
    ) -> Step {
        self.lift_far(side, u, ux, heavy, far, far_near, 0, "W2")
    }

    /// `far` weighs `0`, `far_near` weighs `1` and its child `near_most` on `side` weighs `0`.
    #[allow(clippy::too_many_arguments)]
    pub(super) fn w3(
        self,
        side: Side,
        u: &'g Node<K, V>,
        ux: &'g Node<K, V>,
        heavy: &'g Node<K, V>,
        far: &'g Node<K, V>,
        far_near: &'g Node<K, V>,
        near_most: &'g Node<K, V>,
    ) -> Step {
        let opposite = side.opposite();
        let a = self.adopt(near_most, side)?;
        let b = self.adopt(near_most, opposite)?;
        let c = self.adopt(far_near, opposite)?;
        let d = self.adopt(far, opposite)?;
        let mut permits = self.allocate(5)?;
        let nh = self.lighten(&mut permits, heavy);
        let nxll = permits.copy(ux, Weight::Of(1), Some(side.arrange(nh, a)));
        let nxlr = permits.copy(far_near, Weight::Of(1), Some(side.arrange(b, c)));
        let nxl = permits.copy(near_most, Weight::Of(0), Some(side.arrange(nxll, nxlr)));
        let nx = permits.copy(far, Weight::Of(ux.weight()), Some(side.arrange(nxl, d)));
        self.commit("W3", u, ux, nx, &[ux, heavy, far, far_near, near_most])
    }

    /// `far` weighs `0`, `far_near` weighs `1` and its child `far_most` away from `side` weighs
    /// `0`.
    #[allow(clippy::too_many_arguments)]
    pub(super) fn w4(
        self,
        side: Side,
        u: &'g Node<K, V>,
        ux: &'g Node<K, V>,
        heavy: &'g Node<K, V>,
        far: &'g Node<K, V>,
        far_near: &'g Node<K, V>,
        far_most: &'g Node<K, V>,
    ) -> Step {
        let opposite = side.opposite();
        let a = self.adopt(far_near, side)?;
        let b = self.adopt(far, opposite)?;
        let mut permits = self.allocate(5)?;
        let nh = self.lighten(&mut permits, heavy);
        let nfm = permits.copy(far_most, Weight::Of(1), far_most.children(self.guard));
        let nxl = permits.copy(ux, Weight::Of(1), Some(side.arrange(nh, a)));
        let nxr = permits.copy(far, Weight::Of(0), Some(side.arrange(nfm, b)));
        let nx = permits.copy(far_near, Weight::Of(ux.weight()), Some(side.arrange(nxl, nxr)));
        self.commit("W4", u, ux, nx, &[ux, heavy, far, far_near, far_most])
    }

    /// `far` weighs `1` and its child `far_far` away from `side` weighs `0`.
    #[allow(clippy::too_many_arguments)]
    pub(super) fn w5(
        self,
        side: Side,
        u: &'g Node<K, V>,
        ux: &'g Node<K, V>,
        heavy: &'g Node<K, V>,
        far: &'g Node<K, V>,
        far_far: &'g Node<K, V>,
    ) -> Step {
        let a = self.adopt(far, side)?;
        let mut permits = self.allocate(4)?;
        let nh = self.lighten(&mut permits, heavy);
        let nxl = permits.copy(ux, Weight::Of(1), Some(side.arrange(nh, a)));
        let nxr = permits.copy(far_far, Weight::Of(1), far_far.children(self.guard));
        let nx = permits.copy(far, Weight::Of(ux.weight()), Some(side.arrange(nxl, nxr)));
        self.commit("W5", u, ux, nx, &[ux, heavy, far, far_far])
    }

    /// `far` weighs `1`, its child `far_near` on `side` weighs `0`, the other child does not.
    #[allow(clippy::too_many_arguments)]
    pub(super) fn w6(
        self,
        side: Side,
        u: &'g Node<K, V>,
        ux: &'g Node<K, V>,
        heavy: &'g Node<K, V>,
        far: &'g Node<K, V>,
        far_near: &'g Node<K, V>,
    ) -> Step {
        let opposite = side.opposite();
        let a = self.adopt(far_near, side)?;
        let b = self.adopt(far_near, opposite)?;
        let c = self.adopt(far, opposite)?;
        let mut permits = self.allocate(4)?;
        let nh = self.lighten(&mut permits, heavy);
        let nxl = permits.copy(ux, Weight::Of(1), Some(side.arrange(nh, a)));
        let nxr = permits.copy(far, Weight::Of(1), Some(side.arrange(b, c)));
        let nx = permits.copy(far_near, Weight::Of(ux.weight()), Some(side.arrange(nxl, nxr)));
        self.commit("W6", u, ux, nx, &[ux, heavy, far, far_near])
    }

    /// Both children of `ux` are heavier than `1`; one unit of weight moves up to `ux`.
    pub(super) fn w7(
        self,
        u: &'g Node<K, V>,
        ux: &'g Node<K, V>,
        uxl: &'g Node<K, V>,
        uxr: &'g Node<K, V>,
    ) -> Step {
        let mut permits = self.allocate(3)?;
        let nxl = self.lighten(&mut permits, uxl);
        let nxr = self.lighten(&mut permits, uxr);
        let nx = permits.copy(ux, top(u, ux.weight() + 1), Some((nxl, nxr)));
        self.commit("W7", u, ux, nx, &[ux, uxl, uxr])
    }

    /// Shared shape of [`Self::w1`] and [`Self::w2`]: `far` becomes the top node, and `ux` takes
    /// a lightened `heavy` together with `far_near` reweighted to `far_near_weight`.
    #[allow(clippy::too_many_arguments)]
    fn lift_far(
        self,
        side: Side,
        u: &'g Node<K, V>,
        ux: &'g Node<K, V>,
        heavy: &'g Node<K, V>,
        far: &'g Node<K, V>,
        far_near: &'g Node<K, V>,
        far_near_weight: u32,
        name: &'static str,
    ) -> Step {
        let rest = self.adopt(far, side.opposite())?;
        let mut permits = self.allocate(4)?;
        let nh = self.lighten(&mut permits, heavy);
        let nfn = permits.copy(far_near, Weight::Of(far_near_weight), far_near.children(self.guard));
        let nxl = permits.copy(ux, Weight::Of(1), Some(side.arrange(nh, nfn)));
        let nx = permits.copy(far, Weight::Of(ux.weight()), Some(side.arrange(nxl, rest)));
        self.commit(name, u, ux, nx, &[ux, heavy, far, far_near])
    }

    /// Builds a copy of `node` one unit lighter, keeping its children.
    #[inline]
    fn lighten(&self, permits: &mut Permits, node: &'g Node<K, V>) -> Shared<Node<K, V>> {
        permits.copy(node, Weight::Of(lighter(node.weight())), node.children(self.guard))
    }

    /// Returns a strong reference to a child that a new node is going to adopt.
    #[inline]
    fn adopt(
        &self,
        node: &'g Node<K, V>,
        side: Side,
    ) -> Result<Shared<Node<K, V>>, Abort> {
        node.child_shared(side, self.guard)
            .ok_or(Abort::Busy)
    }

    /// Retires the replaced nodes and links `nx` in place of `ux`.
    #[cfg_attr(not(feature = "tracing"), allow(unused_variables))]
    fn commit(
        self,
        name: &'static str,
        u: &'g Node<K, V>,
        ux: &'g Node<K, V>,
        nx: Shared<Node<K, V>>,
        replaced: &[&'g Node<K, V>],
    ) -> Step {
        let guard = self.guard;
        for node in replaced {
            node.retire();
        }
        let unlinked = u.replace_child(ux, nx, guard);
        debug_assert!(unlinked.is_some());
        drop(self);
        debug_log!(rotation = name, "rebalanced");
        // SAFETY: a coarse tree is exclusively locked during rebalancing, and a fine tree only
        // defers the release.
        unsafe { Node::reclaim::<D>(unlinked) };
        Ok(())
    }
}

/// Weight of a new top node; the child of a sentinel always weighs `1`.
#[inline]
fn top<K, V>(u: &Node<K, V>, weight: u32) -> Weight {
    if u.is_sentinel() {
        Weight::Of(1)
    } else {
        Weight::Of(weight)
    }
}
