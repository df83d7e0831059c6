#![allow(clippy::module_name_repetitions)]

use std::error::Error;
use std::fmt;

/// [`Exhausted`]: the node pool could not supply the nodes an operation needed.
///
/// The tree is left unchanged when an operation fails with [`Exhausted`].
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Exhausted;

impl fmt::Display for Exhausted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("node pool exhausted")
    }
}

impl Error for Exhausted {}

/// [`Abort`]: why an update attempt or a rebalancing step gave up without changing the tree.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(super) enum Abort {
    /// Busy: a node in the window is locked, retired, or no longer linked as observed.
    Busy,
    /// Exhausted: every node slot is taken, possibly by retired nodes awaiting reclamation.
    Exhausted,
    /// Full: the tree already holds as many entries as its capacity.
    Full,
}
