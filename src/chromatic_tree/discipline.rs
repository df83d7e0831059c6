//! Synchronization disciplines of a [`ChromaticTree`](super::ChromaticTree).

use std::fmt;

use parking_lot::RwLock;

/// [`Discipline`] decides how a [`ChromaticTree`](super::ChromaticTree) synchronizes writers and
/// when unlinked nodes are reclaimed.
///
/// The trait is sealed; [`Coarse`] and [`Fine`] are the only implementations.
pub trait Discipline: 'static + Default + Send + Sync + private::Sealed {
    /// `true` if writers lock individual nodes and readers run without any lock.
    const FINE_GRAINED: bool;

    /// Returns the number of extra pool slots for nodes retired but not yet reclaimed.
    #[doc(hidden)]
    fn retired_margin() -> usize;

    /// Runs `f` while no writer is active, unless fine-grained.
    #[doc(hidden)]
    fn shared<R, F: FnOnce() -> R>(&self, f: F) -> R;

    /// Runs `f` exclusively of every other operation, unless fine-grained.
    #[doc(hidden)]
    fn exclusive<R, F: FnOnce() -> R>(&self, f: F) -> R;
}

/// [`Coarse`]: a single reader-writer lock guards the whole tree.
///
/// Readers run in parallel, writers one at a time, and unlinked nodes are freed immediately.
#[derive(Default)]
pub struct Coarse {
    lock: RwLock<()>,
}

/// [`Fine`]: writers lock only the nodes they restructure and readers never block.
///
/// Unlinked nodes are reclaimed once no thread can reach them any longer.
#[derive(Clone, Copy, Debug, Default)]
pub struct Fine;

impl Discipline for Coarse {
    const FINE_GRAINED: bool = false;

    #[inline]
    fn retired_margin() -> usize {
        0
    }

    #[inline]
    fn shared<R, F: FnOnce() -> R>(&self, f: F) -> R {
        let _guard = self.lock.read();
        f()
    }

    #[inline]
    fn exclusive<R, F: FnOnce() -> R>(&self, f: F) -> R {
        let _guard = self.lock.write();
        f()
    }
}

impl fmt::Debug for Coarse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Coarse")
            .field("locked", &self.lock.is_locked())
            .finish()
    }
}

impl Discipline for Fine {
    const FINE_GRAINED: bool = true;

    #[inline]
    fn retired_margin() -> usize {
        let threads = std::thread::available_parallelism().map_or(1, usize::from);
        threads.saturating_mul(super::pool::RETIRED_MARGIN)
    }

    #[inline]
    fn shared<R, F: FnOnce() -> R>(&self, f: F) -> R {
        f()
    }

    #[inline]
    fn exclusive<R, F: FnOnce() -> R>(&self, f: F) -> R {
        f()
    }
}

mod private {
    pub trait Sealed {}
    impl Sealed for super::Coarse {}
    impl Sealed for super::Fine {}
}
