//! Concurrent chromatic search trees.
//!
//! # chromatic::ChromaticTree
//! A capacity-bounded ordered map built on a chromatic tree: a leaf-oriented binary search tree
//! with relaxed red-black balance. Every update performs a constant amount of local work and
//! repairs the balance violations it introduced with small rotations along its own search path.
//!
//! Two synchronization disciplines are provided.
//!
//! * [`CglChromaticTree`]: a single reader-writer lock around the whole tree.
//! * [`FglChromaticTree`]: readers never lock, writers latch only the nodes they replace.
//!
//! Both hold at most `capacity` entries, with every node taken from a pool sized at creation;
//! an insertion into a full tree fails without modifying it.
//!
//! ```
//! use chromatic::FglChromaticTree;
//!
//! let tree: FglChromaticTree<u64, &str> = FglChromaticTree::new(64);
//!
//! assert_eq!(tree.insert(7, "seven"), Ok(None));
//! assert_eq!(tree.get(&7), Some("seven"));
//! assert_eq!(tree.remove(&7), Ok(Some("seven")));
//! assert!(tree.is_empty());
//! ```

mod chromatic_tree;
pub use chromatic_tree::{
    CglChromaticTree, ChromaticTree, Coarse, Discipline, Exhausted, FglChromaticTree, Fine,
};

pub use equivalent::{Comparable, Equivalent};

mod tracing_helpers;

#[cfg(test)]
mod tests;
