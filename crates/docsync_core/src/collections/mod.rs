//! Persistent collections.
//!
//! Every cached collection in the local store is held in one of these
//! structures so a transaction can take an O(1) snapshot of the state before
//! it starts and discard its working copy on abort.

mod sorted_map;
mod sorted_set;

pub use sorted_map::{Comparator, Iter, Natural, SortedMap};
pub use sorted_set::{SetIter, SortedSet};
