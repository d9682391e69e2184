//! Persistent sorted set.

use super::sorted_map::{Comparator, Iter, Natural, SortedMap};
use std::fmt;

/// An immutable sorted set with structural sharing.
///
/// Backed by a [`SortedMap`] with unit values.
pub struct SortedSet<T, C = Natural> {
    map: SortedMap<T, (), C>,
}

impl<T, C: Clone> Clone for SortedSet<T, C> {
    fn clone(&self) -> Self {
        Self {
            map: self.map.clone(),
        }
    }
}

impl<T, C: Comparator<T> + Default> Default for SortedSet<T, C> {
    fn default() -> Self {
        Self {
            map: SortedMap::default(),
        }
    }
}

impl<T, C: Comparator<T> + Default> SortedSet<T, C> {
    /// Creates an empty set ordered by the default comparator.
    pub fn new() -> Self {
        Self::default()
    }
}

impl<T, C: Comparator<T>> SortedSet<T, C> {
    /// Creates an empty set ordered by `comparator`.
    pub fn with_comparator(comparator: C) -> Self {
        Self {
            map: SortedMap::with_comparator(comparator),
        }
    }

    /// Returns the number of elements.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Returns true if the set is empty.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Returns a new set containing `item`.
    #[must_use]
    pub fn insert(&self, item: T) -> Self {
        Self {
            map: self.map.insert(item, ()),
        }
    }

    /// Returns a new set without `item`.
    #[must_use]
    pub fn remove(&self, item: &T) -> Self {
        Self {
            map: self.map.remove(item),
        }
    }

    /// Returns true if `item` is in the set.
    pub fn contains(&self, item: &T) -> bool {
        self.map.contains_key(item)
    }

    /// Returns the smallest element.
    pub fn first(&self) -> Option<&T> {
        self.map.min_key()
    }

    /// Returns the largest element.
    pub fn last(&self) -> Option<&T> {
        self.map.max_key()
    }

    /// Returns the position of `item`, if present.
    pub fn index_of(&self, item: &T) -> Option<usize> {
        self.map.index_of(item)
    }

    /// Iterates elements in ascending order.
    pub fn iter(&self) -> SetIter<'_, T> {
        SetIter {
            inner: self.map.iter(),
        }
    }

    /// Iterates elements greater than or equal to `item`.
    pub fn iter_from(&self, item: &T) -> SetIter<'_, T> {
        SetIter {
            inner: self.map.iter_from(item),
        }
    }

    /// Iterates elements in descending order.
    pub fn reverse_iter(&self) -> SetIter<'_, T> {
        SetIter {
            inner: self.map.reverse_iter(),
        }
    }

    /// Returns the comparator that orders this set.
    pub fn comparator(&self) -> &C {
        self.map.comparator()
    }

    /// Returns a new set with every element of `items` inserted.
    #[must_use]
    pub fn insert_all(&self, items: impl IntoIterator<Item = T>) -> Self {
        items.into_iter().fold(self.clone(), |set, item| set.insert(item))
    }
}

impl<T: Clone, C: Comparator<T>> SortedSet<T, C> {
    /// Returns the union of two sets.
    ///
    /// The larger set is kept and the smaller one is inserted into it.
    #[must_use]
    pub fn union(&self, other: &Self) -> Self {
        let (base, extra) = if self.len() >= other.len() {
            (self, other)
        } else {
            (other, self)
        };
        base.insert_all(extra.iter().cloned())
    }
}

/// Iterator over a [`SortedSet`].
pub struct SetIter<'a, T> {
    inner: Iter<'a, T, ()>,
}

impl<'a, T> Iterator for SetIter<'a, T> {
    type Item = &'a T;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next().map(|(k, _)| k)
    }
}

impl<'a, T, C: Comparator<T>> IntoIterator for &'a SortedSet<T, C> {
    type Item = &'a T;
    type IntoIter = SetIter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl<T, C: Comparator<T> + Default> FromIterator<T> for SortedSet<T, C> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        Self::new().insert_all(iter)
    }
}

impl<T: PartialEq, C: Comparator<T>> PartialEq for SortedSet<T, C> {
    fn eq(&self, other: &Self) -> bool {
        self.map == other.map
    }
}

impl<T: fmt::Debug, C: Comparator<T>> fmt::Debug for SortedSet<T, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_operations() {
        let set: SortedSet<&str> = ["b", "a", "c"].into_iter().collect();
        assert_eq!(set.len(), 3);
        assert!(set.contains(&"a"));
        assert_eq!(set.first(), Some(&"a"));
        assert_eq!(set.last(), Some(&"c"));

        let smaller = set.remove(&"b");
        assert!(set.contains(&"b"));
        assert!(!smaller.contains(&"b"));
        assert_eq!(smaller.iter().copied().collect::<Vec<_>>(), vec!["a", "c"]);
    }

    #[test]
    fn union_merges_both_sides() {
        let a: SortedSet<i32> = [1, 3, 5].into_iter().collect();
        let b: SortedSet<i32> = [2, 3, 4, 6].into_iter().collect();
        let both = a.union(&b);
        assert_eq!(both.iter().copied().collect::<Vec<_>>(), vec![1, 2, 3, 4, 5, 6]);
        assert_eq!(a.len(), 3);
    }

    #[test]
    fn tuple_elements_support_prefix_scans() {
        let set: SortedSet<(i32, &str)> =
            [(1, "x"), (2, "a"), (2, "b"), (3, "c")].into_iter().collect();
        let under_two: Vec<_> = set
            .iter_from(&(2, ""))
            .take_while(|(id, _)| *id == 2)
            .map(|(_, k)| *k)
            .collect();
        assert_eq!(under_two, vec!["a", "b"]);
    }
}
