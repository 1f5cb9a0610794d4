//! Persistent sorted set built on [`SortedMap`].

use crate::sorted_map::{Comparator, SortedMap};
use std::cmp::Ordering;
use std::fmt;

/// An immutable sorted set with structural sharing.
pub struct SortedSet<T> {
    map: SortedMap<T, ()>,
}

impl<T> Clone for SortedSet<T> {
    fn clone(&self) -> Self {
        Self {
            map: self.map.clone(),
        }
    }
}

impl<T: Ord + 'static> SortedSet<T> {
    /// Creates an empty set ordered by `T`'s natural order.
    #[must_use]
    pub fn new() -> Self {
        Self {
            map: SortedMap::new(),
        }
    }
}

impl<T: Ord + 'static> Default for SortedSet<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> SortedSet<T> {
    /// Creates an empty set ordered by `cmp`.
    #[must_use]
    pub fn with_comparator(cmp: Comparator<T>) -> Self {
        Self {
            map: SortedMap::with_comparator(cmp),
        }
    }

    /// Returns the ordering used by this set.
    pub fn comparator(&self) -> &Comparator<T> {
        self.map.comparator()
    }

    /// Returns the number of elements.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Returns true if the set is empty.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
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

    /// Returns the position of `item` in iteration order.
    pub fn index_of(&self, item: &T) -> Option<usize> {
        self.map.index_of(item)
    }

    /// Iterates over the elements in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.map.keys()
    }

    /// Iterates over the elements in descending order.
    pub fn iter_rev(&self) -> impl Iterator<Item = &T> {
        self.map.iter_rev().map(|(k, _)| k)
    }

    /// Iterates in ascending order from the first element `>= item`.
    pub fn iter_from(&self, item: &T) -> impl Iterator<Item = &T> {
        self.map.iter_from(item).map(|(k, _)| k)
    }
}

impl<T: Clone> SortedSet<T> {
    /// Returns a copy of this set with `item` added.
    #[must_use]
    pub fn insert(&self, item: T) -> Self {
        Self {
            map: self.map.insert(item, ()),
        }
    }

    /// Returns a copy of this set without `item`.
    #[must_use]
    pub fn remove(&self, item: &T) -> Self {
        Self {
            map: self.map.remove(item),
        }
    }

    /// Returns the union of both sets, keeping this set's comparator.
    #[must_use]
    pub fn union(&self, other: &SortedSet<T>) -> Self {
        other
            .iter()
            .fold(self.clone(), |set, item| set.insert(item.clone()))
    }
}

impl<T: fmt::Debug> fmt::Debug for SortedSet<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

impl<T> PartialEq for SortedSet<T> {
    fn eq(&self, other: &Self) -> bool {
        let cmp = self.map.comparator();
        self.len() == other.len()
            && self
                .iter()
                .zip(other.iter())
                .all(|(a, b)| cmp(a, b) == Ordering::Equal)
    }
}

impl<T: Ord + Clone + 'static> FromIterator<T> for SortedSet<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        iter.into_iter().fold(SortedSet::new(), |set, item| set.insert(item))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_remove_contains() {
        let set = SortedSet::new().insert(2).insert(1).insert(2);
        assert_eq!(set.len(), 2);
        assert!(set.contains(&1));
        let set = set.remove(&1);
        assert!(!set.contains(&1));
        assert_eq!(set.first(), Some(&2));
    }

    #[test]
    fn union_keeps_all_elements() {
        let a: SortedSet<i32> = [1, 2, 3].into_iter().collect();
        let b: SortedSet<i32> = [3, 4].into_iter().collect();
        let both = a.union(&b);
        assert_eq!(both.iter().copied().collect::<Vec<_>>(), vec![1, 2, 3, 4]);
        assert_eq!(b.union(&a), both);
    }

    #[test]
    fn equality_ignores_insertion_order() {
        let a: SortedSet<&str> = ["x", "y"].into_iter().collect();
        let b: SortedSet<&str> = ["y", "x"].into_iter().collect();
        assert_eq!(a, b);
        assert_ne!(a, b.insert("z"));
    }
}
