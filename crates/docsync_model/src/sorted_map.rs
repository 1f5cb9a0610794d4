//! Persistent sorted map backed by a left-leaning red-black tree.
//!
//! Every update returns a new map that shares all untouched subtrees with
//! the map it was derived from. Nodes are reference counted, so cloning a
//! map is O(1) and old versions stay valid for as long as anyone holds them.

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

/// Comparator used to order keys.
pub type Comparator<K> = Arc<dyn Fn(&K, &K) -> Ordering + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Color {
    Red,
    Black,
}

impl Color {
    fn flip(self) -> Self {
        match self {
            Color::Red => Color::Black,
            Color::Black => Color::Red,
        }
    }
}

type Link<K, V> = Option<Arc<Node<K, V>>>;

#[derive(Clone)]
struct Node<K, V> {
    key: K,
    value: V,
    color: Color,
    size: usize,
    left: Link<K, V>,
    right: Link<K, V>,
}

fn is_red<K, V>(link: &Link<K, V>) -> bool {
    matches!(link, Some(node) if node.color == Color::Red)
}

fn left_is_red<K, V>(link: &Link<K, V>) -> bool {
    matches!(link, Some(node) if is_red(&node.left))
}

fn size<K, V>(link: &Link<K, V>) -> usize {
    link.as_ref().map_or(0, |node| node.size)
}

fn detach<K: Clone, V: Clone>(link: Link<K, V>) -> Node<K, V> {
    match link {
        Some(node) => Arc::unwrap_or_clone(node),
        None => unreachable!("red-black rotation requires a child node"),
    }
}

impl<K: Clone, V: Clone> Node<K, V> {
    fn leaf(key: K, value: V) -> Self {
        Self {
            key,
            value,
            color: Color::Red,
            size: 1,
            left: None,
            right: None,
        }
    }

    fn resize(&mut self) {
        self.size = size(&self.left) + size(&self.right) + 1;
    }

    fn rotate_left(mut self) -> Self {
        let mut right = detach(self.right.take());
        let color = self.color;
        self.right = right.left.take();
        self.color = Color::Red;
        self.resize();
        right.left = Some(Arc::new(self));
        right.color = color;
        right.resize();
        right
    }

    fn rotate_right(mut self) -> Self {
        let mut left = detach(self.left.take());
        let color = self.color;
        self.left = left.right.take();
        self.color = Color::Red;
        self.resize();
        left.right = Some(Arc::new(self));
        left.color = color;
        left.resize();
        left
    }

    fn color_flip(mut self) -> Self {
        self.left = self.left.map(|child| {
            let mut child = Arc::unwrap_or_clone(child);
            child.color = child.color.flip();
            Arc::new(child)
        });
        self.right = self.right.map(|child| {
            let mut child = Arc::unwrap_or_clone(child);
            child.color = child.color.flip();
            Arc::new(child)
        });
        self.color = self.color.flip();
        self
    }

    fn fix_up(mut self) -> Self {
        self.resize();
        let mut node = self;
        if is_red(&node.right) && !is_red(&node.left) {
            node = node.rotate_left();
        }
        if is_red(&node.left) && left_is_red(&node.left) {
            node = node.rotate_right();
        }
        if is_red(&node.left) && is_red(&node.right) {
            node = node.color_flip();
        }
        node
    }

    fn move_red_left(self) -> Self {
        let mut node = self.color_flip();
        if left_is_red(&node.right) {
            let right = detach(node.right.take()).rotate_right();
            node.right = Some(Arc::new(right));
            node.resize();
            node = node.rotate_left().color_flip();
        }
        node
    }

    fn move_red_right(self) -> Self {
        let mut node = self.color_flip();
        if left_is_red(&node.left) {
            node = node.rotate_right().color_flip();
        }
        node
    }

    fn min_node(&self) -> &Self {
        let mut node = self;
        while let Some(left) = &node.left {
            node = &**left;
        }
        node
    }

    fn remove_min(self) -> Option<Self> {
        if self.left.is_none() {
            return None;
        }
        let mut node = self;
        if !is_red(&node.left) && !left_is_red(&node.left) {
            node = node.move_red_left();
        }
        let left = detach(node.left.take()).remove_min();
        node.left = left.map(Arc::new);
        Some(node.fix_up())
    }

    fn remove(self, key: &K, cmp: &Comparator<K>) -> Option<Self> {
        let mut node = self;
        if cmp(key, &node.key) == Ordering::Less {
            if node.left.is_some() && !is_red(&node.left) && !left_is_red(&node.left) {
                node = node.move_red_left();
            }
            let left = node.left.take().and_then(|l| Arc::unwrap_or_clone(l).remove(key, cmp));
            node.left = left.map(Arc::new);
        } else {
            if is_red(&node.left) {
                node = node.rotate_right();
            }
            if node.right.is_some() && !is_red(&node.right) && !left_is_red(&node.right) {
                node = node.move_red_right();
            }
            if cmp(key, &node.key) == Ordering::Equal {
                let Some(right) = node.right.take() else {
                    return None;
                };
                let right = Arc::unwrap_or_clone(right);
                let smallest = right.min_node();
                node.key = smallest.key.clone();
                node.value = smallest.value.clone();
                node.right = right.remove_min().map(Arc::new);
            } else {
                let right = node.right.take().and_then(|r| Arc::unwrap_or_clone(r).remove(key, cmp));
                node.right = right.map(Arc::new);
            }
        }
        Some(node.fix_up())
    }
}

fn insert_into<K: Clone, V: Clone>(link: &Link<K, V>, key: K, value: V, cmp: &Comparator<K>) -> Node<K, V> {
    let Some(existing) = link else {
        return Node::leaf(key, value);
    };
    let mut node = (**existing).clone();
    match cmp(&key, &node.key) {
        Ordering::Less => node.left = Some(Arc::new(insert_into(&node.left, key, value, cmp))),
        Ordering::Equal => node.value = value,
        Ordering::Greater => node.right = Some(Arc::new(insert_into(&node.right, key, value, cmp))),
    }
    node.fix_up()
}

/// An immutable sorted map with structural sharing.
pub struct SortedMap<K, V> {
    root: Link<K, V>,
    cmp: Comparator<K>,
}

impl<K, V> Clone for SortedMap<K, V> {
    fn clone(&self) -> Self {
        Self {
            root: self.root.clone(),
            cmp: Arc::clone(&self.cmp),
        }
    }
}

impl<K: Ord + 'static, V> SortedMap<K, V> {
    /// Creates an empty map ordered by `K`'s natural order.
    #[must_use]
    pub fn new() -> Self {
        Self {
            root: None,
            cmp: Arc::new(|a: &K, b: &K| a.cmp(b)),
        }
    }
}

impl<K: Ord + 'static, V> Default for SortedMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> SortedMap<K, V> {
    /// Creates an empty map ordered by `cmp`.
    #[must_use]
    pub fn with_comparator(cmp: Comparator<K>) -> Self {
        Self { root: None, cmp }
    }

    /// Returns the comparator ordering this map.
    pub fn comparator(&self) -> &Comparator<K> {
        &self.cmp
    }

    /// Returns the number of entries.
    pub fn len(&self) -> usize {
        size(&self.root)
    }

    /// Returns true if the map has no entries.
    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    /// Looks up the value stored for `key`.
    pub fn get(&self, key: &K) -> Option<&V> {
        let mut link = &self.root;
        while let Some(node) = link {
            match (self.cmp)(key, &node.key) {
                Ordering::Less => link = &node.left,
                Ordering::Equal => return Some(&node.value),
                Ordering::Greater => link = &node.right,
            }
        }
        None
    }

    /// Returns true if `key` is present.
    pub fn contains_key(&self, key: &K) -> bool {
        self.get(key).is_some()
    }

    /// Returns the position of `key` in iteration order.
    pub fn index_of(&self, key: &K) -> Option<usize> {
        let mut pruned = 0;
        let mut link = &self.root;
        while let Some(node) = link {
            match (self.cmp)(key, &node.key) {
                Ordering::Less => link = &node.left,
                Ordering::Equal => return Some(pruned + size(&node.left)),
                Ordering::Greater => {
                    pruned += size(&node.left) + 1;
                    link = &node.right;
                }
            }
        }
        None
    }

    /// Returns the key immediately before `key`, if both exist.
    pub fn predecessor_key(&self, key: &K) -> Option<&K> {
        let mut link = &self.root;
        let mut right_parent: Option<&Node<K, V>> = None;
        while let Some(node) = link {
            match (self.cmp)(key, &node.key) {
                Ordering::Equal => {
                    return match &node.left {
                        Some(left) => {
                            let mut n: &Node<K, V> = left;
                            while let Some(r) = &n.right {
                                n = &**r;
                            }
                            Some(&n.key)
                        }
                        None => right_parent.map(|p| &p.key),
                    };
                }
                Ordering::Less => link = &node.left,
                Ordering::Greater => {
                    right_parent = Some(node);
                    link = &node.right;
                }
            }
        }
        None
    }

    /// Returns the smallest key.
    pub fn min_key(&self) -> Option<&K> {
        let mut node = self.root.as_deref()?;
        while let Some(left) = &node.left {
            node = &**left;
        }
        Some(&node.key)
    }

    /// Returns the largest key.
    pub fn max_key(&self) -> Option<&K> {
        let mut node = self.root.as_deref()?;
        while let Some(right) = &node.right {
            node = &**right;
        }
        Some(&node.key)
    }

    /// Iterates over entries in ascending order.
    pub fn iter(&self) -> Iter<'_, K, V> {
        let mut iter = Iter {
            stack: Vec::new(),
            ascending: true,
        };
        iter.push_spine(&self.root);
        iter
    }

    /// Iterates over entries in descending order.
    pub fn iter_rev(&self) -> Iter<'_, K, V> {
        let mut iter = Iter {
            stack: Vec::new(),
            ascending: false,
        };
        iter.push_spine(&self.root);
        iter
    }

    /// Iterates in ascending order starting at the first key `>= key`.
    pub fn iter_from(&self, key: &K) -> Iter<'_, K, V> {
        let mut stack = Vec::new();
        let mut link = &self.root;
        while let Some(node) = link {
            match (self.cmp)(key, &node.key) {
                Ordering::Equal => {
                    stack.push(&**node);
                    break;
                }
                Ordering::Less => {
                    stack.push(&**node);
                    link = &node.left;
                }
                Ordering::Greater => link = &node.right,
            }
        }
        Iter {
            stack,
            ascending: true,
        }
    }

    /// Returns the keys in ascending order.
    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.iter().map(|(k, _)| k)
    }

    /// Returns the values in key order.
    pub fn values(&self) -> impl Iterator<Item = &V> {
        self.iter().map(|(_, v)| v)
    }
}

impl<K: Clone, V: Clone> SortedMap<K, V> {
    /// Returns a copy of this map with `key` mapped to `value`.
    #[must_use]
    pub fn insert(&self, key: K, value: V) -> Self {
        let mut root = insert_into(&self.root, key, value, &self.cmp);
        root.color = Color::Black;
        Self {
            root: Some(Arc::new(root)),
            cmp: Arc::clone(&self.cmp),
        }
    }

    /// Returns a copy of this map without `key`.
    #[must_use]
    pub fn remove(&self, key: &K) -> Self {
        if !self.contains_key(key) {
            return self.clone();
        }
        let root = self
            .root
            .as_ref()
            .and_then(|root| (**root).clone().remove(key, &self.cmp))
            .map(|mut root| {
                root.color = Color::Black;
                Arc::new(root)
            });
        Self {
            root,
            cmp: Arc::clone(&self.cmp),
        }
    }
}

impl<K: fmt::Debug, V: fmt::Debug> fmt::Debug for SortedMap<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}

impl<K, V: PartialEq> PartialEq for SortedMap<K, V> {
    fn eq(&self, other: &Self) -> bool {
        self.len() == other.len()
            && self
                .iter()
                .zip(other.iter())
                .all(|((k1, v1), (k2, v2))| (self.cmp)(k1, k2) == Ordering::Equal && v1 == v2)
    }
}

impl<K: Ord + Clone + 'static, V: Clone> FromIterator<(K, V)> for SortedMap<K, V> {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        iter.into_iter()
            .fold(SortedMap::new(), |map, (k, v)| map.insert(k, v))
    }
}

/// In-order iterator over a [`SortedMap`].
pub struct Iter<'a, K, V> {
    stack: Vec<&'a Node<K, V>>,
    ascending: bool,
}

impl<'a, K, V> Iter<'a, K, V> {
    fn push_spine(&mut self, mut link: &'a Link<K, V>) {
        while let Some(node) = link {
            self.stack.push(node);
            link = if self.ascending { &node.left } else { &node.right };
        }
    }
}

impl<'a, K, V> Iterator for Iter<'a, K, V> {
    type Item = (&'a K, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.stack.pop()?;
        let next = if self.ascending { &node.right } else { &node.left };
        self.push_spine(next);
        Some((&node.key, &node.value))
    }
}

impl<'a, K, V> IntoIterator for &'a SortedMap<K, V> {
    type Item = (&'a K, &'a V);
    type IntoIter = Iter<'a, K, V>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::BTreeMap;

    fn check_invariants<K, V>(map: &SortedMap<K, V>) {
        fn black_height<K, V>(link: &Link<K, V>) -> usize {
            match link {
                None => 1,
                Some(node) => {
                    assert!(!(is_red(&node.right)), "right-leaning red link");
                    if node.color == Color::Red {
                        assert!(!is_red(&node.left), "two consecutive red links");
                    }
                    assert_eq!(node.size, size(&node.left) + size(&node.right) + 1);
                    let left = black_height(&node.left);
                    let right = black_height(&node.right);
                    assert_eq!(left, right, "unbalanced black height");
                    left + usize::from(node.color == Color::Black)
                }
            }
        }
        assert!(!is_red(&map.root));
        black_height(&map.root);
    }

    #[test]
    fn insert_and_get() {
        let map = SortedMap::new().insert(3, "c").insert(1, "a").insert(2, "b");
        assert_eq!(map.len(), 3);
        assert_eq!(map.get(&2), Some(&"b"));
        assert_eq!(map.get(&4), None);
        assert_eq!(map.keys().copied().collect::<Vec<_>>(), vec![1, 2, 3]);
        check_invariants(&map);
    }

    #[test]
    fn updates_do_not_affect_previous_versions() {
        let v1 = SortedMap::new().insert(1, 10).insert(2, 20);
        let v2 = v1.insert(3, 30).remove(&1);
        assert_eq!(v1.len(), 2);
        assert_eq!(v1.get(&1), Some(&10));
        assert_eq!(v2.len(), 2);
        assert_eq!(v2.get(&1), None);
        assert_eq!(v2.get(&3), Some(&30));
    }

    #[test]
    fn overwrite_keeps_size() {
        let map = SortedMap::new().insert("a", 1).insert("a", 2);
        assert_eq!(map.len(), 1);
        assert_eq!(map.get(&"a"), Some(&2));
    }

    #[test]
    fn remove_missing_key_is_noop() {
        let map = SortedMap::new().insert(1, ()).insert(2, ());
        assert_eq!(map.remove(&5).len(), 2);
        assert!(SortedMap::<i32, ()>::new().remove(&1).is_empty());
    }

    #[test]
    fn min_max_and_reverse() {
        let map: SortedMap<i32, ()> = (0..20).map(|i| (i * 3, ())).collect();
        assert_eq!(map.min_key(), Some(&0));
        assert_eq!(map.max_key(), Some(&57));
        let rev: Vec<_> = map.iter_rev().map(|(k, _)| *k).collect();
        assert_eq!(rev.first(), Some(&57));
        assert_eq!(rev.last(), Some(&0));
        assert!(SortedMap::<i32, ()>::new().min_key().is_none());
    }

    #[test]
    fn iter_from_starts_at_lower_bound() {
        let map: SortedMap<i32, ()> = [1, 3, 5, 7].into_iter().map(|k| (k, ())).collect();
        let from_four: Vec<_> = map.iter_from(&4).map(|(k, _)| *k).collect();
        assert_eq!(from_four, vec![5, 7]);
        let from_three: Vec<_> = map.iter_from(&3).map(|(k, _)| *k).collect();
        assert_eq!(from_three, vec![3, 5, 7]);
        assert_eq!(map.iter_from(&8).count(), 0);
    }

    #[test]
    fn index_and_predecessor() {
        let map: SortedMap<i32, ()> = [10, 20, 30, 40].into_iter().map(|k| (k, ())).collect();
        assert_eq!(map.index_of(&30), Some(2));
        assert_eq!(map.index_of(&35), None);
        assert_eq!(map.predecessor_key(&30), Some(&20));
        assert_eq!(map.predecessor_key(&10), None);
    }

    #[test]
    fn custom_comparator_orders_descending() {
        let map = SortedMap::with_comparator(Arc::new(|a: &i32, b: &i32| b.cmp(a)))
            .insert(1, ())
            .insert(3, ())
            .insert(2, ());
        assert_eq!(map.keys().copied().collect::<Vec<_>>(), vec![3, 2, 1]);
    }

    proptest! {
        #[test]
        fn agrees_with_btreemap(ops in prop::collection::vec((any::<bool>(), 0u8..64), 0..200)) {
            let mut model = BTreeMap::new();
            let mut map = SortedMap::new();
            for (insert, key) in ops {
                if insert {
                    model.insert(key, u32::from(key) * 2);
                    map = map.insert(key, u32::from(key) * 2);
                } else {
                    model.remove(&key);
                    map = map.remove(&key);
                }
                check_invariants(&map);
            }
            prop_assert_eq!(map.len(), model.len());
            let ours: Vec<_> = map.iter().map(|(k, v)| (*k, *v)).collect();
            let theirs: Vec<_> = model.into_iter().collect();
            prop_assert_eq!(ours, theirs);
        }
    }
}
