//! Persistent sorted map backed by a left-leaning red-black tree.
//!
//! Every update returns a new map. Unchanged subtrees are shared between the
//! old and the new version through `Arc`, so an insert or remove copies only
//! the O(log n) nodes on the path to the affected key. A map handed out
//! earlier never observes later updates.

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

/// A total order over keys.
pub trait Comparator<K: ?Sized>: Clone {
    /// Compares two keys.
    fn compare(&self, a: &K, b: &K) -> Ordering;
}

/// The natural `Ord` ordering.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Natural;

impl<K: Ord + ?Sized> Comparator<K> for Natural {
    fn compare(&self, a: &K, b: &K) -> Ordering {
        a.cmp(b)
    }
}

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

struct Node<K, V> {
    entry: Arc<(K, V)>,
    color: Color,
    left: Link<K, V>,
    right: Link<K, V>,
    size: usize,
}

impl<K, V> Node<K, V> {
    fn key(&self) -> &K {
        &self.entry.0
    }
}

fn size<K, V>(link: &Link<K, V>) -> usize {
    link.as_ref().map_or(0, |n| n.size)
}

fn is_red<K, V>(link: &Link<K, V>) -> bool {
    link.as_ref().is_some_and(|n| n.color == Color::Red)
}

fn left_is_red<K, V>(link: &Link<K, V>) -> bool {
    link.as_ref().is_some_and(|n| is_red(&n.left))
}

fn node<K, V>(
    entry: Arc<(K, V)>,
    color: Color,
    left: Link<K, V>,
    right: Link<K, V>,
) -> Arc<Node<K, V>> {
    let size = 1 + size(&left) + size(&right);
    Arc::new(Node {
        entry,
        color,
        left,
        right,
        size,
    })
}

fn with_color<K, V>(n: &Arc<Node<K, V>>, color: Color) -> Arc<Node<K, V>> {
    node(n.entry.clone(), color, n.left.clone(), n.right.clone())
}

fn with_left<K, V>(n: &Arc<Node<K, V>>, left: Link<K, V>) -> Arc<Node<K, V>> {
    node(n.entry.clone(), n.color, left, n.right.clone())
}

fn with_right<K, V>(n: &Arc<Node<K, V>>, right: Link<K, V>) -> Arc<Node<K, V>> {
    node(n.entry.clone(), n.color, n.left.clone(), right)
}

fn rotate_left<K, V>(n: &Arc<Node<K, V>>) -> Arc<Node<K, V>> {
    let Some(r) = &n.right else {
        return Arc::clone(n);
    };
    let lowered = node(n.entry.clone(), Color::Red, n.left.clone(), r.left.clone());
    node(r.entry.clone(), n.color, Some(lowered), r.right.clone())
}

fn rotate_right<K, V>(n: &Arc<Node<K, V>>) -> Arc<Node<K, V>> {
    let Some(l) = &n.left else {
        return Arc::clone(n);
    };
    let lowered = node(n.entry.clone(), Color::Red, l.right.clone(), n.right.clone());
    node(l.entry.clone(), n.color, l.left.clone(), Some(lowered))
}

fn flip_colors<K, V>(n: &Arc<Node<K, V>>) -> Arc<Node<K, V>> {
    let flip = |link: &Link<K, V>| link.as_ref().map(|c| with_color(c, c.color.flip()));
    node(
        n.entry.clone(),
        n.color.flip(),
        flip(&n.left),
        flip(&n.right),
    )
}

fn balance<K, V>(n: Arc<Node<K, V>>) -> Arc<Node<K, V>> {
    let mut n = n;
    if is_red(&n.right) && !is_red(&n.left) {
        n = rotate_left(&n);
    }
    if is_red(&n.left) && left_is_red(&n.left) {
        n = rotate_right(&n);
    }
    if is_red(&n.left) && is_red(&n.right) {
        n = flip_colors(&n);
    }
    n
}

fn move_red_left<K, V>(n: &Arc<Node<K, V>>) -> Arc<Node<K, V>> {
    let mut n = flip_colors(n);
    if left_is_red(&n.right) {
        let right = n.right.as_ref().map(rotate_right);
        n = with_right(&n, right);
        n = rotate_left(&n);
        n = flip_colors(&n);
    }
    n
}

fn move_red_right<K, V>(n: &Arc<Node<K, V>>) -> Arc<Node<K, V>> {
    let mut n = flip_colors(n);
    if left_is_red(&n.left) {
        n = rotate_right(&n);
        n = flip_colors(&n);
    }
    n
}

fn insert<K, V, C: Comparator<K>>(
    link: &Link<K, V>,
    entry: Arc<(K, V)>,
    cmp: &C,
) -> Arc<Node<K, V>> {
    let Some(n) = link else {
        return node(entry, Color::Red, None, None);
    };
    let n = match cmp.compare(&entry.0, n.key()) {
        Ordering::Less => with_left(n, Some(insert(&n.left, entry, cmp))),
        Ordering::Greater => with_right(n, Some(insert(&n.right, entry, cmp))),
        Ordering::Equal => node(entry, n.color, n.left.clone(), n.right.clone()),
    };
    balance(n)
}

fn min_node<K, V>(n: &Arc<Node<K, V>>) -> &Arc<Node<K, V>> {
    let mut current = n;
    while let Some(left) = &current.left {
        current = left;
    }
    current
}

fn max_node<K, V>(n: &Arc<Node<K, V>>) -> &Arc<Node<K, V>> {
    let mut current = n;
    while let Some(right) = &current.right {
        current = right;
    }
    current
}

fn remove_min<K, V>(n: &Arc<Node<K, V>>) -> Link<K, V> {
    if n.left.is_none() {
        return None;
    }
    let mut n = Arc::clone(n);
    if !is_red(&n.left) && !left_is_red(&n.left) {
        n = move_red_left(&n);
    }
    let left = n.left.as_ref().and_then(remove_min);
    Some(balance(with_left(&n, left)))
}

/// Removes `key`, which must be present in the subtree.
fn remove<K, V, C: Comparator<K>>(n: &Arc<Node<K, V>>, key: &K, cmp: &C) -> Link<K, V> {
    let mut n = Arc::clone(n);
    if cmp.compare(key, n.key()) == Ordering::Less {
        if !is_red(&n.left) && !left_is_red(&n.left) {
            n = move_red_left(&n);
        }
        let left = n.left.as_ref().and_then(|l| remove(l, key, cmp));
        n = with_left(&n, left);
    } else {
        if is_red(&n.left) {
            n = rotate_right(&n);
        }
        if cmp.compare(key, n.key()) == Ordering::Equal && n.right.is_none() {
            return None;
        }
        if !is_red(&n.right) && !left_is_red(&n.right) {
            n = move_red_right(&n);
        }
        if cmp.compare(key, n.key()) == Ordering::Equal {
            let Some(right) = &n.right else {
                return None;
            };
            let successor = min_node(right).entry.clone();
            n = node(successor, n.color, n.left.clone(), remove_min(right));
        } else {
            let right = n.right.as_ref().and_then(|r| remove(r, key, cmp));
            n = with_right(&n, right);
        }
    }
    Some(balance(n))
}

/// An immutable sorted map with structural sharing.
///
/// # Example
///
/// ```
/// use docsync_core::SortedMap;
///
/// let empty: SortedMap<i32, &str> = SortedMap::new();
/// let one = empty.insert(1, "one");
/// let two = one.insert(2, "two");
///
/// assert!(empty.is_empty());
/// assert_eq!(one.len(), 1);
/// assert_eq!(two.get(&2), Some(&"two"));
/// ```
pub struct SortedMap<K, V, C = Natural> {
    root: Link<K, V>,
    comparator: C,
}

impl<K, V, C: Clone> Clone for SortedMap<K, V, C> {
    fn clone(&self) -> Self {
        Self {
            root: self.root.clone(),
            comparator: self.comparator.clone(),
        }
    }
}

impl<K, V, C: Comparator<K> + Default> Default for SortedMap<K, V, C> {
    fn default() -> Self {
        Self::with_comparator(C::default())
    }
}

impl<K, V, C: Comparator<K> + Default> SortedMap<K, V, C> {
    /// Creates an empty map ordered by the default comparator.
    pub fn new() -> Self {
        Self::default()
    }
}

impl<K, V, C: Comparator<K>> SortedMap<K, V, C> {
    /// Creates an empty map ordered by `comparator`.
    pub fn with_comparator(comparator: C) -> Self {
        Self {
            root: None,
            comparator,
        }
    }

    /// Returns the comparator that orders this map.
    pub fn comparator(&self) -> &C {
        &self.comparator
    }

    /// Returns the number of entries.
    pub fn len(&self) -> usize {
        size(&self.root)
    }

    /// Returns true if the map has no entries.
    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    /// Returns a new map with `key` set to `value`.
    #[must_use]
    pub fn insert(&self, key: K, value: V) -> Self {
        let root = insert(&self.root, Arc::new((key, value)), &self.comparator);
        Self {
            root: Some(with_color(&root, Color::Black)),
            comparator: self.comparator.clone(),
        }
    }

    /// Returns a new map without `key`.
    #[must_use]
    pub fn remove(&self, key: &K) -> Self {
        let Some(root) = &self.root else {
            return self.clone();
        };
        if !self.contains_key(key) {
            return self.clone();
        }
        let root = if !is_red(&root.left) && !is_red(&root.right) {
            with_color(root, Color::Red)
        } else {
            Arc::clone(root)
        };
        let root = remove(&root, key, &self.comparator).map(|r| with_color(&r, Color::Black));
        Self {
            root,
            comparator: self.comparator.clone(),
        }
    }

    /// Returns the value stored under `key`.
    pub fn get(&self, key: &K) -> Option<&V> {
        let mut current = self.root.as_ref();
        while let Some(n) = current {
            match self.comparator.compare(key, n.key()) {
                Ordering::Less => current = n.left.as_ref(),
                Ordering::Greater => current = n.right.as_ref(),
                Ordering::Equal => return Some(&n.entry.1),
            }
        }
        None
    }

    /// Returns true if `key` is present.
    pub fn contains_key(&self, key: &K) -> bool {
        self.get(key).is_some()
    }

    /// Returns the smallest entry.
    pub fn min(&self) -> Option<(&K, &V)> {
        self.root.as_ref().map(|r| {
            let n = min_node(r);
            (&n.entry.0, &n.entry.1)
        })
    }

    /// Returns the largest entry.
    pub fn max(&self) -> Option<(&K, &V)> {
        self.root.as_ref().map(|r| {
            let n = max_node(r);
            (&n.entry.0, &n.entry.1)
        })
    }

    /// Returns the smallest key.
    pub fn min_key(&self) -> Option<&K> {
        self.min().map(|(k, _)| k)
    }

    /// Returns the largest key.
    pub fn max_key(&self) -> Option<&K> {
        self.max().map(|(k, _)| k)
    }

    /// Returns the largest key strictly smaller than `key`.
    pub fn predecessor_key(&self, key: &K) -> Option<&K> {
        let mut current = self.root.as_ref();
        let mut candidate = None;
        while let Some(n) = current {
            if self.comparator.compare(n.key(), key) == Ordering::Less {
                candidate = Some(n.key());
                current = n.right.as_ref();
            } else {
                current = n.left.as_ref();
            }
        }
        candidate
    }

    /// Returns the position of `key` in iteration order, if present.
    pub fn index_of(&self, key: &K) -> Option<usize> {
        let mut current = self.root.as_ref();
        let mut preceding = 0;
        while let Some(n) = current {
            match self.comparator.compare(key, n.key()) {
                Ordering::Less => current = n.left.as_ref(),
                Ordering::Greater => {
                    preceding += size(&n.left) + 1;
                    current = n.right.as_ref();
                }
                Ordering::Equal => return Some(preceding + size(&n.left)),
            }
        }
        None
    }

    /// Iterates entries in ascending key order.
    pub fn iter(&self) -> Iter<'_, K, V> {
        let mut iter = Iter {
            stack: Vec::new(),
            ascending: true,
        };
        let mut current = self.root.as_ref();
        while let Some(n) = current {
            iter.stack.push(n);
            current = n.left.as_ref();
        }
        iter
    }

    /// Iterates entries with keys greater than or equal to `key`, ascending.
    pub fn iter_from(&self, key: &K) -> Iter<'_, K, V> {
        let mut iter = Iter {
            stack: Vec::new(),
            ascending: true,
        };
        let mut current = self.root.as_ref();
        while let Some(n) = current {
            match self.comparator.compare(n.key(), key) {
                Ordering::Less => current = n.right.as_ref(),
                Ordering::Equal => {
                    iter.stack.push(n);
                    break;
                }
                Ordering::Greater => {
                    iter.stack.push(n);
                    current = n.left.as_ref();
                }
            }
        }
        iter
    }

    /// Iterates entries in descending key order.
    pub fn reverse_iter(&self) -> Iter<'_, K, V> {
        let mut iter = Iter {
            stack: Vec::new(),
            ascending: false,
        };
        let mut current = self.root.as_ref();
        while let Some(n) = current {
            iter.stack.push(n);
            current = n.right.as_ref();
        }
        iter
    }

    /// Iterates entries with keys less than or equal to `key`, descending.
    pub fn reverse_iter_from(&self, key: &K) -> Iter<'_, K, V> {
        let mut iter = Iter {
            stack: Vec::new(),
            ascending: false,
        };
        let mut current = self.root.as_ref();
        while let Some(n) = current {
            match self.comparator.compare(n.key(), key) {
                Ordering::Greater => current = n.left.as_ref(),
                Ordering::Equal => {
                    iter.stack.push(n);
                    break;
                }
                Ordering::Less => {
                    iter.stack.push(n);
                    current = n.right.as_ref();
                }
            }
        }
        iter
    }

    /// Iterates keys in ascending order.
    pub fn keys(&self) -> impl Iterator<Item = &K> + '_ {
        self.iter().map(|(k, _)| k)
    }

    /// Iterates values in ascending key order.
    pub fn values(&self) -> impl Iterator<Item = &V> + '_ {
        self.iter().map(|(_, v)| v)
    }

    /// Returns a new map with every entry of `entries` inserted.
    #[must_use]
    pub fn insert_all(&self, entries: impl IntoIterator<Item = (K, V)>) -> Self {
        entries
            .into_iter()
            .fold(self.clone(), |map, (k, v)| map.insert(k, v))
    }

    /// Verifies the red-black invariants and the search order.
    ///
    /// Returns the black height of the tree.
    ///
    /// # Errors
    ///
    /// Returns a description of the first violated invariant.
    pub fn check_invariants(&self) -> Result<usize, String> {
        if is_red(&self.root) {
            return Err("root is red".to_string());
        }
        check_node(&self.root, &self.comparator)
    }
}

fn check_node<K, V, C: Comparator<K>>(link: &Link<K, V>, cmp: &C) -> Result<usize, String> {
    let Some(n) = link else {
        return Ok(1);
    };
    if is_red(&n.right) {
        return Err("right-leaning red link".to_string());
    }
    if n.color == Color::Red && is_red(&n.left) {
        return Err("two consecutive red links".to_string());
    }
    if let Some(l) = &n.left {
        if cmp.compare(l.key(), n.key()) != Ordering::Less {
            return Err("left child not smaller than parent".to_string());
        }
        if cmp.compare(max_node(l).key(), n.key()) != Ordering::Less {
            return Err("left subtree out of order".to_string());
        }
    }
    if let Some(r) = &n.right {
        if cmp.compare(min_node(r).key(), n.key()) != Ordering::Greater {
            return Err("right subtree out of order".to_string());
        }
    }
    if n.size != 1 + size(&n.left) + size(&n.right) {
        return Err("cached subtree size is stale".to_string());
    }
    let left = check_node(&n.left, cmp)?;
    let right = check_node(&n.right, cmp)?;
    if left != right {
        return Err(format!("black height mismatch: {left} vs {right}"));
    }
    Ok(left + usize::from(n.color == Color::Black))
}

/// In-order iterator over a [`SortedMap`].
pub struct Iter<'a, K, V> {
    stack: Vec<&'a Arc<Node<K, V>>>,
    ascending: bool,
}

impl<'a, K, V> Iterator for Iter<'a, K, V> {
    type Item = (&'a K, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        let n = self.stack.pop()?;
        let mut current = if self.ascending {
            n.right.as_ref()
        } else {
            n.left.as_ref()
        };
        while let Some(c) = current {
            self.stack.push(c);
            current = if self.ascending {
                c.left.as_ref()
            } else {
                c.right.as_ref()
            };
        }
        Some((&n.entry.0, &n.entry.1))
    }
}

impl<'a, K, V, C: Comparator<K>> IntoIterator for &'a SortedMap<K, V, C> {
    type Item = (&'a K, &'a V);
    type IntoIter = Iter<'a, K, V>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl<K, V, C: Comparator<K> + Default> FromIterator<(K, V)> for SortedMap<K, V, C> {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self::new().insert_all(iter)
    }
}

impl<K: PartialEq, V: PartialEq, C: Comparator<K>> PartialEq for SortedMap<K, V, C> {
    fn eq(&self, other: &Self) -> bool {
        self.len() == other.len() && self.iter().eq(other.iter())
    }
}

impl<K: fmt::Debug, V: fmt::Debug, C: Comparator<K>> fmt::Debug for SortedMap<K, V, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}
