//! # Balanced Ordered Index
//!
//! A height-balanced (AVL) binary search tree keyed by a `u64`, each node
//! carrying one opaque `u64` payload word. The allocator uses it twice: keyed
//! by run length (free runs) and keyed by start address (reserved/used runs).
//!
//! Nodes live in a [`NodeArena`] and link to their children by [`NodeRef`];
//! there are no parent links. Walking back up the tree goes through
//! [`AvlTree::get_parent`], which re-descends from the root.
//!
//! ## Invariants
//! - Keys are unique; inserting a present key is a no-op.
//! - `height` is the number of nodes on the longest path down to a leaf
//!   (a leaf has height 1, an empty subtree height 0).
//! - After every public operation the balance factor
//!   `height(left) - height(right)` of every node lies in `-1..=1`.

use crate::arena::{ArenaExhausted, NodeArena, NodeRef};
use core::cmp::Ordering;

/// Upper bound for the height of any tree addressable by a [`NodeRef`].
///
/// An AVL tree of height `h` holds at least `fib(h + 2) - 1` nodes, so even
/// `u32::MAX` nodes stay well below this.
const MAX_HEIGHT: usize = 64;

/// A tree node.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct AvlNode {
    pub key: u64,
    pub payload: u64,
    left: Option<NodeRef>,
    right: Option<NodeRef>,
    height: u64,
}

impl AvlNode {
    const fn leaf(key: u64, payload: u64) -> Self {
        Self {
            key,
            payload,
            left: None,
            right: None,
            height: 1,
        }
    }

    #[inline]
    #[must_use]
    pub const fn left(&self) -> Option<NodeRef> {
        self.left
    }

    #[inline]
    #[must_use]
    pub const fn right(&self) -> Option<NodeRef> {
        self.right
    }

    #[inline]
    #[must_use]
    pub const fn height(&self) -> u64 {
        self.height
    }
}

/// Root handle of a balanced ordered index.
///
/// The tree does not own an arena; every operation takes the arena its nodes
/// live in. Using a tree with a different arena than the one it was built in
/// is a logic error.
#[derive(Debug, Default)]
pub struct AvlTree {
    root: Option<NodeRef>,
    len: usize,
}

impl AvlTree {
    #[must_use]
    pub const fn new() -> Self {
        Self { root: None, len: 0 }
    }

    #[inline]
    #[must_use]
    pub const fn root(&self) -> Option<NodeRef> {
        self.root
    }

    #[inline]
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    /// Height of the whole tree (0 when empty).
    #[must_use]
    pub fn height(&self, arena: &NodeArena<AvlNode>) -> u64 {
        height(arena, self.root)
    }

    /// Inserts `key` with `payload`.
    ///
    /// Returns `Ok(false)` without touching the tree if `key` is already
    /// present; the existing payload is kept.
    ///
    /// # Errors
    /// [`ArenaExhausted`] if no node could be obtained. The tree is unchanged.
    pub fn insert(
        &mut self,
        arena: &mut NodeArena<AvlNode>,
        key: u64,
        payload: u64,
    ) -> Result<bool, ArenaExhausted> {
        let mut inserted = false;
        self.root = Some(insert_at(arena, self.root, key, payload, &mut inserted)?);
        if inserted {
            self.len += 1;
        }
        Ok(inserted)
    }

    /// Exact-match lookup.
    #[must_use]
    pub fn find(&self, arena: &NodeArena<AvlNode>, key: u64) -> Option<NodeRef> {
        let mut node = self.root;
        while let Some(n) = node {
            let current = &arena[n];
            node = match key.cmp(&current.key) {
                Ordering::Equal => return Some(n),
                Ordering::Less => current.left,
                Ordering::Greater => current.right,
            };
        }
        None
    }

    /// The node with the smallest key `>= key`.
    #[must_use]
    pub fn find_or_higher(&self, arena: &NodeArena<AvlNode>, key: u64) -> Option<NodeRef> {
        find_or_higher_at(arena, self.root, key)
    }

    /// The node with the largest key `<= key`.
    #[must_use]
    pub fn find_or_lower(&self, arena: &NodeArena<AvlNode>, key: u64) -> Option<NodeRef> {
        find_or_lower_at(arena, self.root, key)
    }

    /// Removes `key`, returning whether it was present.
    ///
    /// Handles to the node holding the in-order successor of a two-child node
    /// are invalidated: its key and payload move into the deleted node's slot.
    pub fn delete(&mut self, arena: &mut NodeArena<AvlNode>, key: u64) -> bool {
        let mut removed = false;
        self.root = delete_at(arena, self.root, key, &mut removed);
        if removed {
            self.len -= 1;
        }
        removed
    }

    /// The parent of the node holding `key`; `None` for the root or a missing key.
    #[must_use]
    pub fn get_parent(&self, arena: &NodeArena<AvlNode>, key: u64) -> Option<NodeRef> {
        let mut parent = None;
        let mut node = self.root;
        while let Some(n) = node {
            let current = &arena[n];
            match key.cmp(&current.key) {
                Ordering::Equal => return parent,
                Ordering::Less => node = current.left,
                Ordering::Greater => node = current.right,
            }
            parent = Some(n);
        }
        None
    }

    /// The node with the smallest key.
    #[must_use]
    pub fn first(&self, arena: &NodeArena<AvlNode>) -> Option<NodeRef> {
        self.root.map(|n| leftmost(arena, n))
    }

    /// The in-order successor of the node holding `key`.
    ///
    /// Returns `None` if `key` is absent or holds the largest key. Without a
    /// right subtree this walks back up via [`get_parent`](Self::get_parent)
    /// until it arrives from a left child.
    #[must_use]
    pub fn successor(&self, arena: &NodeArena<AvlNode>, key: u64) -> Option<NodeRef> {
        let node = self.find(arena, key)?;
        if let Some(right) = arena[node].right {
            return Some(leftmost(arena, right));
        }

        let mut child = node;
        loop {
            let parent = self.get_parent(arena, arena[child].key)?;
            if arena[parent].left == Some(child) {
                return Some(parent);
            }
            child = parent;
        }
    }

    /// The payload stored under `key`.
    #[must_use]
    pub fn payload(&self, arena: &NodeArena<AvlNode>, key: u64) -> Option<u64> {
        self.find(arena, key).map(|n| arena[n].payload)
    }

    /// Replaces the payload stored under `key`; returns whether `key` was present.
    pub fn set_payload(&self, arena: &mut NodeArena<AvlNode>, key: u64, payload: u64) -> bool {
        match self.find(arena, key) {
            Some(n) => {
                arena[n].payload = payload;
                true
            }
            None => false,
        }
    }

    /// Returns every node to the arena.
    pub fn clear(&mut self, arena: &mut NodeArena<AvlNode>) {
        if let Some(root) = self.root.take() {
            dispose(arena, root);
        }
        self.len = 0;
    }

    /// In-order `(key, payload)` iterator. Does not allocate.
    #[must_use]
    pub fn iter<'a>(&self, arena: &'a NodeArena<AvlNode>) -> Iter<'a> {
        let mut iter = Iter {
            arena,
            stack: [None; MAX_HEIGHT],
            depth: 0,
        };
        iter.push_left(self.root);
        iter
    }

    /// Checks ordering, stored heights and the balance bound of every node.
    #[must_use]
    pub fn is_balanced(&self, arena: &NodeArena<AvlNode>) -> bool {
        check(arena, self.root, None, None).is_some()
    }
}

/// In-order iterator over `(key, payload)` pairs of an [`AvlTree`].
pub struct Iter<'a> {
    arena: &'a NodeArena<AvlNode>,
    stack: [Option<NodeRef>; MAX_HEIGHT],
    depth: usize,
}

impl Iter<'_> {
    fn push_left(&mut self, mut node: Option<NodeRef>) {
        while let Some(n) = node {
            self.stack[self.depth] = Some(n);
            self.depth += 1;
            node = self.arena[n].left;
        }
    }
}

impl Iterator for Iter<'_> {
    type Item = (u64, u64);

    fn next(&mut self) -> Option<Self::Item> {
        if self.depth == 0 {
            return None;
        }
        self.depth -= 1;
        let node = self.stack[self.depth].take()?;
        let current = self.arena[node];
        self.push_left(current.right);
        Some((current.key, current.payload))
    }
}

#[inline]
fn height(arena: &NodeArena<AvlNode>, node: Option<NodeRef>) -> u64 {
    node.map_or(0, |n| arena[n].height)
}

fn update_height(arena: &mut NodeArena<AvlNode>, node: NodeRef) {
    let current = arena[node];
    arena[node].height = 1 + height(arena, current.left).max(height(arena, current.right));
}

fn balance_factor(arena: &NodeArena<AvlNode>, node: NodeRef) -> i64 {
    let current = &arena[node];
    height(arena, current.left).cast_signed() - height(arena, current.right).cast_signed()
}

fn leftmost(arena: &NodeArena<AvlNode>, mut node: NodeRef) -> NodeRef {
    while let Some(left) = arena[node].left {
        node = left;
    }
    node
}

/// Right rotation around `y`; returns the new subtree root.
///
/// ```text
///       y            x
///      / \          / \
///     x   C   =>   A   y
///    / \              / \
///   A   B            B   C
/// ```
fn rotate_right(arena: &mut NodeArena<AvlNode>, y: NodeRef) -> NodeRef {
    let Some(x) = arena[y].left else {
        return y;
    };
    arena[y].left = arena[x].right;
    arena[x].right = Some(y);
    update_height(arena, y);
    update_height(arena, x);
    x
}

/// Left rotation around `x`; returns the new subtree root.
///
/// ```text
///     x                y
///    / \              / \
///   A   y     =>     x   C
///      / \          / \
///     B   C        A   B
/// ```
fn rotate_left(arena: &mut NodeArena<AvlNode>, x: NodeRef) -> NodeRef {
    let Some(y) = arena[x].right else {
        return x;
    };
    arena[x].right = arena[y].left;
    arena[y].left = Some(x);
    update_height(arena, x);
    update_height(arena, y);
    y
}

fn insert_at(
    arena: &mut NodeArena<AvlNode>,
    node: Option<NodeRef>,
    key: u64,
    payload: u64,
    inserted: &mut bool,
) -> Result<NodeRef, ArenaExhausted> {
    let Some(n) = node else {
        let leaf = arena.allocate(AvlNode::leaf(key, payload))?;
        *inserted = true;
        return Ok(leaf);
    };

    let current = arena[n];
    match key.cmp(&current.key) {
        Ordering::Equal => return Ok(n),
        Ordering::Less => {
            let left = insert_at(arena, current.left, key, payload, inserted)?;
            arena[n].left = Some(left);
        }
        Ordering::Greater => {
            let right = insert_at(arena, current.right, key, payload, inserted)?;
            arena[n].right = Some(right);
        }
    }

    if !*inserted {
        return Ok(n);
    }

    update_height(arena, n);
    let balance = balance_factor(arena, n);

    // The inserted key tells which grandchild grew.
    if balance > 1 {
        if let Some(left) = arena[n].left {
            if key > arena[left].key {
                arena[n].left = Some(rotate_left(arena, left));
            }
            return Ok(rotate_right(arena, n));
        }
    }
    if balance < -1 {
        if let Some(right) = arena[n].right {
            if key < arena[right].key {
                arena[n].right = Some(rotate_right(arena, right));
            }
            return Ok(rotate_left(arena, n));
        }
    }
    Ok(n)
}

fn find_or_higher_at(
    arena: &NodeArena<AvlNode>,
    node: Option<NodeRef>,
    key: u64,
) -> Option<NodeRef> {
    let n = node?;
    let current = &arena[n];
    match current.key.cmp(&key) {
        Ordering::Equal => Some(n),
        Ordering::Greater => find_or_higher_at(arena, current.left, key).or(Some(n)),
        Ordering::Less => find_or_higher_at(arena, current.right, key),
    }
}

fn find_or_lower_at(
    arena: &NodeArena<AvlNode>,
    node: Option<NodeRef>,
    key: u64,
) -> Option<NodeRef> {
    let n = node?;
    let current = &arena[n];
    match current.key.cmp(&key) {
        Ordering::Equal => Some(n),
        Ordering::Less => find_or_lower_at(arena, current.right, key).or(Some(n)),
        Ordering::Greater => find_or_lower_at(arena, current.left, key),
    }
}

fn delete_at(
    arena: &mut NodeArena<AvlNode>,
    node: Option<NodeRef>,
    key: u64,
    removed: &mut bool,
) -> Option<NodeRef> {
    let n = node?;
    let current = arena[n];

    match key.cmp(&current.key) {
        Ordering::Less => arena[n].left = delete_at(arena, current.left, key, removed),
        Ordering::Greater => arena[n].right = delete_at(arena, current.right, key, removed),
        Ordering::Equal => {
            *removed = true;
            match (current.left, current.right) {
                (None, None) => {
                    arena.free(n);
                    return None;
                }
                (Some(child), None) | (None, Some(child)) => {
                    arena.free(n);
                    return Some(child);
                }
                (Some(_), Some(right)) => {
                    let successor = arena[leftmost(arena, right)];
                    arena[n].key = successor.key;
                    arena[n].payload = successor.payload;
                    let mut unused = false;
                    arena[n].right = delete_at(arena, Some(right), successor.key, &mut unused);
                }
            }
        }
    }

    Some(rebalance(arena, n))
}

/// Restores the balance bound at `node` after a deletion below it.
///
/// Unlike insertion there is no single key to follow, so the children's own
/// balance picks single vs. double rotation.
fn rebalance(arena: &mut NodeArena<AvlNode>, node: NodeRef) -> NodeRef {
    update_height(arena, node);
    let balance = balance_factor(arena, node);

    if balance > 1 {
        if let Some(left) = arena[node].left {
            if balance_factor(arena, left) < 0 {
                arena[node].left = Some(rotate_left(arena, left));
            }
            return rotate_right(arena, node);
        }
    }
    if balance < -1 {
        if let Some(right) = arena[node].right {
            if balance_factor(arena, right) > 0 {
                arena[node].right = Some(rotate_right(arena, right));
            }
            return rotate_left(arena, node);
        }
    }
    node
}

fn dispose(arena: &mut NodeArena<AvlNode>, node: NodeRef) {
    let current = arena[node];
    if let Some(left) = current.left {
        dispose(arena, left);
    }
    if let Some(right) = current.right {
        dispose(arena, right);
    }
    arena.free(node);
}

/// Returns the subtree height if the subtree is a valid AVL tree with keys in `(low, high)`.
fn check(
    arena: &NodeArena<AvlNode>,
    node: Option<NodeRef>,
    low: Option<u64>,
    high: Option<u64>,
) -> Option<u64> {
    let Some(n) = node else {
        return Some(0);
    };
    let current = arena.get(n)?;

    if low.is_some_and(|low| current.key <= low) || high.is_some_and(|high| current.key >= high) {
        return None;
    }

    let left = check(arena, current.left, low, Some(current.key))?;
    let right = check(arena, current.right, Some(current.key), high)?;
    let expected = 1 + left.max(right);

    (left.abs_diff(right) <= 1 && current.height == expected).then_some(expected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck::{Arbitrary, Gen};
    use std::collections::BTreeMap;

    fn dynamic_arena() -> NodeArena<AvlNode> {
        let mut arena = NodeArena::new();
        arena.promote();
        arena
    }

    fn keys(tree: &AvlTree, arena: &NodeArena<AvlNode>) -> Vec<u64> {
        tree.iter(arena).map(|(k, _)| k).collect()
    }

    #[test]
    fn insert_and_find() {
        let mut arena = NodeArena::new();
        let mut tree = AvlTree::new();
        for key in [50, 20, 70, 10, 30, 60, 80] {
            assert!(tree.insert(&mut arena, key, key * 100).unwrap());
        }

        assert_eq!(tree.len(), 7);
        assert_eq!(keys(&tree, &arena), vec![10, 20, 30, 50, 60, 70, 80]);
        assert_eq!(tree.payload(&arena, 30), Some(3000));
        assert!(tree.find(&arena, 35).is_none());
        assert!(tree.is_balanced(&arena));
    }

    #[test]
    fn duplicate_insert_is_ignored() {
        let mut arena = NodeArena::new();
        let mut tree = AvlTree::new();
        assert!(tree.insert(&mut arena, 7, 1).unwrap());
        assert!(!tree.insert(&mut arena, 7, 2).unwrap());

        assert_eq!(tree.len(), 1);
        assert_eq!(arena.live(), 1);
        assert_eq!(tree.payload(&arena, 7), Some(1));
    }

    #[test]
    fn empty_tree_operations_are_no_ops() {
        let mut arena = NodeArena::new();
        let mut tree = AvlTree::new();
        assert!(tree.find(&arena, 1).is_none());
        assert!(tree.find_or_higher(&arena, 1).is_none());
        assert!(!tree.delete(&mut arena, 1));
        assert!(tree.get_parent(&arena, 1).is_none());
        assert_eq!(tree.height(&arena), 0);
    }

    #[test]
    fn find_or_higher_returns_smallest_key_not_below() {
        let mut arena = NodeArena::new();
        let mut tree = AvlTree::new();
        for key in [4, 8, 15, 16, 23, 42] {
            tree.insert(&mut arena, key, 0).unwrap();
        }

        let key_of = |n: Option<NodeRef>| n.map(|n| arena[n].key);
        assert_eq!(key_of(tree.find_or_higher(&arena, 1)), Some(4));
        assert_eq!(key_of(tree.find_or_higher(&arena, 15)), Some(15));
        assert_eq!(key_of(tree.find_or_higher(&arena, 17)), Some(23));
        assert_eq!(key_of(tree.find_or_higher(&arena, 43)), None);

        assert_eq!(key_of(tree.find_or_lower(&arena, 3)), None);
        assert_eq!(key_of(tree.find_or_lower(&arena, 17)), Some(16));
        assert_eq!(key_of(tree.find_or_lower(&arena, 100)), Some(42));
    }

    #[test]
    fn delete_leaf_single_child_and_two_children() {
        let mut arena = NodeArena::new();
        let mut tree = AvlTree::new();
        for key in 1..=15 {
            tree.insert(&mut arena, key, key).unwrap();
        }

        assert!(tree.delete(&mut arena, 1)); // leaf
        assert!(tree.delete(&mut arena, 2)); // now a single-child node
        assert!(tree.delete(&mut arena, 8)); // root with two children
        assert!(!tree.delete(&mut arena, 8));

        assert_eq!(keys(&tree, &arena), vec![3, 4, 5, 6, 7, 9, 10, 11, 12, 13, 14, 15]);
        assert_eq!(arena.live(), 12);
        assert!(tree.is_balanced(&arena));

        // Payloads travel with their keys across successor replacement.
        assert_eq!(tree.payload(&arena, 9), Some(9));
    }

    #[test]
    fn sequential_inserts_stay_logarithmic() {
        let mut arena = dynamic_arena();
        let mut tree = AvlTree::new();
        for key in 0..1024 {
            tree.insert(&mut arena, key, 0).unwrap();
            assert!(tree.is_balanced(&arena), "unbalanced after inserting {key}");
        }
        // A perfectly balanced tree of 1024 nodes has height 11.
        assert!(tree.height(&arena) <= 11);
    }

    #[test]
    fn parent_and_successor() {
        let mut arena = NodeArena::new();
        let mut tree = AvlTree::new();
        for key in [20, 10, 30, 5, 15, 25, 35] {
            tree.insert(&mut arena, key, 0).unwrap();
        }

        let key_of = |n: Option<NodeRef>| n.map(|n| arena[n].key);
        assert_eq!(key_of(tree.get_parent(&arena, 20)), None);
        assert_eq!(key_of(tree.get_parent(&arena, 15)), Some(10));
        assert_eq!(key_of(tree.get_parent(&arena, 30)), Some(20));
        assert_eq!(key_of(tree.get_parent(&arena, 99)), None);

        assert_eq!(key_of(tree.successor(&arena, 5)), Some(10));
        assert_eq!(key_of(tree.successor(&arena, 15)), Some(20));
        assert_eq!(key_of(tree.successor(&arena, 20)), Some(25));
        assert_eq!(key_of(tree.successor(&arena, 35)), None);
        assert_eq!(key_of(tree.first(&arena)), Some(5));
    }

    #[test]
    fn pool_exhaustion_leaves_tree_intact() {
        let mut arena = NodeArena::new();
        let mut tree = AvlTree::new();
        for key in 0..crate::arena::POOL_CAPACITY as u64 {
            tree.insert(&mut arena, key, key).unwrap();
        }

        assert_eq!(tree.insert(&mut arena, 1000, 0), Err(ArenaExhausted));
        assert_eq!(tree.len(), crate::arena::POOL_CAPACITY);
        assert!(tree.find(&arena, 1000).is_none());
        assert!(tree.is_balanced(&arena));

        // Duplicates do not need a node.
        assert_eq!(tree.insert(&mut arena, 5, 0), Ok(false));
    }

    #[test]
    fn clear_returns_all_nodes() {
        let mut arena = NodeArena::new();
        let mut tree = AvlTree::new();
        for key in 0..100 {
            tree.insert(&mut arena, key * 3, 0).unwrap();
        }
        tree.clear(&mut arena);
        assert!(tree.is_empty());
        assert_eq!(tree.len(), 0);
        assert_eq!(arena.live(), 0);
    }

    #[test]
    fn randomized_operations_keep_balance() {
        const OPERATIONS: usize = 10_000;
        const KEY_SPACE: u64 = 512;

        let mut g = Gen::new(100);
        let mut arena = dynamic_arena();
        let mut tree = AvlTree::new();
        let mut model = BTreeMap::new();

        for step in 0..OPERATIONS {
            let key = u64::arbitrary(&mut g) % KEY_SPACE;
            if bool::arbitrary(&mut g) {
                let payload = u64::arbitrary(&mut g);
                let inserted = tree.insert(&mut arena, key, payload).unwrap();
                assert_eq!(inserted, !model.contains_key(&key));
                model.entry(key).or_insert(payload);
            } else {
                assert_eq!(tree.delete(&mut arena, key), model.remove(&key).is_some());
            }

            assert!(tree.is_balanced(&arena), "balance violated at step {step}");
            assert_eq!(tree.len(), model.len());
        }

        let expected: Vec<_> = model.into_iter().collect();
        let actual: Vec<_> = tree.iter(&arena).collect();
        assert_eq!(actual, expected);
        assert_eq!(arena.live(), tree.len());
    }
}
