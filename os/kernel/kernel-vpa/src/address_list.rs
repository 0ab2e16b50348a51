//! # Address List
//!
//! A doubly linked list of `u64` values stored in a [`NodeArena`]. The free-run
//! index keeps one list per distinct run length, holding the start addresses
//! of all free runs of exactly that length.
//!
//! Entries keep insertion order; nothing relies on it.

use crate::arena::{ArenaExhausted, NodeArena, NodeRef};

/// A list node. Links are handles into the same arena.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct ListNode {
    pub data: u64,
    prev: Option<NodeRef>,
    next: Option<NodeRef>,
}

impl ListNode {
    #[inline]
    #[must_use]
    pub const fn prev(&self) -> Option<NodeRef> {
        self.prev
    }

    #[inline]
    #[must_use]
    pub const fn next(&self) -> Option<NodeRef> {
        self.next
    }
}

/// Head handle of an address list.
#[derive(Debug, Default)]
pub struct AddressList {
    head: Option<NodeRef>,
}

impl AddressList {
    #[must_use]
    pub const fn new() -> Self {
        Self { head: None }
    }

    /// Reattaches to a non-empty list whose head was stored as a payload word.
    #[inline]
    #[must_use]
    pub const fn from_bits(head: u64) -> Self {
        Self {
            head: Some(NodeRef::from_bits(head)),
        }
    }

    /// The head as a payload word; `None` for an empty list.
    #[inline]
    #[must_use]
    pub fn to_bits(&self) -> Option<u64> {
        self.head.map(NodeRef::to_bits)
    }

    #[inline]
    #[must_use]
    pub const fn head(&self) -> Option<NodeRef> {
        self.head
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// Appends `value` at the tail. The head only changes for an empty list.
    ///
    /// # Errors
    /// [`ArenaExhausted`] if no node could be obtained. The list is unchanged.
    pub fn insert(
        &mut self,
        arena: &mut NodeArena<ListNode>,
        value: u64,
    ) -> Result<NodeRef, ArenaExhausted> {
        let tail = self.tail(arena);
        self.append(arena, tail, value)
    }

    /// Appends `value` unless the list already holds it; `None` for a duplicate.
    ///
    /// Finds the tail and checks for the duplicate in the same walk.
    ///
    /// # Errors
    /// [`ArenaExhausted`] if no node could be obtained. The list is unchanged.
    pub fn insert_unique(
        &mut self,
        arena: &mut NodeArena<ListNode>,
        value: u64,
    ) -> Result<Option<NodeRef>, ArenaExhausted> {
        let mut tail = None;
        let mut node = self.head;
        while let Some(n) = node {
            if arena[n].data == value {
                return Ok(None);
            }
            tail = Some(n);
            node = arena[n].next;
        }
        self.append(arena, tail, value).map(Some)
    }

    fn append(
        &mut self,
        arena: &mut NodeArena<ListNode>,
        tail: Option<NodeRef>,
        value: u64,
    ) -> Result<NodeRef, ArenaExhausted> {
        let node = arena.allocate(ListNode {
            data: value,
            prev: tail,
            next: None,
        })?;

        match tail {
            Some(tail) => arena[tail].next = Some(node),
            None => self.head = Some(node),
        }
        Ok(node)
    }

    /// The first node holding `value`.
    #[must_use]
    pub fn find(&self, arena: &NodeArena<ListNode>, value: u64) -> Option<NodeRef> {
        let mut node = self.head;
        while let Some(n) = node {
            if arena[n].data == value {
                return Some(n);
            }
            node = arena[n].next;
        }
        None
    }

    /// Unlinks the first node holding `value` and returns it to the arena.
    pub fn delete(&mut self, arena: &mut NodeArena<ListNode>, value: u64) -> bool {
        let Some(node) = self.find(arena, value) else {
            return false;
        };

        let ListNode { prev, next, .. } = arena[node];
        match prev {
            Some(prev) => arena[prev].next = next,
            None => self.head = next,
        }
        if let Some(next) = next {
            arena[next].prev = prev;
        }

        arena.free(node);
        true
    }

    /// Number of entries.
    #[must_use]
    pub fn length(&self, arena: &NodeArena<ListNode>) -> u64 {
        self.iter(arena).map(|_| 1).sum()
    }

    /// The value at the head of the list.
    #[must_use]
    pub fn first(&self, arena: &NodeArena<ListNode>) -> Option<u64> {
        self.head.map(|n| arena[n].data)
    }

    #[must_use]
    pub fn iter<'a>(&self, arena: &'a NodeArena<ListNode>) -> Iter<'a> {
        Iter {
            arena,
            node: self.head,
        }
    }

    /// Returns every node to the arena.
    pub fn clear(&mut self, arena: &mut NodeArena<ListNode>) {
        let mut node = self.head.take();
        while let Some(n) = node {
            node = arena[n].next;
            arena.free(n);
        }
    }

    fn tail(&self, arena: &NodeArena<ListNode>) -> Option<NodeRef> {
        let mut node = self.head?;
        while let Some(next) = arena[node].next {
            node = next;
        }
        Some(node)
    }
}

/// Iterator over the values of an [`AddressList`], head to tail.
pub struct Iter<'a> {
    arena: &'a NodeArena<ListNode>,
    node: Option<NodeRef>,
}

impl Iterator for Iter<'_> {
    type Item = u64;

    fn next(&mut self) -> Option<u64> {
        let node = self.arena[self.node?];
        self.node = node.next;
        Some(node.data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(list: &AddressList, arena: &NodeArena<ListNode>) -> Vec<u64> {
        list.iter(arena).collect()
    }

    #[test]
    fn insert_appends_in_order() {
        let mut arena = NodeArena::new();
        let mut list = AddressList::new();
        let head = list.insert(&mut arena, 0x1000).unwrap();
        list.insert(&mut arena, 0x5000).unwrap();
        list.insert(&mut arena, 0x3000).unwrap();

        assert_eq!(list.head(), Some(head));
        assert_eq!(collect(&list, &arena), vec![0x1000, 0x5000, 0x3000]);
        assert_eq!(list.length(&arena), 3);
        assert_eq!(list.first(&arena), Some(0x1000));
    }

    #[test]
    fn insert_unique_skips_present_values() {
        let mut arena = NodeArena::new();
        let mut list = AddressList::new();
        let first = list.insert_unique(&mut arena, 0x1000).unwrap();
        assert_eq!(list.head(), first);
        assert!(list.insert_unique(&mut arena, 0x2000).unwrap().is_some());

        assert_eq!(list.insert_unique(&mut arena, 0x1000), Ok(None));
        assert_eq!(list.insert_unique(&mut arena, 0x2000), Ok(None));
        assert_eq!(arena.live(), 2);

        let tail = list.insert_unique(&mut arena, 0x3000).unwrap().unwrap();
        assert_eq!(arena[tail].prev(), list.find(&arena, 0x2000));
        assert_eq!(collect(&list, &arena), vec![0x1000, 0x2000, 0x3000]);
    }

    #[test]
    fn delete_relinks_neighbours() {
        let mut arena = NodeArena::new();
        let mut list = AddressList::new();
        for value in [1, 2, 3, 4] {
            list.insert(&mut arena, value).unwrap();
        }

        assert!(list.delete(&mut arena, 3)); // middle
        assert!(list.delete(&mut arena, 1)); // head
        assert!(list.delete(&mut arena, 4)); // tail
        assert!(!list.delete(&mut arena, 4));
        assert_eq!(collect(&list, &arena), vec![2]);

        let only = list.head().unwrap();
        assert_eq!(arena[only].prev(), None);
        assert_eq!(arena[only].next(), None);
        assert_eq!(arena.live(), 1);

        assert!(list.delete(&mut arena, 2));
        assert!(list.is_empty());
        assert_eq!(arena.live(), 0);
    }

    #[test]
    fn head_survives_a_payload_word() {
        let mut arena = NodeArena::new();
        let mut list = AddressList::new();
        list.insert(&mut arena, 10).unwrap();
        list.insert(&mut arena, 20).unwrap();

        let reattached = AddressList::from_bits(list.to_bits().unwrap());
        assert_eq!(reattached.find(&arena, 20), list.find(&arena, 20));
        assert_eq!(collect(&reattached, &arena), vec![10, 20]);
    }

    #[test]
    fn exhausted_pool_leaves_list_unchanged() {
        let mut arena = NodeArena::new();
        let mut list = AddressList::new();
        for value in 0..crate::arena::POOL_CAPACITY as u64 {
            list.insert(&mut arena, value).unwrap();
        }
        assert_eq!(list.insert(&mut arena, 999), Err(ArenaExhausted));
        assert_eq!(list.length(&arena), crate::arena::POOL_CAPACITY as u64);

        list.clear(&mut arena);
        assert_eq!(arena.live(), 0);
    }
}
