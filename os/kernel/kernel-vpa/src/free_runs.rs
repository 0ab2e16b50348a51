//! # Free-Run Index
//!
//! Free runs grouped by length: an [`AvlTree`] keyed by run length in pages
//! whose payload is the head of an [`AddressList`] of start addresses, one per
//! free run of exactly that length.
//!
//! ```text
//!            ┌────────┐
//!            │ len 8  │──▶ 0x4000_0000 ─ 0x7000_0000
//!            └──┬──┬──┘
//!       ┌───────┘  └───────┐
//!   ┌───▼────┐        ┌────▼───┐
//!   │ len 1  │        │ len 75 │──▶ 0x0001_0000
//!   └────────┘        └────────┘
//!       │
//!       ▼
//!   0x0000_B000
//! ```
//!
//! A length key exists only while its list is non-empty. Runs are not merged
//! on insertion; see [`VirtualPageAllocator::cleanup_free_pages`](crate::VirtualPageAllocator::cleanup_free_pages).

use crate::address_list::AddressList;
use crate::arena::{ArenaExhausted, NodeStore};
use crate::avl::AvlTree;
use crate::VirtualAddress;
use crate::run::PageRange;

/// Free runs indexed by length, see the [module docs](self).
#[derive(Debug, Default)]
pub struct FreeRunIndex {
    lengths: AvlTree,
}

impl FreeRunIndex {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            lengths: AvlTree::new(),
        }
    }

    /// Number of distinct run lengths.
    #[must_use]
    pub const fn length_count(&self) -> usize {
        self.lengths.len()
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.lengths.is_empty()
    }

    /// Records `range` as free. Recording the same run twice is a no-op.
    ///
    /// # Errors
    /// [`ArenaExhausted`] if a tree or list node could not be obtained. The
    /// index is unchanged.
    pub fn insert(&mut self, nodes: &mut NodeStore, range: PageRange) -> Result<(), ArenaExhausted> {
        let start = range.start.as_u64();
        if let Some(head) = self.lengths.payload(&nodes.trees, range.pages) {
            // Appending never moves a non-empty list's head.
            AddressList::from_bits(head).insert_unique(&mut nodes.lists, start)?;
            return Ok(());
        }

        let mut list = AddressList::new();
        let head = list.insert(&mut nodes.lists, start)?;
        if let Err(e) = self.lengths.insert(&mut nodes.trees, range.pages, head.to_bits()) {
            list.clear(&mut nodes.lists);
            return Err(e);
        }
        Ok(())
    }

    /// Removes exactly `range`; returns whether it was recorded.
    pub fn remove(&mut self, nodes: &mut NodeStore, range: PageRange) -> bool {
        let Some(head) = self.lengths.payload(&nodes.trees, range.pages) else {
            return false;
        };

        let mut list = AddressList::from_bits(head);
        if !list.delete(&mut nodes.lists, range.start.as_u64()) {
            return false;
        }

        match list.to_bits() {
            Some(head) => {
                self.lengths.set_payload(&mut nodes.trees, range.pages, head);
            }
            None => {
                self.lengths.delete(&mut nodes.trees, range.pages);
            }
        }
        true
    }

    /// Whether exactly `range` is recorded.
    #[must_use]
    pub fn contains(&self, nodes: &NodeStore, range: PageRange) -> bool {
        self.lengths
            .payload(&nodes.trees, range.pages)
            .is_some_and(|head| {
                AddressList::from_bits(head)
                    .find(&nodes.lists, range.start.as_u64())
                    .is_some()
            })
    }

    /// Best fit: a run of the smallest recorded length `>= pages`.
    #[must_use]
    pub fn best_fit(&self, nodes: &NodeStore, pages: u64) -> Option<PageRange> {
        let node = self.lengths.find_or_higher(&nodes.trees, pages)?;
        let entry = &nodes.trees[node];
        let start = AddressList::from_bits(entry.payload).first(&nodes.lists)?;
        Some(PageRange::new(VirtualAddress::new(start), entry.key))
    }

    /// The smallest recorded length `>= pages` together with its address list.
    #[must_use]
    pub fn lengths_from(&self, nodes: &NodeStore, pages: u64) -> Option<(u64, AddressList)> {
        let node = self.lengths.find_or_higher(&nodes.trees, pages)?;
        let entry = &nodes.trees[node];
        Some((entry.key, AddressList::from_bits(entry.payload)))
    }

    /// The first recorded run satisfying `predicate`, in length order.
    pub fn find(&self, nodes: &NodeStore, mut predicate: impl FnMut(&PageRange) -> bool) -> Option<PageRange> {
        self.iter(nodes).find(|range| predicate(range))
    }

    /// All free runs, ordered by length (insertion order within a length).
    pub fn iter<'a>(&self, nodes: &'a NodeStore) -> impl Iterator<Item = PageRange> + 'a {
        self.lengths.iter(&nodes.trees).flat_map(move |(pages, head)| {
            AddressList::from_bits(head)
                .iter(&nodes.lists)
                .map(move |start| PageRange::new(VirtualAddress::new(start), pages))
        })
    }

    /// Returns every tree and list node to the arenas.
    pub fn clear(&mut self, nodes: &mut NodeStore) {
        for (_, head) in self.lengths.iter(&nodes.trees) {
            AddressList::from_bits(head).clear(&mut nodes.lists);
        }
        self.lengths.clear(&mut nodes.trees);
    }

    /// Checks the underlying tree, see [`AvlTree::is_balanced`].
    #[must_use]
    pub fn is_balanced(&self, nodes: &NodeStore) -> bool {
        self.lengths.is_balanced(&nodes.trees)
    }
}
