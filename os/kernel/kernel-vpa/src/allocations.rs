//! # Allocation Index
//!
//! Reserved and used runs keyed by start address. The payload of every entry
//! is a [`RunEntry`]: the run length plus the reserved flag in bit 63.

use crate::VirtualAddress;
use crate::arena::{ArenaExhausted, NodeArena};
use crate::avl::{AvlNode, AvlTree};
use crate::coalesce::merge_adjacent;
use crate::run::{MAX_RUN_PAGES, PageRange, RunEntry, RunState};

/// Reserved and used runs by start address.
#[derive(Debug, Default)]
pub struct AllocationIndex {
    starts: AvlTree,
}

impl AllocationIndex {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            starts: AvlTree::new(),
        }
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.starts.len()
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.starts.is_empty()
    }

    /// Records `range` in `state`. Returns `Ok(false)` if its start is already tracked.
    ///
    /// # Errors
    /// [`ArenaExhausted`] if no tree node could be obtained.
    pub fn insert(
        &mut self,
        trees: &mut NodeArena<AvlNode>,
        range: PageRange,
        state: RunState,
    ) -> Result<bool, ArenaExhausted> {
        let entry = RunEntry::of(range.pages, state);
        self.starts.insert(trees, range.start.as_u64(), entry.into_bits())
    }

    /// The entry starting exactly at `start`.
    #[must_use]
    pub fn get(&self, trees: &NodeArena<AvlNode>, start: VirtualAddress) -> Option<RunEntry> {
        self.starts.payload(trees, start.as_u64()).map(RunEntry::from_bits)
    }

    /// Removes the entry starting exactly at `start`.
    pub fn remove(&mut self, trees: &mut NodeArena<AvlNode>, start: VirtualAddress) -> Option<RunEntry> {
        let entry = self.get(trees, start)?;
        self.starts.delete(trees, start.as_u64());
        Some(entry)
    }

    /// The tracked run containing the page at `address`.
    #[must_use]
    pub fn containing(
        &self,
        trees: &NodeArena<AvlNode>,
        address: VirtualAddress,
    ) -> Option<(PageRange, RunState)> {
        let node = self.starts.find_or_lower(trees, address.as_u64())?;
        let (range, state) = decode(&trees[node]);
        range.contains_address(address).then_some((range, state))
    }

    /// Some tracked run sharing a page with `range`.
    #[must_use]
    pub fn first_overlapping(
        &self,
        trees: &NodeArena<AvlNode>,
        range: PageRange,
    ) -> Option<(PageRange, RunState)> {
        if let Some(below) = self.containing(trees, range.start) {
            return Some(below);
        }
        let node = self.starts.find_or_higher(trees, range.start.as_u64())?;
        let (above, state) = decode(&trees[node]);
        above.overlaps(&range).then_some((above, state))
    }

    /// All tracked runs in address order.
    pub fn iter<'a>(&self, trees: &'a NodeArena<AvlNode>) -> impl Iterator<Item = (PageRange, RunState)> + 'a {
        self.starts.iter(trees).map(|(start, payload)| {
            let entry = RunEntry::from_bits(payload);
            (PageRange::new(VirtualAddress::new(start), entry.pages()), entry.state())
        })
    }

    /// Merges address-adjacent runs of the same state; returns the number of merges.
    ///
    /// A reserved run is never merged with a used one.
    pub fn coalesce(&mut self, trees: &mut NodeArena<AvlNode>) -> usize {
        merge_adjacent(&mut self.starts, trees, |(start, payload), (next_start, next_payload)| {
            let entry = RunEntry::from_bits(payload);
            let next = RunEntry::from_bits(next_payload);
            let run = PageRange::new(VirtualAddress::new(start), entry.pages());
            let following = PageRange::new(VirtualAddress::new(next_start), next.pages());

            let mergeable = entry.state() == next.state()
                && run.is_adjacent_to(&following)
                && entry.pages() <= MAX_RUN_PAGES - next.pages();
            mergeable.then(|| RunEntry::of(entry.pages() + next.pages(), entry.state()).into_bits())
        })
    }

    /// Returns every node to the arena.
    pub fn clear(&mut self, trees: &mut NodeArena<AvlNode>) {
        self.starts.clear(trees);
    }

    #[must_use]
    pub fn is_balanced(&self, trees: &NodeArena<AvlNode>) -> bool {
        self.starts.is_balanced(trees)
    }
}

fn decode(node: &AvlNode) -> (PageRange, RunState) {
    let entry = RunEntry::from_bits(node.payload);
    (PageRange::new(VirtualAddress::new(node.key), entry.pages()), entry.state())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(address: u64) -> VirtualAddress {
        VirtualAddress::new(address)
    }

    fn range(start: u64, pages: u64) -> PageRange {
        PageRange::new(at(start), pages)
    }

    fn index_with(trees: &mut NodeArena<AvlNode>, runs: &[(u64, u64, RunState)]) -> AllocationIndex {
        let mut index = AllocationIndex::new();
        for &(start, pages, state) in runs {
            assert!(index.insert(trees, range(start, pages), state).unwrap());
        }
        index
    }

    #[test]
    fn entries_carry_length_and_state() {
        let mut trees = NodeArena::new();
        let mut index = index_with(
            &mut trees,
            &[(0x1000, 10, RunState::Reserved), (0xB000, 5, RunState::Used)],
        );

        assert_eq!(
            index.get(&trees, at(0x1000)),
            Some(RunEntry::of(10, RunState::Reserved))
        );
        assert_eq!(index.get(&trees, at(0xB000)), Some(RunEntry::of(5, RunState::Used)));
        assert_eq!(index.get(&trees, at(0x2000)), None);

        assert_eq!(
            index.remove(&mut trees, at(0xB000)),
            Some(RunEntry::of(5, RunState::Used))
        );
        assert_eq!(index.remove(&mut trees, at(0xB000)), None);
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn overlap_queries() {
        let mut trees = NodeArena::new();
        let index = index_with(
            &mut trees,
            &[(0x1000, 4, RunState::Reserved), (0x10000, 2, RunState::Used)],
        );

        assert_eq!(
            index.containing(&trees, at(0x3000)),
            Some((range(0x1000, 4), RunState::Reserved))
        );
        assert_eq!(index.containing(&trees, at(0x5000)), None);

        assert_eq!(
            index.first_overlapping(&trees, range(0x8000, 9)),
            Some((range(0x10000, 2), RunState::Used))
        );
        assert_eq!(index.first_overlapping(&trees, range(0x5000, 11)), None);
    }

    #[test]
    fn coalesce_merges_only_equal_states() {
        let mut trees = NodeArena::new();
        let mut index = index_with(
            &mut trees,
            &[
                (0x1000, 1, RunState::Used),
                (0x2000, 2, RunState::Used),
                (0x4000, 1, RunState::Reserved),
                (0x5000, 3, RunState::Reserved),
                (0xA000, 1, RunState::Reserved),
            ],
        );

        assert_eq!(index.coalesce(&mut trees), 2);
        let runs: Vec<_> = index.iter(&trees).collect();
        assert_eq!(
            runs,
            vec![
                (range(0x1000, 3), RunState::Used),
                (range(0x4000, 4), RunState::Reserved),
                (range(0xA000, 1), RunState::Reserved),
            ]
        );
        assert!(index.is_balanced(&trees));
    }
}
