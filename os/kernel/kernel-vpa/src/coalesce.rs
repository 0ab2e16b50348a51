//! # Deferred Coalescing
//!
//! Freeing pages never merges runs eagerly; adjacent free runs accumulate
//! until a caller asks for a cleanup pass. Both passes share one walk over an
//! address-ordered tree: visit runs in address order and, whenever a run ends
//! exactly where its in-order successor begins, fold the successor into it and
//! test the enlarged run again.
//!
//! Free runs are indexed by length, so their pass first re-indexes them by
//! address into a temporary tree, merges there, and rebuilds the length index
//! from the result:
//!
//! ```text
//!  by length            by address              by address         by length
//!  3 ─▶ A               A: 3  ┐                 A: 8               8 ─▶ A
//!  5 ─▶ A+3p      ──▶   A+3p: 5 ┘ merge   ──▶   Z: 2         ──▶   2 ─▶ Z
//!  2 ─▶ Z               Z: 2
//! ```

use crate::VirtualAddress;
use crate::arena::NodeArena;
use crate::avl::{AvlNode, AvlTree};
use crate::run::{MAX_RUN_PAGES, PageRange};
use crate::vpa::{VirtualPageAllocator, VpaError};

/// Folds address-adjacent entries of `tree` together; returns the number of merges.
///
/// `merge` receives `(key, payload)` of a node and of its in-order successor
/// and returns the payload of the merged entry, or `None` to keep both.
pub(crate) fn merge_adjacent<F>(
    tree: &mut AvlTree,
    arena: &mut NodeArena<AvlNode>,
    merge: F,
) -> usize
where
    F: Fn((u64, u64), (u64, u64)) -> Option<u64>,
{
    let mut merges = 0;
    let mut cursor = tree.first(arena).map(|n| arena[n].key);

    while let Some(key) = cursor {
        let Some(payload) = tree.payload(arena, key) else {
            break;
        };
        let Some(next) = tree.successor(arena, key) else {
            break;
        };
        let AvlNode {
            key: next_key,
            payload: next_payload,
            ..
        } = arena[next];

        match merge((key, payload), (next_key, next_payload)) {
            Some(merged) => {
                tree.delete(arena, next_key);
                tree.set_payload(arena, key, merged);
                merges += 1;
            }
            None => cursor = Some(next_key),
        }
    }

    merges
}

impl VirtualPageAllocator {
    /// Merges every pair of address-adjacent free runs.
    ///
    /// Runs in `O(n log n)` for `n` free runs and is meant to be called
    /// opportunistically (e.g. after an allocation failed), not after every
    /// free. Returns the number of merges performed.
    ///
    /// # Errors
    /// [`VpaError::NodeSupplyExhausted`] if the temporary address index could
    /// not be built; the free-run index is left as it was.
    pub fn cleanup_free_pages(&mut self) -> Result<usize, VpaError> {
        let before = self.free_runs.length_count();

        let mut by_address = self.organise_by_address()?;

        let merges = merge_adjacent(
            &mut by_address,
            &mut self.nodes.trees,
            |(start, pages), (next_start, next_pages)| {
                let run = PageRange::new(VirtualAddress::new(start), pages);
                let next = PageRange::new(VirtualAddress::new(next_start), next_pages);
                let mergeable = run.is_adjacent_to(&next)
                    && pages <= MAX_RUN_PAGES - next_pages;
                mergeable.then_some(pages + next_pages)
            },
        );

        self.free_runs.clear(&mut self.nodes);
        self.organise_by_length(&mut by_address)?;

        log::debug!(
            "free-run cleanup: {merges} merges, {before} -> {} distinct lengths",
            self.free_runs.length_count()
        );
        Ok(merges)
    }

    /// Merges address-adjacent reserved runs with each other, and used runs
    /// with each other. Returns the number of merges performed.
    ///
    /// Merged used runs can only be returned as a whole afterwards: an
    /// [`unallocate_pages`](Self::unallocate_pages) call must name the merged
    /// run exactly.
    pub fn cleanup_allocations(&mut self) -> usize {
        let merges = self.allocations.coalesce(&mut self.nodes.trees);
        log::debug!("allocation cleanup: {merges} merges");
        merges
    }

    /// Copies every free run into a new tree keyed by start address (payload: length).
    fn organise_by_address(&mut self) -> Result<AvlTree, VpaError> {
        let mut by_address = AvlTree::new();
        let mut cursor = self.free_runs.lengths_from(&self.nodes, 1);

        while let Some((pages, list)) = cursor {
            for start in list.iter(&self.nodes.lists) {
                if let Err(e) = by_address.insert(&mut self.nodes.trees, start, pages) {
                    log::warn!("free-run cleanup aborted: {e}");
                    by_address.clear(&mut self.nodes.trees);
                    return Err(e.into());
                }
            }
            cursor = pages
                .checked_add(1)
                .and_then(|next| self.free_runs.lengths_from(&self.nodes, next));
        }

        Ok(by_address)
    }

    /// Drains `by_address` into the (empty) free-run index.
    ///
    /// Each step releases a tree node before claiming at most one tree node
    /// and one list node, and the drained index released at least as many list
    /// nodes as there are runs, so this cannot run out of nodes. Should it
    /// happen anyway, the runs that could not be re-indexed are dropped from
    /// the free count so the counters keep matching the index.
    fn organise_by_length(&mut self, by_address: &mut AvlTree) -> Result<(), VpaError> {
        while let Some(first) = by_address.first(&self.nodes.trees) {
            let AvlNode { key, payload, .. } = self.nodes.trees[first];
            by_address.delete(&mut self.nodes.trees, key);

            let run = PageRange::new(VirtualAddress::new(key), payload);
            if let Err(e) = self.free_runs.insert(&mut self.nodes, run) {
                let mut lost = run.pages;
                lost += by_address.iter(&self.nodes.trees).map(|(_, pages)| pages).sum::<u64>();
                by_address.clear(&mut self.nodes.trees);
                self.counts.free -= lost;
                log::error!("free-run cleanup lost {lost} free pages while rebuilding: {e}");
                return Err(e.into());
            }
        }
        Ok(())
    }
}
