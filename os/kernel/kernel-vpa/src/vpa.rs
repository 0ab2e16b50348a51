//! # Virtual Page-Range Allocator
//!
//! Coordinates the [free-run index](crate::free_runs) and the
//! [allocation index](crate::allocations) to hand out, reserve and take back
//! page-granular ranges of a virtual address space.
//!
//! Every page is in exactly one of three states, or untouched:
//!
//! ```text
//!                reserve_pages            allocate_pages
//!   Reserved ◀──────────────────  Free  ──────────────────▶ Used
//!            ──────────────────▶       ◀──────────────────
//!               unreserve_pages          unallocate_pages
//! ```
//!
//! Untouched pages (outside the initial free range and never reserved) are in
//! no index at all. Reserved and used runs never turn into each other directly.
//!
//! ## Concurrency
//!
//! Nothing here locks. Callers serialize access themselves, e.g. by keeping
//! the allocator behind a spin lock or by running with interrupts disabled.
//! No operation blocks.
//!
//! ## Cost
//!
//! Allocating and releasing take `O(log n)` tree work plus a walk of the one
//! address list holding runs of the affected length.
//! [`reserve_pages`](VirtualPageAllocator::reserve_pages) and
//! [`state_of`](VirtualPageAllocator::state_of) scan the free-run index, which
//! is `O(n)` in the number of free runs. Both cleanup passes are `O(n log n)`.

use crate::allocations::AllocationIndex;
use crate::arena::{ArenaExhausted, NodeStore, NodeSupply};
use crate::free_runs::FreeRunIndex;
use crate::run::{MAX_RUN_PAGES, PageRange, PageState, RunEntry, RunState};
use crate::{PAGE_SIZE, Size4K, VirtualAddress};

#[derive(Copy, Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum VpaError {
    #[error("no free run of {pages} pages")]
    OutOfVirtualSpace { pages: u64 },
    #[error("bookkeeping node supply exhausted")]
    NodeSupplyExhausted,
    #[error("request for zero pages")]
    ZeroPages,
    #[error("run of {pages} pages exceeds the run length limit")]
    RunTooLarge { pages: u64 },
    #[error("address {address} is not page aligned")]
    Unaligned { address: VirtualAddress },
    #[error("range overlaps tracked run {existing}")]
    Overlap { existing: PageRange },
}

impl From<ArenaExhausted> for VpaError {
    fn from(_: ArenaExhausted) -> Self {
        Self::NodeSupplyExhausted
    }
}

/// Page counters, kept equal to the run lengths summed over each index.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct PageCounts {
    pub free: u64,
    pub used: u64,
    pub reserved: u64,
}

impl PageCounts {
    /// All pages the allocator has been told about.
    #[inline]
    #[must_use]
    pub const fn tracked(&self) -> u64 {
        self.free + self.used + self.reserved
    }

    const fn of_state_mut(&mut self, state: RunState) -> &mut u64 {
        match state {
            RunState::Reserved => &mut self.reserved,
            RunState::Used => &mut self.used,
        }
    }
}

/// The virtual page-range allocator, see the [module docs](self).
#[derive(Debug)]
pub struct VirtualPageAllocator {
    pub(crate) nodes: NodeStore,
    pub(crate) free_runs: FreeRunIndex,
    pub(crate) allocations: AllocationIndex,
    pub(crate) counts: PageCounts,
}

impl VirtualPageAllocator {
    /// Creates an allocator managing `pages` free pages starting at `base`.
    ///
    /// # Errors
    /// [`VpaError::ZeroPages`], [`VpaError::Unaligned`] or
    /// [`VpaError::RunTooLarge`] for an unusable range.
    pub fn new(base: VirtualAddress, pages: u64) -> Result<Self, VpaError> {
        validate(base, pages)?;

        let range = PageRange::new(base, pages);
        let mut vpa = Self {
            nodes: NodeStore::new(),
            free_runs: FreeRunIndex::new(),
            allocations: AllocationIndex::new(),
            counts: PageCounts::default(),
        };
        vpa.free(range)?;

        log::info!("virtual page allocator managing {range} ({pages} pages)");
        Ok(vpa)
    }

    /// Creates an allocator and applies the boot-time `reservations` in order.
    ///
    /// Reservations may lie inside or outside the initial free range (e.g. the
    /// kernel image and the boot framebuffer respectively).
    ///
    /// # Errors
    /// See [`new`](Self::new) and [`reserve_pages`](Self::reserve_pages).
    pub fn with_reservations(
        base: VirtualAddress,
        pages: u64,
        reservations: &[PageRange],
    ) -> Result<Self, VpaError> {
        let mut vpa = Self::new(base, pages)?;
        for reservation in reservations {
            vpa.reserve_pages(reservation.start, reservation.pages)?;
        }
        Ok(vpa)
    }

    /// Excludes `pages` pages at `address` from allocation.
    ///
    /// Reserving a start address that is already tracked (reserved or used) is
    /// a no-op. Free pages inside the range stop being free; untouched pages
    /// become reserved directly.
    ///
    /// Finding the free runs the range overlaps scans the free-run index, so
    /// this is `O(n)` in the number of free runs. Reservations are a boot-time
    /// affair; allocation does not go through this path.
    ///
    /// # Errors
    /// - [`VpaError::ZeroPages`], [`VpaError::Unaligned`], [`VpaError::RunTooLarge`].
    /// - [`VpaError::Overlap`] if the range intersects a tracked run starting elsewhere.
    /// - [`VpaError::NodeSupplyExhausted`]; nothing was changed.
    pub fn reserve_pages(&mut self, address: VirtualAddress, pages: u64) -> Result<(), VpaError> {
        validate(address, pages)?;

        if self.allocations.get(&self.nodes.trees, address).is_some() {
            log::debug!("{address} is already tracked; ignoring reservation");
            return Ok(());
        }

        let range = PageRange::new(address, pages);
        if let Some((existing, _)) = self.allocations.first_overlapping(&self.nodes.trees, range) {
            return Err(VpaError::Overlap { existing });
        }

        self.reserve_range(range)?;
        log::trace!("reserved {range}");
        Ok(())
    }

    /// Returns a reservation to the free pool.
    ///
    /// Only an exact match of a previous reservation is accepted; anything else
    /// is ignored and reported as `Ok(false)`.
    ///
    /// # Errors
    /// [`VpaError::NodeSupplyExhausted`]; the reservation is kept.
    pub fn unreserve_pages(
        &mut self,
        address: VirtualAddress,
        pages: u64,
    ) -> Result<bool, VpaError> {
        self.unlock_pages(PageRange::new(address, pages), RunState::Reserved)
    }

    /// Allocates `pages` contiguous pages and returns the start address.
    ///
    /// Picks a run of the smallest free length that fits and carves the
    /// request off its start; the remainder stays free. The chosen run is the
    /// head of its address list, so no part of the free-run index is scanned.
    ///
    /// # Errors
    /// - [`VpaError::ZeroPages`] / [`VpaError::RunTooLarge`] for impossible requests.
    /// - [`VpaError::OutOfVirtualSpace`] if no free run is large enough. A
    ///   [`cleanup_free_pages`](Self::cleanup_free_pages) may help.
    /// - [`VpaError::NodeSupplyExhausted`]; nothing was changed.
    pub fn allocate_pages(&mut self, pages: u64) -> Result<VirtualAddress, VpaError> {
        check_pages(pages)?;

        let Some(run) = self.free_runs.best_fit(&self.nodes, pages) else {
            log::warn!("out of virtual address space: no free run of {pages} pages");
            return Err(VpaError::OutOfVirtualSpace { pages });
        };
        debug_assert!(run.pages >= pages);

        let range = PageRange::new(run.start, pages);
        let inserted = self
            .allocations
            .insert(&mut self.nodes.trees, range, RunState::Used)?;
        debug_assert!(inserted, "free run {run} starts at a tracked address");

        if let Err(e) = self.take_front(run, pages) {
            self.allocations.remove(&mut self.nodes.trees, range.start);
            return Err(e);
        }

        self.counts.free -= pages;
        self.counts.used += pages;
        log::trace!("allocated {range} from free run {run}");
        Ok(range.start)
    }

    /// Returns an allocation to the free pool. No merging happens here.
    ///
    /// Only an exact match of a previous allocation is accepted; anything else
    /// is ignored and reported as `Ok(false)`.
    ///
    /// # Errors
    /// [`VpaError::NodeSupplyExhausted`]; the allocation is kept.
    pub fn unallocate_pages(
        &mut self,
        address: VirtualAddress,
        pages: u64,
    ) -> Result<bool, VpaError> {
        self.unlock_pages(PageRange::new(address, pages), RunState::Used)
    }

    /// The address [`allocate_pages`](Self::allocate_pages) would return, without allocating.
    #[must_use]
    pub fn find_free_pages(&self, pages: u64) -> Option<VirtualAddress> {
        if pages == 0 {
            return None;
        }
        self.free_runs.best_fit(&self.nodes, pages).map(|run| run.start)
    }

    #[inline]
    #[must_use]
    pub const fn counts(&self) -> PageCounts {
        self.counts
    }

    /// The state of the page containing `address`; `None` if untouched.
    ///
    /// Reserved and used pages are found with one descent of the allocation
    /// index. Free runs are indexed by length, not address, so telling a free
    /// page from an untouched one walks every free run: `O(n)` in the number
    /// of free runs. Meant for diagnostics and tests, not for hot paths.
    #[must_use]
    pub fn state_of(&self, address: VirtualAddress) -> Option<PageState> {
        if let Some((_, state)) = self.allocations.containing(&self.nodes.trees, address) {
            return Some(state.into());
        }
        self.free_runs
            .find(&self.nodes, |run| run.contains_address(address))
            .map(|_| PageState::Free)
    }

    /// All free runs, ordered by length.
    pub fn free_runs(&self) -> impl Iterator<Item = PageRange> + '_ {
        self.free_runs.iter(&self.nodes)
    }

    /// All reserved and used runs, ordered by address.
    pub fn allocations(&self) -> impl Iterator<Item = (PageRange, RunState)> + '_ {
        self.allocations.iter(&self.nodes.trees)
    }

    #[inline]
    #[must_use]
    pub const fn node_supply(&self) -> NodeSupply {
        self.nodes.supply()
    }

    /// Signals that the kernel heap is online: bookkeeping nodes come from the
    /// heap from now on. Irreversible.
    pub fn promote_node_supply(&mut self) {
        self.nodes.promote();
    }

    /// Whether both indices satisfy the balance bound.
    #[must_use]
    pub fn is_balanced(&self) -> bool {
        self.free_runs.is_balanced(&self.nodes) && self.allocations.is_balanced(&self.nodes.trees)
    }

    /// Records `range` as reserved and takes any free pages in it out of the
    /// free-run index.
    fn reserve_range(&mut self, range: PageRange) -> Result<(), VpaError> {
        let inserted = self
            .allocations
            .insert(&mut self.nodes.trees, range, RunState::Reserved)?;
        debug_assert!(inserted, "{range} starts at a tracked address");

        match self.unfree(range) {
            Ok(carved) => {
                self.counts.free -= carved;
                self.counts.reserved += range.pages;
                Ok(())
            }
            Err(e) => {
                self.allocations.remove(&mut self.nodes.trees, range.start);
                Err(e)
            }
        }
    }

    /// Removes an exact `(range, state)` entry and returns the range to the free-run index.
    fn unlock_pages(&mut self, range: PageRange, state: RunState) -> Result<bool, VpaError> {
        let tracked = check_pages(range.pages).is_ok()
            && self.allocations.get(&self.nodes.trees, range.start)
                == Some(RunEntry::of(range.pages, state));
        if !tracked {
            log::debug!("no {state:?} run {range} to release; ignoring");
            return Ok(false);
        }

        self.allocations.remove(&mut self.nodes.trees, range.start);
        if let Err(e) = self.free(range) {
            if self.allocations.insert(&mut self.nodes.trees, range, state).is_err() {
                log::error!("lost {state:?} run {range} while rolling back");
            }
            return Err(e);
        }

        *self.counts.of_state_mut(state) -= range.pages;
        log::trace!("released {state:?} run {range}");
        Ok(true)
    }

    /// Replaces the free `run` by what is left after its first `pages` pages.
    /// On failure the free-run index is unchanged.
    fn take_front(&mut self, run: PageRange, pages: u64) -> Result<(), VpaError> {
        self.free_runs.remove(&mut self.nodes, run);
        if run.pages == pages {
            return Ok(());
        }

        let rest = PageRange::new(run.page_at(pages), run.pages - pages);
        if let Err(e) = self.free_runs.insert(&mut self.nodes, rest) {
            self.reinsert_free_run(run);
            return Err(e.into());
        }
        Ok(())
    }

    /// Adds `range` to the free-run index without merging.
    fn free(&mut self, range: PageRange) -> Result<(), VpaError> {
        self.free_runs.insert(&mut self.nodes, range)?;
        self.counts.free += range.pages;
        Ok(())
    }

    /// Takes every free page inside `range` out of the free-run index and
    /// returns how many there were.
    ///
    /// At most two free runs stick out of `range`: one below its start and one
    /// above its end. Those are split first; any failure undoes what was done.
    /// Runs entirely inside `range` are then dropped, which cannot fail.
    fn unfree(&mut self, range: PageRange) -> Result<u64, VpaError> {
        let mut carved = 0;

        let below = self
            .free_runs
            .find(&self.nodes, |run| run.overlaps(&range) && run.start < range.start);
        let above = self
            .free_runs
            .find(&self.nodes, |run| run.overlaps(&range) && run.end() > range.end());

        if let Some(run) = below {
            carved += self.split_free_run(run, range)?;
        }
        if let Some(run) = above.filter(|run| Some(*run) != below) {
            match self.split_free_run(run, range) {
                Ok(pages) => carved += pages,
                Err(e) => {
                    if let Some(run) = below {
                        self.restore_free_run(run, range);
                    }
                    return Err(e);
                }
            }
        }

        while let Some(run) = self.free_runs.find(&self.nodes, |run| range.contains(run)) {
            self.free_runs.remove(&mut self.nodes, run);
            carved += run.pages;
        }

        Ok(carved)
    }

    /// Replaces the free `run` by what remains of it outside `hole`; returns
    /// the number of pages removed. On failure the free-run index is unchanged.
    fn split_free_run(&mut self, run: PageRange, hole: PageRange) -> Result<u64, VpaError> {
        let (below, above) = run.remainders(&hole);
        self.free_runs.remove(&mut self.nodes, run);

        if let Some(part) = below {
            if let Err(e) = self.free_runs.insert(&mut self.nodes, part) {
                self.reinsert_free_run(run);
                return Err(e.into());
            }
        }
        if let Some(part) = above {
            if let Err(e) = self.free_runs.insert(&mut self.nodes, part) {
                if let Some(part) = below {
                    self.free_runs.remove(&mut self.nodes, part);
                }
                self.reinsert_free_run(run);
                return Err(e.into());
            }
        }

        let kept = below.map_or(0, |p| p.pages) + above.map_or(0, |p| p.pages);
        log::trace!("split free run {run} around {hole}");
        Ok(run.pages - kept)
    }

    /// Undoes a successful [`split_free_run`](Self::split_free_run).
    fn restore_free_run(&mut self, run: PageRange, hole: PageRange) {
        let (below, above) = run.remainders(&hole);
        for part in [below, above].into_iter().flatten() {
            self.free_runs.remove(&mut self.nodes, part);
        }
        self.reinsert_free_run(run);
    }

    fn reinsert_free_run(&mut self, run: PageRange) {
        if let Err(e) = self.free_runs.insert(&mut self.nodes, run) {
            log::error!("lost free run {run} while rolling back: {e}");
        }
    }
}

const fn check_pages(pages: u64) -> Result<(), VpaError> {
    if pages == 0 {
        return Err(VpaError::ZeroPages);
    }
    if pages > MAX_RUN_PAGES {
        return Err(VpaError::RunTooLarge { pages });
    }
    Ok(())
}

/// Rejects unaligned starts, empty runs and runs reaching past the top of the address space.
const fn validate(address: VirtualAddress, pages: u64) -> Result<(), VpaError> {
    if !address.is_aligned::<Size4K>() {
        return Err(VpaError::Unaligned { address });
    }
    if let Err(e) = check_pages(pages) {
        return Err(e);
    }
    match pages.checked_mul(PAGE_SIZE) {
        Some(bytes) if address.checked_add(bytes).is_some() => Ok(()),
        _ => Err(VpaError::RunTooLarge { pages }),
    }
}
