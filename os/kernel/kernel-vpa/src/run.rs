//! # Page Runs
//!
//! A *run* is a contiguous, page-aligned span of virtual pages tracked as a
//! single unit. [`PageRange`] describes one; [`RunEntry`] is the bit-packed
//! payload word the allocation index stores per run.

use crate::{PAGE_SHIFT, PAGE_SIZE, Size4K, VirtualAddress};
use bitfield_struct::bitfield;
use core::fmt;

/// Largest run length representable in a [`RunEntry`] (63 bits).
pub const MAX_RUN_PAGES: u64 = (1 << 63) - 1;

/// A page-aligned span `[start, start + pages * PAGE_SIZE)`.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PageRange {
    /// Page-aligned start address.
    pub start: VirtualAddress,
    /// Length in pages.
    pub pages: u64,
}

impl PageRange {
    #[inline]
    #[must_use]
    pub const fn new(start: VirtualAddress, pages: u64) -> Self {
        Self { start, pages }
    }

    /// Whether the start address lies on a page boundary.
    #[inline]
    #[must_use]
    pub const fn is_aligned(&self) -> bool {
        self.start.is_aligned::<Size4K>()
    }

    /// Exclusive end address (saturates at the top of the address space).
    #[inline]
    #[must_use]
    pub const fn end(&self) -> VirtualAddress {
        VirtualAddress::new(
            self.start
                .as_u64()
                .saturating_add(self.pages.saturating_mul(PAGE_SIZE)),
        )
    }

    /// Start of the page `pages` pages into the range.
    #[inline]
    #[must_use]
    pub const fn page_at(&self, pages: u64) -> VirtualAddress {
        VirtualAddress::new(self.start.as_u64() + pages * PAGE_SIZE)
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.pages == 0
    }

    /// Whether `other` lies entirely within `self`.
    #[inline]
    #[must_use]
    pub fn contains(&self, other: &Self) -> bool {
        other.start >= self.start && other.end() <= self.end()
    }

    /// Whether the page at `address` belongs to the range.
    #[inline]
    #[must_use]
    pub fn contains_address(&self, address: VirtualAddress) -> bool {
        self.start <= address && address < self.end()
    }

    /// Whether the two ranges share at least one page.
    #[inline]
    #[must_use]
    pub fn overlaps(&self, other: &Self) -> bool {
        self.start < other.end() && other.start < self.end()
    }

    /// Whether `next` starts exactly where `self` ends.
    #[inline]
    #[must_use]
    pub fn is_adjacent_to(&self, next: &Self) -> bool {
        self.end() == next.start
    }

    /// Number of pages `self` and `other` have in common.
    #[must_use]
    pub fn overlap_pages(&self, other: &Self) -> u64 {
        if !self.overlaps(other) {
            return 0;
        }
        let start = self.start.max(other.start);
        let end = self.end().min(other.end());
        pages_between(start, end)
    }

    /// The parts of `self` below and above `hole`, either of which may be absent.
    #[must_use]
    pub fn remainders(&self, hole: &Self) -> (Option<Self>, Option<Self>) {
        let below = (hole.start > self.start).then(|| {
            let end = hole.start.min(self.end());
            Self::new(self.start, pages_between(self.start, end))
        });
        let above = (hole.end() < self.end()).then(|| {
            let start = hole.end().max(self.start);
            Self::new(start, pages_between(start, self.end()))
        });
        (below, above)
    }

    /// The run covering both `self` and the adjacent `next`.
    #[inline]
    #[must_use]
    pub const fn merged_with(&self, next: &Self) -> Self {
        Self::new(self.start, self.pages + next.pages)
    }
}

/// Whole pages in `[start, end)`.
#[inline]
const fn pages_between(start: VirtualAddress, end: VirtualAddress) -> u64 {
    (end.as_u64() - start.as_u64()) >> PAGE_SHIFT
}

impl fmt::Debug for PageRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PageRange({}, {} pages)", self.start, self.pages)
    }
}

impl fmt::Display for PageRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}..{})", self.start, self.end())
    }
}

/// State of a tracked, non-free run.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum RunState {
    /// Permanently excluded from allocation (kernel image, framebuffer, ...).
    Reserved,
    /// Handed out by the allocator.
    Used,
}

/// State of a single page as seen by the allocator.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum PageState {
    Free,
    Reserved,
    Used,
}

impl From<RunState> for PageState {
    fn from(value: RunState) -> Self {
        match value {
            RunState::Reserved => Self::Reserved,
            RunState::Used => Self::Used,
        }
    }
}

/// Allocation index payload: run length and state flag packed into one word.
///
/// The length occupies bits 0..=62, so a single run is capped at
/// [`MAX_RUN_PAGES`] pages.
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct RunEntry {
    /// Run length in pages (bits 0..=62).
    #[bits(63)]
    pub pages: u64,
    /// Reserved flag (bit 63); clear for used runs.
    pub reserved: bool,
}

impl RunEntry {
    /// Packs a run of `pages` pages in `state`.
    #[inline]
    #[must_use]
    pub const fn of(pages: u64, state: RunState) -> Self {
        Self::new()
            .with_pages(pages)
            .with_reserved(matches!(state, RunState::Reserved))
    }

    #[inline]
    #[must_use]
    pub const fn state(self) -> RunState {
        if self.reserved() {
            RunState::Reserved
        } else {
            RunState::Used
        }
    }
}
