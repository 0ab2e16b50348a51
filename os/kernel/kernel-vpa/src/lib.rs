//! # Virtual Page-Range Allocator
//!
//! Hands out page-granular ranges of the kernel's virtual address space and
//! keeps track of which ranges are free, reserved (kernel image, framebuffer,
//! MMIO windows) or in use.
//!
//! ## What you get
//! - A [`VirtualPageAllocator`] with best-fit allocation, reservations and
//!   deferred coalescing.
//! - A [`NodeArena`](arena::NodeArena) that serves bookkeeping nodes from a
//!   fixed inline pool until the kernel heap is online.
//! - An arena-backed [AVL tree](avl) and [doubly linked list](address_list),
//!   the two containers both indices are built from.
//!
//! ## Layout
//!
//! ```text
//!                    ┌───────────────────────────┐
//!                    │   VirtualPageAllocator    │
//!                    └──────┬─────────────┬──────┘
//!                           │             │
//!              ┌────────────▼───┐   ┌─────▼────────────┐
//!              │ FreeRunIndex   │   │ AllocationIndex  │
//!              │ length → list  │   │ start → RunEntry │
//!              └───┬────────┬───┘   └─────┬────────────┘
//!                  │        │             │
//!          ┌───────▼──┐ ┌───▼─────────┐   │
//!          │ AvlTree  │ │ AddressList │   │
//!          └───────┬──┘ └───┬─────────┘   │
//!                  │        │  ┌──────────┘
//!          ┌───────▼────────▼──▼──┐
//!          │      NodeStore       │  trees: NodeArena<AvlNode>
//!          │  (pool ▸ dynamic)    │  lists: NodeArena<ListNode>
//!          └──────────────────────┘
//! ```
//!
//! Free runs are indexed by length so that a best-fit search is a single
//! tree descent; reserved and used runs are indexed by address. Freeing never
//! merges: call [`cleanup_free_pages`](VirtualPageAllocator::cleanup_free_pages)
//! when fragmentation gets in the way.
//!
//! ## Example
//!
//! ```
//! use kernel_vpa::{PAGE_SIZE, PageCounts, VirtualAddress, VirtualPageAllocator};
//!
//! let base = VirtualAddress::new(0x1000);
//! let mut vpa = VirtualPageAllocator::new(base, 100).unwrap();
//! vpa.reserve_pages(base, 10).unwrap();
//!
//! let addr = vpa.allocate_pages(5).unwrap();
//! assert_eq!(addr, base + 10 * PAGE_SIZE);
//! assert_eq!(vpa.counts(), PageCounts { free: 85, used: 5, reserved: 10 });
//!
//! assert!(vpa.unallocate_pages(addr, 5).unwrap());
//! assert_eq!(vpa.cleanup_free_pages().unwrap(), 1);
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]

extern crate alloc;

pub mod address_list;
pub mod allocations;
pub mod arena;
pub mod avl;
mod coalesce;
pub mod free_runs;
mod run;
mod vpa;

pub use crate::arena::{ArenaExhausted, NodeSupply};
pub use crate::run::{MAX_RUN_PAGES, PageRange, PageState, RunEntry, RunState};
pub use crate::vpa::{PageCounts, VirtualPageAllocator, VpaError};

pub use kernel_memory_addresses::{PageSize, Size4K, VirtualAddress};

/// Size of a virtual page in bytes.
pub const PAGE_SIZE: u64 = Size4K::SIZE;

/// `log2(PAGE_SIZE)`.
pub const PAGE_SHIFT: u32 = Size4K::SHIFT;
