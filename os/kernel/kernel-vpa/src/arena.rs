//! # Node Arena
//!
//! Fixed-size record storage for the tree and list nodes of the allocator.
//!
//! The allocator that hands out virtual address ranges is needed long before
//! the kernel heap exists, so its own bookkeeping cannot rely on a heap. Every
//! [`NodeArena`] therefore starts out serving records from an inline pool of
//! [`POOL_CAPACITY`] slots, tracked by a single `u128` occupancy bitmap. Once
//! the heap is online the arena is [promoted](NodeArena::promote) to
//! [`NodeSupply::Dynamic`] and further records come from a growable slot
//! vector instead.
//!
//! ```text
//!            index 0 .. 128                    index 128 ..
//! ┌────────────────────────────────┐ ┌───────────────────────────────┐
//! │ pool slots (bitmap-tracked)    │ │ dynamic slots (heap-backed)   │
//! └────────────────────────────────┘ └───────────────────────────────┘
//!        NodeSupply::Pool                  NodeSupply::Dynamic
//! ```
//!
//! Records are addressed by [`NodeRef`], a generational handle. Freeing a
//! record bumps its slot generation, so a handle that outlives its record is
//! detected instead of silently aliasing the next occupant. Records never move
//! while live.

use crate::address_list::ListNode;
use crate::avl::AvlNode;
use alloc::vec::Vec;
use core::fmt;
use core::ops::{Index, IndexMut};

/// Number of records served from the inline pool.
pub const POOL_CAPACITY: usize = 128;

const _: () = assert!(POOL_CAPACITY == u128::BITS as usize);

/// A generational handle to a record in a [`NodeArena`].
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub struct NodeRef {
    index: u32,
    generation: u32,
}

impl NodeRef {
    #[inline]
    const fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    /// Slot index; values below [`POOL_CAPACITY`] denote pool slots.
    #[inline]
    #[must_use]
    pub const fn index(self) -> u32 {
        self.index
    }

    #[inline]
    #[must_use]
    pub const fn generation(self) -> u32 {
        self.generation
    }

    /// Packs the handle into a payload word (generation in the high half).
    #[inline]
    #[must_use]
    pub const fn to_bits(self) -> u64 {
        ((self.generation as u64) << 32) | self.index as u64
    }

    /// Inverse of [`to_bits`](Self::to_bits).
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn from_bits(bits: u64) -> Self {
        Self::new(bits as u32, (bits >> 32) as u32)
    }

    #[inline]
    const fn is_pool(self) -> bool {
        (self.index as usize) < POOL_CAPACITY
    }
}

impl fmt::Debug for NodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeRef(#{}@{})", self.index, self.generation)
    }
}

/// Where new records come from.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum NodeSupply {
    /// Only the fixed inline pool; allocation fails once it is full.
    #[default]
    Pool,
    /// The kernel heap is online; records are allocated dynamically.
    Dynamic,
}

/// The pool is full and no dynamic node supply is online yet.
#[derive(Copy, Clone, Debug, Eq, PartialEq, thiserror::Error)]
#[error("node pool exhausted and no dynamic node supply is online")]
pub struct ArenaExhausted;

#[derive(Default)]
struct Slot<T> {
    generation: u32,
    occupied: bool,
    value: T,
}

/// Slot storage for records of type `T`, see the [module docs](self).
pub struct NodeArena<T> {
    pool: [Slot<T>; POOL_CAPACITY],
    /// Bit `i` is set while pool slot `i` is in use.
    pool_used: u128,
    dynamic: Vec<Slot<T>>,
    /// Dynamic slots available for reuse (offsets into `dynamic`).
    dynamic_free: Vec<u32>,
    dynamic_live: usize,
    supply: NodeSupply,
}

impl<T: Default> Default for NodeArena<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Default> NodeArena<T> {
    /// Creates an arena serving from its inline pool only.
    #[must_use]
    pub fn new() -> Self {
        Self {
            pool: core::array::from_fn(|_| Slot::default()),
            pool_used: 0,
            dynamic: Vec::new(),
            dynamic_free: Vec::new(),
            dynamic_live: 0,
            supply: NodeSupply::Pool,
        }
    }

    /// Stores `value` in a free slot and returns its handle.
    ///
    /// # Errors
    /// [`ArenaExhausted`] if the supply is [`NodeSupply::Pool`] and every pool
    /// slot is in use. Callers must not retry; the only remedy is
    /// [`promote`](Self::promote).
    pub fn allocate(&mut self, value: T) -> Result<NodeRef, ArenaExhausted> {
        match self.supply {
            NodeSupply::Pool => self.allocate_pool(value),
            NodeSupply::Dynamic => Ok(self.allocate_dynamic(value)),
        }
    }

    fn allocate_pool(&mut self, value: T) -> Result<NodeRef, ArenaExhausted> {
        let vacant = !self.pool_used;
        if vacant == 0 {
            return Err(ArenaExhausted);
        }

        let index = vacant.trailing_zeros();
        self.pool_used |= 1u128 << index;

        let slot = &mut self.pool[index as usize];
        slot.occupied = true;
        slot.value = value;
        Ok(NodeRef::new(index, slot.generation))
    }

    #[allow(clippy::cast_possible_truncation)]
    fn allocate_dynamic(&mut self, value: T) -> NodeRef {
        self.dynamic_live += 1;

        if let Some(offset) = self.dynamic_free.pop() {
            let slot = &mut self.dynamic[offset as usize];
            slot.occupied = true;
            slot.value = value;
            return NodeRef::new(POOL_CAPACITY as u32 + offset, slot.generation);
        }

        let offset = self.dynamic.len() as u32;
        self.dynamic.push(Slot {
            generation: 0,
            occupied: true,
            value,
        });
        NodeRef::new(POOL_CAPACITY as u32 + offset, 0)
    }

    /// Returns the record behind `node` to the back-end that issued it.
    ///
    /// Returns `false` (and does nothing) for a stale or foreign handle.
    #[allow(clippy::cast_possible_truncation)]
    pub fn free(&mut self, node: NodeRef) -> bool {
        if self.get(node).is_none() {
            return false;
        }

        if self.contains(node) {
            self.pool_used &= !(1u128 << node.index);
        } else {
            self.dynamic_live -= 1;
            self.dynamic_free.push(node.index - POOL_CAPACITY as u32);
        }

        if let Some(slot) = self.slot_mut(node) {
            slot.occupied = false;
            slot.generation = slot.generation.wrapping_add(1);
            slot.value = T::default();
        }
        true
    }
}

impl<T> NodeArena<T> {
    /// Whether `node` addresses the inline pool (as opposed to dynamic storage).
    ///
    /// This is a pure range test; it does not check liveness.
    #[inline]
    #[must_use]
    pub const fn contains(&self, node: NodeRef) -> bool {
        node.is_pool()
    }

    /// The record behind `node`, or `None` if the handle is stale.
    #[must_use]
    pub fn get(&self, node: NodeRef) -> Option<&T> {
        let slot = self.slot(node)?;
        (slot.occupied && slot.generation == node.generation).then_some(&slot.value)
    }

    /// Mutable access to the record behind `node`, or `None` if the handle is stale.
    pub fn get_mut(&mut self, node: NodeRef) -> Option<&mut T> {
        let slot = self.slot_mut(node)?;
        (slot.occupied && slot.generation == node.generation).then_some(&mut slot.value)
    }

    /// Switches to [`NodeSupply::Dynamic`]. There is no way back.
    ///
    /// Records already in the pool stay where they are and are returned to
    /// the pool when freed.
    pub fn promote(&mut self) {
        if self.supply == NodeSupply::Pool {
            log::info!(
                "node arena promoted to dynamic supply ({} pool slots in use)",
                self.pool_in_use()
            );
            self.supply = NodeSupply::Dynamic;
        }
    }

    #[inline]
    #[must_use]
    pub const fn supply(&self) -> NodeSupply {
        self.supply
    }

    /// Number of occupied pool slots.
    #[inline]
    #[must_use]
    pub const fn pool_in_use(&self) -> usize {
        self.pool_used.count_ones() as usize
    }

    /// Number of live records across both back-ends.
    #[inline]
    #[must_use]
    pub const fn live(&self) -> usize {
        self.pool_in_use() + self.dynamic_live
    }

    fn slot(&self, node: NodeRef) -> Option<&Slot<T>> {
        if node.is_pool() {
            self.pool.get(node.index as usize)
        } else {
            self.dynamic.get((node.index as usize) - POOL_CAPACITY)
        }
    }

    fn slot_mut(&mut self, node: NodeRef) -> Option<&mut Slot<T>> {
        if node.is_pool() {
            self.pool.get_mut(node.index as usize)
        } else {
            self.dynamic.get_mut((node.index as usize) - POOL_CAPACITY)
        }
    }
}

impl<T> Index<NodeRef> for NodeArena<T> {
    type Output = T;

    fn index(&self, node: NodeRef) -> &T {
        match self.get(node) {
            Some(value) => value,
            None => panic!("stale node handle {node:?}"),
        }
    }
}

impl<T> IndexMut<NodeRef> for NodeArena<T> {
    fn index_mut(&mut self, node: NodeRef) -> &mut T {
        match self.get_mut(node) {
            Some(value) => value,
            None => panic!("stale node handle {node:?}"),
        }
    }
}

impl<T> fmt::Debug for NodeArena<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeArena")
            .field("supply", &self.supply)
            .field("pool_in_use", &self.pool_in_use())
            .field("dynamic_live", &self.dynamic_live)
            .finish_non_exhaustive()
    }
}

/// The two arenas backing one allocator: tree nodes and address-list nodes.
#[derive(Debug, Default)]
pub struct NodeStore {
    pub trees: NodeArena<AvlNode>,
    pub lists: NodeArena<ListNode>,
}

impl NodeStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Promotes both arenas to [`NodeSupply::Dynamic`].
    pub fn promote(&mut self) {
        self.trees.promote();
        self.lists.promote();
    }

    #[must_use]
    pub const fn supply(&self) -> NodeSupply {
        self.trees.supply()
    }
}
