//! # Virtual Memory Address Types
//!
//! Strongly typed wrappers for virtual addresses and page bases, so that
//! address arithmetic in the memory-management crates cannot silently mix a
//! byte address with a page count or an unaligned value with a page base.
//!
//! | Type | Generic | Description |
//! |----------|----------|-------------|
//! | [`MemoryAddress`] | – | A raw 64-bit address. |
//! | [`MemoryPage<S>`] | [`S: PageSize`](PageSize) | A page-aligned base address of a page of size `S`. |
//! | [`VirtualAddress`] | – | A [`MemoryAddress`] that denotes virtual memory. |
//! | [`VirtualPage<S>`] | [`S: PageSize`](PageSize) | The page-aligned base of a virtual page. |
//!
//! ## Page Sizes
//!
//! Page sizes are marker types implementing [`PageSize`], which carries the
//! [`SIZE`](PageSize::SIZE) and [`SHIFT`](PageSize::SHIFT) constants. Only the
//! 4 KiB base granularity ([`Size4K`]) is provided; the range allocator keeps
//! no huge-page bookkeeping.
//!
//! ## Typical Usage
//!
//! ```rust
//! # use kernel_memory_addresses::*;
//! let va = VirtualAddress::new(0xFFFF_FFFF_8000_1234);
//! assert!(!va.is_aligned::<Size4K>());
//!
//! let page = va.page::<Size4K>();
//! assert_eq!(page.base(), VirtualAddress::new(0xFFFF_FFFF_8000_1000));
//! assert!(page.base().is_aligned::<Size4K>());
//!
//! assert_eq!(VirtualAddress::new(u64::MAX).checked_add(1), None);
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]

mod memory_address;
mod page_size;
mod virtual_address;
mod virtual_page;

pub use crate::memory_address::{MemoryAddress, MemoryPage};
pub use crate::page_size::{PageSize, Size4K};
pub use crate::virtual_address::VirtualAddress;
pub use crate::virtual_page::VirtualPage;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alignment_helpers() {
        let a = MemoryAddress::new(0x12345);
        assert_eq!(a.align_down::<Size4K>().as_u64(), 0x12000);
        assert_eq!(a.page::<Size4K>().base().as_u64(), 0x12000);
        assert!(!a.is_aligned::<Size4K>());
        assert!(MemoryAddress::new(0x12000).is_aligned::<Size4K>());
    }

    #[test]
    fn virtual_page_of_an_address() {
        let va = VirtualAddress::new(0xFFFF_FFFF_8000_1234);
        let vp = va.page::<Size4K>();
        assert_eq!(vp.base().as_u64(), 0xFFFF_FFFF_8000_1000);
        assert_eq!(VirtualPage::<Size4K>::containing_address(va), vp);
        assert_eq!(VirtualAddress::from(vp), vp.base());

        assert!(VirtualPage::<Size4K>::try_from(va).is_err());
        assert_eq!(VirtualPage::<Size4K>::try_from(vp.base()), Ok(vp));
    }

    #[test]
    fn checked_arithmetic() {
        let va = VirtualAddress::new(0xFFFF_FFFF_FFFF_F000);
        assert_eq!(va.checked_add(0xFFF), Some(VirtualAddress::new(u64::MAX)));
        assert_eq!(va.checked_add(Size4K::SIZE), None);
        assert_eq!(va + 0x10, VirtualAddress::new(0xFFFF_FFFF_FFFF_F010));
    }

    #[test]
    fn formatting() {
        let va = VirtualAddress::new(0xB000);
        assert_eq!(format!("{va}"), "0x000000000000B000");
        assert_eq!(format!("{va:?}"), "VA(0x000000000000B000)");
        assert_eq!(format!("{}", va.page::<Size4K>()), "0x000000000000B000/4K");
    }
}
