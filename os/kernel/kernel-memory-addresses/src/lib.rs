//! # Virtual and Physical Memory Address Types
//!
//! Strongly typed wrappers for raw addresses and 4 KiB frames used by the
//! frame allocator, the page-table walker and the heap.
//!
//! | Type | Meaning |
//! |------|---------|
//! | [`PhysicalAddress`] | A byte address in physical memory (RAM or MMIO). |
//! | [`VirtualAddress`] | A byte address translated by the paging hardware. |
//! | [`PhysicalFrame`] | A 4 KiB aligned physical frame, identified by its index. |
//!
//! ```rust
//! # use kernel_memory_addresses::*;
//! let pa = PhysicalAddress::new(0x0010_2042);
//! let frame = pa.frame();
//! assert_eq!(frame.index(), 0x102);
//! assert_eq!(frame.base() + pa.frame_offset(), pa);
//! ```
//!
//! All types are `#[repr(transparent)]` over `u64` and therefore zero-cost.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod physical_address;
mod virtual_address;

pub use physical_address::{PhysicalAddress, PhysicalFrame};
pub use virtual_address::VirtualAddress;

/// Size of a physical frame and of a base page, in bytes.
pub const FRAME_SIZE: u64 = 4096;

/// `log2(FRAME_SIZE)`.
pub const FRAME_SHIFT: u32 = 12;

const _: () = assert!(1 << FRAME_SHIFT == FRAME_SIZE);

/// Round `x` down to a multiple of `align` (a power of two).
#[inline]
#[must_use]
pub const fn align_down(x: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two());
    x & !(align - 1)
}

/// Round `x` up to a multiple of `align` (a power of two).
///
/// Returns `None` if the result does not fit into `u64`.
#[inline]
#[must_use]
pub const fn align_up(x: u64, align: u64) -> Option<u64> {
    debug_assert!(align.is_power_of_two());
    match x.checked_add(align - 1) {
        Some(v) => Some(v & !(align - 1)),
        None => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_helpers() {
        assert_eq!(align_down(0x1FFF, FRAME_SIZE), 0x1000);
        assert_eq!(align_up(0x1001, FRAME_SIZE), Some(0x2000));
        assert_eq!(align_up(0x2000, FRAME_SIZE), Some(0x2000));
        assert_eq!(align_up(u64::MAX, FRAME_SIZE), None);
    }

    #[test]
    fn frame_round_trip() {
        let pa = PhysicalAddress::new(0x0010_2042);
        assert_eq!(pa.frame().index(), 0x102);
        assert_eq!(pa.frame_offset(), 0x42);
        assert_eq!(pa.frame().base().as_u64(), 0x0010_2000);
        assert!(PhysicalFrame::from_aligned(pa).is_none());
        assert_eq!(
            PhysicalFrame::from_aligned(PhysicalAddress::new(0x3000)),
            Some(PhysicalFrame::from_index(3))
        );
    }

    #[test]
    fn virtual_alignment() {
        let va = VirtualAddress::new(0xFFFF_FFFF_8000_1234);
        assert!(!va.is_page_aligned());
        assert_eq!(va.page_base().as_u64(), 0xFFFF_FFFF_8000_1000);
        assert_eq!(va.page_offset(), 0x234);
    }
}
