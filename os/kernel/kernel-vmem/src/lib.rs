//! # Virtual Memory Support
//!
//! x86-64 four-level translation trees, walked and edited through a direct
//! map of physical memory.
//!
//! ## What you get
//! - [`PageEntry`] / [`PageFlags`]: one translation entry and its permission bits.
//! - [`PageTable`] and [`TableLevel`]: a 512-entry table and the VA index split.
//! - [`walk`](walk::walk): the single walk-or-create primitive behind every
//!   lookup, map and unmap.
//! - [`AddressSpace`]: a handle over one root table with map / unmap / query,
//!   kernel-half sharing and lower-half teardown.
//! - The seams to the rest of the kernel: [`FrameAlloc`], [`PhysMapper`]
//!   and [`Mmu`].
//!
//! ## x86-64 Virtual Address → Physical Address Walk
//!
//! ```text
//! | 47‒39 | 38‒30 | 29‒21 | 20‒12 | 11‒0   |
//! |  PML4 |  PDPT |   PD  |   PT  | Offset |
//!
//!  PML4  →  PDPT  →  PD  →  PT  →  4 KiB frame
//!             │        └─ PS=1 → 2 MiB leaf
//!             └────────── PS=1 → 1 GiB leaf
//! ```
//!
//! Tables are never dereferenced through their own mappings. Every table
//! frame is reached as `direct_map_offset + physical`, so editing a tree that
//! is not active (or not yet complete) never faults.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod address_space;
mod entry;
mod mmu;
mod table;
pub mod walk;

pub use crate::address_space::{AddressSpace, Teardown};
pub use crate::entry::{PageEntry, PageFlags};
#[cfg(feature = "asm")]
pub use crate::mmu::HardwareMmu;
pub use crate::mmu::Mmu;
pub use crate::table::{PageTable, TableLevel};
pub use crate::walk::WalkError;

use kernel_memory_addresses::{FRAME_SIZE, PhysicalAddress, PhysicalFrame};

/// Source of physical 4 KiB frames for translation tables and mapped pages.
pub trait FrameAlloc {
    /// Allocate one frame, or `None` when physical memory is exhausted.
    fn alloc_4k(&mut self) -> Option<PhysicalFrame>;

    /// Return a frame obtained from [`alloc_4k`](Self::alloc_4k).
    fn free_4k(&mut self, frame: PhysicalFrame);
}

/// Gives the kernel a usable pointer for any physical address, typically via
/// a fixed-offset direct map.
pub trait PhysMapper {
    /// Virtual pointer through which the byte at `pa` can be accessed.
    fn phys_to_ptr(&self, pa: PhysicalAddress) -> *mut u8;

    /// Borrow the memory at `pa` as a `T`.
    ///
    /// # Safety
    /// - `pa` must be mapped writable through this mapper and suitably
    ///   aligned for `T`.
    /// - The bytes at `pa` must be a valid `T` and must not be aliased by any
    ///   other live reference for `'a`.
    #[inline]
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        unsafe { &mut *self.phys_to_ptr(pa).cast::<T>() }
    }

    /// Fill `frame` with zeros.
    ///
    /// # Safety
    /// `frame` must be owned by the caller and mapped through this mapper.
    #[inline]
    #[allow(clippy::cast_possible_truncation)]
    unsafe fn zero_frame(&self, frame: PhysicalFrame) {
        unsafe {
            core::ptr::write_bytes(self.phys_to_ptr(frame.base()), 0, FRAME_SIZE as usize);
        }
    }
}

/// Borrow the table stored in `frame`.
///
/// # Safety
/// `frame` must hold a translation table reachable through `m`, and no other
/// reference to it may be live.
#[inline]
pub(crate) unsafe fn table_mut<'a, M: PhysMapper>(m: &M, frame: PhysicalFrame) -> &'a mut PageTable {
    unsafe { m.phys_to_mut::<PageTable>(frame.base()) }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::cell::UnsafeCell;
    use std::vec::Vec;

    #[repr(C, align(4096))]
    pub struct Aligned4K([u8; 4096]);

    /// Simulated physical memory: frame `n` is `frames[n]`.
    pub struct TestPhys {
        frames: UnsafeCell<Vec<Aligned4K>>,
    }

    impl TestPhys {
        pub fn with_frames(n: usize) -> Self {
            let frames = (0..n).map(|_| Aligned4K([0; 4096])).collect();
            Self {
                frames: UnsafeCell::new(frames),
            }
        }
    }

    impl PhysMapper for TestPhys {
        fn phys_to_ptr(&self, pa: PhysicalAddress) -> *mut u8 {
            let idx = usize::try_from(pa.frame().index()).unwrap();
            let off = usize::try_from(pa.frame_offset()).unwrap();
            let frames = unsafe { &mut *self.frames.get() };
            unsafe { frames[idx].0.as_mut_ptr().add(off) }
        }
    }

    /// Hands out frames `next..end` and remembers what was freed.
    pub struct BumpAlloc {
        pub next: u64,
        pub end: u64,
        pub freed: Vec<PhysicalFrame>,
    }

    impl BumpAlloc {
        pub fn new(next: u64, end: u64) -> Self {
            Self {
                next,
                end,
                freed: Vec::new(),
            }
        }

        pub fn allocated(&self, start: u64) -> u64 {
            self.next - start
        }
    }

    impl FrameAlloc for BumpAlloc {
        fn alloc_4k(&mut self) -> Option<PhysicalFrame> {
            if self.next >= self.end {
                return None;
            }
            let f = PhysicalFrame::from_index(self.next);
            self.next += 1;
            Some(f)
        }

        fn free_4k(&mut self, frame: PhysicalFrame) {
            self.freed.push(frame);
        }
    }
}
