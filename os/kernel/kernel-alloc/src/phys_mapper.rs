//! # Direct-map [`PhysMapper`]
//!
//! The boot loader maps all physical memory at a fixed offset, so every
//! physical address `pa` is reachable at `offset + pa`. The memory core uses
//! this window to edit translation tables, zero fresh frames and store the
//! frame bitmap without ever going through the tables it is editing.
//!
//! ```rust
//! use kernel_alloc::phys_mapper::DirectMap;
//! use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
//!
//! let dm = DirectMap::new(0xffff_8000_0000_0000);
//! let va = dm.phys_to_virt(PhysicalAddress::new(0x1234_0000)).unwrap();
//! assert_eq!(va.as_u64(), 0xffff_8000_1234_0000);
//! assert_eq!(dm.virt_to_phys(va), Some(PhysicalAddress::new(0x1234_0000)));
//! assert_eq!(dm.virt_to_phys(VirtualAddress::new(0x1000)), None);
//! ```

use kernel_info::memory::DIRECT_MAP_WINDOW;
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
use kernel_vmem::PhysMapper;

/// [`PhysMapper`] for a fixed-offset direct map covering `window` bytes of
/// physical memory.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct DirectMap {
    offset: u64,
    window: u64,
}

impl DirectMap {
    /// Direct map at `offset` covering [`DIRECT_MAP_WINDOW`].
    #[must_use]
    pub const fn new(offset: u64) -> Self {
        Self::with_window(offset, DIRECT_MAP_WINDOW)
    }

    #[must_use]
    pub const fn with_window(offset: u64, window: u64) -> Self {
        Self { offset, window }
    }

    #[inline]
    #[must_use]
    pub const fn offset(&self) -> u64 {
        self.offset
    }

    #[inline]
    #[must_use]
    pub const fn window(&self) -> u64 {
        self.window
    }

    /// Whether `[pa, pa + len)` is reachable through the window.
    #[inline]
    #[must_use]
    pub const fn covers(&self, pa: PhysicalAddress, len: u64) -> bool {
        match pa.as_u64().checked_add(len) {
            Some(end) => end <= self.window,
            None => false,
        }
    }

    /// `offset + pa`, if `pa` lies inside the window.
    #[inline]
    #[must_use]
    pub const fn phys_to_virt(&self, pa: PhysicalAddress) -> Option<VirtualAddress> {
        if pa.as_u64() < self.window {
            Some(VirtualAddress::new(self.offset.wrapping_add(pa.as_u64())))
        } else {
            None
        }
    }

    /// `va - offset`, if `va` lies inside the window.
    #[inline]
    #[must_use]
    pub const fn virt_to_phys(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        let rel = va.as_u64().wrapping_sub(self.offset);
        if va.as_u64() >= self.offset && rel < self.window {
            Some(PhysicalAddress::new(rel))
        } else {
            None
        }
    }
}

impl PhysMapper for DirectMap {
    #[inline]
    fn phys_to_ptr(&self, pa: PhysicalAddress) -> *mut u8 {
        debug_assert!(pa.as_u64() < self.window, "{pa} outside the direct map");
        VirtualAddress::new(self.offset.wrapping_add(pa.as_u64())).as_mut_ptr()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_bounds() {
        let dm = DirectMap::with_window(0x1000_0000, 0x10_0000);
        assert!(dm.covers(PhysicalAddress::new(0xF_F000), 0x1000));
        assert!(!dm.covers(PhysicalAddress::new(0xF_F000), 0x1001));
        assert!(dm.phys_to_virt(PhysicalAddress::new(0x10_0000)).is_none());
        assert!(dm.virt_to_phys(VirtualAddress::new(0x0FFF_FFFF)).is_none());
        assert_eq!(
            dm.virt_to_phys(VirtualAddress::new(0x1000_0042)),
            Some(PhysicalAddress::new(0x42))
        );
    }
}
