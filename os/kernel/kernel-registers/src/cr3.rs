use bitfield_struct::bitfield;
use kernel_memory_addresses::PhysicalAddress;

#[cfg(feature = "asm")]
use crate::{LoadRegisterUnsafe, StoreRegisterUnsafe};

/// CR3 with PCID disabled: physical base of the root translation table plus
/// the cache-control bits used for walks through it.
#[bitfield(u64)]
pub struct Cr3 {
    #[bits(3, default = 0)]
    _reserved0: u8,

    /// Bit 3: page-level write-through for the root table.
    pub pwt: bool,

    /// Bit 4: page-level cache disable for the root table.
    pub pcd: bool,

    #[bits(7, default = 0)]
    _reserved1: u8,

    /// Bits 12-51: root table physical base >> 12.
    #[bits(40)]
    root_base_4k: u64,

    #[bits(12, default = 0)]
    _reserved2: u16,
}

impl Cr3 {
    /// `root` must be 4 KiB aligned.
    #[must_use]
    pub fn from_root(root: PhysicalAddress) -> Self {
        debug_assert!(root.is_frame_aligned(), "root table must be 4K-aligned");
        Self::new().with_root_base_4k(root.as_u64() >> 12)
    }

    /// Physical address of the root translation table.
    #[must_use]
    pub fn root(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.root_base_4k() << 12)
    }
}

#[cfg(feature = "asm")]
impl LoadRegisterUnsafe for Cr3 {
    unsafe fn load_unsafe() -> Self {
        let cr3: u64;
        unsafe {
            core::arch::asm!("mov {}, cr3", out(reg) cr3, options(nomem, nostack, preserves_flags));
        }
        Self::from_bits(cr3)
    }
}

#[cfg(feature = "asm")]
impl StoreRegisterUnsafe for Cr3 {
    unsafe fn store_unsafe(self) {
        let cr3 = self.into_bits();
        unsafe {
            core::arch::asm!("mov cr3, {}", in(reg) cr3, options(nostack, preserves_flags));
        }
    }
}
