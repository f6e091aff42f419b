use bitfield_struct::bitfield;

#[cfg(feature = "asm")]
use crate::{LoadRegisterUnsafe, StoreRegisterUnsafe};

/// CR0 in 64-bit mode. Reserved bits are kept at 0.
#[bitfield(u64)]
pub struct Cr0 {
    /// Bit 0: protected mode enable.
    pub pe_protection_enable: bool,
    /// Bit 1
    pub mp_monitor_coprocessor: bool,
    /// Bit 2
    pub em_emulation: bool,
    /// Bit 3
    pub ts_task_switched: bool,
    /// Bit 4
    pub et_extension_type: bool,
    /// Bit 5
    pub ne_numeric_error: bool,
    #[bits(10, default = 0)]
    _reserved_6_15: u16,
    /// Bit 16: supervisor writes honour read-only pages.
    pub wp_write_protect: bool,
    #[bits(default = 0)]
    _reserved_17: bool,
    /// Bit 18
    pub am_alignment_mask: bool,
    #[bits(10, default = 0)]
    _reserved_19_28: u16,
    /// Bit 29
    pub nw_not_write_through: bool,
    /// Bit 30
    pub cd_cache_disable: bool,
    /// Bit 31: paging enabled. If set when the memory core starts, the boot
    /// loader's root table is adopted instead of building a new one.
    pub pg_paging: bool,
    #[bits(32, default = 0)]
    _reserved_32_63: u32,
}

impl Cr0 {
    /// Whether address translation is active.
    #[inline]
    #[must_use]
    pub const fn translation_enabled(&self) -> bool {
        self.pg_paging() && self.pe_protection_enable()
    }
}

#[cfg(feature = "asm")]
impl LoadRegisterUnsafe for Cr0 {
    unsafe fn load_unsafe() -> Self {
        let cr0: u64;
        unsafe {
            core::arch::asm!("mov {}, cr0", out(reg) cr0, options(nomem, nostack, preserves_flags));
        }
        Self::from_bits(cr0)
    }
}

#[cfg(feature = "asm")]
impl StoreRegisterUnsafe for Cr0 {
    unsafe fn store_unsafe(self) {
        let cr0 = self.into_bits();
        unsafe {
            core::arch::asm!("mov cr0, {}", in(reg) cr0, options(nostack, preserves_flags));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paging_bit_position() {
        let cr0 = Cr0::from_bits(0x8000_0011);
        assert!(cr0.pg_paging());
        assert!(cr0.pe_protection_enable());
        assert!(cr0.translation_enabled());
        assert!(!Cr0::from_bits(0x11).translation_enabled());
    }
}
