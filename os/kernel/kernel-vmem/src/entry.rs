use bitfield_struct::bitfield;
use bitflags::bitflags;
use kernel_memory_addresses::PhysicalFrame;

/// One 64-bit x86-64 translation entry, identical at all four levels.
///
/// | Bits  | Field            |
/// |-------|------------------|
/// | 0     | present          |
/// | 1     | writable         |
/// | 2     | user             |
/// | 3     | write-through    |
/// | 4     | cache disable    |
/// | 5     | accessed         |
/// | 6     | dirty (leaf)     |
/// | 7     | huge page (PS)   |
/// | 8     | global (leaf)    |
/// | 9-11  | available to OS  |
/// | 12-51 | frame number     |
/// | 52-62 | available to OS  |
/// | 63    | no-execute       |
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct PageEntry {
    pub present: bool,
    pub writable: bool,
    pub user: bool,
    pub write_through: bool,
    pub cache_disabled: bool,
    pub accessed: bool,
    pub dirty: bool,
    /// PS: the entry maps a 1 GiB (level 3) or 2 MiB (level 2) page instead
    /// of pointing to a table.
    pub huge_page: bool,
    pub global: bool,
    #[bits(3)]
    pub os_available_low: u8,
    #[bits(40)]
    frame_number: u64,
    #[bits(11)]
    pub os_available_high: u16,
    pub no_execute: bool,
}

impl PageEntry {
    /// An entry pointing at `frame` with the permission bits from `flags`.
    #[inline]
    #[must_use]
    pub const fn mapping(frame: PhysicalFrame, flags: PageFlags) -> Self {
        Self::from_bits(flags.bits()).with_frame_number(frame.index())
    }

    #[inline]
    #[must_use]
    pub const fn frame(&self) -> PhysicalFrame {
        PhysicalFrame::from_index(self.frame_number())
    }

    /// The flag bits of this entry, without the frame number.
    #[inline]
    #[must_use]
    pub const fn flags(&self) -> PageFlags {
        PageFlags::from_bits_truncate(self.into_bits())
    }

    /// Replace the flag bits, keeping the frame.
    #[inline]
    #[must_use]
    pub const fn with_flags(self, flags: PageFlags) -> Self {
        Self::mapping(self.frame(), flags)
    }

    /// Present and pointing to a next-level table.
    #[inline]
    #[must_use]
    pub const fn is_table(&self) -> bool {
        self.present() && !self.huge_page()
    }
}

bitflags! {
    /// Permission and caching bits of a translation entry.
    ///
    /// Bit positions match the architecture; see [`PageEntry`].
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct PageFlags: u64 {
        const PRESENT = 1 << 0;
        const WRITABLE = 1 << 1;
        const USER = 1 << 2;
        const WRITE_THROUGH = 1 << 3;
        const CACHE_DISABLE = 1 << 4;
        const ACCESSED = 1 << 5;
        const DIRTY = 1 << 6;
        const HUGE_PAGE = 1 << 7;
        const GLOBAL = 1 << 8;
        const NO_EXECUTE = 1 << 63;
    }
}

impl PageFlags {
    /// Flags for newly created intermediate tables. `USER` is added only when
    /// the leaf below asks for it.
    #[inline]
    #[must_use]
    pub const fn for_table(leaf: Self) -> Self {
        let base = Self::PRESENT.union(Self::WRITABLE);
        if leaf.contains(Self::USER) {
            base.union(Self::USER)
        } else {
            base
        }
    }

    /// Kernel read/write data.
    pub const KERNEL_DATA: Self = Self::PRESENT
        .union(Self::WRITABLE)
        .union(Self::NO_EXECUTE);

    /// User read/write data.
    pub const USER_DATA: Self = Self::KERNEL_DATA.union(Self::USER);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mapping_encodes_frame_and_flags() {
        let e = PageEntry::mapping(
            PhysicalFrame::from_index(0x300),
            PageFlags::PRESENT | PageFlags::WRITABLE | PageFlags::NO_EXECUTE,
        );
        assert_eq!(e.into_bits(), 0x8000_0000_0030_0003);
        assert!(e.present());
        assert!(e.writable());
        assert!(e.no_execute());
        assert!(!e.user());
        assert_eq!(e.frame().base().as_u64(), 0x30_0000);
    }

    #[test]
    fn flags_strip_frame_number() {
        let e = PageEntry::from_bits(0x0000_0000_1234_5067);
        assert_eq!(
            e.flags(),
            PageFlags::PRESENT
                | PageFlags::WRITABLE
                | PageFlags::USER
                | PageFlags::ACCESSED
                | PageFlags::DIRTY
        );
        assert_eq!(e.frame().index(), 0x12345);
    }

    #[test]
    fn table_flags_only_add_user_on_request() {
        assert_eq!(
            PageFlags::for_table(PageFlags::KERNEL_DATA),
            PageFlags::PRESENT | PageFlags::WRITABLE
        );
        assert!(PageFlags::for_table(PageFlags::PRESENT | PageFlags::USER).contains(PageFlags::USER));
    }

    #[test]
    fn huge_entry_is_not_a_table() {
        let e = PageEntry::new().with_present(true).with_huge_page(true);
        assert!(!e.is_table());
        assert!(e.with_huge_page(false).is_table());
    }
}
