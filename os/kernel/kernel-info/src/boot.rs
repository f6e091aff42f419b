//! # Boot Memory Map
//!
//! The boot collaborator hands the memory core an ordered list of physical
//! regions plus one direct-map offset (`virtual = physical + offset`). Both are
//! consumed once and retained for the kernel's lifetime.

/// Type of a physical memory region as reported by the boot loader.
#[repr(u32)]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum MemoryRegionKind {
    /// Free RAM the kernel may hand out.
    Usable = 0,
    Reserved = 1,
    AcpiReclaimable = 2,
    AcpiNvs = 3,
    BadMemory = 4,
    /// Loader data that may be reclaimed once the kernel no longer needs it.
    BootloaderReclaimable = 5,
    KernelAndModules = 6,
    Framebuffer = 7,
}

impl MemoryRegionKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Usable => "usable",
            Self::Reserved => "reserved",
            Self::AcpiReclaimable => "acpi-reclaimable",
            Self::AcpiNvs => "acpi-nvs",
            Self::BadMemory => "bad",
            Self::BootloaderReclaimable => "bootloader-reclaimable",
            Self::KernelAndModules => "kernel-and-modules",
            Self::Framebuffer => "framebuffer",
        }
    }
}

/// One `{base, length, kind}` entry of the boot memory map.
#[repr(C)]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct MemoryRegion {
    pub base: u64,
    pub length: u64,
    pub kind: MemoryRegionKind,
}

impl MemoryRegion {
    #[must_use]
    pub const fn new(base: u64, length: u64, kind: MemoryRegionKind) -> Self {
        Self { base, length, kind }
    }

    #[must_use]
    pub const fn usable(base: u64, length: u64) -> Self {
        Self::new(base, length, MemoryRegionKind::Usable)
    }

    /// Exclusive end address, saturating at `u64::MAX`.
    #[inline]
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.base.saturating_add(self.length)
    }

    #[inline]
    #[must_use]
    pub const fn is_usable(&self) -> bool {
        matches!(self.kind, MemoryRegionKind::Usable)
    }

    #[inline]
    #[must_use]
    pub const fn contains(&self, addr: u64) -> bool {
        addr >= self.base && addr < self.end()
    }
}

/// Borrowed view over the boot memory map.
#[derive(Debug, Copy, Clone)]
pub struct MemoryMap<'a> {
    regions: &'a [MemoryRegion],
}

impl<'a> MemoryMap<'a> {
    #[must_use]
    pub const fn new(regions: &'a [MemoryRegion]) -> Self {
        Self { regions }
    }

    #[must_use]
    pub const fn regions(&self) -> &'a [MemoryRegion] {
        self.regions
    }

    pub fn iter(&self) -> impl Iterator<Item = &'a MemoryRegion> + 'a {
        self.regions.iter()
    }

    pub fn usable(&self) -> impl Iterator<Item = &'a MemoryRegion> + 'a {
        self.regions.iter().filter(|r| r.is_usable())
    }

    /// Sum of all region lengths, regardless of kind.
    #[must_use]
    pub fn total_length(&self) -> u64 {
        self.regions
            .iter()
            .fold(0u64, |acc, r| acc.saturating_add(r.length))
    }

    /// Exclusive end of the highest usable region, or `0` if there is none.
    #[must_use]
    pub fn highest_usable_end(&self) -> u64 {
        self.usable().map(MemoryRegion::end).max().unwrap_or(0)
    }

    /// The largest usable region; the first one wins on ties.
    #[must_use]
    pub fn largest_usable(&self) -> Option<&'a MemoryRegion> {
        self.usable()
            .fold(None, |best: Option<&MemoryRegion>, r| match best {
                Some(b) if b.length >= r.length => Some(b),
                _ => Some(r),
            })
    }

    /// Returns `true` if `[addr, addr + len)` lies inside a single usable region.
    #[must_use]
    pub fn is_usable_range(&self, addr: u64, len: u64) -> bool {
        let Some(end) = addr.checked_add(len) else {
            return false;
        };
        self.usable().any(|r| addr >= r.base && end <= r.end())
    }
}

/// Everything the memory core takes from the boot collaborator.
#[derive(Debug, Copy, Clone)]
pub struct BootMemoryInfo<'a> {
    pub memory_map: MemoryMap<'a>,
    /// `virtual = physical + direct_map_offset` for every physical frame.
    pub direct_map_offset: u64,
}
