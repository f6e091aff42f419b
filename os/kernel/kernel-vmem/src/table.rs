use crate::PageEntry;
use kernel_info::memory::TABLE_ENTRIES;
use kernel_memory_addresses::VirtualAddress;

/// One 4 KiB translation table of 512 entries, at any level.
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [PageEntry; TABLE_ENTRIES],
}

const _: () = assert!(size_of::<PageTable>() == 4096);

impl PageTable {
    #[inline]
    pub fn zero(&mut self) {
        self.entries.fill(PageEntry::new());
    }

    #[inline]
    #[must_use]
    pub const fn get(&self, index: usize) -> PageEntry {
        self.entries[index]
    }

    #[inline]
    pub const fn set(&mut self, index: usize, entry: PageEntry) {
        self.entries[index] = entry;
    }

    #[inline]
    pub const fn entry_mut(&mut self, index: usize) -> &mut PageEntry {
        &mut self.entries[index]
    }

    #[must_use]
    pub fn present_count(&self) -> usize {
        self.entries.iter().filter(|e| e.present()).count()
    }
}

/// Level of a table in the four-level tree, root first.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd)]
pub enum TableLevel {
    /// Root (PML4), indexed by VA bits 39-47.
    Pml4,
    /// Indexed by VA bits 30-38; may hold 1 GiB leaves.
    Pdpt,
    /// Indexed by VA bits 21-29; may hold 2 MiB leaves.
    Pd,
    /// Leaf level, indexed by VA bits 12-20.
    Pt,
}

impl TableLevel {
    pub const ALL: [Self; 4] = [Self::Pml4, Self::Pdpt, Self::Pd, Self::Pt];

    #[inline]
    #[must_use]
    pub const fn shift(self) -> u32 {
        match self {
            Self::Pml4 => 39,
            Self::Pdpt => 30,
            Self::Pd => 21,
            Self::Pt => 12,
        }
    }

    /// Bytes covered by one entry at this level.
    #[inline]
    #[must_use]
    pub const fn entry_span(self) -> u64 {
        1 << self.shift()
    }

    /// The 9-bit table index of `va` at this level.
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn index_of(self, va: VirtualAddress) -> usize {
        ((va.as_u64() >> self.shift()) & 0x1FF) as usize
    }

    #[inline]
    #[must_use]
    pub const fn next(self) -> Option<Self> {
        match self {
            Self::Pml4 => Some(Self::Pdpt),
            Self::Pdpt => Some(Self::Pd),
            Self::Pd => Some(Self::Pt),
            Self::Pt => None,
        }
    }

    /// Whether a present entry with PS set is a valid leaf at this level.
    #[inline]
    #[must_use]
    pub const fn allows_huge(self) -> bool {
        matches!(self, Self::Pdpt | Self::Pd)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_indices() {
        // 0xFFFF_FFFF_9000_0000: heap base
        let va = VirtualAddress::new(0xFFFF_FFFF_9000_0000);
        assert_eq!(TableLevel::Pml4.index_of(va), 511);
        assert_eq!(TableLevel::Pdpt.index_of(va), 510);
        assert_eq!(TableLevel::Pd.index_of(va), 128);
        assert_eq!(TableLevel::Pt.index_of(va), 0);

        let va = VirtualAddress::new(0x0000_0000_0040_3000);
        assert_eq!(TableLevel::Pml4.index_of(va), 0);
        assert_eq!(TableLevel::Pd.index_of(va), 2);
        assert_eq!(TableLevel::Pt.index_of(va), 3);
    }

    #[test]
    fn levels_chain_down_to_pt() {
        let mut level = TableLevel::Pml4;
        let mut n = 1;
        while let Some(next) = level.next() {
            level = next;
            n += 1;
        }
        assert_eq!(level, TableLevel::Pt);
        assert_eq!(n, TableLevel::ALL.len());
    }
}
