//! # Address Space (x86-64, PML4-rooted)
//!
//! A handle over **one** translation tree, identified by its root frame and
//! edited through a [`PhysMapper`]. The handle does not own the frames and
//! never touches the processor; loading CR3 and invalidating translation
//! caches is left to the caller (see [`Mmu`](crate::Mmu)).
//!
//! ## Kernel half
//!
//! Root entries `256..512` cover the kernel half. New spaces copy those
//! entries from the kernel root ([`AddressSpace::share_kernel_half`]), so both
//! trees point at the **same** lower-level tables. Teardown
//! ([`AddressSpace::teardown_lower_half`]) only ever walks entries `0..256`.

use crate::walk::{self, Mode};
use crate::{FrameAlloc, PageEntry, PageFlags, PhysMapper, TableLevel, WalkError, table_mut};
use kernel_info::memory::{KERNEL_HALF_FIRST_INDEX, TABLE_ENTRIES};
use kernel_memory_addresses::{PhysicalAddress, PhysicalFrame, VirtualAddress};

/// Handle to a single, concrete address space.
pub struct AddressSpace<'m, M: PhysMapper> {
    root: PhysicalFrame,
    mapper: &'m M,
}

/// Frames released by [`AddressSpace::teardown_lower_half`].
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct Teardown {
    /// Data frames mapped by 4 KiB leaves.
    pub leaves: usize,
    /// Intermediate tables (PDPT, PD, PT).
    pub tables: usize,
}

impl<'m, M: PhysMapper> AddressSpace<'m, M> {
    #[inline]
    pub const fn from_root(mapper: &'m M, root: PhysicalFrame) -> Self {
        Self { root, mapper }
    }

    #[inline]
    pub const fn root(&self) -> PhysicalFrame {
        self.root
    }

    #[inline]
    pub const fn mapper(&self) -> &'m M {
        self.mapper
    }

    /// Zero the root table. Only valid for a freshly allocated root.
    pub fn clear(&self) {
        unsafe { self.mapper.zero_frame(self.root) };
    }

    /// Install `va → frame` as a 4 KiB leaf with `flags` (PRESENT is implied).
    ///
    /// Missing intermediate tables are taken from `alloc`. An existing leaf is
    /// overwritten; the previous entry is returned so the caller can decide
    /// about its frame and translation-cache maintenance.
    ///
    /// # Errors
    /// [`WalkError::OutOfMemory`] if a table could not be allocated,
    /// [`WalkError::HugePage`] if a huge page already covers `va`.
    pub fn map_one<A: FrameAlloc>(
        &self,
        alloc: &mut A,
        va: VirtualAddress,
        frame: PhysicalFrame,
        flags: PageFlags,
    ) -> Result<PageEntry, WalkError> {
        let mode = Mode::Create {
            alloc,
            table_flags: PageFlags::for_table(flags),
        };
        let mut slot = unsafe { walk::walk(self.mapper, self.root, va.page_base(), mode) }?;
        let previous = slot.entry();
        slot.set(PageEntry::mapping(frame, flags | PageFlags::PRESENT));
        Ok(previous)
    }

    /// Clear the 4 KiB leaf for `va` and return the frame it mapped.
    ///
    /// Only the leaf is touched; tables stay in place.
    ///
    /// # Errors
    /// [`WalkError::Absent`] if any level, including the leaf, is not present.
    /// [`WalkError::HugePage`] if `va` is covered by a huge page.
    pub fn unmap_one(&self, va: VirtualAddress) -> Result<PhysicalFrame, WalkError> {
        let mut slot = unsafe { walk::lookup(self.mapper, self.root, va.page_base()) }?;
        if slot.level() != TableLevel::Pt {
            return Err(WalkError::HugePage(slot.level()));
        }
        let e = slot.entry();
        if !e.present() {
            return Err(WalkError::Absent(TableLevel::Pt));
        }
        slot.set(PageEntry::new());
        Ok(e.frame())
    }

    /// Rewrite the permission bits of the leaf for `va`, keeping its frame.
    ///
    /// # Errors
    /// Same as [`unmap_one`](Self::unmap_one).
    pub fn update_flags(&self, va: VirtualAddress, flags: PageFlags) -> Result<(), WalkError> {
        let mut slot = unsafe { walk::lookup(self.mapper, self.root, va.page_base()) }?;
        if slot.level() != TableLevel::Pt {
            return Err(WalkError::HugePage(slot.level()));
        }
        let e = slot.entry();
        if !e.present() {
            return Err(WalkError::Absent(TableLevel::Pt));
        }
        slot.set(e.with_flags(flags | PageFlags::PRESENT));
        Ok(())
    }

    /// Translate `va` to the physical address and leaf flags it maps to.
    ///
    /// Huge-page leaves are resolved by adding the offset inside the huge page.
    #[must_use]
    pub fn translate(&self, va: VirtualAddress) -> Option<(PhysicalAddress, PageFlags)> {
        let slot = unsafe { walk::lookup(self.mapper, self.root, va) }.ok()?;
        let e = slot.entry();
        if !e.present() {
            return None;
        }
        let span = slot.level().entry_span();
        let base = e.frame().base().as_u64() & !(span - 1);
        let flags = e.flags();
        Some((PhysicalAddress::new(base | (va.as_u64() & (span - 1))), flags))
    }

    /// Physical address `va` maps to, if any.
    #[inline]
    #[must_use]
    pub fn query(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        self.translate(va).map(|(pa, _)| pa)
    }

    #[inline]
    #[must_use]
    pub fn is_mapped(&self, va: VirtualAddress) -> bool {
        self.translate(va).is_some()
    }

    /// Copy the kernel-half root entries of `kernel_root` into this root.
    ///
    /// The entries are copied, not the tables below them.
    pub fn share_kernel_half(&self, kernel_root: PhysicalFrame) {
        if kernel_root == self.root {
            return;
        }
        let src = unsafe { table_mut(self.mapper, kernel_root) };
        let dst = unsafe { table_mut(self.mapper, self.root) };
        for i in KERNEL_HALF_FIRST_INDEX..TABLE_ENTRIES {
            dst.set(i, src.get(i));
        }
    }

    /// Index of the first lower-half root entry whose table frame is also
    /// referenced by a kernel-half root entry, if any.
    ///
    /// Tearing down such a space would free tables the kernel still uses.
    #[must_use]
    pub fn lower_half_aliases_kernel(&self) -> Option<usize> {
        let root = unsafe { table_mut(self.mapper, self.root) };
        (0..KERNEL_HALF_FIRST_INDEX).find(|&lo| {
            let e = root.get(lo);
            e.is_table()
                && (KERNEL_HALF_FIRST_INDEX..TABLE_ENTRIES).any(|hi| {
                    let k = root.get(hi);
                    k.is_table() && k.frame() == e.frame()
                })
        })
    }

    /// Free every frame reachable through root entries `0..256`: mapped
    /// 4 KiB data frames and the tables themselves. Clears those root
    /// entries. The root frame and the kernel half are left alone.
    ///
    /// Huge-page leaves in the lower half are unlinked but their frames are
    /// not returned, since they were never handed out one by one.
    pub fn teardown_lower_half<A: FrameAlloc>(&self, alloc: &mut A) -> Teardown {
        let mut stats = Teardown::default();
        let root = unsafe { table_mut(self.mapper, self.root) };
        for i in 0..KERNEL_HALF_FIRST_INDEX {
            let e = root.get(i);
            if e.is_table() {
                self.free_subtree(e.frame(), TableLevel::Pdpt, alloc, &mut stats);
            }
            root.set(i, PageEntry::new());
        }
        stats
    }

    fn free_subtree<A: FrameAlloc>(
        &self,
        table: PhysicalFrame,
        level: TableLevel,
        alloc: &mut A,
        stats: &mut Teardown,
    ) {
        let t = unsafe { table_mut(self.mapper, table) };
        for i in 0..TABLE_ENTRIES {
            let e = t.get(i);
            if !e.present() {
                continue;
            }
            match level.next() {
                Some(next) if e.is_table() => self.free_subtree(e.frame(), next, alloc, stats),
                Some(_) => log::warn!("teardown: skipping huge leaf at {level:?}[{i}]"),
                None => {
                    alloc.free_4k(e.frame());
                    stats.leaves += 1;
                }
            }
        }
        alloc.free_4k(table);
        stats.tables += 1;
    }

    /// Call `f` for every present 4 KiB leaf in the lower half, in ascending
    /// address order.
    pub fn for_each_lower_mapping(&self, mut f: impl FnMut(VirtualAddress, PageEntry)) {
        let root = unsafe { table_mut(self.mapper, self.root) };
        for i in 0..KERNEL_HALF_FIRST_INDEX {
            let e = root.get(i);
            if e.is_table() {
                let base = (i as u64) << TableLevel::Pml4.shift();
                self.visit(e.frame(), TableLevel::Pdpt, base, &mut f);
            }
        }
    }

    fn visit(
        &self,
        table: PhysicalFrame,
        level: TableLevel,
        base: u64,
        f: &mut impl FnMut(VirtualAddress, PageEntry),
    ) {
        let t = unsafe { table_mut(self.mapper, table) };
        for i in 0..TABLE_ENTRIES {
            let e = t.get(i);
            if !e.present() {
                continue;
            }
            let va = base | ((i as u64) << level.shift());
            match level.next() {
                Some(next) if e.is_table() => self.visit(e.frame(), next, va, f),
                Some(_) => {}
                None => f(VirtualAddress::new(va), e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{BumpAlloc, TestPhys};

    fn flags() -> PageFlags {
        PageFlags::WRITABLE | PageFlags::NO_EXECUTE
    }

    #[test]
    fn map_query_unmap() {
        let phys = TestPhys::with_frames(32);
        let mut alloc = BumpAlloc::new(1, 32);
        let space = AddressSpace::from_root(&phys, alloc.alloc_4k().unwrap());

        let va = VirtualAddress::new(0x0000_0000_4000_0000);
        let frame = PhysicalFrame::from_index(0x30);
        let prev = space.map_one(&mut alloc, va, frame, flags()).unwrap();
        assert!(!prev.present());

        assert!(space.is_mapped(va));
        assert_eq!(space.query(va + 0x123), Some(PhysicalAddress::new(0x30_123)));
        let (_, f) = space.translate(va).unwrap();
        assert!(f.contains(PageFlags::PRESENT | PageFlags::WRITABLE | PageFlags::NO_EXECUTE));

        assert_eq!(space.unmap_one(va), Ok(frame));
        assert!(!space.is_mapped(va));
        assert_eq!(space.unmap_one(va), Err(WalkError::Absent(TableLevel::Pt)));
    }

    #[test]
    fn unmap_of_never_mapped_region_reports_missing_level() {
        let phys = TestPhys::with_frames(8);
        let mut alloc = BumpAlloc::new(1, 8);
        let space = AddressSpace::from_root(&phys, alloc.alloc_4k().unwrap());
        assert_eq!(
            space.unmap_one(VirtualAddress::new(0x1000)),
            Err(WalkError::Absent(TableLevel::Pml4))
        );
    }

    #[test]
    fn update_flags_keeps_frame() {
        let phys = TestPhys::with_frames(32);
        let mut alloc = BumpAlloc::new(1, 32);
        let space = AddressSpace::from_root(&phys, alloc.alloc_4k().unwrap());
        let va = VirtualAddress::new(0x7000);
        space
            .map_one(&mut alloc, va, PhysicalFrame::from_index(9), flags())
            .unwrap();
        space.update_flags(va, PageFlags::NO_EXECUTE).unwrap();
        let (pa, f) = space.translate(va).unwrap();
        assert_eq!(pa.as_u64(), 0x9000);
        assert!(!f.contains(PageFlags::WRITABLE));
    }

    #[test]
    fn kernel_half_is_shared_not_copied() {
        let phys = TestPhys::with_frames(32);
        let mut alloc = BumpAlloc::new(1, 32);
        let kernel = AddressSpace::from_root(&phys, alloc.alloc_4k().unwrap());
        let kva = VirtualAddress::new(0xFFFF_FFFF_9000_0000);
        kernel
            .map_one(&mut alloc, kva, PhysicalFrame::from_index(20), flags())
            .unwrap();

        let user = AddressSpace::from_root(&phys, alloc.alloc_4k().unwrap());
        let before = alloc.next;
        user.share_kernel_half(kernel.root());
        assert_eq!(alloc.next, before);
        assert_eq!(user.query(kva), kernel.query(kva));

        // a later kernel-half mapping under an existing root entry is visible in both
        kernel
            .map_one(&mut alloc, kva + 0x1000, PhysicalFrame::from_index(21), flags())
            .unwrap();
        assert!(user.is_mapped(kva + 0x1000));
        assert_eq!(user.lower_half_aliases_kernel(), None);
    }

    #[test]
    fn teardown_frees_lower_half_only() {
        let phys = TestPhys::with_frames(64);
        let mut alloc = BumpAlloc::new(1, 64);
        let kernel = AddressSpace::from_root(&phys, alloc.alloc_4k().unwrap());
        let kva = VirtualAddress::new(0xFFFF_FFFF_8000_0000);
        kernel
            .map_one(&mut alloc, kva, PhysicalFrame::from_index(40), flags())
            .unwrap();

        let user = AddressSpace::from_root(&phys, alloc.alloc_4k().unwrap());
        user.share_kernel_half(kernel.root());
        let a = alloc.alloc_4k().unwrap();
        let b = alloc.alloc_4k().unwrap();
        user.map_one(&mut alloc, VirtualAddress::new(0x1000), a, flags())
            .unwrap();
        user.map_one(&mut alloc, VirtualAddress::new(0x40_0000), b, flags())
            .unwrap();

        let mut seen = std::vec::Vec::new();
        user.for_each_lower_mapping(|va, e| seen.push((va.as_u64(), e.frame())));
        assert_eq!(seen, [(0x1000, a), (0x40_0000, b)]);

        let stats = user.teardown_lower_half(&mut alloc);
        // PDPT + PD + two PTs
        assert_eq!(stats, Teardown { leaves: 2, tables: 4 });
        assert!(alloc.freed.contains(&a) && alloc.freed.contains(&b));
        assert!(!user.is_mapped(VirtualAddress::new(0x1000)));
        assert!(user.is_mapped(kva));
        assert!(kernel.is_mapped(kva));
    }

    #[test]
    fn aliasing_lower_entry_is_reported() {
        let phys = TestPhys::with_frames(32);
        let mut alloc = BumpAlloc::new(1, 32);
        let kernel = AddressSpace::from_root(&phys, alloc.alloc_4k().unwrap());
        kernel
            .map_one(
                &mut alloc,
                VirtualAddress::new(0xFFFF_FFFF_8000_0000),
                PhysicalFrame::from_index(30),
                flags(),
            )
            .unwrap();

        let user = AddressSpace::from_root(&phys, alloc.alloc_4k().unwrap());
        user.share_kernel_half(kernel.root());
        let root = unsafe { table_mut(&phys, user.root()) };
        root.set(3, root.get(511));
        assert_eq!(user.lower_half_aliases_kernel(), Some(3));
    }
}
