//! # Kernel Paging
//!
//! Owns the kernel's view of the active translation tree: which root is
//! loaded, how to reach tables (the direct map), and how to keep the
//! processor's translation caches in sync after edits.
//!
//! All tree edits go through [`AddressSpace`], which never touches the
//! processor. [`Paging`] adds the single-page invalidation after every
//! change to the active tree and the root switch used by the address-space
//! manager.
//!
//! ## Address translation
//!
//! ```text
//! virtual_to_physical(va)
//!   ├─ va ∈ [offset, offset + window)  →  va - offset       (direct map)
//!   └─ otherwise                        →  walk the active tree
//! physical_to_virtual(pa)               →  pa + offset
//! ```

use crate::frame_alloc::BitmapFrameAlloc;
use crate::phys_mapper::DirectMap;
use kernel_memory_addresses::{PhysicalAddress, PhysicalFrame, VirtualAddress};
use kernel_vmem::{AddressSpace, FrameAlloc, Mmu, PageFlags, WalkError};
use log::{debug, info};

#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PagingError {
    #[error(transparent)]
    Walk(WalkError),
    #[error("the address is not mapped")]
    NotMapped,
    #[error("virtual or physical address is not 4 KiB aligned")]
    Unaligned,
    #[error("no physical frame for the root table")]
    OutOfFrames,
}

impl From<WalkError> for PagingError {
    fn from(e: WalkError) -> Self {
        match e {
            WalkError::Absent(_) => Self::NotMapped,
            other => Self::Walk(other),
        }
    }
}

/// The active translation tree and the hardware it is loaded into.
pub struct Paging<U: Mmu> {
    direct_map: DirectMap,
    root: PhysicalFrame,
    mmu: U,
}

impl<U: Mmu> Paging<U> {
    /// Adopt the active root if translation is already enabled, otherwise
    /// build an empty root for the boot collaborator to populate and load.
    ///
    /// # Errors
    /// [`PagingError::OutOfFrames`] if a fresh root is needed and none is free.
    pub fn init(direct_map: DirectMap, mmu: U, pmm: &mut BitmapFrameAlloc) -> Result<Self, PagingError> {
        let root = if mmu.translation_enabled() {
            let root = mmu.active_root();
            info!("paging: adopted active root {:?}", root);
            root
        } else {
            let pa = pmm.alloc_zeroed_page().map_err(|_| PagingError::OutOfFrames)?;
            info!("paging: translation off, built empty root at {pa}");
            pa.frame()
        };
        Ok(Self { direct_map, root, mmu })
    }

    /// Root table of the active tree.
    #[inline]
    #[must_use]
    pub const fn root(&self) -> PhysicalFrame {
        self.root
    }

    #[inline]
    #[must_use]
    pub const fn direct_map(&self) -> &DirectMap {
        &self.direct_map
    }

    #[inline]
    #[must_use]
    pub const fn mmu(&self) -> &U {
        &self.mmu
    }

    #[inline]
    pub const fn mmu_mut(&mut self) -> &mut U {
        &mut self.mmu
    }

    /// The active tree as an [`AddressSpace`].
    #[inline]
    #[must_use]
    pub const fn space(&self) -> AddressSpace<'_, DirectMap> {
        AddressSpace::from_root(&self.direct_map, self.root)
    }

    /// Map the 4 KiB page at `va` to the frame at `pa` in the active tree.
    ///
    /// An existing mapping is replaced and its translation invalidated; the
    /// frame it pointed to is left to its owner.
    ///
    /// # Errors
    /// [`PagingError::Unaligned`] for unaligned input; walk failures such as
    /// running out of frames for intermediate tables.
    pub fn map(
        &mut self,
        pmm: &mut impl FrameAlloc,
        va: VirtualAddress,
        pa: PhysicalAddress,
        flags: PageFlags,
    ) -> Result<(), PagingError> {
        if !va.is_page_aligned() || !pa.is_frame_aligned() {
            return Err(PagingError::Unaligned);
        }
        let previous = self.space().map_one(pmm, va, pa.frame(), flags)?;
        if previous.present() {
            debug!("paging: remapped {va} from {:?} to {pa}", previous.frame());
        }
        self.mmu.invalidate_page(va);
        Ok(())
    }

    /// Remove the mapping for `va`, invalidate it and return its frame to
    /// `pmm`. Frames the allocator does not own (firmware, MMIO) are only
    /// unmapped.
    ///
    /// # Errors
    /// [`PagingError::NotMapped`] if nothing maps `va`.
    pub fn unmap(&mut self, pmm: &mut impl FrameAlloc, va: VirtualAddress) -> Result<PhysicalFrame, PagingError> {
        let frame = self.space().unmap_one(va)?;
        self.mmu.invalidate_page(va.page_base());
        pmm.free_4k(frame);
        Ok(frame)
    }

    #[inline]
    #[must_use]
    pub fn is_mapped(&self, va: VirtualAddress) -> bool {
        self.space().is_mapped(va)
    }

    /// Physical address and leaf flags for `va` in the active tree.
    #[inline]
    #[must_use]
    pub fn translate(&self, va: VirtualAddress) -> Option<(PhysicalAddress, PageFlags)> {
        self.space().translate(va)
    }

    /// Rewrite the permissions of an existing mapping.
    ///
    /// # Errors
    /// [`PagingError::NotMapped`] if nothing maps `va`.
    pub fn update_flags(&mut self, va: VirtualAddress, flags: PageFlags) -> Result<(), PagingError> {
        self.space().update_flags(va, flags)?;
        self.mmu.invalidate_page(va.page_base());
        Ok(())
    }

    /// Physical address behind `va`, or `None` if it is not mapped.
    ///
    /// Direct-map addresses are resolved arithmetically; everything else is
    /// walked in the active tree. The offset inside the page is kept.
    #[must_use]
    pub fn virtual_to_physical(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        self.direct_map
            .virt_to_phys(va)
            .or_else(|| self.space().query(va))
    }

    /// Direct-map address of `pa`.
    #[inline]
    #[must_use]
    pub const fn physical_to_virtual(&self, pa: PhysicalAddress) -> Option<VirtualAddress> {
        self.direct_map.phys_to_virt(pa)
    }

    /// Load `root` into the processor.
    ///
    /// # Safety
    /// `root` must map the running code, stack and data at their current
    /// addresses, i.e. share the kernel half of the current tree.
    pub(crate) unsafe fn activate(&mut self, root: PhysicalFrame) {
        if root == self.root {
            return;
        }
        unsafe { self.mmu.set_active_root(root) };
        debug!("paging: switched root {:?} -> {:?}", self.root, root);
        self.root = root;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{RecordingMmu, SimRam};
    use kernel_info::boot::{MemoryMap, MemoryRegion};

    const MIB: u64 = 1024 * 1024;

    fn setup(ram: &SimRam) -> (BitmapFrameAlloc, Paging<RecordingMmu>) {
        let regions = [MemoryRegion::usable(0x10_0000, 3 * MIB)];
        let mut pmm = unsafe { BitmapFrameAlloc::init(MemoryMap::new(&regions), ram.direct_map()) }.unwrap();
        let paging = Paging::init(ram.direct_map(), RecordingMmu::default(), &mut pmm).unwrap();
        (pmm, paging)
    }

    #[test]
    fn map_translate_unmap_round_trip() {
        let ram = SimRam::new(4 * MIB);
        let (mut pmm, mut paging) = setup(&ram);
        let va = VirtualAddress::new(0xFFFF_FFFF_9000_0000);
        let pa = pmm.alloc_page().unwrap();

        paging.map(&mut pmm, va, pa, PageFlags::KERNEL_DATA).unwrap();
        assert!(paging.is_mapped(va));
        assert_eq!(paging.virtual_to_physical(va), Some(pa));
        assert_eq!(
            paging.virtual_to_physical(VirtualAddress::new(va.as_u64() + 0x123)),
            Some(PhysicalAddress::new(pa.as_u64() + 0x123))
        );
        assert_eq!(paging.mmu().invalidations, [va]);

        let free = pmm.free_frames();
        assert_eq!(paging.unmap(&mut pmm, va), Ok(pa.frame()));
        assert!(!paging.is_mapped(va));
        assert_eq!(paging.virtual_to_physical(va), None);
        assert_eq!(pmm.free_frames(), free + 1);
        assert_eq!(paging.mmu().invalidations.len(), 2);
    }

    #[test]
    fn unaligned_and_missing() {
        let ram = SimRam::new(4 * MIB);
        let (mut pmm, mut paging) = setup(&ram);
        let err = paging.map(
            &mut pmm,
            VirtualAddress::new(0x40_0001),
            PhysicalAddress::new(0x20_0000),
            PageFlags::KERNEL_DATA,
        );
        assert_eq!(err, Err(PagingError::Unaligned));
        assert_eq!(
            paging.unmap(&mut pmm, VirtualAddress::new(0x40_0000)),
            Err(PagingError::NotMapped)
        );
        assert_eq!(
            paging.update_flags(VirtualAddress::new(0x40_0000), PageFlags::PRESENT),
            Err(PagingError::NotMapped)
        );
    }

    #[test]
    fn direct_map_fast_path() {
        let ram = SimRam::new(4 * MIB);
        let (_pmm, paging) = setup(&ram);
        let pa = PhysicalAddress::new(0x23_4567);
        let va = paging.physical_to_virtual(pa).unwrap();
        assert_eq!(paging.virtual_to_physical(va), Some(pa));
    }

    #[test]
    fn adopts_active_root() {
        let ram = SimRam::new(4 * MIB);
        let regions = [MemoryRegion::usable(0x10_0000, 3 * MIB)];
        let mut pmm = unsafe { BitmapFrameAlloc::init(MemoryMap::new(&regions), ram.direct_map()) }.unwrap();
        let root = pmm.alloc_zeroed_page().unwrap().frame();
        let mmu = RecordingMmu {
            enabled: true,
            root: Some(root),
            ..RecordingMmu::default()
        };
        let free = pmm.free_frames();
        let paging = Paging::init(ram.direct_map(), mmu, &mut pmm).unwrap();
        assert_eq!(paging.root(), root);
        assert_eq!(pmm.free_frames(), free);
    }

    #[test]
    fn update_flags_invalidates() {
        let ram = SimRam::new(4 * MIB);
        let (mut pmm, mut paging) = setup(&ram);
        let va = VirtualAddress::new(0x40_0000);
        let pa = pmm.alloc_page().unwrap();
        paging.map(&mut pmm, va, pa, PageFlags::KERNEL_DATA).unwrap();
        paging.update_flags(va, PageFlags::NO_EXECUTE).unwrap();
        let (got, flags) = paging.translate(va).unwrap();
        assert_eq!(got, pa);
        assert!(!flags.contains(PageFlags::WRITABLE));
        assert_eq!(paging.mmu().invalidations, [va, va]);
    }
}
