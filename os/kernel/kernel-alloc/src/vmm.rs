//! # Virtual Memory Manager
//!
//! Creates, switches and destroys address spaces. Every space gets its own
//! root table whose kernel half (root entries `256..512`) points at the
//! kernel's own lower-level tables, so kernel code, data and the heap are
//! mapped identically everywhere and switching spaces never unmaps the
//! running kernel.
//!
//! ```text
//!  kernel root                space A root              space B root
//!  ┌──────────────┐           ┌──────────────┐          ┌──────────────┐
//!  │ 0..256  (—)  │           │ 0..256  A's  │          │ 0..256  B's  │
//!  │ 256..512 ────┼──┐        │ 256..512 ────┼──┐       │ 256..512 ────┼──┐
//!  └──────────────┘  │        └──────────────┘  │       └──────────────┘  │
//!                    └──────────────────────────┴─────────────────────────┴─► shared PDPTs
//! ```
//!
//! The per-space descriptor lives in the kernel heap. A [`SpaceHandle`] is
//! the only way to name a space and cannot be cloned; destroying a space
//! consumes it.

use crate::frame_alloc::BitmapFrameAlloc;
use crate::heap::{HeapError, HeapProtection, KernelHeap};
use crate::paging::{Paging, PagingError};
use crate::phys_mapper::DirectMap;
use core::ops::DerefMut;
use core::ptr::NonNull;
use kernel_memory_addresses::{PhysicalAddress, PhysicalFrame, VirtualAddress};
use kernel_vmem::{AddressSpace, FrameAlloc, Mmu, PageEntry, PageFlags, Teardown};
use log::{debug, error, info, warn};

#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VmmError {
    #[error("no physical frame for a root table")]
    OutOfFrames,
    #[error("space descriptor: {0}")]
    Heap(#[from] HeapError),
    #[error(transparent)]
    Paging(#[from] PagingError),
    #[error("lower-half root entry {index} shares a table with the kernel half")]
    SharedTableAliased { index: usize },
    #[error("the space is currently active")]
    SpaceActive,
}

#[repr(C)]
struct SpaceDescriptor {
    root: PhysicalFrame,
    id: u64,
}

/// Owning handle to an address space created by [`AddressSpaceManager`].
#[derive(Debug)]
pub struct SpaceHandle {
    desc: NonNull<SpaceDescriptor>,
}

// Safety: the descriptor is only read through the handle, which is unique.
unsafe impl Send for SpaceHandle {}

impl SpaceHandle {
    fn descriptor(&self) -> &SpaceDescriptor {
        unsafe { self.desc.as_ref() }
    }

    /// Root table frame.
    #[must_use]
    pub fn root(&self) -> PhysicalFrame {
        self.descriptor().root
    }

    /// Creation sequence number, starting at 1.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.descriptor().id
    }
}

/// Bookkeeping for address spaces: the kernel root and a live count.
#[derive(Debug)]
pub struct AddressSpaceManager {
    kernel_root: PhysicalFrame,
    direct_map: DirectMap,
    next_id: u64,
    live: usize,
}

impl AddressSpaceManager {
    /// Capture the currently active tree as the kernel space.
    #[must_use]
    pub fn init<U: Mmu>(paging: &Paging<U>) -> Self {
        info!("vmm: kernel root {:?}", paging.root());
        Self {
            kernel_root: paging.root(),
            direct_map: *paging.direct_map(),
            next_id: 1,
            live: 0,
        }
    }

    #[inline]
    #[must_use]
    pub const fn kernel_root(&self) -> PhysicalFrame {
        self.kernel_root
    }

    /// Spaces created and not yet destroyed.
    #[inline]
    #[must_use]
    pub const fn live_spaces(&self) -> usize {
        self.live
    }

    #[inline]
    fn space(&self, root: PhysicalFrame) -> AddressSpace<'_, DirectMap> {
        AddressSpace::from_root(&self.direct_map, root)
    }

    /// New address space: empty lower half, kernel half shared with the
    /// kernel root.
    ///
    /// The descriptor is allocated before `lock_pmm` is called, so a heap
    /// access that faults into a demand-paged heap page never finds the
    /// frame allocator already held.
    ///
    /// # Errors
    /// [`VmmError::Heap`] if the descriptor cannot be allocated,
    /// [`VmmError::OutOfFrames`] if no root frame is available. Nothing is
    /// leaked on failure.
    pub fn create_space<P>(
        &mut self,
        heap: &mut KernelHeap,
        lock_pmm: impl FnOnce() -> P,
    ) -> Result<SpaceHandle, VmmError>
    where
        P: DerefMut<Target = BitmapFrameAlloc>,
    {
        let desc = heap
            .allocate(size_of::<SpaceDescriptor>(), HeapProtection::NO_EXECUTE)?
            .cast::<SpaceDescriptor>();
        // the guard drops here, before the heap is touched again
        let frame = lock_pmm().alloc_page();
        let root = match frame {
            Ok(pa) => pa.frame(),
            Err(e) => {
                warn!("vmm: no root frame for a new space: {e}");
                if let Err(e) = heap.free(desc.cast()) {
                    error!("vmm: could not return descriptor {desc:p}: {e}");
                }
                return Err(VmmError::OutOfFrames);
            }
        };

        let space = self.space(root);
        space.clear();
        space.share_kernel_half(self.kernel_root);

        let id = self.next_id;
        unsafe { desc.write(SpaceDescriptor { root, id }) };
        self.next_id += 1;
        self.live += 1;
        debug!("vmm: created space {id} with root {root:?}");
        Ok(SpaceHandle { desc })
    }

    /// Whether [`destroy_space`](Self::destroy_space) would accept `space`.
    ///
    /// # Errors
    /// [`VmmError::SpaceActive`] or [`VmmError::SharedTableAliased`].
    pub fn can_destroy<U: Mmu>(&self, space: &SpaceHandle, paging: &Paging<U>) -> Result<(), VmmError> {
        if space.root() == paging.root() {
            return Err(VmmError::SpaceActive);
        }
        match self.space(space.root()).lower_half_aliases_kernel() {
            Some(index) => Err(VmmError::SharedTableAliased { index }),
            None => Ok(()),
        }
    }

    /// Free the lower half of `space`, its root and its descriptor.
    ///
    /// Refused while the space is active, if a lower-half root entry shares
    /// a table with the kernel half, and if the heap will not take the
    /// descriptor back. A refused space is untouched and its handle is
    /// returned with the reason.
    ///
    /// # Errors
    /// [`VmmError::SpaceActive`], [`VmmError::SharedTableAliased`] or
    /// [`VmmError::Heap`], each paired with the handle.
    pub fn destroy_space<U: Mmu>(
        &mut self,
        space: SpaceHandle,
        paging: &Paging<U>,
        pmm: &mut BitmapFrameAlloc,
        heap: &mut KernelHeap,
    ) -> Result<Teardown, (VmmError, SpaceHandle)> {
        let root = space.root();
        let id = space.id();
        match self.can_destroy(&space, paging) {
            Ok(()) => {}
            Err(VmmError::SharedTableAliased { index }) => {
                error!("vmm: space {id} root entry {index} aliases a kernel table; not destroying it");
                return Err((VmmError::SharedTableAliased { index }, space));
            }
            Err(e) => {
                warn!("vmm: refusing to destroy space {id}: {e}");
                return Err((e, space));
            }
        }

        // the descriptor goes first so a refusing heap leaves the space whole
        if let Err(e) = heap.free(space.desc.cast()) {
            warn!("vmm: heap refused the descriptor of space {id}: {e}");
            return Err((e.into(), space));
        }

        let freed = self.space(root).teardown_lower_half(pmm);
        pmm.free_4k(root);
        self.live -= 1;
        debug!(
            "vmm: destroyed space {id}: {} pages, {} tables",
            freed.leaves, freed.tables
        );
        Ok(freed)
    }

    /// Make `space` the active translation tree.
    ///
    /// The kernel half is re-copied first, so root entries the kernel gained
    /// after the space was created are visible in it as well.
    pub fn switch_space<U: Mmu>(&self, paging: &mut Paging<U>, space: &SpaceHandle) {
        let root = space.root();
        self.space(root).share_kernel_half(self.kernel_root);
        // Safety: the kernel half now matches the kernel root, so the running kernel stays mapped
        unsafe { paging.activate(root) };
    }

    /// Switch back to the kernel's own tree.
    pub fn switch_to_kernel<U: Mmu>(&self, paging: &mut Paging<U>) {
        unsafe { paging.activate(self.kernel_root) };
    }

    /// Map `va → pa` in `space`. The translation cache is only touched if the
    /// space is the active one.
    ///
    /// # Errors
    /// [`PagingError::Unaligned`], or walk failures as [`VmmError::Paging`].
    pub fn map_page<U: Mmu>(
        &self,
        space: &SpaceHandle,
        paging: &mut Paging<U>,
        pmm: &mut BitmapFrameAlloc,
        va: VirtualAddress,
        pa: PhysicalAddress,
        flags: PageFlags,
    ) -> Result<(), VmmError> {
        if !va.is_page_aligned() || !pa.is_frame_aligned() {
            return Err(PagingError::Unaligned.into());
        }
        self.space(space.root())
            .map_one(pmm, va, pa.frame(), flags)
            .map_err(PagingError::from)?;
        if paging.root() == space.root() {
            paging.mmu_mut().invalidate_page(va);
        }
        Ok(())
    }

    /// Unmap `va` in `space` and return its frame to `pmm`.
    ///
    /// # Errors
    /// [`PagingError::NotMapped`] as [`VmmError::Paging`].
    pub fn unmap_page<U: Mmu>(
        &self,
        space: &SpaceHandle,
        paging: &mut Paging<U>,
        pmm: &mut BitmapFrameAlloc,
        va: VirtualAddress,
    ) -> Result<PhysicalFrame, VmmError> {
        let frame = self
            .space(space.root())
            .unmap_one(va)
            .map_err(PagingError::from)?;
        if paging.root() == space.root() {
            paging.mmu_mut().invalidate_page(va.page_base());
        }
        pmm.free_4k(frame);
        Ok(frame)
    }

    #[must_use]
    pub fn is_mapped(&self, space: &SpaceHandle, va: VirtualAddress) -> bool {
        self.space(space.root()).is_mapped(va)
    }

    /// Physical address `va` maps to in `space`.
    #[must_use]
    pub fn get_physical(&self, space: &SpaceHandle, va: VirtualAddress) -> Option<PhysicalAddress> {
        self.space(space.root()).query(va)
    }

    /// Visit every lower-half 4 KiB mapping of `space`.
    pub fn for_each_mapping(&self, space: &SpaceHandle, f: impl FnMut(VirtualAddress, PageEntry)) {
        self.space(space.root()).for_each_lower_mapping(f);
    }

    /// Log the lower-half mappings of `space`.
    pub fn dump_mappings(&self, space: &SpaceHandle) {
        info!("vmm: space {} (root {:?})", space.id(), space.root());
        let mut n = 0usize;
        self.for_each_mapping(space, |va, e| {
            info!("  {va} -> {:?} {:?}", e.frame(), e.flags());
            n += 1;
        });
        info!("vmm: {n} user mappings");
    }
}
