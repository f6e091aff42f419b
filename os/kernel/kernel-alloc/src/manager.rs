//! # Memory Manager
//!
//! The boot-time context that owns all four components, each behind its own
//! [`SpinLock`]. Built once from the boot memory information; everything
//! else in the kernel reaches memory services through it.
//!
//! ## Lock order
//!
//! ```text
//!  vmm  →  heap  →  paging  →  pmm
//! ```
//!
//! A method that needs several locks takes them in this order. The page-fault
//! path never waits: it only `try_lock`s paging and pmm.

use crate::fault::{self, FaultResolution, GrowableRegion, PageFaultError};
use crate::frame_alloc::{BitmapFrameAlloc, FrameAllocInitError};
use crate::heap::{HeapConfig, HeapError, HeapPlacement, HeapProtection, KernelHeap, LockedHeap, place_heap};
use crate::paging::{Paging, PagingError};
use crate::phys_mapper::DirectMap;
use crate::vmm::{AddressSpaceManager, SpaceHandle, VmmError};
use arrayvec::ArrayVec;
use core::ptr::NonNull;
use kernel_info::boot::{BootMemoryInfo, MemoryMap};
use kernel_info::memory::HEAP_MAX_SIZE;
use kernel_memory_addresses::{PhysicalAddress, PhysicalFrame, VirtualAddress};
use kernel_sync::SpinLock;
use kernel_vmem::{Mmu, PageFlags, Teardown};
use log::info;

/// Demand-paged windows the fault handler knows about.
pub const MAX_GROWABLE_REGIONS: usize = 4;

#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BootError {
    #[error("physical memory: {0}")]
    Frames(#[from] FrameAllocInitError),
    #[error("paging: {0}")]
    Paging(#[from] PagingError),
    #[error("heap: {0}")]
    Heap(#[from] HeapError),
}

pub struct MemoryManager<U: Mmu> {
    vmm: SpinLock<AddressSpaceManager>,
    heap: LockedHeap,
    paging: SpinLock<Paging<U>>,
    pmm: SpinLock<BitmapFrameAlloc>,
    growable: ArrayVec<GrowableRegion, MAX_GROWABLE_REGIONS>,
    /// Size limit of a page-mapped heap; `None` for a direct-mapped one.
    heap_limit: Option<u64>,
}

impl<U: Mmu> MemoryManager<U> {
    /// Bring up frames, paging, heap and address spaces, in that order.
    ///
    /// # Errors
    /// The first component that fails, as a [`BootError`].
    ///
    /// # Safety
    /// Must run once, on the boot core, before any other memory service.
    /// The memory map must describe real RAM and the direct map must cover it.
    pub unsafe fn init(boot: BootMemoryInfo<'_>, mmu: U, heap: HeapConfig) -> Result<Self, BootError> {
        let direct_map = DirectMap::new(boot.direct_map_offset);
        unsafe { Self::init_with_direct_map(boot.memory_map, direct_map, mmu, heap) }
    }

    /// [`init`](Self::init) with an explicit direct-map window.
    ///
    /// # Errors
    /// As [`init`](Self::init).
    ///
    /// # Safety
    /// As [`init`](Self::init).
    pub unsafe fn init_with_direct_map(
        map: MemoryMap<'_>,
        direct_map: DirectMap,
        mmu: U,
        heap: HeapConfig,
    ) -> Result<Self, BootError> {
        let mut pmm = unsafe { BitmapFrameAlloc::init(map, direct_map) }?;
        let mut paging = Paging::init(direct_map, mmu, &mut pmm)?;

        let (start, len) = place_heap(&heap, &mut paging, &mut pmm)?;
        let kernel_heap = unsafe { KernelHeap::from_region(start, len, heap.poisoning) }?;

        let mut growable = ArrayVec::new();
        let heap_limit = match heap.placement {
            HeapPlacement::Mapped { base } => {
                let end = VirtualAddress::new(base.as_u64().saturating_add(HEAP_MAX_SIZE));
                growable.push(GrowableRegion::new(base, end, PageFlags::KERNEL_DATA));
                Some(HEAP_MAX_SIZE)
            }
            HeapPlacement::DirectMapped => None,
        };

        let vmm = AddressSpaceManager::init(&paging);
        info!(
            "memory: {} KiB free, heap {} KiB, root {:?}",
            pmm.free_memory() / 1024,
            len / 1024,
            paging.root()
        );

        Ok(Self {
            vmm: SpinLock::new(vmm),
            heap: LockedHeap::new(kernel_heap),
            paging: SpinLock::new(paging),
            pmm: SpinLock::new(pmm),
            growable,
            heap_limit,
        })
    }

    #[inline]
    #[must_use]
    pub const fn pmm(&self) -> &SpinLock<BitmapFrameAlloc> {
        &self.pmm
    }

    #[inline]
    #[must_use]
    pub const fn paging(&self) -> &SpinLock<Paging<U>> {
        &self.paging
    }

    #[inline]
    #[must_use]
    pub const fn heap(&self) -> &LockedHeap {
        &self.heap
    }

    #[inline]
    #[must_use]
    pub const fn vmm(&self) -> &SpinLock<AddressSpaceManager> {
        &self.vmm
    }

    #[inline]
    #[must_use]
    pub fn growable_regions(&self) -> &[GrowableRegion] {
        &self.growable
    }

    /// Register another demand-paged window.
    ///
    /// Returns `false` if the table is full.
    pub fn add_growable_region(&mut self, region: GrowableRegion) -> bool {
        self.growable.try_push(region).is_ok()
    }

    /// # Errors
    /// As [`KernelHeap::allocate`].
    pub fn allocate(&self, size: usize) -> Result<NonNull<u8>, HeapError> {
        self.heap.lock().allocate(size, HeapProtection::empty())
    }

    /// # Errors
    /// As [`KernelHeap::allocate`].
    pub fn allocate_protected(&self, size: usize, protection: HeapProtection) -> Result<NonNull<u8>, HeapError> {
        self.heap.lock().allocate(size, protection)
    }

    /// # Errors
    /// As [`KernelHeap::free`].
    pub fn free(&self, ptr: NonNull<u8>) -> Result<(), HeapError> {
        self.heap.lock().free(ptr)
    }

    /// # Errors
    /// As [`KernelHeap::calloc`].
    pub fn calloc(&self, count: usize, size: usize) -> Result<NonNull<u8>, HeapError> {
        self.heap.lock().calloc(count, size)
    }

    /// # Errors
    /// As [`KernelHeap::realloc`].
    pub fn realloc(&self, ptr: NonNull<u8>, new_size: usize) -> Result<NonNull<u8>, HeapError> {
        self.heap.lock().realloc(ptr, new_size)
    }

    /// Grow a page-mapped heap into its window. The new pages are mapped on
    /// first touch by the page-fault handler.
    ///
    /// # Errors
    /// [`HeapError::NotGrowable`] for a direct-mapped heap or past the window
    /// limit; otherwise as [`KernelHeap::extend`].
    pub fn grow_heap(&self, additional: usize) -> Result<(), HeapError> {
        let Some(limit) = self.heap_limit else {
            return Err(HeapError::NotGrowable);
        };
        let mut heap = self.heap.lock();
        let new_total = heap.total_size().checked_add(additional).ok_or(HeapError::Overflow)?;
        if !u64::try_from(new_total).is_ok_and(|t| t <= limit) {
            return Err(HeapError::NotGrowable);
        }
        // Safety: the bytes lie inside the registered growable window
        unsafe { heap.extend(additional) }
    }

    /// Map a kernel page in the active tree.
    ///
    /// # Errors
    /// As [`Paging::map`].
    pub fn map(&self, va: VirtualAddress, pa: PhysicalAddress, flags: PageFlags) -> Result<(), PagingError> {
        let mut paging = self.paging.lock();
        let mut pmm = self.pmm.lock();
        paging.map(&mut *pmm, va, pa, flags)
    }

    /// # Errors
    /// As [`Paging::unmap`].
    pub fn unmap(&self, va: VirtualAddress) -> Result<PhysicalFrame, PagingError> {
        let mut paging = self.paging.lock();
        let mut pmm = self.pmm.lock();
        paging.unmap(&mut *pmm, va)
    }

    #[must_use]
    pub fn virtual_to_physical(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        self.paging.lock().virtual_to_physical(va)
    }

    #[must_use]
    pub fn physical_to_virtual(&self, pa: PhysicalAddress) -> Option<VirtualAddress> {
        self.paging.lock().physical_to_virtual(pa)
    }

    /// The frame allocator is locked only once the descriptor is allocated.
    ///
    /// # Errors
    /// As [`AddressSpaceManager::create_space`].
    pub fn create_space(&self) -> Result<SpaceHandle, VmmError> {
        let mut vmm = self.vmm.lock();
        let mut heap = self.heap.lock();
        vmm.create_space(&mut *heap, || self.pmm.lock())
    }

    /// A refused space comes back with the error and can be destroyed later.
    ///
    /// # Errors
    /// As [`AddressSpaceManager::destroy_space`].
    pub fn destroy_space(&self, space: SpaceHandle) -> Result<Teardown, (VmmError, SpaceHandle)> {
        let mut vmm = self.vmm.lock();
        let mut heap = self.heap.lock();
        let paging = self.paging.lock();
        let mut pmm = self.pmm.lock();
        vmm.destroy_space(space, &*paging, &mut *pmm, &mut *heap)
    }

    pub fn switch_space(&self, space: &SpaceHandle) {
        let vmm = self.vmm.lock();
        let mut paging = self.paging.lock();
        vmm.switch_space(&mut *paging, space);
    }

    pub fn switch_to_kernel(&self) {
        let vmm = self.vmm.lock();
        let mut paging = self.paging.lock();
        vmm.switch_to_kernel(&mut *paging);
    }

    /// # Errors
    /// As [`AddressSpaceManager::map_page`].
    pub fn map_page(
        &self,
        space: &SpaceHandle,
        va: VirtualAddress,
        pa: PhysicalAddress,
        flags: PageFlags,
    ) -> Result<(), VmmError> {
        let vmm = self.vmm.lock();
        let mut paging = self.paging.lock();
        let mut pmm = self.pmm.lock();
        vmm.map_page(space, &mut *paging, &mut *pmm, va, pa, flags)
    }

    /// # Errors
    /// As [`AddressSpaceManager::unmap_page`].
    pub fn unmap_page(&self, space: &SpaceHandle, va: VirtualAddress) -> Result<PhysicalFrame, VmmError> {
        let vmm = self.vmm.lock();
        let mut paging = self.paging.lock();
        let mut pmm = self.pmm.lock();
        vmm.unmap_page(space, &mut *paging, &mut *pmm, va)
    }

    #[must_use]
    pub fn get_physical(&self, space: &SpaceHandle, va: VirtualAddress) -> Option<PhysicalAddress> {
        self.vmm.lock().get_physical(space, va)
    }

    /// Page-fault entry point for the interrupt glue. Unrecoverable faults
    /// are logged; halting is up to the caller (see [`fault::halt`]).
    #[must_use]
    pub fn handle_page_fault(&self, addr: VirtualAddress, err: PageFaultError) -> FaultResolution {
        let resolution = fault::resolve(&self.paging, &self.pmm, &self.growable, addr, err);
        if let FaultResolution::Unrecoverable(why) = resolution {
            fault::report(addr, err, why);
        }
        resolution
    }

    /// Log the memory map and heap counters.
    pub fn log_summary(&self) {
        self.pmm.lock().dump_memory_map();
        self.heap.lock().log_stats();
    }
}
