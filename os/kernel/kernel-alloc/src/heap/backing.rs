//! Where the heap's bytes come from.

use super::HeapError;
use crate::frame_alloc::BitmapFrameAlloc;
use crate::paging::{Paging, PagingError};
use core::ptr::NonNull;
use kernel_info::memory::{HEAP_INITIAL_SIZE, HEAP_START};
use kernel_memory_addresses::{FRAME_SIZE, VirtualAddress, align_up};
use kernel_vmem::{Mmu, PageFlags};
use log::{info, warn};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum HeapPlacement {
    /// Fresh frames mapped page by page at `base`. The remainder of the heap
    /// window is registered for demand paging.
    Mapped { base: VirtualAddress },
    /// One physically contiguous run, addressed through the direct map.
    DirectMapped,
}

/// Heap parameters chosen at boot.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct HeapConfig {
    pub placement: HeapPlacement,
    /// Initial size in bytes, rounded up to whole frames.
    pub size: u64,
    pub poisoning: bool,
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self {
            placement: HeapPlacement::Mapped {
                base: VirtualAddress::new(HEAP_START),
            },
            size: HEAP_INITIAL_SIZE,
            poisoning: cfg!(feature = "poison"),
        }
    }
}

impl HeapConfig {
    #[must_use]
    pub fn direct_mapped(size: u64) -> Self {
        Self {
            placement: HeapPlacement::DirectMapped,
            size,
            ..Self::default()
        }
    }

    #[must_use]
    pub const fn with_poisoning(mut self, on: bool) -> Self {
        self.poisoning = on;
        self
    }
}

/// Map `size` bytes of fresh frames at `base` as kernel data.
///
/// On failure every page mapped so far is unmapped and its frame returned.
///
/// # Errors
/// [`HeapError::MapFailed`] if frames run out or a mapping cannot be built.
pub fn map_heap_backing<U: Mmu>(
    paging: &mut Paging<U>,
    pmm: &mut BitmapFrameAlloc,
    base: VirtualAddress,
    size: u64,
) -> Result<NonNull<u8>, HeapError> {
    if !base.is_page_aligned() {
        return Err(HeapError::MapFailed(PagingError::Unaligned));
    }
    let pages = align_up(size, FRAME_SIZE).ok_or(HeapError::Overflow)? / FRAME_SIZE;

    for i in 0..pages {
        let va = base + i * FRAME_SIZE;
        if let Err(e) = back_page(paging, pmm, va) {
            warn!("heap: backing failed at {va} after {i} pages: {e}");
            for j in 0..i {
                if let Err(e) = paging.unmap(pmm, base + j * FRAME_SIZE) {
                    warn!("heap: rollback of page {j} failed: {e}");
                }
            }
            return Err(HeapError::MapFailed(e));
        }
    }

    info!("heap: mapped {pages} pages at {base}");
    NonNull::new(base.as_mut_ptr()).ok_or(HeapError::MapFailed(PagingError::Unaligned))
}

fn back_page<U: Mmu>(paging: &mut Paging<U>, pmm: &mut BitmapFrameAlloc, va: VirtualAddress) -> Result<(), PagingError> {
    let pa = pmm.alloc_page().map_err(|_| PagingError::OutOfFrames)?;
    paging.map(pmm, va, pa, PageFlags::KERNEL_DATA).inspect_err(|_| {
        if let Err(e) = pmm.free_page(pa) {
            warn!("heap: could not return {pa}: {e}");
        }
    })
}

/// Obtain backing memory for `config`; returns its start and length.
///
/// # Errors
/// As [`map_heap_backing`]; [`HeapError::OutOfMemory`] if no contiguous run
/// exists for a direct-mapped heap.
pub fn place_heap<U: Mmu>(
    config: &HeapConfig,
    paging: &mut Paging<U>,
    pmm: &mut BitmapFrameAlloc,
) -> Result<(NonNull<u8>, usize), HeapError> {
    let bytes = align_up(config.size, FRAME_SIZE).ok_or(HeapError::Overflow)?;
    let len = usize::try_from(bytes).map_err(|_| HeapError::Overflow)?;
    let start = match config.placement {
        HeapPlacement::Mapped { base } => map_heap_backing(paging, pmm, base, bytes)?,
        HeapPlacement::DirectMapped => {
            let pa = pmm
                .alloc_pages(bytes / FRAME_SIZE)
                .map_err(|_| HeapError::OutOfMemory { requested: len })?;
            let va = paging
                .physical_to_virtual(pa)
                .ok_or(HeapError::MapFailed(PagingError::NotMapped))?;
            info!("heap: {bytes} bytes of contiguous frames at {pa} ({va})");
            NonNull::new(va.as_mut_ptr()).ok_or(HeapError::MapFailed(PagingError::NotMapped))?
        }
    };
    Ok((start, len))
}
