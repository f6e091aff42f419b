//! # Kernel Memory Management
//!
//! Physical frames, translation tables, the kernel heap and address spaces,
//! built on top of `kernel-vmem` and brought up together by
//! [`MemoryManager`].
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │           Address Space Manager  ([`vmm`])          │
//! │    • create / destroy / switch spaces               │
//! │    • shared kernel half, per-space lower half       │
//! └────────────┬───────────────────────┬────────────────┘
//!              │                       │ descriptors
//! ┌────────────▼────────────┐ ┌────────▼────────────────┐
//! │   Paging ([`paging`])   │ │  Kernel Heap ([`heap`]) │
//! │  • map / unmap / query  │ │  • best fit, coalescing │
//! │  • TLB maintenance      │ │  • canaries, checksums  │
//! │  • fault policy         │ │  • poisoning, lockdown  │
//! └────────────┬────────────┘ └────────┬────────────────┘
//!              │ frames                │ backing pages
//! ┌────────────▼───────────────────────▼────────────────┐
//! │        Physical Frame Allocator ([`frame_alloc`])   │
//! │    • one bit per 4 KiB frame, stored in RAM         │
//! │    • first fit, contiguous runs, double-free checks │
//! └─────────────────────────────────────────────────────┘
//!          all physical memory reached through the
//!              direct map ([`phys_mapper`])
//! ```
//!
//! ## Bring-up
//!
//! ```text
//! MemoryManager::init(boot info, mmu, heap config)
//!   1. BitmapFrameAlloc::init   bitmap in the largest usable region
//!   2. Paging::init             adopt CR3, or build an empty root
//!   3. place_heap               map HEAP_START.. (or take direct-mapped frames)
//!   4. KernelHeap::from_region  one free block over the backing
//!   5. AddressSpaceManager      remember the kernel root
//! ```
//!
//! ## Features
//! - `asm` (default): [`HardwareMmu`](kernel_vmem::HardwareMmu) and a real
//!   `cli; hlt` in [`fault::halt`].
//! - `poison` (default): heap poisoning on unless [`HeapConfig`] says otherwise.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod fault;
pub mod frame_alloc;
pub mod heap;
mod manager;
pub mod paging;
pub mod phys_mapper;
pub mod vmm;

#[cfg(test)]
mod testing;

pub use crate::fault::{FaultResolution, GrowableRegion, PageFaultError, UnrecoverableFault};
pub use crate::frame_alloc::{BitmapFrameAlloc, FrameAllocInitError, FrameError};
pub use crate::heap::{HeapConfig, HeapError, HeapPlacement, HeapProtection, HeapStats, KernelHeap, LockedHeap};
pub use crate::manager::{BootError, MAX_GROWABLE_REGIONS, MemoryManager};
pub use crate::paging::{Paging, PagingError};
pub use crate::phys_mapper::DirectMap;
pub use crate::vmm::{AddressSpaceManager, SpaceHandle, VmmError};
