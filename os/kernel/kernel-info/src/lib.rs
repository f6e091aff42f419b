//! # Kernel Memory Layout and Boot Hand-off
//!
//! This crate defines the fixed virtual memory layout the memory core relies
//! on, and the data the boot collaborator hands to it exactly once.
//!
//! ## Modules
//!
//! * [`memory`]: compile-time layout constants (frame size, kernel base,
//!   user/kernel split, heap window, direct-map window).
//! * [`boot`]: the physical memory map ([`MemoryRegion`](boot::MemoryRegion),
//!   [`MemoryRegionKind`](boot::MemoryRegionKind)) and the direct-map offset.
//!
//! ## Virtual Address Space Layout
//!
//! ```text
//! 0x0000_0000_0000_0000 ┌─────────────────────────────────┐
//!                       │        Lower (user) half        │  PML4[0..256]
//!                       │   owned by each address space   │
//! USER_HALF_END         ├─────────────────────────────────┤ 0x0000_8000_0000_0000
//!                       │     non-canonical hole          │
//!                       ├─────────────────────────────────┤ 0xffff_8000_0000_0000
//!                       │  Direct map (boot offset + PA)  │  PML4[256..512]
//!                       │              ...                │  shared by all
//! KERNEL_BASE           ├─────────────────────────────────┤ 0xffff_ffff_8000_0000
//!                       │       Kernel text & data        │
//! HEAP_START            ├─────────────────────────────────┤ 0xffff_ffff_9000_0000
//!                       │   Kernel heap (HEAP_MAX_SIZE)   │
//!                       └─────────────────────────────────┘
//! ```
//!
//! Every address space shares the upper half with the kernel space, so kernel
//! code and data stay reachable regardless of which space is active.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![deny(unsafe_code)]

pub mod boot;
pub mod memory;
