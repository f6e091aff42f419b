//! # Memory Layout

/// Size of a physical frame / base page.
pub const FRAME_SIZE: u64 = kernel_memory_addresses::FRAME_SIZE;

/// Number of entries in one translation table.
pub const TABLE_ENTRIES: usize = 512;

/// First address past the lower (per-space) half of the address range.
pub const USER_HALF_END: u64 = 0x0000_8000_0000_0000;

/// Root-table index of the first kernel-half entry; entries from here up to
/// [`TABLE_ENTRIES`] are shared by every address space.
pub const KERNEL_HALF_FIRST_INDEX: usize = 256;

/// Where the kernel executes (VMA). Addresses at or above this value are
/// kernel addresses in every address space.
pub const KERNEL_BASE: u64 = 0xffff_ffff_8000_0000;

/// Fixed virtual base of the kernel heap.
pub const HEAP_START: u64 = 0xffff_ffff_9000_0000;

/// Bytes mapped and handed to the heap at boot.
pub const HEAP_INITIAL_SIZE: u64 = 0x10_0000; // 1 MiB

/// Size of the heap's virtual window. Faults inside
/// `HEAP_START..HEAP_START + HEAP_MAX_SIZE` are resolved by demand paging.
pub const HEAP_MAX_SIZE: u64 = 0x1000_0000; // 256 MiB

/// Amount of physical memory reachable through the direct map.
pub const DIRECT_MAP_WINDOW: u64 = 0x80_0000_0000; // 512 GiB

/// Returns `true` if `va` lies in the shared kernel half.
#[inline]
#[must_use]
pub const fn is_kernel_half(va: u64) -> bool {
    va >= USER_HALF_END
}

const _: () = {
    assert!(FRAME_SIZE == 4096);
    assert!((KERNEL_HALF_FIRST_INDEX as u64) << 39 == USER_HALF_END);
    assert!(KERNEL_BASE > USER_HALF_END);
    assert!(HEAP_START > KERNEL_BASE);
    assert!(HEAP_START.is_multiple_of(FRAME_SIZE));
    assert!(HEAP_INITIAL_SIZE.is_multiple_of(FRAME_SIZE));
    assert!(HEAP_INITIAL_SIZE <= HEAP_MAX_SIZE);
    assert!(HEAP_START.checked_add(HEAP_MAX_SIZE).is_some());
};
