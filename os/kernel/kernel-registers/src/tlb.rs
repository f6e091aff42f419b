//! Translation-cache maintenance and processor idling.

use kernel_memory_addresses::VirtualAddress;

/// Drop the cached translation for the page containing `va` on this core.
///
/// # Safety
/// Privileged; requires ring 0.
#[inline]
pub unsafe fn invalidate_page(va: VirtualAddress) {
    unsafe {
        core::arch::asm!("invlpg [{}]", in(reg) va.as_u64(), options(nostack, preserves_flags));
    }
}

/// Halt until the next interrupt.
///
/// # Safety
/// Privileged; requires ring 0.
#[inline]
pub unsafe fn halt() {
    unsafe {
        core::arch::asm!("hlt", options(nomem, nostack, preserves_flags));
    }
}
