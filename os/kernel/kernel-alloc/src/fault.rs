//! # Page-Fault Policy
//!
//! Decides what happens after a `#PF`: the interrupt glue passes the faulting
//! address (CR2) and the error code, and gets back either
//! [`FaultResolution::Resolved`] (return from the handler and retry the
//! access) or a reason the fault cannot be fixed.
//!
//! Only one kind of fault is repaired: a **not-present** access inside a
//! registered [`GrowableRegion`], such as the kernel heap window. A fresh
//! zeroed frame is mapped at the faulting page. Protection violations,
//! reserved-bit faults and accesses anywhere else are unrecoverable.
//!
//! The fault can arrive while the faulting core already holds the paging or
//! frame lock. The resolver therefore only ever `try_lock`s; a busy lock is
//! reported as [`UnrecoverableFault::LockContended`] instead of deadlocking.

use crate::frame_alloc::BitmapFrameAlloc;
use crate::paging::{Paging, PagingError};
use bitfield_struct::bitfield;
use kernel_memory_addresses::VirtualAddress;
use kernel_sync::SpinLock;
use kernel_vmem::{Mmu, PageFlags};
use log::{debug, error};

/// Page-fault error code layout (x86-64).
///
/// Each bit describes the condition that caused the page fault.
/// Reference: Intel SDM Vol. 3A, §6.15.1 “Page-Fault Exception (#PF)”.
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct PageFaultError {
    /// 0 = non-present page.
    /// 1 = protection violation (page present but access disallowed).
    pub present: bool, // bit 0

    /// 0 = read or execute.
    /// 1 = write access.
    pub write: bool, // bit 1

    /// 0 = supervisor (CPL 0–2).
    /// 1 = user mode (CPL 3).
    pub user: bool, // bit 2

    /// 1 = caused by reserved bit set in a paging structure.
    pub reserved_bit: bool, // bit 3

    /// 1 = instruction fetch (execute access).
    pub instruction_fetch: bool, // bit 4

    /// 1 = protection-key violation (if CR4.PKE=1).
    pub protection_key: bool, // bit 5

    /// 1 = shadow stack access (if CET-SS enabled).
    pub shadow_stack: bool, // bit 6

    #[bits(57)]
    __: u64,
}

impl PageFaultError {
    #[must_use]
    pub const fn explain(&self) -> &'static str {
        if self.reserved_bit() {
            "Reserved bit set in a paging structure"
        } else if !self.present() {
            "Non-present page (page not mapped or swapped out)"
        } else if self.instruction_fetch() {
            if self.user() {
                "User-mode instruction fetch on protected page (likely NX or SMEP)"
            } else {
                "Kernel instruction fetch on protected page"
            }
        } else if self.write() {
            "Write access to protected page"
        } else {
            "Read access to protected page"
        }
    }
}

/// A virtual range whose pages are mapped on first touch.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct GrowableRegion {
    pub start: VirtualAddress,
    /// Exclusive.
    pub end: VirtualAddress,
    /// Leaf flags for pages mapped on demand.
    pub flags: PageFlags,
}

impl GrowableRegion {
    #[must_use]
    pub const fn new(start: VirtualAddress, end: VirtualAddress, flags: PageFlags) -> Self {
        Self { start, end, flags }
    }

    #[inline]
    #[must_use]
    pub const fn contains(&self, va: VirtualAddress) -> bool {
        va.as_u64() >= self.start.as_u64() && va.as_u64() < self.end.as_u64()
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FaultResolution {
    /// The page is now mapped; retry the access.
    Resolved,
    Unrecoverable(UnrecoverableFault),
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UnrecoverableFault {
    #[error("protection violation on a present page")]
    ProtectionViolation,
    #[error("reserved bit set in a paging structure")]
    ReservedBit,
    #[error("not-present access outside every growable region")]
    OutsideGrowableRegion,
    #[error("paging or frame lock held by the faulting context")]
    LockContended,
    #[error("no physical frame left for demand paging")]
    OutOfFrames,
    #[error("mapping the faulting page failed: {0}")]
    MapFailed(PagingError),
}

/// Decide and, where possible, repair a page fault at `addr`.
#[must_use]
pub fn resolve<U: Mmu>(
    paging: &SpinLock<Paging<U>>,
    pmm: &SpinLock<BitmapFrameAlloc>,
    regions: &[GrowableRegion],
    addr: VirtualAddress,
    err: PageFaultError,
) -> FaultResolution {
    use FaultResolution::Unrecoverable;

    if err.reserved_bit() {
        return Unrecoverable(UnrecoverableFault::ReservedBit);
    }
    if err.present() {
        return Unrecoverable(UnrecoverableFault::ProtectionViolation);
    }
    let Some(region) = regions.iter().find(|r| r.contains(addr)) else {
        return Unrecoverable(UnrecoverableFault::OutsideGrowableRegion);
    };

    let Some(mut paging) = paging.try_lock() else {
        return Unrecoverable(UnrecoverableFault::LockContended);
    };
    let page = addr.page_base();
    if paging.is_mapped(page) {
        // another core got here first; the stale translation is already gone
        paging.mmu_mut().invalidate_page(page);
        return FaultResolution::Resolved;
    }
    let Some(mut pmm) = pmm.try_lock() else {
        return Unrecoverable(UnrecoverableFault::LockContended);
    };

    let Ok(pa) = pmm.alloc_zeroed_page() else {
        return Unrecoverable(UnrecoverableFault::OutOfFrames);
    };
    if let Err(e) = paging.map(&mut *pmm, page, pa, region.flags) {
        if let Err(fe) = pmm.free_page(pa) {
            error!("fault: could not return {pa} after failed map: {fe}");
        }
        return Unrecoverable(UnrecoverableFault::MapFailed(e));
    }
    debug!("fault: demand-mapped {page} -> {pa}");
    FaultResolution::Resolved
}

/// Log an unrecoverable fault with everything known about it.
pub fn report(addr: VirtualAddress, err: PageFaultError, why: UnrecoverableFault) {
    error!(
        "PAGE FAULT: cr2={addr} err={raw:#x} ({explain}): {why}",
        raw = err.into_bits(),
        explain = err.explain()
    );
    error!("{err:#?}");
}

/// Stop this core for good.
pub fn halt() -> ! {
    #[cfg(feature = "asm")]
    kernel_sync::irq::disable_interrupts();
    loop {
        #[cfg(feature = "asm")]
        unsafe {
            kernel_registers::tlb::halt();
        }
        #[cfg(not(feature = "asm"))]
        core::hint::spin_loop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explain_covers_the_cases() {
        let np = PageFaultError::new().with_write(true);
        assert_eq!(np.explain(), "Non-present page (page not mapped or swapped out)");
        let w = PageFaultError::new().with_present(true).with_write(true);
        assert_eq!(w.explain(), "Write access to protected page");
        let nx = PageFaultError::new()
            .with_present(true)
            .with_instruction_fetch(true)
            .with_user(true);
        assert!(nx.explain().contains("NX"));
        assert_eq!(PageFaultError::from_bits(0b1001).explain(), "Reserved bit set in a paging structure");
    }

    #[test]
    fn region_bounds_are_half_open() {
        let r = GrowableRegion::new(
            VirtualAddress::new(0x1000),
            VirtualAddress::new(0x3000),
            PageFlags::KERNEL_DATA,
        );
        assert!(r.contains(VirtualAddress::new(0x1000)));
        assert!(r.contains(VirtualAddress::new(0x2FFF)));
        assert!(!r.contains(VirtualAddress::new(0x3000)));
    }
}
