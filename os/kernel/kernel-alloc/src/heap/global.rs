//! # Kernel Global Allocator
//!
//! [`LockedHeap`] puts a [`KernelHeap`] behind a [`SpinLock`] and exposes it
//! as a [`GlobalAlloc`], so it can be installed with `#[global_allocator]`.
//! Requests with an alignment above [`HEAP_ALIGNMENT`] are refused with a
//! null pointer, as are all requests while the heap is locked down.

use super::{HEAP_ALIGNMENT, HeapProtection, KernelHeap};
use core::alloc::{GlobalAlloc, Layout};
use core::ptr::{self, NonNull};
use kernel_sync::{SpinLock, SpinLockGuard};
use log::error;

pub struct LockedHeap(SpinLock<KernelHeap>);

impl LockedHeap {
    /// An uninitialized heap, suitable for a `static`.
    #[must_use]
    pub const fn empty() -> Self {
        Self(SpinLock::new(KernelHeap::empty()))
    }

    #[must_use]
    pub const fn new(heap: KernelHeap) -> Self {
        Self(SpinLock::new(heap))
    }

    #[inline]
    #[must_use]
    pub fn lock(&self) -> SpinLockGuard<'_, KernelHeap> {
        self.0.lock()
    }

    #[inline]
    #[must_use]
    pub fn try_lock(&self) -> Option<SpinLockGuard<'_, KernelHeap>> {
        self.0.try_lock()
    }
}

unsafe impl GlobalAlloc for LockedHeap {
    /// Allocate a block of at least `layout.size()` bytes.
    ///
    /// # Safety
    /// The `GlobalAlloc` contract applies. Caller must handle a null return (OOM).
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() > HEAP_ALIGNMENT {
            return ptr::null_mut();
        }
        self.0
            .with_lock(|heap| heap.allocate(layout.size().max(1), HeapProtection::empty()))
            .map_or(ptr::null_mut(), NonNull::as_ptr)
    }

    /// Deallocate a block previously returned by `alloc`/`alloc_zeroed`.
    ///
    /// # Safety
    /// The `GlobalAlloc` contract applies. `ptr` and `layout` must match a prior allocation.
    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        let Some(p) = NonNull::new(ptr) else {
            return;
        };
        if let Err(e) = self.0.with_lock(|heap| heap.free(p)) {
            error!("heap: dealloc of {p:p} refused: {e}");
        }
    }

    /// Allocate and zero a block.
    ///
    /// # Safety
    /// The `GlobalAlloc` contract applies.
    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        if layout.align() > HEAP_ALIGNMENT {
            return ptr::null_mut();
        }
        self.0
            .with_lock(|heap| heap.calloc(1, layout.size().max(1)))
            .map_or(ptr::null_mut(), NonNull::as_ptr)
    }

    /// Resize in place when possible, otherwise move.
    ///
    /// # Safety
    /// The `GlobalAlloc` contract applies.
    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if layout.align() > HEAP_ALIGNMENT {
            return ptr::null_mut();
        }
        let Some(p) = NonNull::new(ptr) else {
            return ptr::null_mut();
        };
        self.0
            .with_lock(|heap| heap.realloc(p, new_size.max(1)))
            .map_or(ptr::null_mut(), NonNull::as_ptr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[repr(C, align(16))]
    struct Arena([u8; 16 * 1024]);

    #[test]
    fn global_alloc_contract() {
        let mut arena = std::boxed::Box::new(Arena([0; 16 * 1024]));
        let base = NonNull::new(arena.0.as_mut_ptr()).unwrap();
        let heap = LockedHeap::new(unsafe { KernelHeap::from_region(base, 16 * 1024, true) }.unwrap());

        let layout = Layout::from_size_align(24, 8).unwrap();
        let p = unsafe { heap.alloc(layout) };
        assert!(!p.is_null());
        assert_eq!(p.addr() % 8, 0);

        let too_aligned = Layout::from_size_align(24, 64).unwrap();
        assert!(unsafe { heap.alloc(too_aligned) }.is_null());

        let z = unsafe { heap.alloc_zeroed(layout) };
        assert!(unsafe { core::slice::from_raw_parts(z, 24) }.iter().all(|&b| b == 0));

        let q = unsafe { heap.realloc(p, layout, 200) };
        assert!(!q.is_null());
        unsafe {
            heap.dealloc(q, Layout::from_size_align(200, 8).unwrap());
            heap.dealloc(z, layout);
        }
        assert_eq!(heap.lock().block_count(), 1);
        assert!(!heap.lock().is_locked_down());

        // zero-sized layouts still get a distinct pointer
        let zst = unsafe { heap.alloc(Layout::new::<()>()) };
        assert!(!zst.is_null());
    }
}
