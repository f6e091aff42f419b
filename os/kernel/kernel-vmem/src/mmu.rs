use kernel_memory_addresses::{PhysicalFrame, VirtualAddress};

/// The processor's view of translation: whether it is on, which root table
/// is active, and single-entry translation-cache invalidation.
pub trait Mmu {
    /// Whether translation was already enabled (CR0.PG).
    fn translation_enabled(&self) -> bool;

    /// Root table of the active address space (CR3).
    fn active_root(&self) -> PhysicalFrame;

    /// Make `root` the active translation tree.
    ///
    /// # Safety
    /// `root` must be a complete root table that maps the running code,
    /// stack and data at their current addresses.
    unsafe fn set_active_root(&mut self, root: PhysicalFrame);

    /// Drop any cached translation for the page containing `va` on this core.
    fn invalidate_page(&mut self, va: VirtualAddress);
}

/// [`Mmu`] backed by the real control registers.
#[cfg(feature = "asm")]
#[derive(Debug, Default)]
pub struct HardwareMmu;

#[cfg(feature = "asm")]
impl Mmu for HardwareMmu {
    fn translation_enabled(&self) -> bool {
        use kernel_registers::{Cr0, LoadRegisterUnsafe};
        unsafe { Cr0::load_unsafe() }.translation_enabled()
    }

    fn active_root(&self) -> PhysicalFrame {
        use kernel_registers::{Cr3, LoadRegisterUnsafe};
        unsafe { Cr3::load_unsafe() }.root().frame()
    }

    unsafe fn set_active_root(&mut self, root: PhysicalFrame) {
        use kernel_registers::{Cr3, StoreRegisterUnsafe};
        // no handler may run between the load and the caller's bookkeeping
        let _irq = kernel_sync::IrqGuard::new();
        unsafe { Cr3::from_root(root.base()).store_unsafe() };
    }

    fn invalidate_page(&mut self, va: VirtualAddress) {
        unsafe { kernel_registers::tlb::invalidate_page(va) };
    }
}
