//! Host-side stand-ins for physical memory and the MMU.

use crate::phys_mapper::DirectMap;
use kernel_memory_addresses::{PhysicalFrame, VirtualAddress};
use kernel_vmem::Mmu;
use std::boxed::Box;
use std::vec::Vec;

#[repr(C, align(4096))]
pub struct Frame {
    _bytes: [u8; 4096],
}

/// Simulated physical memory: physical address `pa` is byte `pa` of the
/// buffer, so the direct-map offset is the buffer's own address.
pub struct SimRam {
    _frames: Box<[Frame]>,
    base: *mut Frame,
    len: u64,
}

impl SimRam {
    pub fn new(bytes: u64) -> Self {
        let n = usize::try_from(bytes / 4096).unwrap();
        let mut frames: Box<[Frame]> = (0..n).map(|_| Frame { _bytes: [0; 4096] }).collect();
        let base = frames.as_mut_ptr();
        Self {
            _frames: frames,
            base,
            len: bytes,
        }
    }

    pub fn direct_map(&self) -> DirectMap {
        DirectMap::with_window(self.base as u64, self.len)
    }
}

/// [`Mmu`] that records what the memory core asked of the processor.
#[derive(Debug, Default)]
pub struct RecordingMmu {
    pub enabled: bool,
    pub root: Option<PhysicalFrame>,
    pub loads: Vec<PhysicalFrame>,
    pub invalidations: Vec<VirtualAddress>,
}

impl Mmu for RecordingMmu {
    fn translation_enabled(&self) -> bool {
        self.enabled
    }

    fn active_root(&self) -> PhysicalFrame {
        self.root.unwrap_or(PhysicalFrame::from_index(0))
    }

    unsafe fn set_active_root(&mut self, root: PhysicalFrame) {
        self.root = Some(root);
        self.loads.push(root);
    }

    fn invalidate_page(&mut self, va: VirtualAddress) {
        self.invalidations.push(va);
    }
}
