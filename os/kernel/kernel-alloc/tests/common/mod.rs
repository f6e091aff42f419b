use kernel_alloc::{DirectMap, HeapConfig, MemoryManager};
use kernel_info::boot::{MemoryMap, MemoryRegion};
use kernel_memory_addresses::{PhysicalFrame, VirtualAddress};
use kernel_vmem::Mmu;

pub const MIB: u64 = 1024 * 1024;

#[repr(C, align(4096))]
pub struct Frame {
    _bytes: [u8; 4096],
}

/// Host buffer standing in for physical memory starting at address 0.
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

    /// Host address of the first byte.
    pub fn base(&self) -> u64 {
        self.base as u64
    }

    pub fn direct_map(&self) -> DirectMap {
        DirectMap::with_window(self.base(), self.len)
    }
}

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

/// 16 MiB of usable RAM at 1 MiB, below it the usual legacy holes.
pub const REGIONS: [MemoryRegion; 1] = [MemoryRegion::usable(0x10_0000, 16 * MIB)];

/// Bring up a manager over [`REGIONS`] with a 16 KiB direct-mapped heap.
pub fn boot(ram: &SimRam) -> MemoryManager<RecordingMmu> {
    boot_with(ram, &REGIONS, HeapConfig::direct_mapped(16 * 1024))
}

pub fn boot_with(ram: &SimRam, regions: &[MemoryRegion], heap: HeapConfig) -> MemoryManager<RecordingMmu> {
    unsafe {
        MemoryManager::init_with_direct_map(
            MemoryMap::new(regions),
            ram.direct_map(),
            RecordingMmu::default(),
            heap,
        )
    }
    .unwrap()
}
