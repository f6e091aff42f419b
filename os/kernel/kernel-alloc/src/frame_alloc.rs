//! # Physical Frame Allocator
//!
//! One bit per 4 KiB frame, `1` = used, covering physical memory from `0` up
//! to the end of the highest usable region. The bitmap itself lives in
//! physical memory: it is carved out of the start of the largest usable
//! region and reached through the direct map, so the allocator never needs a
//! heap.
//!
//! ```text
//!  frame:   0   1   2   3   4   5   6   7  ...
//!  bit:     1   1   0   0   1   0   0   0  ...
//!           │   │           └─ reserved / firmware / handed out
//!           │   └─ bitmap storage
//!           └─ never handed out (null frame)
//! ```
//!
//! Everything the memory map does not call usable starts out used and is
//! never handed out. Allocation is first-fit from frame 1 upward, so the
//! lowest free run always wins.

use crate::phys_mapper::DirectMap;
use arrayvec::ArrayVec;
use core::ptr::NonNull;
use kernel_info::boot::{MemoryMap, MemoryRegion};
use kernel_memory_addresses::{FRAME_SIZE, PhysicalAddress, PhysicalFrame, align_down, align_up};
use kernel_vmem::{FrameAlloc, PhysMapper};
use log::{debug, info, warn};

/// Regions of the boot memory map kept for diagnostics and range checks.
pub const MAX_MEMORY_REGIONS: usize = 128;

const BITS_PER_WORD: u64 = 64;

/// Frame 0 is never handed out.
const FIRST_ALLOCATABLE: u64 = 1;

#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameAllocInitError {
    #[error("the memory map has no usable region")]
    NoUsableMemory,
    #[error("the bitmap needs {required} bytes but the largest usable region holds {largest}")]
    BitmapDoesNotFit { required: u64, largest: u64 },
    #[error("the bitmap at {0} is not reachable through the direct map")]
    BitmapNotMapped(PhysicalAddress),
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("no run of {requested} free frames")]
    OutOfFrames { requested: u64 },
    #[error("{0} is not frame-aligned")]
    Unaligned(PhysicalAddress),
    #[error("{0} is outside the tracked physical range")]
    OutOfRange(PhysicalAddress),
    #[error("{frame:?} is already free")]
    DoubleFree { frame: PhysicalFrame },
    #[error("{frame:?} belongs to the allocator and cannot be freed")]
    Reserved { frame: PhysicalFrame },
    #[error("frame count must be non-zero")]
    ZeroCount,
}

/// Bitmap-backed allocator for 4 KiB physical frames.
pub struct BitmapFrameAlloc {
    bitmap: NonNull<u64>,
    words: usize,
    /// Frames covered by the bitmap: `[0, total_frames)`.
    total_frames: u64,
    used_frames: u64,
    bitmap_base: PhysicalFrame,
    bitmap_frames: u64,
    /// Sum of every region in the boot map, usable or not.
    reported_memory: u64,
    regions: ArrayVec<MemoryRegion, MAX_MEMORY_REGIONS>,
    /// `false` if the boot map had more regions than fit in `regions`.
    regions_complete: bool,
    direct_map: DirectMap,
}

// Safety: the bitmap is only reached through `&mut self` (or a lock around it).
unsafe impl Send for BitmapFrameAlloc {}

#[allow(clippy::cast_possible_truncation)]
const fn word_of(index: u64) -> (usize, u64) {
    ((index / BITS_PER_WORD) as usize, 1 << (index % BITS_PER_WORD))
}

impl BitmapFrameAlloc {
    /// Build the allocator from the boot memory map.
    ///
    /// # Errors
    /// - [`FrameAllocInitError::NoUsableMemory`] if nothing is usable.
    /// - [`FrameAllocInitError::BitmapDoesNotFit`] if the bitmap is larger
    ///   than the largest usable region.
    /// - [`FrameAllocInitError::BitmapNotMapped`] if the chosen bitmap
    ///   location lies outside the direct map.
    ///
    /// # Safety
    /// Every usable region must be RAM that nothing else is using, reachable
    /// through `direct_map`.
    pub unsafe fn init(map: MemoryMap<'_>, direct_map: DirectMap) -> Result<Self, FrameAllocInitError> {
        let largest = map.largest_usable().ok_or(FrameAllocInitError::NoUsableMemory)?;
        let total_frames = map.highest_usable_end() / FRAME_SIZE;
        if total_frames <= FIRST_ALLOCATABLE {
            return Err(FrameAllocInitError::NoUsableMemory);
        }

        let words = total_frames.div_ceil(BITS_PER_WORD);
        let required = words * (BITS_PER_WORD / 8);
        let bitmap_frames = required.div_ceil(FRAME_SIZE);

        let start = align_up(largest.base, FRAME_SIZE).unwrap_or(u64::MAX);
        let fits = start
            .checked_add(bitmap_frames * FRAME_SIZE)
            .is_some_and(|end| end <= largest.end());
        if !fits {
            return Err(FrameAllocInitError::BitmapDoesNotFit {
                required,
                largest: largest.length,
            });
        }

        let bitmap_pa = PhysicalAddress::new(start);
        if !direct_map.covers(bitmap_pa, bitmap_frames * FRAME_SIZE) {
            return Err(FrameAllocInitError::BitmapNotMapped(bitmap_pa));
        }
        let bitmap = NonNull::new(direct_map.phys_to_ptr(bitmap_pa).cast::<u64>())
            .ok_or(FrameAllocInitError::BitmapNotMapped(bitmap_pa))?;

        let mut regions = ArrayVec::new();
        let mut regions_complete = true;
        for r in map.iter() {
            if regions.try_push(*r).is_err() {
                regions_complete = false;
                warn!(
                    "memory map has more than {MAX_MEMORY_REGIONS} regions; keeping the first {MAX_MEMORY_REGIONS}"
                );
                break;
            }
        }

        let mut this = Self {
            bitmap,
            words: usize::try_from(words).unwrap_or(usize::MAX),
            total_frames,
            used_frames: 0,
            bitmap_base: bitmap_pa.frame(),
            bitmap_frames,
            reported_memory: map.total_length(),
            regions,
            regions_complete,
            direct_map,
        };

        // everything used, then open up the usable regions
        this.words_mut().fill(u64::MAX);
        for r in map.usable() {
            let Some(first) = align_up(r.base, FRAME_SIZE) else {
                continue;
            };
            let first = first / FRAME_SIZE;
            let end = (align_down(r.end(), FRAME_SIZE) / FRAME_SIZE).min(total_frames);
            if first < end {
                this.clear_range(first, end);
            }
        }
        this.set_range(bitmap_pa.frame().index(), bitmap_pa.frame().index() + bitmap_frames);
        this.set_range(0, FIRST_ALLOCATABLE);

        let padding = (words * BITS_PER_WORD) - total_frames;
        let set: u64 = this.words().iter().map(|w| u64::from(w.count_ones())).sum();
        this.used_frames = set - padding;

        info!(
            "pmm: {} frames tracked, {} free, bitmap {} ({} frames), {} KiB reported",
            this.total_frames,
            this.free_frames(),
            bitmap_pa,
            bitmap_frames,
            this.reported_memory / 1024
        );
        Ok(this)
    }

    #[inline]
    fn words(&self) -> &[u64] {
        unsafe { core::slice::from_raw_parts(self.bitmap.as_ptr(), self.words) }
    }

    #[inline]
    fn words_mut(&mut self) -> &mut [u64] {
        unsafe { core::slice::from_raw_parts_mut(self.bitmap.as_ptr(), self.words) }
    }

    #[inline]
    fn test(&self, index: u64) -> bool {
        let (w, bit) = word_of(index);
        self.words()[w] & bit != 0
    }

    fn set_range(&mut self, first: u64, end: u64) {
        for i in first..end {
            let (w, bit) = word_of(i);
            self.words_mut()[w] |= bit;
        }
    }

    fn clear_range(&mut self, first: u64, end: u64) {
        for i in first..end {
            let (w, bit) = word_of(i);
            self.words_mut()[w] &= !bit;
        }
    }

    fn is_bitmap_frame(&self, index: u64) -> bool {
        let first = self.bitmap_base.index();
        index >= first && index < first + self.bitmap_frames
    }

    /// Whether `count` frames starting at `first` lie inside one usable region.
    fn is_usable_run(&self, first: u64, count: u64) -> bool {
        !self.regions_complete
            || MemoryMap::new(&self.regions).is_usable_range(first * FRAME_SIZE, count * FRAME_SIZE)
    }

    /// Allocate one frame.
    ///
    /// # Errors
    /// [`FrameError::OutOfFrames`] when no frame is free.
    #[inline]
    pub fn alloc_page(&mut self) -> Result<PhysicalAddress, FrameError> {
        self.alloc_pages(1)
    }

    /// Allocate `count` physically contiguous frames; returns the base of the
    /// lowest free run.
    ///
    /// # Errors
    /// [`FrameError::ZeroCount`] for `count == 0`, [`FrameError::OutOfFrames`]
    /// if no run of that length exists.
    pub fn alloc_pages(&mut self, count: u64) -> Result<PhysicalAddress, FrameError> {
        if count == 0 {
            return Err(FrameError::ZeroCount);
        }

        let mut run_start = FIRST_ALLOCATABLE;
        let mut index = FIRST_ALLOCATABLE;
        while index < self.total_frames {
            let (w, _) = word_of(index);
            if index % BITS_PER_WORD == 0 && self.words()[w] == u64::MAX {
                index += BITS_PER_WORD;
                run_start = index;
                continue;
            }
            if self.test(index) {
                index += 1;
                run_start = index;
                continue;
            }

            index += 1;
            if index - run_start == count {
                if self.is_usable_run(run_start, count) {
                    self.set_range(run_start, index);
                    self.used_frames += count;
                    let pa = PhysicalFrame::from_index(run_start).base();
                    debug!("pmm: allocated {count} frame(s) at {pa}");
                    return Ok(pa);
                }
                // straddles two regions; slide the window
                run_start += 1;
            }
        }

        warn!("pmm: no run of {count} free frames ({} free)", self.free_frames());
        Err(FrameError::OutOfFrames { requested: count })
    }

    /// Allocate one frame and fill it with zeros.
    ///
    /// # Errors
    /// Same as [`alloc_page`](Self::alloc_page).
    pub fn alloc_zeroed_page(&mut self) -> Result<PhysicalAddress, FrameError> {
        let pa = self.alloc_page()?;
        unsafe { self.direct_map.zero_frame(pa.frame()) };
        Ok(pa)
    }

    /// Return one frame.
    ///
    /// # Errors
    /// Same as [`free_pages`](Self::free_pages).
    #[inline]
    pub fn free_page(&mut self, pa: PhysicalAddress) -> Result<(), FrameError> {
        self.free_pages(pa, 1)
    }

    /// Return `count` frames starting at `pa`.
    ///
    /// The whole range is checked before any bit changes: on error nothing
    /// is freed.
    ///
    /// # Errors
    /// - [`FrameError::ZeroCount`], [`FrameError::Unaligned`] and
    ///   [`FrameError::OutOfRange`] for malformed requests.
    /// - [`FrameError::Reserved`] for frame 0 and the bitmap's own frames.
    /// - [`FrameError::DoubleFree`] if any frame in the range is already free.
    pub fn free_pages(&mut self, pa: PhysicalAddress, count: u64) -> Result<(), FrameError> {
        if count == 0 {
            return Err(FrameError::ZeroCount);
        }
        if !pa.is_frame_aligned() {
            return Err(FrameError::Unaligned(pa));
        }
        let first = pa.frame().index();
        let end = first
            .checked_add(count)
            .filter(|&end| end <= self.total_frames)
            .ok_or(FrameError::OutOfRange(pa))?;

        for i in first..end {
            if i < FIRST_ALLOCATABLE || self.is_bitmap_frame(i) {
                return Err(FrameError::Reserved {
                    frame: PhysicalFrame::from_index(i),
                });
            }
            if !self.test(i) {
                let frame = PhysicalFrame::from_index(i);
                warn!("pmm: double free of {frame:?}");
                return Err(FrameError::DoubleFree { frame });
            }
        }

        self.clear_range(first, end);
        self.used_frames -= count;
        debug!("pmm: freed {count} frame(s) at {pa}");
        Ok(())
    }

    /// Whether the frame's bit is set. Frames past the tracked range count as used.
    #[must_use]
    pub fn is_frame_used(&self, frame: PhysicalFrame) -> bool {
        frame.index() >= self.total_frames || self.test(frame.index())
    }

    #[inline]
    #[must_use]
    pub const fn total_frames(&self) -> u64 {
        self.total_frames
    }

    #[inline]
    #[must_use]
    pub const fn used_frames(&self) -> u64 {
        self.used_frames
    }

    #[inline]
    #[must_use]
    pub const fn free_frames(&self) -> u64 {
        self.total_frames - self.used_frames
    }

    /// Bytes covered by the bitmap.
    #[inline]
    #[must_use]
    pub const fn total_memory(&self) -> u64 {
        self.total_frames * FRAME_SIZE
    }

    #[inline]
    #[must_use]
    pub const fn used_memory(&self) -> u64 {
        self.used_frames * FRAME_SIZE
    }

    #[inline]
    #[must_use]
    pub const fn free_memory(&self) -> u64 {
        self.free_frames() * FRAME_SIZE
    }

    /// Sum of all region lengths the boot map reported, usable or not.
    #[inline]
    #[must_use]
    pub const fn reported_memory(&self) -> u64 {
        self.reported_memory
    }

    /// First frame and frame count of the bitmap storage.
    #[inline]
    #[must_use]
    pub const fn bitmap_region(&self) -> (PhysicalFrame, u64) {
        (self.bitmap_base, self.bitmap_frames)
    }

    #[inline]
    #[must_use]
    pub const fn direct_map(&self) -> DirectMap {
        self.direct_map
    }

    /// The retained copy of the boot memory map.
    #[must_use]
    pub fn memory_map(&self) -> MemoryMap<'_> {
        MemoryMap::new(&self.regions)
    }

    /// Log every retained region and the frame counters.
    pub fn dump_memory_map(&self) {
        info!("pmm: memory map ({} regions)", self.regions.len());
        for (i, r) in self.regions.iter().enumerate() {
            info!(
                "  [{i:3}] {:#014x}..{:#014x} {:>10} KiB  {}",
                r.base,
                r.end(),
                r.length / 1024,
                r.kind.as_str()
            );
        }
        info!(
            "pmm: {} used / {} free / {} total frames",
            self.used_frames,
            self.free_frames(),
            self.total_frames
        );
    }
}

impl FrameAlloc for BitmapFrameAlloc {
    fn alloc_4k(&mut self) -> Option<PhysicalFrame> {
        self.alloc_page().ok().map(PhysicalAddress::frame)
    }

    fn free_4k(&mut self, frame: PhysicalFrame) {
        if let Err(e) = self.free_page(frame.base()) {
            warn!("pmm: ignoring free of {frame:?}: {e}");
        }
    }
}
