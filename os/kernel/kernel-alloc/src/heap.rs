//! # Hardened Kernel Heap
//!
//! A best-fit allocator over one contiguous region, with every block carrying
//! an in-band header. The blocks tile the region exactly, in address order:
//!
//! ```text
//!  base                                                           base + capacity
//!  ┌────────┬───────────┬────────┬──────────────┬────────┬─────────────────┐
//!  │ header │ payload A │ header │  free  …     │ header │ payload C       │
//!  └────────┴───────────┴────────┴──────────────┴────────┴─────────────────┘
//!     next ─────────────►  next ───────────────►   next = NONE
//! ```
//!
//! ## Integrity
//! - Every header has a canary at both ends and a checksum over its fields.
//! - Each allocate / free / realloc first validates the whole list: bounds,
//!   canaries, checksum, size range and both link directions.
//! - With poisoning on, fresh payload is filled with [`ALLOC_POISON`] and
//!   freed payload with [`FREE_POISON`]. The slack between the requested size
//!   and the block capacity must still be [`ALLOC_POISON`] when the block is
//!   freed; anything else is reported as a payload overflow.
//! - Any violation, a double free or a pointer the heap never handed out puts
//!   the heap into **lockdown**: every later allocate and free is refused
//!   until [`KernelHeap::reset_lockdown`] re-validates the list.
//!
//! Freed blocks merge with free neighbours on both sides, so two free blocks
//! are never adjacent.

mod backing;
mod block;
mod global;

pub use backing::{HeapConfig, HeapPlacement, map_heap_backing, place_heap};
pub use global::LockedHeap;

use block::{BlockHeader, HEADER_SIZE, NONE};
use core::ptr::{self, NonNull};
use log::{debug, error, info, warn};

/// Payload alignment and size granularity.
pub const HEAP_ALIGNMENT: usize = 8;
/// Smallest payload a block can have.
pub const HEAP_MIN_ALLOC: usize = 8;
/// Written at both ends of every block header.
pub const HEAP_CANARY: u64 = 0xDEAD_BEEF_CAFE_BABE;
/// Fill for freshly allocated payload and its slack.
pub const ALLOC_POISON: u8 = 0xAA;
/// Fill for freed payload.
pub const FREE_POISON: u8 = 0xDD;
/// A single allocation may take at most `capacity / HEAP_MAX_ALLOC_DIVISOR`.
pub const HEAP_MAX_ALLOC_DIVISOR: usize = 4;

/// Bytes of metadata in front of every payload.
pub const BLOCK_OVERHEAD: usize = HEADER_SIZE;

bitflags::bitflags! {
    /// Protection tags recorded with an allocation.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
    pub struct HeapProtection: u32 {
        const READ_ONLY = 1 << 0;
        const NO_EXECUTE = 1 << 1;
        const GUARD_PAGE = 1 << 2;
    }
}

/// What an integrity check found wrong.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Corruption {
    #[error("start canary overwritten")]
    StartCanary,
    #[error("end canary overwritten")]
    EndCanary,
    #[error("header checksum mismatch")]
    Checksum,
    #[error("block size out of range")]
    SizeOutOfRange,
    #[error("block extends past the heap")]
    OutOfBounds,
    #[error("inconsistent block links")]
    BrokenLink,
    #[error("payload written past the requested size")]
    PayloadOverflow,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HeapError {
    #[error("heap is not initialized")]
    NotInitialized,
    #[error("zero-sized allocation")]
    ZeroSize,
    #[error("{requested} bytes exceeds the per-allocation limit of {max}")]
    TooLarge { requested: usize, max: usize },
    #[error("no free block for {requested} bytes")]
    OutOfMemory { requested: usize },
    #[error("heap is locked down")]
    LockedDown,
    #[error("pointer was not handed out by this heap")]
    InvalidPointer,
    #[error("block is already free")]
    DoubleFree,
    #[error("heap corruption: {0}")]
    Corrupted(Corruption),
    #[error("mapping heap backing failed: {0}")]
    MapFailed(crate::paging::PagingError),
    #[error("size computation overflowed")]
    Overflow,
    #[error("region too small for a single block")]
    RegionTooSmall,
    #[error("heap cannot grow any further")]
    NotGrowable,
}

/// Counters since initialization.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct HeapStats {
    pub total_allocations: u64,
    pub total_frees: u64,
    pub failed_allocations: u64,
    pub double_free_attempts: u64,
    pub buffer_overflow_detected: u64,
    pub corruption_count: u64,
}

/// One block as seen by [`KernelHeap::blocks`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct BlockInfo {
    /// Payload address.
    pub payload: NonNull<u8>,
    pub size: usize,
    pub requested: usize,
    pub used: bool,
    pub protection: HeapProtection,
}

/// What a payload pointer refers to.
enum Lookup {
    Used(usize, BlockHeader),
    /// A free block, or the inside of one (its header was merged away).
    Free,
    Foreign,
}

#[derive(Default)]
struct Tally {
    blocks: usize,
    used: usize,
    free: usize,
    largest_free: usize,
}

#[inline]
const fn round_up(size: usize) -> usize {
    let rounded = size.next_multiple_of(HEAP_ALIGNMENT);
    if rounded < HEAP_MIN_ALLOC {
        HEAP_MIN_ALLOC
    } else {
        rounded
    }
}

pub struct KernelHeap {
    base: Option<NonNull<u8>>,
    capacity: usize,
    locked_down: bool,
    poisoning: bool,
    stats: HeapStats,
}

// Safety: the region is owned by the heap; access is serialized by `&mut self`.
unsafe impl Send for KernelHeap {}

impl KernelHeap {
    /// A heap that refuses everything with [`HeapError::NotInitialized`].
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            base: None,
            capacity: 0,
            locked_down: false,
            poisoning: cfg!(feature = "poison"),
            stats: HeapStats {
                total_allocations: 0,
                total_frees: 0,
                failed_allocations: 0,
                double_free_attempts: 0,
                buffer_overflow_detected: 0,
                corruption_count: 0,
            },
        }
    }

    /// Take over `[base, base + size)` as one free block.
    ///
    /// The start is rounded up and the end down to [`HEAP_ALIGNMENT`].
    ///
    /// # Errors
    /// [`HeapError::RegionTooSmall`] if not even one minimal block fits.
    ///
    /// # Safety
    /// The region must be writable, unused by anything else, and stay so for
    /// as long as the heap lives.
    pub unsafe fn from_region(base: NonNull<u8>, size: usize, poisoning: bool) -> Result<Self, HeapError> {
        let mut heap = Self::empty();
        unsafe { heap.init(base, size, poisoning) }?;
        Ok(heap)
    }

    /// In-place form of [`from_region`](Self::from_region), for a heap
    /// living in a `static`.
    ///
    /// # Errors
    /// As [`from_region`](Self::from_region).
    ///
    /// # Safety
    /// As [`from_region`](Self::from_region).
    pub unsafe fn init(&mut self, base: NonNull<u8>, size: usize, poisoning: bool) -> Result<(), HeapError> {
        let lead = base.align_offset(HEAP_ALIGNMENT);
        let capacity = size.saturating_sub(lead) & !(HEAP_ALIGNMENT - 1);
        if capacity < HEADER_SIZE + HEAP_MIN_ALLOC {
            return Err(HeapError::RegionTooSmall);
        }
        let base = unsafe { base.add(lead) };

        *self = Self {
            base: Some(base),
            capacity,
            poisoning,
            ..Self::empty()
        };
        self.write(0, BlockHeader::free(capacity - HEADER_SIZE, NONE, NONE, poisoning));
        if poisoning {
            self.fill(HEADER_SIZE, capacity - HEADER_SIZE, FREE_POISON);
        }
        info!(
            "heap: {capacity} bytes at {:p}, max allocation {}, poisoning {}",
            base,
            self.max_allocation(),
            if poisoning { "on" } else { "off" }
        );
        Ok(())
    }

    #[inline]
    #[must_use]
    pub const fn is_initialized(&self) -> bool {
        self.base.is_some()
    }

    /// Start of the managed region.
    #[inline]
    #[must_use]
    pub const fn base(&self) -> Option<NonNull<u8>> {
        self.base
    }

    /// Largest request [`allocate`](Self::allocate) accepts.
    #[inline]
    #[must_use]
    pub const fn max_allocation(&self) -> usize {
        self.capacity / HEAP_MAX_ALLOC_DIVISOR
    }

    #[inline]
    #[must_use]
    pub const fn poisoning(&self) -> bool {
        self.poisoning
    }

    /// Turn poisoning on or off for blocks allocated or freed from now on.
    pub fn set_poisoning(&mut self, on: bool) {
        self.poisoning = on;
        info!("heap: poisoning {}", if on { "on" } else { "off" });
    }

    #[inline]
    fn ptr_at(&self, off: usize) -> *mut u8 {
        match self.base {
            Some(b) => unsafe { b.as_ptr().add(off) },
            None => ptr::null_mut(),
        }
    }

    #[inline]
    fn read(&self, off: usize) -> BlockHeader {
        unsafe { ptr::read(self.ptr_at(off).cast::<BlockHeader>()) }
    }

    /// Seal `h` and store it at `off`.
    #[inline]
    fn write(&mut self, off: usize, mut h: BlockHeader) {
        h.seal();
        unsafe { ptr::write(self.ptr_at(off).cast::<BlockHeader>(), h) };
    }

    #[inline]
    fn fill(&mut self, off: usize, len: usize, byte: u8) {
        unsafe { ptr::write_bytes(self.ptr_at(off), byte, len) };
    }

    fn payload(&self, off: usize) -> NonNull<u8> {
        // callers only pass offsets of validated blocks inside an initialized heap
        NonNull::new(self.ptr_at(off + HEADER_SIZE)).unwrap_or(NonNull::dangling())
    }

    /// Header checks that need nothing but the block itself.
    fn check_block(&self, off: usize) -> Result<BlockHeader, Corruption> {
        if off % HEAP_ALIGNMENT != 0 || off.checked_add(HEADER_SIZE).is_none_or(|e| e > self.capacity) {
            return Err(Corruption::OutOfBounds);
        }
        let h = self.read(off);
        h.check_seal()?;
        if h.size < HEAP_MIN_ALLOC || h.size > self.capacity - HEADER_SIZE || h.requested > h.size {
            return Err(Corruption::SizeOutOfRange);
        }
        let end = off + HEADER_SIZE + h.size;
        if end > self.capacity {
            return Err(Corruption::OutOfBounds);
        }
        let next_ok = if h.next == NONE { end == self.capacity } else { h.next == end };
        let prev_ok = if off == 0 { h.prev == NONE } else { h.prev != NONE && h.prev < off };
        if !next_ok || !prev_ok {
            return Err(Corruption::BrokenLink);
        }
        Ok(h)
    }

    /// Validate every block in address order and hand each to `f`.
    ///
    /// On failure returns the offending block's offset.
    fn for_each_block(&self, mut f: impl FnMut(usize, &BlockHeader)) -> Result<(), (usize, Corruption)> {
        if self.base.is_none() {
            return Ok(());
        }
        let max_steps = self.capacity / (HEADER_SIZE + HEAP_MIN_ALLOC);
        let mut off = 0;
        let mut prev = NONE;
        for _ in 0..=max_steps {
            let h = self.check_block(off).map_err(|c| (off, c))?;
            if h.prev != prev {
                return Err((off, Corruption::BrokenLink));
            }
            f(off, &h);
            if h.next == NONE {
                return Ok(());
            }
            prev = off;
            off = h.next;
        }
        Err((off, Corruption::BrokenLink))
    }

    fn find(&self, ptr: NonNull<u8>) -> Result<Lookup, (usize, Corruption)> {
        let Some(base) = self.base else {
            return Ok(Lookup::Foreign);
        };
        let Some(off) = ptr
            .addr()
            .get()
            .checked_sub(base.addr().get() + HEADER_SIZE)
            .filter(|&off| off < self.capacity && off % HEAP_ALIGNMENT == 0)
        else {
            return Ok(Lookup::Foreign);
        };

        let mut found = Lookup::Foreign;
        self.for_each_block(|o, h| {
            if o == off {
                found = if h.is_used() { Lookup::Used(o, *h) } else { Lookup::Free };
            } else if !h.is_used() && off > o && off < o + HEADER_SIZE + h.size {
                found = Lookup::Free;
            }
        })?;
        Ok(found)
    }

    /// Record a violation at `off` and lock the heap down.
    fn trip(&mut self, off: usize, c: Corruption) -> HeapError {
        self.stats.corruption_count += 1;
        if c == Corruption::PayloadOverflow {
            self.stats.buffer_overflow_detected += 1;
        }
        error!("heap: {c} in block at {:p}", self.ptr_at(off));
        self.lockdown();
        HeapError::Corrupted(c)
    }

    /// Resolve a caller's pointer to its used block, escalating anything else.
    fn locate(&mut self, ptr: NonNull<u8>) -> Result<(usize, BlockHeader), HeapError> {
        match self.find(ptr) {
            Ok(Lookup::Used(off, h)) => Ok((off, h)),
            Ok(Lookup::Free) => {
                self.stats.double_free_attempts += 1;
                error!("heap: {ptr:p} is already free");
                self.lockdown();
                Err(HeapError::DoubleFree)
            }
            Ok(Lookup::Foreign) => {
                error!("heap: {ptr:p} was not allocated from this heap");
                self.lockdown();
                Err(HeapError::InvalidPointer)
            }
            Err((off, c)) => Err(self.trip(off, c)),
        }
    }

    /// Common refusals ahead of any list access.
    fn ensure_usable(&mut self) -> Result<(), HeapError> {
        if self.base.is_none() {
            return Err(HeapError::NotInitialized);
        }
        if self.locked_down {
            return Err(HeapError::LockedDown);
        }
        Ok(())
    }

    /// The slack after the requested bytes must still hold the allocation poison.
    fn check_slack(&mut self, off: usize, h: &BlockHeader) -> Result<(), HeapError> {
        if !h.is_poisoned() || h.requested >= h.size {
            return Ok(());
        }
        let slack = unsafe {
            core::slice::from_raw_parts(self.ptr_at(off + HEADER_SIZE + h.requested), h.size - h.requested)
        };
        if slack.iter().all(|&b| b == ALLOC_POISON) {
            Ok(())
        } else {
            Err(self.trip(off, Corruption::PayloadOverflow))
        }
    }

    /// Allocate at least `size` bytes, 8-byte aligned.
    ///
    /// # Errors
    /// - [`HeapError::NotInitialized`], [`HeapError::LockedDown`].
    /// - [`HeapError::ZeroSize`] and [`HeapError::TooLarge`] for bad sizes.
    /// - [`HeapError::Corrupted`] if validation fails (the heap locks down).
    /// - [`HeapError::OutOfMemory`] if no free block is large enough.
    pub fn allocate(&mut self, size: usize, protection: HeapProtection) -> Result<NonNull<u8>, HeapError> {
        let result = self.allocate_inner(size, protection);
        if result.is_err() {
            self.stats.failed_allocations += 1;
        }
        result
    }

    fn allocate_inner(&mut self, size: usize, protection: HeapProtection) -> Result<NonNull<u8>, HeapError> {
        self.ensure_usable()?;
        if size == 0 {
            return Err(HeapError::ZeroSize);
        }
        let max = self.max_allocation();
        if size > max {
            warn!("heap: refusing {size} bytes (limit {max})");
            return Err(HeapError::TooLarge { requested: size, max });
        }
        let rounded = round_up(size);

        let mut best: Option<(usize, BlockHeader)> = None;
        self.for_each_block(|off, h| {
            let better = best.is_none_or(|(_, b)| h.size < b.size);
            if !h.is_used() && h.size >= rounded && better {
                best = Some((off, *h));
            }
        })
        .map_err(|(off, c)| self.trip(off, c))?;

        let Some((off, mut h)) = best else {
            warn!("heap: out of memory for {size} bytes");
            return Err(HeapError::OutOfMemory { requested: size });
        };

        if h.size >= rounded + HEADER_SIZE + HEAP_MIN_ALLOC {
            let split = off + HEADER_SIZE + rounded;
            let rest = BlockHeader::free(h.size - rounded - HEADER_SIZE, off, h.next, h.is_poisoned());
            if h.next != NONE {
                let mut next = self.read(h.next);
                next.prev = split;
                self.write(h.next, next);
            }
            self.write(split, rest);
            h.size = rounded;
            h.next = split;
        }

        h.set_used(true);
        h.set_poisoned(self.poisoning);
        h.requested = size;
        h.protection = protection.bits();
        self.write(off, h);
        if self.poisoning {
            self.fill(off + HEADER_SIZE, h.size, ALLOC_POISON);
        }

        self.stats.total_allocations += 1;
        let p = self.payload(off);
        debug!("heap: allocated {size} ({}) bytes at {p:p}", h.size);
        Ok(p)
    }

    /// Return a block. Neighbouring free blocks are merged.
    ///
    /// # Errors
    /// - [`HeapError::NotInitialized`], [`HeapError::LockedDown`].
    /// - [`HeapError::DoubleFree`], [`HeapError::InvalidPointer`] and
    ///   [`HeapError::Corrupted`]; all three lock the heap down.
    pub fn free(&mut self, ptr: NonNull<u8>) -> Result<(), HeapError> {
        self.ensure_usable()?;
        let (off, mut h) = self.locate(ptr)?;
        self.check_slack(off, &h)?;

        h.set_used(false);
        h.set_poisoned(self.poisoning);
        h.requested = 0;
        h.protection = 0;
        self.write(off, h);
        if self.poisoning {
            self.fill(off + HEADER_SIZE, h.size, FREE_POISON);
        }
        self.coalesce(off);

        self.stats.total_frees += 1;
        debug!("heap: freed {ptr:p}");
        Ok(())
    }

    /// Merge the free block at `off` with a free successor, then with a free
    /// predecessor.
    fn coalesce(&mut self, off: usize) {
        let mut h = self.read(off);
        if h.next != NONE {
            let next_off = h.next;
            let next = self.read(next_off);
            if !next.is_used() {
                h.size += HEADER_SIZE + next.size;
                h.next = next.next;
                h.set_poisoned(h.is_poisoned() && next.is_poisoned());
                self.relink_prev(next.next, off);
                self.write(off, h);
                self.scrub(next_off);
            }
        }

        if h.prev != NONE {
            let prev_off = h.prev;
            let mut prev = self.read(prev_off);
            if !prev.is_used() {
                prev.size += HEADER_SIZE + h.size;
                prev.next = h.next;
                prev.set_poisoned(prev.is_poisoned() && h.is_poisoned());
                self.relink_prev(h.next, prev_off);
                self.write(prev_off, prev);
                self.scrub(off);
            }
        }
    }

    fn relink_prev(&mut self, off: usize, prev: usize) {
        if off != NONE {
            let mut h = self.read(off);
            h.prev = prev;
            self.write(off, h);
        }
    }

    /// Wipe a header that was merged into its neighbour.
    fn scrub(&mut self, off: usize) {
        let byte = if self.poisoning { FREE_POISON } else { 0 };
        self.fill(off, HEADER_SIZE, byte);
    }

    /// Allocate `count * size` zeroed bytes.
    ///
    /// # Errors
    /// [`HeapError::Overflow`] if the product overflows; otherwise as
    /// [`allocate`](Self::allocate).
    pub fn calloc(&mut self, count: usize, size: usize) -> Result<NonNull<u8>, HeapError> {
        let Some(total) = count.checked_mul(size) else {
            self.stats.failed_allocations += 1;
            return Err(HeapError::Overflow);
        };
        let p = self.allocate(total, HeapProtection::empty())?;
        unsafe { ptr::write_bytes(p.as_ptr(), 0, total) };
        Ok(p)
    }

    /// Resize an allocation. Stays in place when the block's capacity is
    /// enough, otherwise moves it and copies the old contents.
    ///
    /// # Errors
    /// [`HeapError::ZeroSize`] for `new_size == 0` (use [`free`](Self::free));
    /// otherwise as [`allocate`](Self::allocate) and [`free`](Self::free).
    pub fn realloc(&mut self, ptr: NonNull<u8>, new_size: usize) -> Result<NonNull<u8>, HeapError> {
        self.ensure_usable()?;
        if new_size == 0 {
            return Err(HeapError::ZeroSize);
        }
        let max = self.max_allocation();
        if new_size > max {
            return Err(HeapError::TooLarge { requested: new_size, max });
        }
        let (off, mut h) = self.locate(ptr)?;
        self.check_slack(off, &h)?;

        if round_up(new_size) <= h.size {
            if h.is_poisoned() && new_size < h.requested {
                self.fill(off + HEADER_SIZE + new_size, h.requested - new_size, ALLOC_POISON);
            }
            h.requested = new_size;
            self.write(off, h);
            debug!("heap: resized {ptr:p} in place to {new_size} bytes");
            return Ok(ptr);
        }

        let protection = HeapProtection::from_bits_truncate(h.protection);
        let moved = self.allocate(new_size, protection)?;
        unsafe { ptr::copy_nonoverlapping(ptr.as_ptr(), moved.as_ptr(), h.requested.min(new_size)) };
        self.free(ptr)?;
        Ok(moved)
    }

    /// Full validation of the block owning `ptr`. Damage anywhere in the
    /// list locks the heap down, as in [`validate_all_blocks`](Self::validate_all_blocks).
    ///
    /// # Errors
    /// [`HeapError::InvalidPointer`] if `ptr` is not a live allocation,
    /// [`HeapError::Corrupted`] if the block or the list is damaged.
    pub fn validate_block(&mut self, ptr: NonNull<u8>) -> Result<(), HeapError> {
        match self.find(ptr) {
            Ok(Lookup::Used(..)) => Ok(()),
            Ok(_) => Err(HeapError::InvalidPointer),
            Err((off, c)) => Err(self.trip(off, c)),
        }
    }

    /// Walk and validate the whole list; returns the number of blocks.
    /// A failure locks the heap down.
    ///
    /// # Errors
    /// [`HeapError::Corrupted`] describing the first damaged block.
    pub fn validate_all_blocks(&mut self) -> Result<usize, HeapError> {
        let mut n = 0;
        match self.for_each_block(|_, _| n += 1) {
            Ok(()) => Ok(n),
            Err((off, c)) => Err(self.trip(off, c)),
        }
    }

    /// Whether `ptr` is the payload of a live allocation. A damaged list
    /// answers `false` and locks the heap down.
    pub fn is_valid_pointer(&mut self, ptr: NonNull<u8>) -> bool {
        self.validate_block(ptr).is_ok()
    }

    /// Refuse every allocate and free from now on.
    pub fn lockdown(&mut self) {
        if !self.locked_down {
            error!("heap: LOCKDOWN, all further allocations refused");
            self.locked_down = true;
        }
    }

    #[inline]
    #[must_use]
    pub const fn is_locked_down(&self) -> bool {
        self.locked_down
    }

    /// Leave lockdown, but only if the list validates again.
    ///
    /// # Errors
    /// [`HeapError::Corrupted`] if the damage is still there.
    pub fn reset_lockdown(&mut self) -> Result<(), HeapError> {
        match self.for_each_block(|_, _| {}) {
            Ok(()) => {
                if self.locked_down {
                    warn!("heap: lockdown lifted after successful validation");
                }
                self.locked_down = false;
                Ok(())
            }
            Err((off, c)) => {
                error!("heap: lockdown stays, {c} in block at {:p}", self.ptr_at(off));
                Err(HeapError::Corrupted(c))
            }
        }
    }

    #[inline]
    #[must_use]
    pub const fn stats(&self) -> HeapStats {
        self.stats
    }

    fn tally(&self) -> Tally {
        let mut t = Tally::default();
        let walked = self.for_each_block(|_, h| {
            t.blocks += 1;
            if h.is_used() {
                t.used += HEADER_SIZE + h.size;
            } else {
                t.used += HEADER_SIZE;
                t.free += h.size;
                t.largest_free = t.largest_free.max(h.size);
            }
        });
        if let Err((off, c)) = walked {
            warn!("heap: statistics stop at block {off:#x}: {c}");
        }
        t
    }

    /// Bytes managed, metadata included.
    #[inline]
    #[must_use]
    pub const fn total_size(&self) -> usize {
        self.capacity
    }

    /// Payload of used blocks plus every header.
    #[must_use]
    pub fn used_size(&self) -> usize {
        self.tally().used
    }

    /// Payload capacity of free blocks.
    #[must_use]
    pub fn free_size(&self) -> usize {
        self.tally().free
    }

    #[must_use]
    pub fn block_count(&self) -> usize {
        self.tally().blocks
    }

    #[must_use]
    pub fn largest_free_block(&self) -> usize {
        self.tally().largest_free
    }

    /// Visit every block in address order. Stops early on corruption.
    pub fn blocks(&self, mut f: impl FnMut(BlockInfo)) {
        let walked = self.for_each_block(|off, h| {
            f(BlockInfo {
                payload: self.payload(off),
                size: h.size,
                requested: h.requested,
                used: h.is_used(),
                protection: HeapProtection::from_bits_truncate(h.protection),
            });
        });
        if let Err((off, c)) = walked {
            warn!("heap: block walk stopped at {off:#x}: {c}");
        }
    }

    /// Log one line per block.
    pub fn dump_blocks(&self) {
        info!("heap: {} bytes at {:?}", self.capacity, self.base);
        self.blocks(|b| {
            info!(
                "  {:p} {:>8} / {:>8} {} {:?}",
                b.payload,
                b.requested,
                b.size,
                if b.used { "used" } else { "free" },
                b.protection
            );
        });
    }

    pub fn log_stats(&self) {
        let t = self.tally();
        let s = self.stats;
        info!(
            "heap: {} blocks, {} used / {} free / {} total bytes, largest free {}",
            t.blocks, t.used, t.free, self.capacity, t.largest_free
        );
        info!(
            "heap: {} allocs, {} frees, {} failed, {} double frees, {} overflows, {} corruptions{}",
            s.total_allocations,
            s.total_frees,
            s.failed_allocations,
            s.double_free_attempts,
            s.buffer_overflow_detected,
            s.corruption_count,
            if self.locked_down { ", LOCKED DOWN" } else { "" }
        );
    }

    /// Grow the managed region by `additional` bytes directly after its end.
    ///
    /// # Errors
    /// [`HeapError::NotInitialized`], [`HeapError::LockedDown`],
    /// [`HeapError::Corrupted`], or [`HeapError::RegionTooSmall`] if the last
    /// block is in use and `additional` cannot hold a block of its own.
    ///
    /// # Safety
    /// `[base + total_size, base + total_size + additional)` must be writable
    /// and unused, either mapped or inside a demand-paged region.
    pub unsafe fn extend(&mut self, additional: usize) -> Result<(), HeapError> {
        self.ensure_usable()?;
        let additional = additional & !(HEAP_ALIGNMENT - 1);
        if additional == 0 {
            return Ok(());
        }
        let mut last = None;
        self.for_each_block(|off, h| last = Some((off, *h)))
            .map_err(|(off, c)| self.trip(off, c))?;
        let Some((last_off, mut last)) = last else {
            return Err(HeapError::NotInitialized);
        };

        let old_end = self.capacity;
        if last.is_used() {
            if additional < HEADER_SIZE + HEAP_MIN_ALLOC {
                return Err(HeapError::RegionTooSmall);
            }
            self.capacity += additional;
            last.next = old_end;
            self.write(last_off, last);
            self.write(
                old_end,
                BlockHeader::free(additional - HEADER_SIZE, last_off, NONE, self.poisoning),
            );
            if self.poisoning {
                self.fill(old_end + HEADER_SIZE, additional - HEADER_SIZE, FREE_POISON);
            }
        } else {
            self.capacity += additional;
            last.size += additional;
            last.set_poisoned(last.is_poisoned() && self.poisoning);
            self.write(last_off, last);
            if self.poisoning {
                self.fill(old_end, additional, FREE_POISON);
            }
        }
        info!("heap: grew by {additional} bytes to {}", self.capacity);
        Ok(())
    }

    /// Overwrite the start canary of the block owning `ptr`.
    #[cfg(test)]
    pub(crate) fn smash_header(&mut self, ptr: NonNull<u8>) {
        let off = ptr.addr().get() - self.ptr_at(0).addr() - HEADER_SIZE;
        let mut h = self.read(off);
        h.smash_start_canary();
        unsafe { ptr::write(self.ptr_at(off).cast::<BlockHeader>(), h) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::vec;
    use std::vec::Vec;

    #[repr(C, align(16))]
    struct Arena([u8; 64 * 1024]);

    fn heap(arena: &mut Arena, poisoning: bool) -> KernelHeap {
        let base = NonNull::new(arena.0.as_mut_ptr()).unwrap();
        unsafe { KernelHeap::from_region(base, arena.0.len(), poisoning) }.unwrap()
    }

    fn arena() -> std::boxed::Box<Arena> {
        std::boxed::Box::new(Arena([0; 64 * 1024]))
    }

    fn sizes(h: &KernelHeap) -> Vec<(usize, bool)> {
        let mut v = Vec::new();
        h.blocks(|b| v.push((b.size, b.used)));
        v
    }

    #[test]
    fn fresh_heap_is_one_free_block() {
        let mut a = arena();
        let h = heap(&mut a, true);
        assert_eq!(h.block_count(), 1);
        assert_eq!(h.free_size(), 64 * 1024 - BLOCK_OVERHEAD);
        assert_eq!(h.used_size() + h.free_size(), h.total_size());
        assert_eq!(h.max_allocation(), 16 * 1024);
    }

    #[test]
    fn allocation_is_aligned_poisoned_and_split() {
        let mut a = arena();
        let mut h = heap(&mut a, true);
        let p = h.allocate(13, HeapProtection::NO_EXECUTE).unwrap();
        assert_eq!(p.addr().get() % HEAP_ALIGNMENT, 0);
        let bytes = unsafe { core::slice::from_raw_parts(p.as_ptr(), 16) };
        assert!(bytes.iter().all(|&b| b == ALLOC_POISON));
        assert_eq!(sizes(&h), vec![(16, true), (64 * 1024 - 2 * BLOCK_OVERHEAD - 16, false)]);
        assert_eq!(h.used_size() + h.free_size(), h.total_size());
        assert!(h.is_valid_pointer(p));
        assert_eq!(h.validate_block(p), Ok(()));
    }

    #[test]
    fn size_refusals() {
        let mut a = arena();
        let mut h = heap(&mut a, true);
        assert_eq!(h.allocate(0, HeapProtection::empty()), Err(HeapError::ZeroSize));
        assert_eq!(
            h.allocate(16 * 1024 + 1, HeapProtection::empty()),
            Err(HeapError::TooLarge {
                requested: 16 * 1024 + 1,
                max: 16 * 1024
            })
        );
        assert_eq!(h.stats().failed_allocations, 2);
        assert!(!h.is_locked_down());
    }

    #[test]
    fn uninitialized_heap_refuses() {
        let mut h = KernelHeap::empty();
        assert_eq!(h.allocate(8, HeapProtection::empty()), Err(HeapError::NotInitialized));
        assert_eq!(h.free(NonNull::dangling()), Err(HeapError::NotInitialized));
        assert_eq!(h.block_count(), 0);
    }

    #[test]
    fn best_fit_prefers_the_smallest_hole() {
        let mut a = arena();
        let mut h = heap(&mut a, false);
        let big = h.allocate(512, HeapProtection::empty()).unwrap();
        let _sep1 = h.allocate(8, HeapProtection::empty()).unwrap();
        let small = h.allocate(64, HeapProtection::empty()).unwrap();
        let _sep2 = h.allocate(8, HeapProtection::empty()).unwrap();
        h.free(big).unwrap();
        h.free(small).unwrap();

        assert_eq!(h.allocate(48, HeapProtection::empty()).unwrap(), small);
        assert_eq!(h.allocate(256, HeapProtection::empty()).unwrap(), big);
    }

    #[test]
    fn coalescing_in_either_order() {
        for reverse in [false, true] {
            let mut a = arena();
            let mut h = heap(&mut a, true);
            let x = h.allocate(100, HeapProtection::empty()).unwrap();
            let y = h.allocate(200, HeapProtection::empty()).unwrap();
            let _z = h.allocate(300, HeapProtection::empty()).unwrap();
            if reverse {
                h.free(y).unwrap();
                h.free(x).unwrap();
            } else {
                h.free(x).unwrap();
                h.free(y).unwrap();
            }
            let blocks = sizes(&h);
            assert_eq!(blocks[0], (104 + BLOCK_OVERHEAD + 200, false));
            assert_eq!(blocks.len(), 3);
            assert_eq!(h.validate_all_blocks(), Ok(3));
        }
    }

    #[test]
    fn freeing_everything_restores_one_block() {
        let mut a = arena();
        let mut h = heap(&mut a, true);
        let ptrs: Vec<_> = (1..20)
            .map(|i| h.allocate(i * 24, HeapProtection::empty()).unwrap())
            .collect();
        for p in ptrs.iter().step_by(2).chain(ptrs.iter().skip(1).step_by(2)) {
            h.free(*p).unwrap();
        }
        assert_eq!(h.block_count(), 1);
        assert_eq!(h.largest_free_block(), 64 * 1024 - BLOCK_OVERHEAD);
        assert_eq!(h.stats().total_allocations, 19);
        assert_eq!(h.stats().total_frees, 19);
    }

    #[test]
    fn double_free_is_detected_and_locks_down() {
        let mut a = arena();
        let mut h = heap(&mut a, true);
        let p = h.allocate(32, HeapProtection::empty()).unwrap();
        let _keep = h.allocate(32, HeapProtection::empty()).unwrap();
        h.free(p).unwrap();
        assert_eq!(h.free(p), Err(HeapError::DoubleFree));
        assert_eq!(h.stats().double_free_attempts, 1);
        assert!(h.is_locked_down());
        assert_eq!(h.allocate(8, HeapProtection::empty()), Err(HeapError::LockedDown));

        // the list itself is intact, so lockdown can be lifted
        assert_eq!(h.reset_lockdown(), Ok(()));
        assert!(h.allocate(8, HeapProtection::empty()).is_ok());
    }

    #[test]
    fn stale_pointer_into_merged_block_is_a_double_free() {
        let mut a = arena();
        let mut h = heap(&mut a, false);
        let x = h.allocate(64, HeapProtection::empty()).unwrap();
        let y = h.allocate(64, HeapProtection::empty()).unwrap();
        let _z = h.allocate(64, HeapProtection::empty()).unwrap();
        h.free(x).unwrap();
        h.free(y).unwrap(); // y's header is merged into x
        assert_eq!(h.free(y), Err(HeapError::DoubleFree));
    }

    #[test]
    fn foreign_pointer_locks_down() {
        let mut a = arena();
        let mut h = heap(&mut a, true);
        let p = h.allocate(64, HeapProtection::empty()).unwrap();
        let inside = unsafe { p.add(8) };
        assert!(!h.is_valid_pointer(inside));
        assert_eq!(h.free(inside), Err(HeapError::InvalidPointer));
        assert!(h.is_locked_down());
        assert_eq!(h.free(p), Err(HeapError::LockedDown));
    }

    #[test]
    fn slack_overflow_is_caught_on_free() {
        let mut a = arena();
        let mut h = heap(&mut a, true);
        let p = h.allocate(13, HeapProtection::empty()).unwrap();
        unsafe { p.add(13).write(0) };
        assert_eq!(h.free(p), Err(HeapError::Corrupted(Corruption::PayloadOverflow)));
        let s = h.stats();
        assert_eq!((s.buffer_overflow_detected, s.corruption_count), (1, 1));
        assert!(h.is_locked_down());
    }

    #[test]
    fn header_overwrite_is_caught_on_next_operation() {
        let mut a = arena();
        let mut h = heap(&mut a, true);
        let p = h.allocate(16, HeapProtection::empty()).unwrap();
        let q = h.allocate(16, HeapProtection::empty()).unwrap();
        // run past p's payload into q's start canary
        unsafe { ptr::write_bytes(p.as_ptr(), 0x41, 16 + 8) };
        assert_eq!(
            h.allocate(8, HeapProtection::empty()),
            Err(HeapError::Corrupted(Corruption::StartCanary))
        );
        assert!(h.is_locked_down());
        assert_eq!(h.validate_block(q), Err(HeapError::Corrupted(Corruption::StartCanary)));
        assert_eq!(h.reset_lockdown(), Err(HeapError::Corrupted(Corruption::StartCanary)));
        assert!(h.is_locked_down());
    }

    #[test]
    fn smashed_header_fails_validation() {
        let mut a = arena();
        let mut h = heap(&mut a, false);
        let p = h.allocate(16, HeapProtection::empty()).unwrap();
        h.smash_header(p);
        assert_eq!(h.validate_all_blocks(), Err(HeapError::Corrupted(Corruption::StartCanary)));
        assert_eq!(h.stats().corruption_count, 1);
    }

    #[test]
    fn free_of_a_smashed_block_locks_down() {
        let mut a = arena();
        let mut h = heap(&mut a, true);
        let p = h.allocate(32, HeapProtection::empty()).unwrap();
        h.smash_header(p);
        assert_eq!(h.free(p), Err(HeapError::Corrupted(Corruption::StartCanary)));
        assert!(h.is_locked_down());
        assert_eq!(h.stats().total_frees, 0);
        assert_eq!(h.free(p), Err(HeapError::LockedDown));
    }

    #[test]
    fn pointer_checks_escalate_on_a_damaged_list() {
        let mut a = arena();
        let mut h = heap(&mut a, false);
        let p = h.allocate(16, HeapProtection::empty()).unwrap();
        let q = h.allocate(16, HeapProtection::empty()).unwrap();
        h.smash_header(q);

        assert!(!h.is_valid_pointer(p));
        assert!(h.is_locked_down());
        assert_eq!(h.stats().corruption_count, 1);

        assert_eq!(h.validate_block(p), Err(HeapError::Corrupted(Corruption::StartCanary)));
        assert_eq!(h.stats().corruption_count, 2);
    }

    #[test]
    fn calloc_zeroes_and_checks_overflow() {
        let mut a = arena();
        let mut h = heap(&mut a, true);
        let p = h.calloc(10, 10).unwrap();
        let bytes = unsafe { core::slice::from_raw_parts(p.as_ptr(), 100) };
        assert!(bytes.iter().all(|&b| b == 0));
        assert_eq!(h.calloc(usize::MAX, 2), Err(HeapError::Overflow));
        // slack past 100 is still poison, so the free passes
        assert_eq!(h.free(p), Ok(()));
    }

    #[test]
    fn realloc_in_place_and_moving() {
        let mut a = arena();
        let mut h = heap(&mut a, true);
        let p = h.allocate(20, HeapProtection::READ_ONLY).unwrap();
        unsafe { ptr::copy_nonoverlapping(b"0123456789abcdefghij".as_ptr(), p.as_ptr(), 20) };

        // 24-byte capacity: shrink and regrow stay put
        assert_eq!(h.realloc(p, 10), Ok(p));
        assert_eq!(h.realloc(p, 24), Ok(p));
        assert_eq!(h.realloc(p, 10), Ok(p));

        let _fence = h.allocate(8, HeapProtection::empty()).unwrap();
        let q = h.realloc(p, 100).unwrap();
        assert_ne!(q, p);
        let bytes = unsafe { core::slice::from_raw_parts(q.as_ptr(), 10) };
        assert_eq!(bytes, b"0123456789");
        assert!(!h.is_valid_pointer(p));
        let mut prot = HeapProtection::empty();
        h.blocks(|b| {
            if b.payload == q {
                prot = b.protection;
            }
        });
        assert_eq!(prot, HeapProtection::READ_ONLY);
        assert_eq!(h.free(q), Ok(()));
    }

    #[test]
    fn exhaustion_is_out_of_memory() {
        let mut a = arena();
        let mut h = heap(&mut a, false);
        let mut n = 0;
        while h.allocate(16 * 1024, HeapProtection::empty()).is_ok() {
            n += 1;
        }
        assert_eq!(n, 3);
        assert_eq!(
            h.allocate(16 * 1024, HeapProtection::empty()),
            Err(HeapError::OutOfMemory { requested: 16 * 1024 })
        );
        assert!(!h.is_locked_down());
    }

    #[test]
    fn extend_appends_free_space() {
        let mut a = arena();
        let base = NonNull::new(a.0.as_mut_ptr()).unwrap();
        let mut h = unsafe { KernelHeap::from_region(base, 32 * 1024, true) }.unwrap();
        let _p = h.allocate(8 * 1024, HeapProtection::empty()).unwrap();
        unsafe { h.extend(32 * 1024) }.unwrap();
        assert_eq!(h.total_size(), 64 * 1024);
        assert_eq!(h.block_count(), 2);
        assert_eq!(h.used_size() + h.free_size(), h.total_size());
        assert_eq!(h.validate_all_blocks(), Ok(2));
    }
}
