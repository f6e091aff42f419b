//! In-band block metadata.
//!
//! ```text
//!  offset 0                                                        64
//!  ┌────────┬──────┬───────────┬──────┬──────┬───────┬──────┬──────────┬────────┐
//!  │ canary │ size │ requested │ prev │ next │ state │ prot │ checksum │ canary │ payload…
//!  └────────┴──────┴───────────┴──────┴──────┴───────┴──────┴──────────┴────────┘
//! ```
//!
//! `prev` / `next` are byte offsets from the heap base, [`NONE`] at either
//! end of the list. The checksum covers every other field, canaries included.

use super::{Corruption, HEAP_ALIGNMENT, HEAP_CANARY};

/// End-of-list marker for `prev` / `next`.
pub const NONE: usize = usize::MAX;

const USED: u32 = 1 << 0;
/// Payload was filled with poison when the block entered its current state.
const POISONED: u32 = 1 << 1;

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

#[repr(C)]
#[derive(Debug, Copy, Clone)]
pub struct BlockHeader {
    canary_start: u64,
    /// Payload capacity in bytes.
    pub size: usize,
    /// Bytes the caller asked for; `0` while free.
    pub requested: usize,
    pub prev: usize,
    pub next: usize,
    state: u32,
    pub protection: u32,
    checksum: u64,
    canary_end: u64,
}

pub const HEADER_SIZE: usize = size_of::<BlockHeader>();

const _: () = assert!(HEADER_SIZE == 64);
const _: () = assert!(HEADER_SIZE % HEAP_ALIGNMENT == 0);

impl BlockHeader {
    /// A sealed free block.
    pub fn free(size: usize, prev: usize, next: usize, poisoned: bool) -> Self {
        let mut h = Self {
            canary_start: HEAP_CANARY,
            size,
            requested: 0,
            prev,
            next,
            state: if poisoned { POISONED } else { 0 },
            protection: 0,
            checksum: 0,
            canary_end: HEAP_CANARY,
        };
        h.seal();
        h
    }

    #[inline]
    pub const fn is_used(&self) -> bool {
        self.state & USED != 0
    }

    #[inline]
    pub const fn is_poisoned(&self) -> bool {
        self.state & POISONED != 0
    }

    #[inline]
    pub const fn set_used(&mut self, used: bool) {
        if used {
            self.state |= USED;
        } else {
            self.state &= !USED;
        }
    }

    #[inline]
    pub const fn set_poisoned(&mut self, poisoned: bool) {
        if poisoned {
            self.state |= POISONED;
        } else {
            self.state &= !POISONED;
        }
    }

    /// Recompute the checksum after a field changed.
    #[inline]
    pub fn seal(&mut self) {
        self.checksum = self.compute_checksum();
    }

    /// FNV-1a over every field but the checksum, one 64-bit word at a time.
    fn compute_checksum(&self) -> u64 {
        let words = [
            self.canary_start,
            self.size as u64,
            self.requested as u64,
            self.prev as u64,
            self.next as u64,
            u64::from(self.state) | (u64::from(self.protection) << 32),
            self.canary_end,
        ];
        words
            .iter()
            .fold(FNV_OFFSET, |hash, w| (hash ^ w).wrapping_mul(FNV_PRIME))
    }

    /// Canaries first, then the checksum.
    pub fn check_seal(&self) -> Result<(), Corruption> {
        if self.canary_start != HEAP_CANARY {
            return Err(Corruption::StartCanary);
        }
        if self.canary_end != HEAP_CANARY {
            return Err(Corruption::EndCanary);
        }
        if self.checksum != self.compute_checksum() {
            return Err(Corruption::Checksum);
        }
        Ok(())
    }

    #[cfg(test)]
    pub const fn smash_start_canary(&mut self) {
        self.canary_start ^= 1;
    }
}
