//! # Typed `X86_64` Control Registers
//!
//! [`Cr0`] tells the memory core whether translation is already enabled when
//! it takes over from the boot loader; [`Cr3`] holds the active root table.
//! [`tlb`] wraps single-entry translation-cache invalidation.
//!
//! Loading and storing the registers is privileged and only compiled in with
//! the `asm` feature; the bitfield types themselves are usable everywhere.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod cr0;
pub mod cr3;
#[cfg(feature = "asm")]
pub mod tlb;

pub use cr0::Cr0;
pub use cr3::Cr3;

pub trait LoadRegisterUnsafe {
    /// # Safety
    /// The register access is privileged and requires ring 0.
    unsafe fn load_unsafe() -> Self;
}

pub trait StoreRegisterUnsafe {
    /// # Safety
    /// The register access is privileged and requires ring 0. Storing a
    /// control register changes global CPU state; the caller must make sure
    /// the new value keeps the running code mapped and executable.
    unsafe fn store_unsafe(self);
}
