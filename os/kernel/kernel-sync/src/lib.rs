//! # Kernel synchronization primitives
//!
//! Each memory-core component (frame bitmap, active translation tree, heap)
//! lives behind its own [`SpinLock`]. Paths that may run while the same core
//! already holds a lock, such as the page-fault handler, use
//! [`SpinLock::try_lock`] and fail instead of spinning forever.
//!
//! [`IrqGuard`] masks interrupts for the duration of a translation-register
//! load so a handler never observes a half-switched address space.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod irq;
mod spin_lock;

pub use irq::IrqGuard;
pub use spin_lock::{SpinLock, SpinLockGuard};
