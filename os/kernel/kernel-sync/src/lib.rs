//! # Kernel synchronization primitives
//!
//! * [`SpinLock`]: plain test-and-test-and-set lock, used where the holder
//!   never re-enters (the memory-region registry).
//! * [`ReentrantSpinLock`]: spin lock the owning CPU may take again while it
//!   already holds it (the frame allocator, whose bookkeeping may allocate or
//!   free frames itself).
//! * [`SyncOnceCell`]: one-shot initialisation, including a fallible variant.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod raw_spin;
mod reentrant;
mod spin_lock;
mod sync_once_cell;

pub use raw_spin::RawSpin;
pub use reentrant::{ReentrantSpinLock, ReentrantSpinLockGuard};
pub use spin_lock::{SpinLock, SpinLockGuard};
pub use sync_once_cell::SyncOnceCell;
