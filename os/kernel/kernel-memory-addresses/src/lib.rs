//! # Physical and Virtual Address Types
//!
//! Strongly typed wrappers for the raw addresses handled by the frame
//! allocator and the address-space layer.
//!
//! ## Overview
//!
//! | Type | Description |
//! |------|-------------|
//! | [`PhysicalAddress`] | A byte address in physical memory (RAM, firmware tables or MMIO). |
//! | [`VirtualAddress`] | A byte address in some virtual address space. |
//! | [`FrameNumber`] | The index of a [`PAGE_SIZE`] frame, i.e. `physical >> PAGE_SHIFT`. |
//!
//! All three are `#[repr(transparent)]` over `u64`, `Copy`, totally ordered and
//! hashable so they can be used as map keys (the pin table is keyed by
//! [`FrameNumber`]).
//!
//! ## Typical Usage
//!
//! ```rust
//! # use kernel_memory_addresses::*;
//! let pa = PhysicalAddress::new(0x0020_0123);
//! assert_eq!(pa.align_down(), PhysicalAddress::new(0x0020_0000));
//! assert_eq!(pa.align_up(), PhysicalAddress::new(0x0020_1000));
//!
//! let frame = pa.frame();
//! assert_eq!(frame.as_u64(), 0x200);
//! assert_eq!(frame.base(), PhysicalAddress::new(0x0020_0000));
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code, clippy::inline_always)]

mod frame_number;
mod physical_address;
mod virtual_address;

pub use frame_number::FrameNumber;
pub use physical_address::PhysicalAddress;
pub use virtual_address::VirtualAddress;

/// Size of a base page in bytes.
pub const PAGE_SIZE: u64 = 4096;

/// `log2(PAGE_SIZE)`.
pub const PAGE_SHIFT: u32 = 12;

const _: () = {
    assert!(PAGE_SIZE.is_power_of_two());
    assert!(1 << PAGE_SHIFT == PAGE_SIZE);
};

/// Rounds `value` down to a multiple of [`PAGE_SIZE`].
#[inline(always)]
#[must_use]
pub const fn page_align_down(value: u64) -> u64 {
    value & !(PAGE_SIZE - 1)
}

/// Rounds `value` up to a multiple of [`PAGE_SIZE`].
///
/// Saturates at the last aligned page instead of wrapping.
#[inline(always)]
#[must_use]
pub const fn page_align_up(value: u64) -> u64 {
    match value.checked_add(PAGE_SIZE - 1) {
        Some(v) => page_align_down(v),
        None => page_align_down(u64::MAX),
    }
}

/// Number of pages needed to cover `bytes`.
#[inline(always)]
#[must_use]
pub const fn pages_for(bytes: u64) -> u64 {
    page_align_up(bytes) >> PAGE_SHIFT
}
