//! # Physical Memory Allocation
//!
//! The kernel's physical page allocator and the heap-growth path built on
//! top of it. Every other kernel service (file cache, process heaps, module
//! loader, device buffers) ultimately allocates through the
//! [`PhysicalMemoryManager`] defined here.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                 ExpandHeap / MemoryRegion            │
//! │   • lazy zero-page heap growth, CoW resolution       │
//! │   • scoped mapped ranges, fixed or dynamic           │
//! └───────────────────────┬──────────────────────────────┘
//!                         │
//! ┌───────────────────────▼──────────────────────────────┐
//! │               PhysicalMemoryManager                  │
//! │   • allocate / free / pin single frames              │
//! │   • low-memory and non-RAM range trackers            │
//! │   • memory pressure handling at the high watermark   │
//! └───────────────────────┬──────────────────────────────┘
//!                         │
//! ┌───────────────────────▼──────────────────────────────┐
//! │                     PageStack                        │
//! │   • LIFO free list per address class                 │
//! │   • backing storage grown from the frames it tracks  │
//! └──────────────────────────────────────────────────────┘
//! ```
//!
//! The architecture layer is reached only through
//! [`kernel_vmem::VirtualAddressSpace`]; nothing in this crate encodes page
//! tables.
//!
//! ## Boot sequence
//!
//! 1. [`PhysicalMemoryManager::new`] with the kernel address space.
//! 2. [`PhysicalMemoryManager::initialise`] with the firmware memory map:
//!    memory below 4 GiB becomes available and the below-4G page stack
//!    segment is marked ready.
//! 3. [`PhysicalMemoryManager::initialise_high`] once the kernel can map
//!    memory above 4 GiB.
//! 4. [`PhysicalMemoryManager::initialisation_done`] to reclaim init-only
//!    memory.
//!
//! Allocations for a segment that is not ready yet spin until it is.
//!
//! ## Failure model
//!
//! Running out of frames and detecting a double free are fatal and panic.
//! Everything a caller can reasonably handle (a physical range that is
//! already taken, an exhausted region window, a heap that would overrun its
//! neighbours) is a typed error: [`RegionError`], [`HeapError`],
//! [`kernel_vmem::MapError`].
//!
//! ## Example
//!
//! ```rust
//! use kernel_alloc::{AddressClass, PhysicalMemoryManager, RegionRequest};
//! use kernel_info::boot::{KernelImage, MemoryKind, MemoryMapEntry};
//! use kernel_vmem::SoftAddressSpace;
//!
//! let pmm = PhysicalMemoryManager::new(SoftAddressSpace::new(), || 0);
//! let map = [MemoryMapEntry::new(0x100_0000, 0x100_0000, MemoryKind::Usable)];
//! pmm.initialise(&map, &KernelImage::default());
//! pmm.pressure().set_watermarks(0, 0);
//!
//! let frame = pmm.allocate_page(AddressClass::Any);
//! pmm.free_page(frame);
//!
//! let region = pmm.allocate_region(RegionRequest::new("scratch", 4)).unwrap();
//! assert_eq!(region.size(), 4 * pmm.page_size());
//! assert_eq!(pmm.memory_regions().len(), 1);
//! drop(region);
//! assert!(pmm.memory_regions().is_empty());
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

extern crate alloc;

#[cfg(debug_assertions)]
mod bitmap;
mod constraint;
pub mod heap;
pub mod page_stack;
mod pin;
mod pmm;
pub mod pressure;
pub mod range_list;
mod region;

pub use crate::constraint::{AddressClass, RegionConstraints};
pub use crate::heap::{ExpandHeap, HeapError, resolve_zero_page_write};
pub use crate::page_stack::Segment;
pub use crate::pin::{PageMeta, PinRelease};
pub use crate::pmm::{LockedFrames, PhysicalMemoryManager};
pub use crate::pressure::{MemoryPressureHandler, MemoryPressureManager, Priority};
pub use crate::region::{MemoryRegion, MemoryRegionInfo, RegionError, RegionRequest};
