//! # Kernel Memory Configuration and Boot Memory Map
//!
//! Compile-time memory layout shared by the frame allocator, the region
//! manager and the address-space layer, plus the boot-time memory map types
//! the allocator is seeded from.
//!
//! ## Modules
//!
//! ### Memory Layout ([`memory`])
//! * **Address classes**: the physical ceilings (1 MiB, 16 MiB, 4 GiB, 64 GiB)
//!   that DMA and bootstrap callers can restrict allocations to
//! * **Virtual windows**: where memory regions, page-stack backing storage and
//!   the bulk mapping of high physical memory live
//! * **Heap boundaries**: where heap growth must stop
//! * **Watermarks**: default free-frame thresholds for reclaim
//!
//! ### Boot Memory Map ([`boot`])
//! * [`MemoryMapEntry`](boot::MemoryMapEntry): one `(address, length, kind)` triple
//! * [`BootMemoryMap`](boot::BootMemoryMap): anything that can enumerate entries
//!
//! ## Virtual Memory Layout
//!
//! ```text
//! 0x0000_0000_0000_0000 ┌─────────────────────────────────┐
//!                       │  User heap, dynamic mappings,   │
//!                       │  stacks                         │
//! KERNEL_SPACE_START    ├─────────────────────────────────┤ 0xffff_8000_0000_0000
//!                       │  Physical memory >= 4 GiB       │
//!                       │  (bulk mapped at boot)          │
//! KERNEL_HEAP_START     ├─────────────────────────────────┤ 0xffff_ffff_5000_0000
//!                       │  Kernel heap                    │
//! KERNEL_MEMORY_REGION_ ├─────────────────────────────────┤ 0xffff_ffff_6000_0000
//! BASE                  │  MemoryRegion carve-out         │
//! PAGE_STACK_*_BASE     ├─────────────────────────────────┤ 0xffff_ffff_7000_0000
//!                       │  Page-stack backing windows     │
//! KERNEL_BASE           ├─────────────────────────────────┤ 0xffff_ffff_8000_0000
//!                       │  Kernel text and data           │
//! 0xFFFF_FFFF_FFFF_FFFF └─────────────────────────────────┘
//! ```
//!
//! All constants are plain `const` values; overlapping or misaligned windows
//! are rejected at compile time.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![deny(unsafe_code)]

pub mod boot;
pub mod memory;
