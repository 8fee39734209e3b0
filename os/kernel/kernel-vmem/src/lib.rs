//! # Virtual Address Space Interface
//!
//! The frame allocator never touches page tables itself. Everything it needs
//! from the architecture layer goes through [`VirtualAddressSpace`]:
//!
//! - [`map`](VirtualAddressSpace::map) / [`unmap`](VirtualAddressSpace::unmap)
//!   a single 4 KiB page,
//! - [`mapping`](VirtualAddressSpace::mapping) /
//!   [`is_mapped`](VirtualAddressSpace::is_mapped) to query a translation,
//! - [`map_huge`](VirtualAddressSpace::map_huge) for bulk mappings, with a
//!   per-page fallback that rolls back on failure,
//! - the per-space [`HeapCursor`] and [`HeapLayout`] that heap growth works
//!   against.
//!
//! Mapping attributes are architecture neutral [`MappingFlags`]; the
//! implementation translates them to its page-table encoding.
//!
//! ## Software address space
//!
//! [`SoftAddressSpace`] keeps its translations in a hash map and its frame
//! contents in sparse, lazily created buffers. It behaves like a page table
//! (double maps fail, writes to read-only pages fault) so allocator code can
//! be exercised on the host.
//!
//! ```rust
//! # use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
//! # use kernel_vmem::{MappingFlags, SoftAddressSpace, VirtualAddressSpace};
//! let space = SoftAddressSpace::new();
//! let va = VirtualAddress::new(0x4000_0000);
//! space.map(PhysicalAddress::new(0x20_0000), va, MappingFlags::WRITE).unwrap();
//! assert_eq!(space.mapping(va), Some((PhysicalAddress::new(0x20_0000), MappingFlags::WRITE)));
//! space.unmap(va).unwrap();
//! assert!(!space.is_mapped(va));
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

extern crate alloc;

mod address_space;
mod flags;
mod heap;
pub mod soft;

pub use crate::address_space::{MapError, VirtualAddressSpace};
pub use crate::flags::MappingFlags;
pub use crate::heap::{HeapCursor, HeapLayout};
pub use crate::soft::SoftAddressSpace;

/// Re-export constants as info module.
pub use kernel_info::memory as info;
