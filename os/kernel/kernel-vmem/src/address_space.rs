//! # Address Space Primitives
//!
//! The contract between the frame allocator and the architecture's paging
//! code. All methods take `&self`; implementations serialise page-table
//! updates internally so the allocator can map while holding its own locks.
//!
//! ## Re-entrancy
//!
//! `map` may allocate page-table frames through the frame allocator, which
//! re-enters it on the same CPU. The one exception is the page-stack backing
//! windows: mappings there must be satisfiable without allocating, since the
//! allocator is in the middle of updating its free list when it requests
//! them.

use crate::{HeapCursor, HeapLayout, MappingFlags};
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, VirtualAddress};
use log::trace;

#[derive(Debug, Clone, Copy, Eq, PartialEq, thiserror::Error)]
pub enum MapError {
    #[error("virtual page {0} is already mapped")]
    AlreadyMapped(VirtualAddress),
    #[error("virtual page {0} is not mapped")]
    NotMapped(VirtualAddress),
    #[error("virtual page {0} is not writable")]
    WriteProtected(VirtualAddress),
    #[error("address {0:#x} is not page aligned")]
    Unaligned(u64),
    #[error("out of page-table memory")]
    OutOfTables,
}

/// One virtual address space, as seen by the memory manager.
pub trait VirtualAddressSpace {
    /// Maps the 4 KiB frame at `phys` to the page at `virt`.
    ///
    /// # Errors
    /// [`MapError::AlreadyMapped`] if `virt` already has a translation,
    /// [`MapError::OutOfTables`] if intermediate tables could not be created.
    fn map(
        &self,
        phys: PhysicalAddress,
        virt: VirtualAddress,
        flags: MappingFlags,
    ) -> Result<(), MapError>;

    /// Removes the translation of the page at `virt`.
    ///
    /// # Errors
    /// [`MapError::NotMapped`] if there was none.
    fn unmap(&self, virt: VirtualAddress) -> Result<(), MapError>;

    /// Translation and flags of the page containing `virt`.
    fn mapping(&self, virt: VirtualAddress) -> Option<(PhysicalAddress, MappingFlags)>;

    fn is_mapped(&self, virt: VirtualAddress) -> bool {
        self.mapping(virt).is_some()
    }

    /// Maps `pages` physically contiguous frames starting at `phys` to
    /// `virt`.
    ///
    /// The default maps page by page. If any page fails, the pages mapped by
    /// this call are unmapped again before the error is returned.
    ///
    /// # Errors
    /// The first error returned by [`map`](Self::map).
    fn map_huge(
        &self,
        phys: PhysicalAddress,
        virt: VirtualAddress,
        pages: u64,
        flags: MappingFlags,
    ) -> Result<(), MapError> {
        for i in 0..pages {
            let offset = i * PAGE_SIZE;
            if let Err(e) = self.map(phys + offset, virt + offset, flags) {
                trace!("map_huge failed at page {i} of {pages}; rolling back");
                for j in 0..i {
                    let _ = self.unmap(virt + j * PAGE_SIZE);
                }
                return Err(e);
            }
        }
        Ok(())
    }

    /// Fills `len` bytes at `virt` with `value`.
    ///
    /// # Safety
    /// `virt..virt+len` must be mapped writable in this space, and this
    /// space must be the one the CPU is currently running on.
    unsafe fn fill(&self, virt: VirtualAddress, value: u8, len: usize) {
        unsafe { core::ptr::write_bytes(virt.as_mut_ptr::<u8>(), value, len) }
    }

    /// Heap extent of this space, mutated only by heap growth.
    fn heap_cursor(&mut self) -> &mut HeapCursor;

    fn heap_layout(&self) -> HeapLayout;
}
