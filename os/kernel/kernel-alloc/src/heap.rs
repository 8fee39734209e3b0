//! # Heap Growth
//!
//! Heaps grow lazily. New heap pages are not backed by fresh frames but by
//! the one shared zero frame, mapped read-only with
//! [`MappingFlags::COPY_ON_WRITE`]. Each such mapping holds one pin on the
//! zero frame. The first write to such a page faults, and the fault handler
//! calls [`resolve_zero_page_write`] to give the page a private frame,
//! which drops that pin again.
//!
//! Shrinking routes every unmapped frame through
//! [`PhysicalMemoryManager::free_page`], so zero-frame mappings only lose
//! their pin while private frames are really freed.

use crate::pmm::PAGE_BYTES;
use crate::{AddressClass, PhysicalMemoryManager};
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, VirtualAddress};
use kernel_vmem::{HeapLayout, MapError, MappingFlags, VirtualAddressSpace};
use log::{error, trace, warn};

#[derive(Debug, Clone, Copy, Eq, PartialEq, thiserror::Error)]
pub enum HeapError {
    #[error("heap would grow into the kernel heap at {0}")]
    KernelHeapOverrun(VirtualAddress),
    #[error("heap would grow into the dynamic mapping area at {0}")]
    DynamicRegionOverrun(VirtualAddress),
    #[error("heap would grow over the user stacks into kernel space at {0}")]
    KernelRegionOverrun(VirtualAddress),
    #[error("heap end out of the address range")]
    AddressOverflow,
    #[error("heap would shrink below its start")]
    HeapUnderflow,
    #[error("could not prepare the zero page: {0}")]
    ZeroPage(#[from] MapError),
}

/// Heap growth for any address space.
pub trait ExpandHeap: VirtualAddressSpace {
    /// Moves the heap end by `delta` bytes.
    ///
    /// Growing returns the previous end, which is where the new memory
    /// starts. Shrinking returns the new end, rounded up to the page
    /// boundary that is now the top of mapped heap memory. Nothing is
    /// changed if an error is returned.
    ///
    /// New pages map the zero frame of `pmm` with `flags` minus
    /// [`MappingFlags::WRITE`] plus [`MappingFlags::COPY_ON_WRITE`]. A page
    /// that is already mapped is left alone.
    ///
    /// # Errors
    /// A [`HeapError`] if the new end would cross one of the boundaries of
    /// [`heap_layout`](VirtualAddressSpace::heap_layout) or the heap start,
    /// or if the zero frame could not be created.
    fn expand_heap<K: VirtualAddressSpace>(
        &mut self,
        pmm: &PhysicalMemoryManager<K>,
        delta: i64,
        flags: MappingFlags,
    ) -> Result<VirtualAddress, HeapError>;

    /// Unmaps and frees `pages` pages from `start`, undoing a growth whose
    /// pages were already given private frames.
    fn rollback_heap_expansion<K: VirtualAddressSpace>(
        &self,
        pmm: &PhysicalMemoryManager<K>,
        start: VirtualAddress,
        pages: u64,
    );
}

impl<T: VirtualAddressSpace + ?Sized> ExpandHeap for T {
    fn expand_heap<K: VirtualAddressSpace>(
        &mut self,
        pmm: &PhysicalMemoryManager<K>,
        delta: i64,
        flags: MappingFlags,
    ) -> Result<VirtualAddress, HeapError> {
        let cursor = *self.heap_cursor();
        let old_end = cursor.end;
        let new_end = old_end.checked_offset(delta).ok_or(HeapError::AddressOverflow)?;
        check_bounds(self.heap_layout(), cursor.start, new_end)?;

        if delta == 0 {
            return Ok(old_end);
        }

        if delta > 0 {
            let zero = pmm.zero_page_or_create(&*self, old_end.align_up())?;
            let cow = (flags - MappingFlags::WRITE) | MappingFlags::COPY_ON_WRITE;

            let mut page = old_end.align_down();
            let top = new_end.align_up();
            while page < top {
                if self.is_mapped(page) {
                    trace!("heap page {page} already mapped");
                } else if let Err(e) = self.map(zero, page, cow) {
                    warn!("heap expansion could not map {page}: {e}");
                } else {
                    pmm.pin(zero);
                }
                page += PAGE_SIZE;
            }

            self.heap_cursor().end = new_end;
            trace!("heap grown to {new_end}");
            return Ok(old_end);
        }

        let floor = new_end.align_up();
        let mut page = old_end.align_up();
        while page > floor {
            page = VirtualAddress::new(page.as_u64() - PAGE_SIZE);
            if let Some((pa, _)) = self.mapping(page)
                && self.unmap(page).is_ok()
            {
                pmm.free_page(pa);
            }
        }

        // The page holding `new_end` stays mapped, so the end moves up to it.
        self.heap_cursor().end = floor;
        trace!("heap shrunk to {floor}");
        Ok(floor)
    }

    fn rollback_heap_expansion<K: VirtualAddressSpace>(
        &self,
        pmm: &PhysicalMemoryManager<K>,
        start: VirtualAddress,
        pages: u64,
    ) {
        for i in 0..pages {
            let va = start + i * PAGE_SIZE;
            if let Some((pa, _)) = self.mapping(va)
                && self.unmap(va).is_ok()
            {
                pmm.free_page(pa);
            }
        }
    }
}

fn check_bounds(
    layout: HeapLayout,
    start: VirtualAddress,
    new_end: VirtualAddress,
) -> Result<(), HeapError> {
    if new_end >= layout.kernel_heap_start {
        error!("heap expansion to {new_end} would run into the kernel heap");
        return Err(HeapError::KernelHeapOverrun(new_end));
    }
    match layout.dynamic_start {
        Some(dynamic) if new_end >= dynamic => {
            error!("heap expansion no longer allowed; about to run into the dynamic memory area");
            return Err(HeapError::DynamicRegionOverrun(new_end));
        }
        None if new_end >= layout.kernel_start => {
            error!("heap expansion no longer allowed; about to run into kernel space");
            return Err(HeapError::KernelRegionOverrun(new_end));
        }
        _ => {}
    }
    if new_end < start {
        return Err(HeapError::HeapUnderflow);
    }
    Ok(())
}

/// Gives the page containing `fault` a private, zeroed frame if it is a
/// copy-on-write mapping of the zero frame.
///
/// Returns `Ok(false)` if the page is not such a mapping and the fault is
/// somebody else's business. On success the page is writable, no longer
/// copy-on-write, and the zero frame has lost the pin of this mapping.
///
/// # Errors
/// The mapping error if the private frame could not be mapped; the zero
/// frame mapping is restored and the private frame freed.
pub fn resolve_zero_page_write<A, K>(
    space: &A,
    pmm: &PhysicalMemoryManager<K>,
    fault: VirtualAddress,
) -> Result<bool, MapError>
where
    A: VirtualAddressSpace + ?Sized,
    K: VirtualAddressSpace,
{
    let page = fault.align_down();
    let Some(zero) = pmm.zero_page() else {
        return Ok(false);
    };
    let Some((pa, flags)) = space.mapping(page) else {
        return Ok(false);
    };
    if pa != zero || !flags.contains(MappingFlags::COPY_ON_WRITE) {
        return Ok(false);
    }

    let private: PhysicalAddress = pmm.allocate_page(AddressClass::Any);
    let private_flags = (flags - MappingFlags::COPY_ON_WRITE) | MappingFlags::WRITE;
    if let Err(e) = space.unmap(page) {
        pmm.free_page(private);
        return Err(e);
    }
    if let Err(e) = space.map(private, page, private_flags) {
        if space.map(zero, page, flags).is_err() {
            error!("lost the zero page mapping at {page}");
            pmm.free_page(zero);
        }
        pmm.free_page(private);
        return Err(e);
    }

    // SAFETY: mapped writable just above.
    unsafe { space.fill(page, 0, PAGE_BYTES) };
    pmm.free_page(zero);
    trace!("zero page write at {fault} resolved with frame {private}");
    Ok(true)
}
