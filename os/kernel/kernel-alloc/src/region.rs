//! # Memory Regions
//!
//! A [`MemoryRegion`] is a named window of kernel virtual space mapped onto
//! physical memory, carved out of the memory-region window. The handle is
//! the single owner of the mapping: dropping it (or passing it to
//! [`PhysicalMemoryManager::unmap_region`]) unmaps every page, returns the
//! backing frames to wherever they came from and gives the virtual range
//! back.
//!
//! ## Request modes
//!
//! * **Fixed**: [`RegionRequest::at_physical`] names the physical range.
//!   Requires [`RegionConstraints::CONTINUOUS`] and excludes
//!   [`RegionConstraints::VIRTUAL_ONLY`]. RAM is reserved in its tracker
//!   (below 1 MiB, below 16 MiB, or taken off the page stack); device
//!   memory ([`RegionConstraints::NON_RAM`]) is reserved in the non-RAM
//!   tracker. If the reservation fails the request fails, unless
//!   [`RegionConstraints::FORCE`] is set: then the range is mapped anyway
//!   and the region is flagged forced and never returns those frames.
//! * **Dynamic**: fresh frames. Contiguous requests are served from the low
//!   trackers, everything else page by page from the page stack.
//!   [`RegionConstraints::VIRTUAL_ONLY`] only reserves virtual space.
//!
//! Any failure after something was reserved undoes the reservation; no
//! partial region survives a failed request.

use crate::pmm::FrameState;
use crate::range_list::RangeList;
use crate::{AddressClass, PhysicalMemoryManager, RegionConstraints};
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::Ordering;
use kernel_info::memory::{BELOW_1M, BELOW_16M};
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, VirtualAddress};
use kernel_vmem::{MapError, MappingFlags, VirtualAddressSpace};
use log::{debug, info, trace};

#[derive(Debug, Clone, Copy, Eq, PartialEq, thiserror::Error)]
pub enum RegionError {
    #[error("a region needs at least one page")]
    Empty,
    #[error("fixed physical regions must be continuous and not virtual-only")]
    InvalidConstraints,
    #[error("physical range at {0} is not available")]
    RangeUnavailable(PhysicalAddress),
    #[error("physical range at {0} crosses an address class boundary")]
    StraddlesClassBoundary(PhysicalAddress),
    #[error("memory region window exhausted")]
    VirtualSpaceExhausted,
    #[error("no contiguous low memory left for {0} pages")]
    OutOfLowMemory(u64),
    #[error("mapping failed: {0}")]
    MapFailed(#[from] MapError),
}

/// What to allocate.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct RegionRequest {
    pub name: &'static str,
    pub pages: u64,
    pub constraints: RegionConstraints,
    pub class: AddressClass,
    pub flags: MappingFlags,
    pub physical_start: Option<PhysicalAddress>,
}

impl RegionRequest {
    /// `pages` pages of kernel read/write memory anywhere.
    #[must_use]
    pub const fn new(name: &'static str, pages: u64) -> Self {
        Self {
            name,
            pages,
            constraints: RegionConstraints::empty(),
            class: AddressClass::Any,
            flags: MappingFlags::KERNEL_DATA,
            physical_start: None,
        }
    }

    #[must_use]
    pub const fn with_constraints(mut self, constraints: RegionConstraints) -> Self {
        self.constraints = constraints;
        self
    }

    #[must_use]
    pub const fn with_class(mut self, class: AddressClass) -> Self {
        self.class = class;
        self
    }

    #[must_use]
    pub const fn with_flags(mut self, flags: MappingFlags) -> Self {
        self.flags = flags;
        self
    }

    #[must_use]
    pub const fn at_physical(mut self, start: PhysicalAddress) -> Self {
        self.physical_start = Some(start);
        self
    }

    const fn length(&self) -> u64 {
        self.pages * PAGE_SIZE
    }
}

/// Where a region's frames go when it is released.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum Backing {
    /// Each mapped frame is freed individually.
    Frames,
    /// One contiguous range of a low-memory tracker.
    Low(AddressClass),
    /// A reserved range of the non-RAM tracker.
    Device,
    /// Nothing is returned.
    Borrowed,
}

/// Registry entry of a live region.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct MemoryRegionInfo {
    pub name: &'static str,
    pub virtual_address: VirtualAddress,
    /// Zero unless the region is physically contiguous.
    pub physical_address: PhysicalAddress,
    pub size: u64,
    pub non_ram: bool,
    pub forced: bool,
}

pub(crate) struct RegionRecord {
    pub(crate) id: u64,
    pub(crate) info: MemoryRegionInfo,
}

/// Everything the region lock protects.
pub(crate) struct RegionState {
    pub(crate) virtual_window: RangeList,
    pub(crate) registry: Vec<RegionRecord>,
}

impl RegionState {
    pub(crate) const fn new() -> Self {
        Self {
            virtual_window: RangeList::new(),
            registry: Vec::new(),
        }
    }
}

/// Physical side of a region before it is mapped.
struct Reservation {
    /// `None` unless physically contiguous.
    physical: Option<PhysicalAddress>,
    backing: Backing,
    forced: bool,
}

/// Owning handle of a mapped region.
pub struct MemoryRegion<'m, S: VirtualAddressSpace> {
    manager: &'m PhysicalMemoryManager<S>,
    id: u64,
    info: MemoryRegionInfo,
    contiguous: bool,
    backing: Backing,
}

impl<S: VirtualAddressSpace> MemoryRegion<'_, S> {
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.info.name
    }

    #[must_use]
    pub const fn virtual_address(&self) -> VirtualAddress {
        self.info.virtual_address
    }

    /// Physical base, zero if the region is not physically contiguous.
    #[must_use]
    pub const fn physical_address(&self) -> PhysicalAddress {
        self.info.physical_address
    }

    #[must_use]
    pub const fn size(&self) -> u64 {
        self.info.size
    }

    #[must_use]
    pub const fn pages(&self) -> u64 {
        self.info.size / PAGE_SIZE
    }

    #[must_use]
    pub const fn is_non_ram(&self) -> bool {
        self.info.non_ram
    }

    #[must_use]
    pub const fn is_forced(&self) -> bool {
        self.info.forced
    }

    #[must_use]
    pub const fn info(&self) -> MemoryRegionInfo {
        self.info
    }

    /// Whether `pa` lies in the region's physical range.
    #[must_use]
    pub fn physical_bounds_check(&self, pa: PhysicalAddress) -> bool {
        let base = self.info.physical_address;
        self.contiguous && pa >= base && pa - base < self.info.size
    }

    /// Virtual address at which `pa` is visible through this region.
    #[must_use]
    pub fn convert_physical_pointer(&self, pa: PhysicalAddress) -> Option<VirtualAddress> {
        self.physical_bounds_check(pa)
            .then(|| self.info.virtual_address + (pa - self.info.physical_address))
    }

    #[must_use]
    pub fn contains(&self, va: VirtualAddress) -> bool {
        va >= self.info.virtual_address && va - self.info.virtual_address < self.info.size
    }

    /// Releases the region now.
    pub fn free(self) {
        drop(self);
    }
}

impl<S: VirtualAddressSpace> fmt::Debug for MemoryRegion<'_, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryRegion")
            .field("id", &self.id)
            .field("info", &self.info)
            .field("backing", &self.backing)
            .finish_non_exhaustive()
    }
}

impl<S: VirtualAddressSpace> Drop for MemoryRegion<'_, S> {
    fn drop(&mut self) {
        self.manager.release_region(self.id, &self.info, self.backing);
    }
}

impl<S: VirtualAddressSpace> PhysicalMemoryManager<S> {
    /// Allocates and maps a memory region.
    ///
    /// # Errors
    /// See [`RegionError`]. Nothing stays reserved when an error is
    /// returned.
    ///
    /// # Panics
    /// If a dynamic page-stack request finds the stack empty
    /// ("Out of memory.").
    pub fn allocate_region(&self, request: RegionRequest) -> Result<MemoryRegion<'_, S>, RegionError> {
        if request.pages == 0 {
            return Err(RegionError::Empty);
        }

        // Handlers may release regions, so this happens before the region
        // lock is taken.
        if request.physical_start.is_none()
            && !request.constraints.intersects(RegionConstraints::CONTINUOUS | RegionConstraints::VIRTUAL_ONLY)
            && !request.class.is_low_memory()
        {
            self.relieve_pressure();
        }

        let mut regions = self.regions.lock();
        let (virt, reservation) = match request.physical_start {
            Some(start) => self.allocate_fixed(&mut regions, &request, start.align_down())?,
            None => self.allocate_dynamic(&mut regions, &request)?,
        };

        let info = MemoryRegionInfo {
            name: request.name,
            virtual_address: virt,
            physical_address: reservation.physical.unwrap_or_default(),
            size: request.length(),
            non_ram: request.constraints.contains(RegionConstraints::NON_RAM),
            forced: reservation.forced,
        };
        let id = self.next_region_id.fetch_add(1, Ordering::Relaxed);
        if !request.constraints.contains(RegionConstraints::ANONYMOUS) {
            regions.registry.push(RegionRecord { id, info });
        }
        debug!(
            "region '{}' at {virt} ({} pages, physical {})",
            request.name, request.pages, info.physical_address
        );

        Ok(MemoryRegion {
            manager: self,
            id,
            info,
            contiguous: reservation.physical.is_some(),
            backing: reservation.backing,
        })
    }

    /// Releases `region`. Equivalent to dropping it.
    pub fn unmap_region(&self, region: MemoryRegion<'_, S>) {
        drop(region);
    }

    fn allocate_fixed(
        &self,
        regions: &mut RegionState,
        request: &RegionRequest,
        start: PhysicalAddress,
    ) -> Result<(VirtualAddress, Reservation), RegionError> {
        let constraints = request.constraints;
        if !constraints.contains(RegionConstraints::CONTINUOUS)
            || constraints.contains(RegionConstraints::VIRTUAL_ONLY)
        {
            return Err(RegionError::InvalidConstraints);
        }

        let reservation = self.reserve_fixed(request, start)?;
        if reservation.forced {
            info!("forcing region '{}' onto unavailable physical range {start}", request.name);
        }

        let length = request.length();
        let Some(virt) = regions.virtual_window.allocate(length) else {
            self.unreserve(&reservation, request.pages);
            return Err(RegionError::VirtualSpaceExhausted);
        };
        let virt = VirtualAddress::new(virt);

        if let Err(e) = self.space.map_huge(start, virt, request.pages, request.flags) {
            self.unreserve(&reservation, request.pages);
            regions.virtual_window.free(virt.as_u64(), length);
            return Err(e.into());
        }

        info!("region '{}' mapped physical {start}+{length:#x} at {virt}", request.name);
        Ok((virt, reservation))
    }

    fn reserve_fixed(&self, request: &RegionRequest, start: PhysicalAddress) -> Result<Reservation, RegionError> {
        let force = request.constraints.contains(RegionConstraints::FORCE);
        let (s, length) = (start.as_u64(), request.length());
        let e = s.saturating_add(length);

        let guard = self.frames.lock();
        let mut frames = guard.borrow_mut();

        let low = if request.constraints.contains(RegionConstraints::NON_RAM) {
            None
        } else if e <= BELOW_1M {
            Some(AddressClass::Below1M)
        } else if s < BELOW_1M {
            return Err(RegionError::StraddlesClassBoundary(start));
        } else if e <= BELOW_16M {
            Some(AddressClass::Below16M)
        } else if s < BELOW_16M {
            return Err(RegionError::StraddlesClassBoundary(start));
        } else {
            None
        };

        let reserved = if request.constraints.contains(RegionConstraints::NON_RAM) {
            frames.non_ram.allocate_specific(s, length).then_some(Backing::Device)
        } else if let Some(class) = low
            && frames.low_pool(class).allocate_specific(s, length)
        {
            Some(Backing::Low(class))
        } else {
            // Low frames freed after boot live on the page stack.
            frames.take_specific(start, request.pages).then_some(Backing::Frames)
        };

        match reserved {
            Some(backing) => Ok(Reservation {
                physical: Some(start),
                backing,
                forced: false,
            }),
            None if force => Ok(Reservation {
                physical: Some(start),
                backing: Backing::Borrowed,
                forced: true,
            }),
            None => Err(RegionError::RangeUnavailable(start)),
        }
    }

    fn allocate_dynamic(
        &self,
        regions: &mut RegionState,
        request: &RegionRequest,
    ) -> Result<(VirtualAddress, Reservation), RegionError> {
        let constraints = request.constraints;
        let length = request.length();
        let virt = regions
            .virtual_window
            .allocate(length)
            .map(VirtualAddress::new)
            .ok_or(RegionError::VirtualSpaceExhausted)?;

        if constraints.contains(RegionConstraints::VIRTUAL_ONLY) {
            return Ok((
                virt,
                Reservation {
                    physical: None,
                    backing: Backing::Frames,
                    forced: false,
                },
            ));
        }

        let class = if constraints.contains(RegionConstraints::CONTINUOUS) && !request.class.is_low_memory() {
            AddressClass::Below16M
        } else {
            request.class
        };

        let result = if class.is_low_memory() {
            self.map_low(request, class, virt)
        } else {
            self.map_frames(request, class, virt)
        };
        if result.is_err() {
            regions.virtual_window.free(virt.as_u64(), length);
        }
        result.map(|reservation| (virt, reservation))
    }

    /// One contiguous low-memory range, mapped in bulk.
    fn map_low(
        &self,
        request: &RegionRequest,
        class: AddressClass,
        virt: VirtualAddress,
    ) -> Result<Reservation, RegionError> {
        let length = request.length();
        let start = self
            .frames
            .with_lock(|f| f.borrow_mut().low_pool(class).allocate(length))
            .map(PhysicalAddress::new)
            .ok_or(RegionError::OutOfLowMemory(request.pages))?;

        if let Err(e) = self.space.map_huge(start, virt, request.pages, request.flags) {
            self.frames
                .with_lock(|f| f.borrow_mut().low_pool(class).free(start.as_u64(), length));
            return Err(e.into());
        }
        Ok(Reservation {
            physical: Some(start),
            backing: Backing::Low(class),
            forced: false,
        })
    }

    /// Page-stack frames, mapped one at a time.
    fn map_frames(
        &self,
        request: &RegionRequest,
        class: AddressClass,
        virt: VirtualAddress,
    ) -> Result<Reservation, RegionError> {
        self.wait_for(class);
        let frames = self.lock_frames();
        for i in 0..request.pages {
            let pa = frames.allocate_page(class);
            if let Err(e) = self.space.map(pa, virt + i * PAGE_SIZE, request.flags) {
                trace!("region '{}' failed at page {i}; rolling back", request.name);
                frames.free_page(pa);
                for j in 0..i {
                    let va = virt + j * PAGE_SIZE;
                    if let Some((mapped, _)) = self.space.mapping(va)
                        && self.space.unmap(va).is_ok()
                    {
                        frames.free_page(mapped);
                    }
                }
                return Err(e.into());
            }
        }
        Ok(Reservation {
            physical: None,
            backing: Backing::Frames,
            forced: false,
        })
    }

    /// Undoes [`reserve_fixed`](Self::reserve_fixed).
    fn unreserve(&self, reservation: &Reservation, pages: u64) {
        let guard = self.frames.lock();
        let mut frames = guard.borrow_mut();
        let start = reservation.physical.unwrap_or_default();
        let length = pages * PAGE_SIZE;
        match reservation.backing {
            Backing::Frames => {
                for i in 0..pages {
                    frames.free_page(&self.space, start + i * PAGE_SIZE);
                }
            }
            backing => return_range(&mut frames, backing, start, length),
        }
    }

    fn release_region(&self, id: u64, info: &MemoryRegionInfo, backing: Backing) {
        let mut regions = self.regions.lock();
        {
            let frames = self.lock_frames();
            for i in 0..info.size / PAGE_SIZE {
                let va = info.virtual_address + i * PAGE_SIZE;
                let Some((pa, _)) = self.space.mapping(va) else {
                    continue;
                };
                if self.space.unmap(va).is_ok() && backing == Backing::Frames {
                    frames.free_page(pa);
                }
            }
            if backing != Backing::Frames {
                return_range(&mut frames.state(), backing, info.physical_address, info.size);
            }
        }

        regions
            .virtual_window
            .free(info.virtual_address.as_u64(), info.size);
        regions.registry.retain(|r| r.id != id);
        debug!("region '{}' at {} released", info.name, info.virtual_address);
    }
}

/// Gives a reserved range back to the tracker it was taken from.
fn return_range(frames: &mut FrameState, backing: Backing, start: PhysicalAddress, length: u64) {
    match backing {
        Backing::Low(class) => frames.low_pool(class).free(start.as_u64(), length),
        Backing::Device => frames.non_ram.free(start.as_u64(), length),
        Backing::Frames | Backing::Borrowed => {}
    }
}
