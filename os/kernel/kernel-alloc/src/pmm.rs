//! # Physical Memory Manager
//!
//! Owner of every free frame in the system and gate for every frame and
//! region operation.
//!
//! ## Frame sources
//!
//! | Address range | Fed at boot into | Served by |
//! |---------------|------------------|-----------|
//! | `0 .. 1 MiB` | [`RangeList`] | [`AddressClass::Below1M`] pages, low regions |
//! | `1 MiB .. 16 MiB` | [`RangeList`] | [`AddressClass::Below16M`] pages, contiguous regions |
//! | `16 MiB ..` | [`PageStack`] | everything else |
//!
//! Every frame given back through `free_page` goes onto the page stack,
//! whatever its address. The low trackers only get back what regions took
//! from them and memory released during boot.
//!
//! ## Locking
//!
//! Two locks, always taken in this order:
//!
//! 1. the region lock ([`SpinLock`]) guarding the virtual carve-out window
//!    and the region registry;
//! 2. the frame lock ([`ReentrantSpinLock`]) guarding the trackers, the pin
//!    table and the debug bitmap.
//!
//! The frame lock may be taken again by the CPU that holds it, so frame
//! bookkeeping that allocates or frees frames (page-table growth inside a
//! `map` call, a pressure handler returning memory) does not deadlock.
//! [`PhysicalMemoryManager::lock_frames`] exposes the already-locked tier
//! directly: [`LockedFrames`] performs the same operations as the public
//! methods without going through the lock again.
//!
//! ## Memory pressure
//!
//! Before a frame is handed out, the free count is compared against the
//! high watermark. Under it, the registered pressure handlers are asked to
//! compact, outside the frame lock. Only one CPU runs the handlers at a
//! time, and a CPU that already holds the frame lock skips the check.

use crate::page_stack::{PageStack, Segment, SegmentStates};
use crate::pin::{PinRelease, PinTable};
use crate::pressure::MemoryPressureManager;
use crate::range_list::{Range, RangeList};
use crate::region::RegionState;
use crate::{AddressClass, MemoryRegionInfo};
use alloc::vec::Vec;
use core::cell::{RefCell, RefMut};
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use kernel_info::boot::{BootMemoryMap, KernelImage, MemoryKind, MemoryMapEntry};
use kernel_info::memory::{
    BELOW_1M, BELOW_4G, BELOW_16M, BELOW_64G, KERNEL_MEMORY_REGION_BASE,
    KERNEL_MEMORY_REGION_SIZE, PHYSICAL_HUGE_MAP_BASE,
};
use kernel_memory_addresses::{
    PAGE_SIZE, PhysicalAddress, VirtualAddress, page_align_down, page_align_up,
};
use kernel_sync::{ReentrantSpinLock, ReentrantSpinLockGuard, SpinLock, SyncOnceCell};
use kernel_vmem::{MapError, MappingFlags, VirtualAddressSpace};
use log::{debug, error, info, trace, warn};

#[cfg(debug_assertions)]
use crate::bitmap::AllocationBitmap;

#[allow(clippy::cast_possible_truncation)]
pub(crate) const PAGE_BYTES: usize = PAGE_SIZE as usize;

/// Boundaries at which a freed range has to be split.
const CLASS_BOUNDARIES: [u64; 4] = [BELOW_1M, BELOW_16M, BELOW_4G, BELOW_64G];

/// Everything the frame lock protects.
pub(crate) struct FrameState {
    pub(crate) stack: PageStack,
    pub(crate) below_1m: RangeList,
    pub(crate) below_16m: RangeList,
    pub(crate) non_ram: RangeList,
    acpi: Vec<Range>,
    pins: PinTable,
    #[cfg(debug_assertions)]
    allocated: AllocationBitmap,
}

impl FrameState {
    fn new() -> Self {
        Self {
            stack: PageStack::new(),
            below_1m: RangeList::new(),
            below_16m: RangeList::new(),
            non_ram: RangeList::new(),
            acpi: Vec::new(),
            pins: PinTable::new(),
            #[cfg(debug_assertions)]
            allocated: AllocationBitmap::new(),
        }
    }

    pub(crate) fn low_pool(&mut self, class: AddressClass) -> &mut RangeList {
        if class == AddressClass::Below1M {
            &mut self.below_1m
        } else {
            &mut self.below_16m
        }
    }

    /// Takes one frame of `class` and marks it allocated.
    pub(crate) fn take(&mut self, class: AddressClass, segments: &SegmentStates) -> Option<PhysicalAddress> {
        let pa = if class.is_low_memory() {
            self.low_pool(class).allocate(PAGE_SIZE).map(PhysicalAddress::new)
        } else {
            self.stack.allocate(class, segments)
        }?;
        self.mark_allocated(pa);
        Some(pa)
    }

    /// # Panics
    /// In debug builds, if `pa` is already marked allocated.
    pub(crate) fn mark_allocated(&mut self, pa: PhysicalAddress) {
        #[cfg(debug_assertions)]
        assert!(self.allocated.set(pa.frame()), "frame {pa} handed out twice");
        #[cfg(not(debug_assertions))]
        let _ = pa;
    }

    /// Clears the allocation mark. `false` if there was none; release
    /// builds keep no marks and always succeed.
    pub(crate) fn mark_free(&mut self, pa: PhysicalAddress) -> bool {
        #[cfg(debug_assertions)]
        {
            self.allocated.clear(pa.frame())
        }
        #[cfg(not(debug_assertions))]
        {
            let _ = pa;
            true
        }
    }

    /// Pushes a frame onto the page stack.
    pub(crate) fn release<S: VirtualAddressSpace + ?Sized>(&mut self, space: &S, pa: PhysicalAddress) {
        self.stack.free(space, pa, PAGE_SIZE);
    }

    /// Takes `pages` frames at `start` off the page stack and marks them
    /// allocated; all or nothing.
    pub(crate) fn take_specific(&mut self, start: PhysicalAddress, pages: u64) -> bool {
        if !self.stack.remove_specific(start, pages) {
            return false;
        }
        for i in 0..pages {
            self.mark_allocated(start + i * PAGE_SIZE);
        }
        true
    }

    /// Hands unowned `start..start + length` back, split at the class
    /// boundaries; below 16 MiB to the low trackers.
    fn release_range<S: VirtualAddressSpace + ?Sized>(&mut self, space: &S, start: u64, length: u64) {
        let mut lo = page_align_up(start);
        let end = page_align_down(start.saturating_add(length));
        while lo < end {
            let hi = CLASS_BOUNDARIES
                .into_iter()
                .find(|b| *b > lo)
                .map_or(end, |b| b.min(end));
            match lo {
                a if a < BELOW_1M => self.below_1m.free(lo, hi - lo),
                a if a < BELOW_16M => self.below_16m.free(lo, hi - lo),
                _ => {
                    self.stack.free(space, PhysicalAddress::new(lo), hi - lo);
                }
            }
            lo = hi;
        }
    }

    /// Pin-aware free. Returns `true` if the frame left the allocated state.
    ///
    /// # Panics
    /// In debug builds, if the frame is not currently allocated.
    pub(crate) fn free_page<S: VirtualAddressSpace + ?Sized>(&mut self, space: &S, pa: PhysicalAddress) -> bool {
        if let PinRelease::StillPinned(left) = self.pins.release(pa.frame()) {
            trace!("frame {pa} still pinned {left} times");
            return false;
        }
        assert!(self.mark_free(pa), "double free of frame {pa}");
        self.release(space, pa);
        true
    }
}

/// Frame operations for a CPU that already holds the frame lock.
pub struct LockedFrames<'a, S: VirtualAddressSpace> {
    manager: &'a PhysicalMemoryManager<S>,
    guard: ReentrantSpinLockGuard<'a, RefCell<FrameState>>,
}

impl<S: VirtualAddressSpace> LockedFrames<'_, S> {
    /// Pops one frame of `class`, without the memory pressure check.
    ///
    /// # Panics
    /// If no frame of `class` is left ("Out of memory.").
    #[must_use]
    pub fn allocate_page(&self, class: AddressClass) -> PhysicalAddress {
        let Some(pa) = self.guard.borrow_mut().take(class, &self.manager.segments) else {
            panic!("Out of memory.");
        };
        pa
    }

    /// See [`PhysicalMemoryManager::free_page`].
    ///
    /// # Panics
    /// In debug builds, on a double free.
    pub fn free_page(&self, pa: PhysicalAddress) {
        self.guard.borrow_mut().free_page(&self.manager.space, pa);
    }

    pub fn pin(&self, pa: PhysicalAddress) -> u64 {
        self.guard.borrow_mut().pins.pin(pa.frame())
    }

    #[must_use]
    pub fn refcount(&self, pa: PhysicalAddress) -> u64 {
        self.guard.borrow().pins.refcount(pa.frame())
    }

    #[must_use]
    pub fn free_page_count(&self) -> usize {
        self.guard.borrow().stack.free_pages()
    }

    pub(crate) fn state(&self) -> RefMut<'_, FrameState> {
        self.guard.borrow_mut()
    }

    /// Lock depth on this CPU, 1 for the outermost holder.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.guard.depth()
    }
}

pub struct PhysicalMemoryManager<S: VirtualAddressSpace> {
    pub(crate) space: S,
    pub(crate) frames: ReentrantSpinLock<RefCell<FrameState>>,
    pub(crate) regions: SpinLock<RegionState>,
    pub(crate) segments: SegmentStates,
    pressure: MemoryPressureManager,
    handling_pressure: AtomicBool,
    hit_watermark: AtomicBool,
    zero_page: SyncOnceCell<PhysicalAddress>,
    pub(crate) next_region_id: AtomicU64,
}

impl<S: VirtualAddressSpace> PhysicalMemoryManager<S> {
    /// An allocator without any memory; feed it with
    /// [`initialise`](Self::initialise).
    ///
    /// `space` is the kernel address space the allocator maps page-stack
    /// storage and memory regions into. `current_cpu` identifies the
    /// calling CPU for the re-entrant frame lock.
    pub fn new(space: S, current_cpu: fn() -> usize) -> Self {
        Self {
            space,
            frames: ReentrantSpinLock::new(RefCell::new(FrameState::new()), current_cpu),
            regions: SpinLock::new(RegionState::new()),
            segments: SegmentStates::new(),
            pressure: MemoryPressureManager::new(),
            handling_pressure: AtomicBool::new(false),
            hit_watermark: AtomicBool::new(false),
            zero_page: SyncOnceCell::new(),
            next_region_id: AtomicU64::new(1),
        }
    }

    /// Takes the frame lock.
    #[must_use]
    pub fn lock_frames(&self) -> LockedFrames<'_, S> {
        LockedFrames {
            manager: self,
            guard: self.frames.lock(),
        }
    }

    /// Allocates one frame satisfying `class`.
    ///
    /// Runs the memory pressure handlers first if the free count is under
    /// the high watermark.
    ///
    /// # Panics
    /// If no frame of `class` is left ("Out of memory."), and in debug
    /// builds if the frame popped is already marked allocated.
    pub fn allocate_page(&self, class: AddressClass) -> PhysicalAddress {
        self.wait_for(class);
        self.relieve_pressure();
        self.lock_frames().allocate_page(class)
    }

    /// Frees one frame.
    ///
    /// A pinned frame only loses one pin; it goes back onto the page stack
    /// when the last pin is gone.
    ///
    /// # Panics
    /// In debug builds, if the frame is not allocated.
    pub fn free_page(&self, pa: PhysicalAddress) {
        self.lock_frames().free_page(pa);
    }

    /// Adds an owner to an allocated frame. Returns the new pin count.
    pub fn pin(&self, pa: PhysicalAddress) -> u64 {
        self.lock_frames().pin(pa)
    }

    /// Outstanding pins of `pa`.
    #[must_use]
    pub fn refcount(&self, pa: PhysicalAddress) -> u64 {
        self.lock_frames().refcount(pa)
    }

    /// Frames on the page stack. The low-memory trackers are not counted.
    #[must_use]
    pub fn free_page_count(&self) -> usize {
        self.lock_frames().free_page_count()
    }

    #[must_use]
    pub const fn page_size(&self) -> u64 {
        PAGE_SIZE
    }

    #[must_use]
    pub const fn space(&self) -> &S {
        &self.space
    }

    #[must_use]
    pub const fn pressure(&self) -> &MemoryPressureManager {
        &self.pressure
    }

    #[must_use]
    pub fn is_segment_ready(&self, segment: Segment) -> bool {
        self.segments.is_ready(segment)
    }

    /// Firmware ranges holding ACPI tables, in map order.
    #[must_use]
    pub fn acpi_ranges(&self) -> Vec<Range> {
        self.frames.with_lock(|f| f.borrow().acpi.clone())
    }

    /// Snapshot of every registered memory region.
    #[must_use]
    pub fn memory_regions(&self) -> Vec<MemoryRegionInfo> {
        self.regions
            .with_lock(|r| r.registry.iter().map(|rec| rec.info).collect())
    }

    /// Spins until the segment `class` depends on is ready. Happens outside
    /// the frame lock so the CPU initialising that segment can take it.
    pub(crate) fn wait_for(&self, class: AddressClass) {
        if let Some(segment) = Segment::for_class(class) {
            self.segments.wait_ready(segment);
        }
    }

    pub(crate) fn relieve_pressure(&self) {
        if self.frames.is_held_by_current_cpu() {
            return;
        }

        let free = self.free_page_count();
        if free < self.pressure.high_watermark() {
            if self
                .handling_pressure
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return;
            }

            warn!("memory pressure encountered ({free} free pages), performing a compact");
            if self.pressure.compact() {
                info!("compact was successful");
            } else {
                error!("compact did not alleviate any memory pressure");
            }

            self.hit_watermark.store(true, Ordering::Relaxed);
            self.handling_pressure.store(false, Ordering::Release);
        } else if !self.handling_pressure.load(Ordering::Acquire)
            && self.hit_watermark.swap(false, Ordering::Relaxed)
        {
            error!("memory pressure was hit, but is no longer being hit");
        }
    }

    /// First initialisation pass: memory below 4 GiB.
    ///
    /// Feeds the low trackers and the below-4G page stack segment from the
    /// usable map entries, records ACPI ranges, takes `kernel` out of the
    /// below-16M tracker, derives the non-RAM ranges and opens the memory
    /// region window. Marks the below-4G segment ready.
    ///
    /// # Panics
    /// If a usable entry crosses the 1 MiB line ("strange memory map").
    pub fn initialise<M: BootMemoryMap + ?Sized>(&self, map: &M, kernel: &KernelImage) {
        {
            let guard = self.frames.lock();
            let mut frames = guard.borrow_mut();

            for entry in map.entries().filter(|e| e.kind == MemoryKind::Usable) {
                let Some((start, end)) = clip(&entry, BELOW_16M, BELOW_4G) else {
                    continue;
                };
                #[allow(clippy::cast_possible_truncation)]
                let pages = ((end - start) / PAGE_SIZE) as usize;
                frames.stack.increase_capacity(pages + 1);
                frames.stack.free(&self.space, PhysicalAddress::new(start), end - start);
            }
            self.segments.mark_ready(Segment::Below4G);

            for entry in map.entries() {
                match entry.kind {
                    MemoryKind::Usable => {
                        assert!(
                            entry.base.as_u64() >= BELOW_1M || entry.end() <= BELOW_1M,
                            "strange memory map: usable range {}..{:#x} crosses 1 MiB",
                            entry.base,
                            entry.end()
                        );
                        if let Some((start, end)) = clip(&entry, 0, BELOW_1M) {
                            frames.below_1m.free(start, end - start);
                        }
                        if let Some((start, end)) = clip(&entry, BELOW_1M, BELOW_16M) {
                            frames.below_16m.free(start, end - start);
                        }
                    }
                    kind if kind.is_acpi() && entry.base.as_u64() < BELOW_4G => {
                        frames.acpi.push(Range::new(entry.base.as_u64(), entry.length));
                    }
                    _ => {}
                }
            }

            frames.below_16m.remove(kernel.base.as_u64(), kernel.length);

            frames.non_ram.free(0, BELOW_4G);
            for entry in map.entries() {
                let end = entry.end().min(BELOW_4G);
                if entry.base.as_u64() < end {
                    frames.non_ram.remove(entry.base.as_u64(), end - entry.base.as_u64());
                }
            }

            info!(
                "physical memory: {} free pages below 4 GiB, {} KiB below 16 MiB, {} KiB below 1 MiB",
                frames.stack.free_pages(),
                frames.below_16m.total() / 1024,
                frames.below_1m.total() / 1024
            );
        }

        self.regions.with_lock(|r| {
            r.virtual_window
                .free(KERNEL_MEMORY_REGION_BASE, KERNEL_MEMORY_REGION_SIZE);
        });
    }

    /// Second initialisation pass: memory at and above 4 GiB.
    ///
    /// Each usable entry is mapped in bulk at
    /// `PHYSICAL_HUGE_MAP_BASE + base` and its frames go to the below-64G
    /// and above-64G segments, which are then marked ready.
    ///
    /// # Panics
    /// If [`initialise`](Self::initialise) has not run.
    pub fn initialise_high<M: BootMemoryMap + ?Sized>(&self, map: &M) {
        for entry in map.entries().filter(|e| e.kind == MemoryKind::Usable) {
            let Some((start, end)) = clip(&entry, BELOW_4G, u64::MAX) else {
                continue;
            };
            let virt = VirtualAddress::new(PHYSICAL_HUGE_MAP_BASE + start);
            if let Err(e) = self.space.map_huge(
                PhysicalAddress::new(start),
                virt,
                (end - start) / PAGE_SIZE,
                MappingFlags::KERNEL_DATA,
            ) {
                warn!("could not map physical range {start:#x}..{end:#x} at {virt}: {e}");
            }
        }

        {
            let guard = self.frames.lock();
            let mut frames = guard.borrow_mut();
            for entry in map.entries() {
                if entry.kind == MemoryKind::Usable {
                    for (lo, hi) in [(BELOW_4G, BELOW_64G), (BELOW_64G, u64::MAX)] {
                        let Some((start, end)) = clip(&entry, lo, hi) else {
                            continue;
                        };
                        #[allow(clippy::cast_possible_truncation)]
                        let pages = ((end - start) / PAGE_SIZE) as usize;
                        frames.stack.increase_capacity(pages);
                        frames.stack.free(&self.space, PhysicalAddress::new(start), end - start);
                    }
                } else if entry.kind.is_acpi() && entry.base.as_u64() >= BELOW_4G {
                    frames.acpi.push(Range::new(entry.base.as_u64(), entry.length));
                }
            }
            info!(
                "physical memory: {} free pages below 64 GiB, {} above",
                frames.stack.segment_free_pages(Segment::Below64G),
                frames.stack.segment_free_pages(Segment::Above64G)
            );
        }

        self.segments.mark_ready(Segment::Below64G);
        self.segments.mark_ready(Segment::Above64G);
    }

    /// Unmaps `pages` pages of boot-only memory at `start` and returns their
    /// frames to the tracker owning their address, as at boot. Unmapped
    /// pages are skipped. Returns the number of frames released.
    pub fn initialisation_done(&self, start: VirtualAddress, pages: u64) -> u64 {
        let guard = self.frames.lock();
        let mut released = 0;
        for i in 0..pages {
            let va = start + i * PAGE_SIZE;
            let Some((pa, _)) = self.space.mapping(va) else {
                continue;
            };
            if self.space.unmap(va).is_ok() {
                guard.borrow_mut().release_range(&self.space, pa.as_u64(), PAGE_SIZE);
                released += 1;
            }
        }
        info!("cleaned up {} KiB of init-only memory", released * PAGE_SIZE / 1024);
        released
    }

    /// Returns an unmapped physical range nobody owns (boot loader scratch,
    /// reclaimed firmware memory) to the allocator.
    pub fn release_range(&self, start: PhysicalAddress, length: u64) {
        debug!("releasing physical range {start}+{length:#x}");
        self.frames
            .with_lock(|f| f.borrow_mut().release_range(&self.space, start.as_u64(), length));
    }

    /// Drops the region registry and all pin metadata.
    pub fn shutdown(&self) {
        let regions = self.regions.with_lock(|r| core::mem::take(&mut r.registry).len());
        self.frames.with_lock(|f| {
            let mut frames = f.borrow_mut();
            debug!("shutdown: {regions} regions dropped");
            if !frames.pins.is_empty() {
                debug!("shutdown: pins of {} frames dropped", frames.pins.len());
            }
            #[cfg(debug_assertions)]
            debug!("shutdown: {} frames still allocated", frames.allocated.count());
            frames.pins.clear();
        });
    }

    /// The shared zero frame, if it has been created.
    #[must_use]
    pub fn zero_page(&self) -> Option<PhysicalAddress> {
        self.zero_page.get().copied()
    }

    /// The shared zero frame, created on first use.
    ///
    /// Creation maps a fresh frame at `scratch` in `space`, clears it and
    /// unmaps it again; `scratch` must be unmapped. The frame starts out
    /// with one pin that is never dropped.
    ///
    /// # Errors
    /// The error of mapping `scratch`; the frame is freed again.
    pub fn zero_page_or_create<A: VirtualAddressSpace + ?Sized>(
        &self,
        space: &A,
        scratch: VirtualAddress,
    ) -> Result<PhysicalAddress, MapError> {
        self.zero_page
            .get_or_try_init(|| {
                let pa = self.allocate_page(AddressClass::Any);
                if let Err(e) = space.map(pa, scratch, MappingFlags::WRITE | MappingFlags::KERNEL_MODE) {
                    self.free_page(pa);
                    return Err(e);
                }
                // SAFETY: mapped writable just above.
                unsafe { space.fill(scratch, 0, PAGE_BYTES) };
                space.unmap(scratch)?;
                self.pin(pa);
                debug!("zero page created at {pa}");
                Ok(pa)
            })
            .copied()
    }
}

/// Page-aligned part of `entry` inside `lo..hi`.
fn clip(entry: &MemoryMapEntry, lo: u64, hi: u64) -> Option<(u64, u64)> {
    let start = page_align_up(entry.base.as_u64().max(lo));
    let end = page_align_down(entry.end().min(hi));
    (start < end).then_some((start, end))
}
