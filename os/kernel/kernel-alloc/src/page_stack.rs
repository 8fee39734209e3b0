//! # Page Stack
//!
//! LIFO free list of physical frames, split into one stack per address
//! class so a request for memory under a ceiling pops in O(1) instead of
//! scanning.
//!
//! | Segment | Frames | Entry size |
//! |---------|--------|------------|
//! | [`Segment::Below4G`] | `0 .. 4 GiB` | 32 bit |
//! | [`Segment::Below64G`] | `4 GiB .. 64 GiB` | 64 bit |
//! | [`Segment::Above64G`] | `64 GiB ..` | 64 bit |
//!
//! ## Backing storage
//!
//! Each segment owns a fixed virtual window. Slots only exist for the part
//! of the window that is mapped, and the frames mapped there come out of the
//! very ranges being freed: when [`PageStack::free`] finds a segment full (or
//! the overall capacity below the desired capacity), the next frame of the
//! range becomes a backing page instead of an entry. Entries are kept in an
//! index-addressed array whose length never exceeds the mapped slot count.
//!
//! ## Readiness
//!
//! Segments start out not ready and become ready strictly in address order
//! ([`SegmentStates::mark_ready`]). A constrained request for a segment that
//! is not ready spins until it is; boot cannot continue without memory.

use crate::AddressClass;
use alloc::vec::Vec;
use core::hint::spin_loop;
use core::sync::atomic::{AtomicBool, Ordering};
use kernel_info::memory::{
    BELOW_4G, BELOW_64G, PAGE_STACK_ABOVE_64G_BASE, PAGE_STACK_ABOVE_64G_SIZE,
    PAGE_STACK_BELOW_4G_BASE, PAGE_STACK_BELOW_4G_SIZE, PAGE_STACK_BELOW_64G_BASE,
    PAGE_STACK_BELOW_64G_SIZE,
};
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, VirtualAddress};
use kernel_vmem::{MappingFlags, VirtualAddressSpace};
use log::{error, trace, warn};

pub const SEGMENTS: usize = 3;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Segment {
    Below4G = 0,
    Below64G = 1,
    Above64G = 2,
}

impl Segment {
    pub const ALL: [Self; SEGMENTS] = [Self::Below4G, Self::Below64G, Self::Above64G];

    /// The segment a frame at `pa` belongs to.
    #[must_use]
    pub const fn for_address(pa: PhysicalAddress) -> Self {
        match pa.as_u64() {
            a if a < BELOW_4G => Self::Below4G,
            a if a < BELOW_64G => Self::Below64G,
            _ => Self::Above64G,
        }
    }

    /// Segment a request of `class` has to wait for. `None` for the classes
    /// the page stack does not serve.
    #[must_use]
    pub const fn for_class(class: AddressClass) -> Option<Self> {
        match class {
            AddressClass::Below1M | AddressClass::Below16M => None,
            AddressClass::Any | AddressClass::Below4G => Some(Self::Below4G),
            AddressClass::Below64G => Some(Self::Below64G),
        }
    }

    /// Exclusive upper bound of the segment's frames.
    #[must_use]
    pub const fn ceiling(self) -> u64 {
        match self {
            Self::Below4G => BELOW_4G,
            Self::Below64G => BELOW_64G,
            Self::Above64G => u64::MAX,
        }
    }

    const fn index(self) -> usize {
        self as usize
    }

    /// Bytes per stack entry in the backing window.
    const fn entry_size(self) -> u64 {
        match self {
            Self::Below4G => 4,
            Self::Below64G | Self::Above64G => 8,
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    const fn slots_per_page(self) -> usize {
        (PAGE_SIZE / self.entry_size()) as usize
    }

    const fn window(self) -> (VirtualAddress, u64) {
        match self {
            Self::Below4G => (
                VirtualAddress::new(PAGE_STACK_BELOW_4G_BASE),
                PAGE_STACK_BELOW_4G_SIZE,
            ),
            Self::Below64G => (
                VirtualAddress::new(PAGE_STACK_BELOW_64G_BASE),
                PAGE_STACK_BELOW_64G_SIZE,
            ),
            Self::Above64G => (
                VirtualAddress::new(PAGE_STACK_ABOVE_64G_BASE),
                PAGE_STACK_ABOVE_64G_SIZE,
            ),
        }
    }
}

/// Per-segment `NotReady -> Ready` state machine.
///
/// Lives outside the allocator lock so that a CPU spinning on a segment
/// never blocks the CPU that is about to mark it ready.
pub struct SegmentStates {
    ready: [AtomicBool; SEGMENTS],
}

impl Default for SegmentStates {
    fn default() -> Self {
        Self::new()
    }
}

impl SegmentStates {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            ready: [const { AtomicBool::new(false) }; SEGMENTS],
        }
    }

    #[must_use]
    pub fn is_ready(&self, segment: Segment) -> bool {
        self.ready[segment.index()].load(Ordering::Acquire)
    }

    /// Marks `segment` ready. Idempotent.
    ///
    /// # Panics
    /// If a lower segment is not ready yet.
    pub fn mark_ready(&self, segment: Segment) {
        for lower in &Segment::ALL[..segment.index()] {
            assert!(
                self.is_ready(*lower),
                "page stack segment {segment:?} marked ready before {lower:?}"
            );
        }
        self.ready[segment.index()].store(true, Ordering::Release);
    }

    pub fn wait_ready(&self, segment: Segment) {
        while !self.is_ready(segment) {
            spin_loop();
        }
    }
}

#[derive(Default)]
struct Stack {
    entries: Vec<PhysicalAddress>,
    /// Entries the mapped part of the window can hold.
    slots: usize,
    backing_pages: u64,
}

#[derive(Default)]
pub struct PageStack {
    stacks: [Stack; SEGMENTS],
    /// Slots over all segments.
    capacity: usize,
    desired_capacity: usize,
    free_pages: usize,
}

impl PageStack {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Pops one frame satisfying `class`.
    ///
    /// [`AddressClass::Any`] starts at the highest ready segment and falls
    /// back toward lower ones; constrained classes start at their own
    /// segment, spinning until it is ready. Classes below 16 MiB are not
    /// served here and always yield `None`.
    pub fn allocate(&mut self, class: AddressClass, states: &SegmentStates) -> Option<PhysicalAddress> {
        let first = match class {
            AddressClass::Below1M | AddressClass::Below16M => return None,
            AddressClass::Below4G => Segment::Below4G,
            AddressClass::Below64G => Segment::Below64G,
            AddressClass::Any => Segment::ALL
                .into_iter()
                .rev()
                .find(|s| states.is_ready(*s))
                .unwrap_or(Segment::Below4G),
        };
        states.wait_ready(first);

        let pa = Segment::ALL[..=first.index()]
            .iter()
            .rev()
            .find_map(|s| self.stacks[s.index()].entries.pop())?;
        self.free_pages -= 1;
        Some(pa)
    }

    /// Pushes every frame of `start..start + length` onto its segment.
    ///
    /// The range must not cross a segment boundary. Frames are consumed as
    /// backing pages first while the segment has no free slot or the overall
    /// capacity is below the desired capacity. Returns the number of frames
    /// that ended up on the stack.
    pub fn free<S: VirtualAddressSpace + ?Sized>(
        &mut self,
        space: &S,
        start: PhysicalAddress,
        length: u64,
    ) -> usize {
        let pages = length / PAGE_SIZE;
        if pages == 0 {
            return 0;
        }
        debug_assert!(start.is_page_aligned(), "unaligned free of {start}");

        let segment = Segment::for_address(start);
        debug_assert_eq!(
            segment,
            Segment::for_address(start + (pages - 1) * PAGE_SIZE),
            "range at {start} crosses a page stack segment"
        );

        let mut pushed = 0;
        let mut dropped = 0;
        let mut can_grow = true;
        for i in 0..pages {
            let pa = start + i * PAGE_SIZE;
            if can_grow && self.wants_backing(segment) {
                if self.grow(space, segment, pa) {
                    continue;
                }
                can_grow = false;
            }
            if self.push(segment, pa) {
                pushed += 1;
            } else {
                dropped += 1;
            }
        }

        if dropped > 0 {
            error!("page stack {segment:?} is full; {dropped} frames from {start} are lost");
        }
        pushed
    }

    /// Raises the desired capacity by `frames` slots.
    pub fn increase_capacity(&mut self, frames: usize) {
        self.desired_capacity += frames;
    }

    /// Removes every frame of `start..start + pages` from the stacks, or
    /// none if any of them is missing.
    pub fn remove_specific(&mut self, start: PhysicalAddress, pages: u64) -> bool {
        let end = start + pages * PAGE_SIZE;
        let inside = |pa: &PhysicalAddress| *pa >= start && *pa < end;

        let found: u64 = self
            .stacks
            .iter()
            .map(|s| s.entries.iter().filter(|pa| inside(pa)).count() as u64)
            .sum();
        if found != pages {
            return false;
        }

        for stack in &mut self.stacks {
            stack.entries.retain(|pa| !inside(pa));
        }
        #[allow(clippy::cast_possible_truncation)]
        {
            self.free_pages -= pages as usize;
        }
        true
    }

    #[must_use]
    pub const fn free_pages(&self) -> usize {
        self.free_pages
    }

    #[must_use]
    pub fn segment_free_pages(&self, segment: Segment) -> usize {
        self.stacks[segment.index()].entries.len()
    }

    /// Number of frames serving as backing storage of `segment`.
    #[must_use]
    pub const fn backing_pages(&self, segment: Segment) -> u64 {
        self.stacks[segment.index()].backing_pages
    }

    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    fn wants_backing(&self, segment: Segment) -> bool {
        let stack = &self.stacks[segment.index()];
        self.capacity < self.desired_capacity || stack.entries.len() >= stack.slots
    }

    /// Maps `pa` as the next backing page of `segment`.
    fn grow<S: VirtualAddressSpace + ?Sized>(&mut self, space: &S, segment: Segment, pa: PhysicalAddress) -> bool {
        let stack = &mut self.stacks[segment.index()];
        let (base, size) = segment.window();
        let offset = stack.backing_pages * PAGE_SIZE;
        if offset >= size {
            return false;
        }

        let va = base + offset;
        if let Err(e) = space.map(pa, va, MappingFlags::KERNEL_DATA) {
            warn!("could not map page stack {segment:?} backing page {pa} at {va}: {e}");
            return false;
        }

        let added = segment.slots_per_page();
        stack.backing_pages += 1;
        stack.slots += added;
        stack.entries.reserve(added);
        self.capacity += added;
        trace!("page stack {segment:?} grown to {} slots", stack.slots);
        true
    }

    fn push(&mut self, segment: Segment, pa: PhysicalAddress) -> bool {
        let stack = &mut self.stacks[segment.index()];
        if stack.entries.len() >= stack.slots {
            return false;
        }
        stack.entries.push(pa);
        self.free_pages += 1;
        true
    }
}
