//! Per-frame pin counts.
//!
//! A pinned frame survives as many frees as it has pins; only the free that
//! drops the count to zero returns it to the allocator. Frames that were
//! never pinned have no entry at all.

use bitfield_struct::bitfield;
use hashbrown::HashMap;
use kernel_memory_addresses::FrameNumber;

/// Metadata word kept per pinned frame.
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct PageMeta {
    /// The frame has been pinned at least once and not fully released.
    pub active: bool,
    /// Outstanding pins (bits 1..63).
    #[bits(63)]
    pub refcount: u64,
}

/// Outcome of a free against the pin table.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PinRelease {
    /// No pins; the frame goes back to the allocator.
    NotPinned,
    /// Pins remain; the frame stays allocated.
    StillPinned(u64),
    /// The last pin was dropped; the frame goes back to the allocator.
    Unpinned,
}

impl PinRelease {
    #[must_use]
    pub const fn frees_frame(self) -> bool {
        !matches!(self, Self::StillPinned(_))
    }
}

#[derive(Default)]
pub struct PinTable {
    entries: HashMap<FrameNumber, PageMeta>,
}

impl PinTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a pin and returns the new count.
    pub fn pin(&mut self, frame: FrameNumber) -> u64 {
        let meta = self.entries.entry(frame).or_insert_with(PageMeta::new);
        let count = meta.refcount() + 1;
        meta.set_refcount(count);
        meta.set_active(true);
        count
    }

    /// Drops one pin, if there is one.
    pub fn release(&mut self, frame: FrameNumber) -> PinRelease {
        let Some(meta) = self.entries.get_mut(&frame) else {
            return PinRelease::NotPinned;
        };
        let count = meta.refcount().saturating_sub(1);
        if count > 0 {
            meta.set_refcount(count);
            return PinRelease::StillPinned(count);
        }
        self.entries.remove(&frame);
        PinRelease::Unpinned
    }

    #[must_use]
    pub fn refcount(&self, frame: FrameNumber) -> u64 {
        self.entries.get(&frame).map_or(0, |m| m.refcount())
    }

    /// Number of frames with outstanding pins.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
