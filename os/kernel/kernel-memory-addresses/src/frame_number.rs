use crate::{PAGE_SHIFT, PhysicalAddress};
use core::fmt;

/// Index of a physical frame (`address >> PAGE_SHIFT`).
///
/// Out-of-line frame metadata (pins, the debug allocation bitmap) is keyed
/// by frame number rather than by raw address.
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct FrameNumber(u64);

impl FrameNumber {
    #[inline]
    #[must_use]
    pub const fn new(index: u64) -> Self {
        Self(index)
    }

    /// The frame that contains `addr` (lower bits discarded).
    #[inline]
    #[must_use]
    pub const fn containing(addr: PhysicalAddress) -> Self {
        Self(addr.as_u64() >> PAGE_SHIFT)
    }

    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Physical base address of this frame.
    #[inline]
    #[must_use]
    pub const fn base(self) -> PhysicalAddress {
        PhysicalAddress::new(self.0 << PAGE_SHIFT)
    }
}

impl fmt::Debug for FrameNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Frame(0x{:X})", self.0)
    }
}
