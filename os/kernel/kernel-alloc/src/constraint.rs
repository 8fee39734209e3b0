use kernel_info::memory::{BELOW_1M, BELOW_4G, BELOW_16M, BELOW_64G};

/// Physical ceiling an allocation must stay under.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub enum AddressClass {
    /// No restriction; the highest populated page stack is preferred.
    #[default]
    Any,
    /// Real-mode reachable memory.
    Below1M,
    /// ISA DMA reachable memory.
    Below16M,
    /// 32-bit device reachable memory.
    Below4G,
    /// PAE reachable memory.
    Below64G,
}

impl AddressClass {
    /// Exclusive upper bound, `None` for [`AddressClass::Any`].
    #[must_use]
    pub const fn ceiling(self) -> Option<u64> {
        match self {
            Self::Any => None,
            Self::Below1M => Some(BELOW_1M),
            Self::Below16M => Some(BELOW_16M),
            Self::Below4G => Some(BELOW_4G),
            Self::Below64G => Some(BELOW_64G),
        }
    }

    /// Whether the class is served by the low-memory range trackers rather
    /// than the page stack.
    #[must_use]
    pub const fn is_low_memory(self) -> bool {
        matches!(self, Self::Below1M | Self::Below16M)
    }
}

bitflags::bitflags! {
    /// How a memory region is to be backed.
    #[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
    pub struct RegionConstraints: u32 {
        /// Physically contiguous backing. Mandatory for fixed-address
        /// requests; dynamic requests are moved below 16 MiB.
        const CONTINUOUS   = 1 << 0;

        /// The physical range is device or firmware memory, not RAM.
        const NON_RAM      = 1 << 1;

        /// Map a fixed physical range even if it cannot be reserved.
        const FORCE        = 1 << 2;

        /// Reserve virtual space only; the owner maps pages itself.
        const VIRTUAL_ONLY = 1 << 3;

        /// Keep the region out of the region registry.
        const ANONYMOUS    = 1 << 4;
    }
}
