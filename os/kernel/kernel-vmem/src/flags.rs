bitflags::bitflags! {
    /// Architecture neutral attributes of a single page mapping.
    #[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
    pub struct MappingFlags: u32 {
        /// Writes are permitted. Without it the page is read-only.
        const WRITE          = 1 << 0;

        /// Writes are combined by the CPU before reaching memory.
        const WRITE_COMBINE  = 1 << 1;

        /// Caching disabled; required for most MMIO.
        const CACHE_DISABLE  = 1 << 2;

        /// Instruction fetches are permitted.
        const EXECUTE        = 1 << 3;

        /// Only accessible from kernel mode.
        const KERNEL_MODE    = 1 << 4;

        /// Read-only view of a shared frame. The first write faults and the
        /// fault handler gives the page a private copy.
        const COPY_ON_WRITE  = 1 << 5;

        /// Write-through caching.
        const WRITE_THROUGH  = 1 << 6;

        /// Frame is shared between address spaces and survives teardown of
        /// any single one of them.
        const SHARED         = 1 << 7;
    }
}

impl MappingFlags {
    /// Flags used for kernel-internal bookkeeping pages.
    pub const KERNEL_DATA: Self = Self::KERNEL_MODE.union(Self::WRITE);
}
