use crate::info::{KERNEL_HEAP_START, KERNEL_SPACE_START, USER_DYNAMIC_START, USER_HEAP_START};
use kernel_memory_addresses::VirtualAddress;

/// Current extent of a heap, `start..end`.
///
/// `end` is a byte address and need not be page aligned after growth;
/// shrinking re-aligns it.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct HeapCursor {
    pub start: VirtualAddress,
    pub end: VirtualAddress,
}

impl HeapCursor {
    #[must_use]
    pub const fn empty_at(start: VirtualAddress) -> Self {
        Self { start, end: start }
    }

    #[must_use]
    pub const fn len(&self) -> u64 {
        self.end.as_u64() - self.start.as_u64()
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.end.as_u64() == self.start.as_u64()
    }
}

/// Boundaries a heap must never grow into.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct HeapLayout {
    /// Start of the kernel heap.
    pub kernel_heap_start: VirtualAddress,
    /// Start of the dynamic mapping area, if the space has one.
    pub dynamic_start: Option<VirtualAddress>,
    /// Start of kernel space (the user stacks sit right below it).
    pub kernel_start: VirtualAddress,
}

impl HeapLayout {
    /// Default layout of a user address space.
    #[must_use]
    pub const fn user() -> Self {
        Self {
            kernel_heap_start: VirtualAddress::new(KERNEL_HEAP_START),
            dynamic_start: Some(VirtualAddress::new(USER_DYNAMIC_START)),
            kernel_start: VirtualAddress::new(KERNEL_SPACE_START),
        }
    }
}

impl Default for HeapLayout {
    fn default() -> Self {
        Self::user()
    }
}

impl Default for HeapCursor {
    fn default() -> Self {
        Self::empty_at(VirtualAddress::new(USER_HEAP_START))
    }
}
