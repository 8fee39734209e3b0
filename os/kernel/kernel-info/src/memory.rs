//! # Memory Layout

use kernel_memory_addresses::PAGE_SIZE;

/// Ceiling of the legacy real-mode area (1 MiB).
pub const BELOW_1M: u64 = 0x0010_0000;

/// Ceiling of ISA DMA reachable memory (16 MiB).
pub const BELOW_16M: u64 = 0x0100_0000;

/// Ceiling of 32-bit addressable memory (4 GiB).
pub const BELOW_4G: u64 = 0x0001_0000_0000;

/// Ceiling of 36-bit (PAE) addressable memory (64 GiB).
pub const BELOW_64G: u64 = 0x0010_0000_0000;

/// Lowest kernel virtual address; user heaps must stay below it.
pub const KERNEL_SPACE_START: u64 = 0xffff_8000_0000_0000;

/// Physical memory at or above 4 GiB is mapped here, offset by its physical
/// address, during the second initialisation pass.
pub const PHYSICAL_HUGE_MAP_BASE: u64 = 0xffff_8000_0000_0000;

/// Start of the kernel heap.
pub const KERNEL_HEAP_START: u64 = 0xffff_ffff_5000_0000;

/// Size of the kernel heap window.
pub const KERNEL_HEAP_SIZE: u64 = 0x1000_0000;

/// Virtual window handed out to memory regions.
pub const KERNEL_MEMORY_REGION_BASE: u64 = 0xffff_ffff_6000_0000;

/// Size of the memory region window (256 MiB).
pub const KERNEL_MEMORY_REGION_SIZE: u64 = 0x1000_0000;

/// Backing storage of the below-4 GiB page stack (32-bit entries).
pub const PAGE_STACK_BELOW_4G_BASE: u64 = 0xffff_ffff_7000_0000;

/// Enough for one 32-bit entry per frame below 4 GiB.
pub const PAGE_STACK_BELOW_4G_SIZE: u64 = 0x0040_0000;

/// Backing storage of the 4 GiB..64 GiB page stack (64-bit entries).
pub const PAGE_STACK_BELOW_64G_BASE: u64 = PAGE_STACK_BELOW_4G_BASE + PAGE_STACK_BELOW_4G_SIZE;

/// Enough for one 64-bit entry per frame between 4 GiB and 64 GiB.
pub const PAGE_STACK_BELOW_64G_SIZE: u64 = 0x0780_0000;

/// Backing storage of the page stack above 64 GiB (64-bit entries).
pub const PAGE_STACK_ABOVE_64G_BASE: u64 = PAGE_STACK_BELOW_64G_BASE + PAGE_STACK_BELOW_64G_SIZE;

pub const PAGE_STACK_ABOVE_64G_SIZE: u64 = 0x0080_0000;

/// Where the kernel executes (VMA).
pub const KERNEL_BASE: u64 = 0xffff_ffff_8000_0000;

/// Default start of a user heap.
pub const USER_HEAP_START: u64 = 0x0000_0000_4000_0000;

/// Default start of the user dynamic mapping area (`mmap` and friends).
pub const USER_DYNAMIC_START: u64 = 0x0000_4000_0000_0000;

/// Below this many free frames, allocation triggers a compaction first.
pub const DEFAULT_HIGH_WATERMARK: usize = 256;

/// Below this many free frames, caches start trimming on their own.
pub const DEFAULT_LOW_WATERMARK: usize = 2048;

const _: () = {
    assert!(BELOW_1M < BELOW_16M && BELOW_16M < BELOW_4G && BELOW_4G < BELOW_64G);
    assert!(KERNEL_HEAP_START.is_multiple_of(PAGE_SIZE));
    assert!(KERNEL_MEMORY_REGION_BASE.is_multiple_of(PAGE_SIZE));
    assert!(KERNEL_MEMORY_REGION_SIZE.is_multiple_of(PAGE_SIZE));
    assert!(KERNEL_HEAP_START + KERNEL_HEAP_SIZE <= KERNEL_MEMORY_REGION_BASE);
    assert!(KERNEL_MEMORY_REGION_BASE + KERNEL_MEMORY_REGION_SIZE <= PAGE_STACK_BELOW_4G_BASE);
    assert!(PAGE_STACK_BELOW_4G_SIZE >= (BELOW_4G / PAGE_SIZE) * 4);
    assert!(PAGE_STACK_ABOVE_64G_BASE + PAGE_STACK_ABOVE_64G_SIZE <= KERNEL_BASE);
    assert!(KERNEL_SPACE_START <= KERNEL_HEAP_START);
    assert!(USER_HEAP_START < USER_DYNAMIC_START && USER_DYNAMIC_START < KERNEL_SPACE_START);
    assert!(DEFAULT_HIGH_WATERMARK < DEFAULT_LOW_WATERMARK);
};
