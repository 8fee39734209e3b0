#![allow(dead_code)]

use kernel_alloc::PhysicalMemoryManager;
use kernel_info::boot::{KernelImage, MemoryKind, MemoryMapEntry};
use kernel_memory_addresses::PhysicalAddress;
use kernel_vmem::SoftAddressSpace;
use std::sync::atomic::{AtomicUsize, Ordering};

pub type Pmm = PhysicalMemoryManager<SoftAddressSpace>;

/// Every test thread acts as its own CPU.
pub fn thread_cpu() -> usize {
    static NEXT: AtomicUsize = AtomicUsize::new(0);
    thread_local!(static ID: usize = NEXT.fetch_add(1, Ordering::Relaxed));
    ID.with(|id| *id)
}

/// A PC-like memory map: conventional memory, the BIOS hole, 1..32 MiB of
/// RAM with the kernel at 1 MiB, and an IOAPIC-style device window.
pub const MAP: [MemoryMapEntry; 5] = [
    MemoryMapEntry::new(0, 0x9_F000, MemoryKind::Usable),
    MemoryMapEntry::new(0x9_F000, 0x6_1000, MemoryKind::Reserved),
    MemoryMapEntry::new(0x10_0000, 0x1F0_0000, MemoryKind::Usable),
    MemoryMapEntry::new(0x200_0000, 0x1_0000, MemoryKind::AcpiReclaimable),
    MemoryMapEntry::new(0xFEC0_0000, 0x1000, MemoryKind::Reserved),
];

pub const KERNEL: KernelImage = KernelImage {
    base: PhysicalAddress::new(0x10_0000),
    length: 0x10_0000,
    init_base: PhysicalAddress::new(0x1C_0000),
    init_length: 0x4_0000,
};

/// Frames the page stack holds right after [`boot`]: 16..32 MiB, minus the
/// five frames consumed as stack storage.
pub const BOOT_FREE_PAGES: usize = 4091;

/// Top of the page stack right after [`boot`].
pub const STACK_TOP: PhysicalAddress = PhysicalAddress::new(0x1FF_F000);

/// An initialised manager with the pressure watermarks disabled.
pub fn boot() -> Pmm {
    let pmm = PhysicalMemoryManager::new(SoftAddressSpace::new(), thread_cpu);
    pmm.initialise(&MAP, &KERNEL);
    pmm.pressure().set_watermarks(0, 0);
    pmm
}
