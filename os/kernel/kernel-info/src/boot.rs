//! # Boot Memory Map
//!
//! The bootloader hands the kernel a list of physical ranges with a type
//! tag. The frame allocator only ever reads it during initialisation.

use kernel_memory_addresses::PhysicalAddress;

/// Type tag of a memory map entry.
///
/// Discriminants follow the E820 numbering; anything unknown is treated
/// as [`MemoryKind::Reserved`].
#[repr(u32)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum MemoryKind {
    /// Free RAM the kernel may hand out.
    Usable = 1,
    /// Firmware or device owned; never touched.
    Reserved = 2,
    /// ACPI tables; reclaimable once parsed.
    AcpiReclaimable = 3,
    /// ACPI non-volatile storage; must be preserved.
    AcpiNvs = 4,
    /// RAM reported defective.
    Bad = 5,
}

impl MemoryKind {
    #[must_use]
    pub const fn from_raw(raw: u32) -> Self {
        match raw {
            1 => Self::Usable,
            3 => Self::AcpiReclaimable,
            4 => Self::AcpiNvs,
            5 => Self::Bad,
            _ => Self::Reserved,
        }
    }

    #[must_use]
    pub const fn is_acpi(self) -> bool {
        matches!(self, Self::AcpiReclaimable | Self::AcpiNvs)
    }
}

/// One `(address, length, kind)` triple of the boot memory map.
#[repr(C)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct MemoryMapEntry {
    pub base: PhysicalAddress,
    /// Length in bytes.
    pub length: u64,
    pub kind: MemoryKind,
}

impl MemoryMapEntry {
    #[must_use]
    pub const fn new(base: u64, length: u64, kind: MemoryKind) -> Self {
        Self {
            base: PhysicalAddress::new(base),
            length,
            kind,
        }
    }

    /// First byte past the entry.
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.base.as_u64().saturating_add(self.length)
    }
}

/// Physical extent of the loaded kernel image.
///
/// Removed from the low-memory trackers during initialisation. The `init`
/// part holds boot-only code and data that may be returned to the allocator
/// once start-up has finished.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct KernelImage {
    pub base: PhysicalAddress,
    pub length: u64,
    pub init_base: PhysicalAddress,
    pub init_length: u64,
}

/// Enumerates the boot memory map.
///
/// Implementations must yield the same entries on every call; the allocator
/// walks the map more than once.
pub trait BootMemoryMap {
    fn entries(&self) -> impl Iterator<Item = MemoryMapEntry> + '_;
}

impl BootMemoryMap for [MemoryMapEntry] {
    fn entries(&self) -> impl Iterator<Item = MemoryMapEntry> + '_ {
        self.iter().copied()
    }
}

impl<const N: usize> BootMemoryMap for [MemoryMapEntry; N] {
    fn entries(&self) -> impl Iterator<Item = MemoryMapEntry> + '_ {
        self.iter().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_kinds_are_reserved() {
        assert_eq!(MemoryKind::from_raw(1), MemoryKind::Usable);
        assert_eq!(MemoryKind::from_raw(4), MemoryKind::AcpiNvs);
        assert_eq!(MemoryKind::from_raw(12), MemoryKind::Reserved);
        assert!(MemoryKind::AcpiReclaimable.is_acpi());
        assert!(!MemoryKind::Usable.is_acpi());
    }

    #[test]
    fn slices_enumerate_in_order() {
        let map = [
            MemoryMapEntry::new(0, 0x9_F000, MemoryKind::Usable),
            MemoryMapEntry::new(0x100_0000, 0x100_0000, MemoryKind::Usable),
        ];
        let ends: Vec<u64> = map.entries().map(|e| e.end()).collect();
        assert_eq!(ends, vec![0x9_F000, 0x200_0000]);
        assert_eq!(map[..].entries().count(), 2);
    }
}
