mod common;

use common::{BOOT_FREE_PAGES, Pmm, boot};
use kernel_alloc::{AddressClass, ExpandHeap, HeapError, resolve_zero_page_write};
use kernel_info::memory::{KERNEL_HEAP_START, KERNEL_SPACE_START, USER_DYNAMIC_START, USER_HEAP_START};
use kernel_memory_addresses::VirtualAddress;
use kernel_vmem::{HeapCursor, HeapLayout, MapError, MappingFlags, SoftAddressSpace, VirtualAddressSpace};

const PAGE: i64 = 4096;
const HEAP: VirtualAddress = VirtualAddress::new(USER_HEAP_START);
const USER: MappingFlags = MappingFlags::WRITE;

fn user_space(pmm: &Pmm) -> SoftAddressSpace {
    pmm.space().sibling()
}

fn space_at(pmm: &Pmm, end: u64, layout: HeapLayout) -> SoftAddressSpace {
    let start = VirtualAddress::new(end);
    pmm.space().sibling().with_heap(HeapCursor::empty_at(start), layout)
}

#[test]
fn growth_maps_the_zero_page_lazily() {
    let pmm = boot();
    let mut space = user_space(&pmm);

    let start = space.expand_heap(&pmm, 3 * PAGE + 100, USER).unwrap();
    assert_eq!(start, HEAP);
    assert_eq!(space.heap_cursor().end, HEAP + 0x3064);

    // One frame for the zero page, shared by all four heap pages.
    let zero = pmm.zero_page().unwrap();
    assert_eq!(pmm.free_page_count(), BOOT_FREE_PAGES - 1);
    assert_eq!(pmm.refcount(zero), 5);
    assert_eq!(space.mapped_pages(), 4);

    let (pa, flags) = space.mapping(HEAP + 0x3000).unwrap();
    assert_eq!(pa, zero);
    assert!(flags.contains(MappingFlags::COPY_ON_WRITE));
    assert!(!flags.contains(MappingFlags::WRITE));
    assert_eq!(space.read_byte(HEAP + 0x1234), Ok(0));
    assert_eq!(space.write_byte(HEAP + 0x1234, 1), Err(MapError::WriteProtected(HEAP + 0x1000)));
}

#[test]
fn shrinking_undoes_growth() {
    let pmm = boot();
    let mut space = user_space(&pmm);
    space.expand_heap(&pmm, 3 * PAGE + 100, USER).unwrap();
    let zero = pmm.zero_page().unwrap();

    let end = space.expand_heap(&pmm, -(3 * PAGE + 100), USER).unwrap();
    assert_eq!(end, HEAP);
    assert_eq!(space.heap_cursor().end, HEAP);
    assert_eq!(space.mapped_pages(), 0);
    assert_eq!(pmm.refcount(zero), 1);
    assert_eq!(pmm.free_page_count(), BOOT_FREE_PAGES - 1);
}

#[test]
fn zero_delta_reports_the_end() {
    let pmm = boot();
    let mut space = user_space(&pmm);
    assert_eq!(space.expand_heap(&pmm, 0, USER), Ok(HEAP));
    assert_eq!(pmm.zero_page(), None);
}

#[test]
fn byte_growth_reuses_the_partial_page() {
    let pmm = boot();
    let mut space = user_space(&pmm);

    assert_eq!(space.expand_heap(&pmm, 100, USER), Ok(HEAP));
    assert_eq!(space.expand_heap(&pmm, 100, USER), Ok(HEAP + 100));
    let zero = pmm.zero_page().unwrap();
    assert_eq!(space.mapped_pages(), 1);
    assert_eq!(pmm.refcount(zero), 2);

    assert_eq!(space.expand_heap(&pmm, -200, USER), Ok(HEAP));
    assert_eq!(space.mapped_pages(), 0);
    assert_eq!(pmm.refcount(zero), 1);
}

#[test]
fn shrinking_leaves_a_page_aligned_end() {
    let pmm = boot();
    let mut space = user_space(&pmm);
    space.expand_heap(&pmm, 3 * PAGE, USER).unwrap();
    let zero = pmm.zero_page().unwrap();

    // The last page is still partly in use.
    assert_eq!(space.expand_heap(&pmm, -100, USER), Ok(HEAP + 0x3000));
    assert_eq!(space.heap_cursor().end, HEAP + 0x3000);
    assert_eq!(space.mapped_pages(), 3);

    assert_eq!(space.expand_heap(&pmm, -(PAGE + 100), USER), Ok(HEAP + 0x2000));
    assert_eq!(space.heap_cursor().end, HEAP + 0x2000);
    assert!(space.heap_cursor().end.is_page_aligned());
    assert_eq!(space.mapped_pages(), 2);
    assert_eq!(pmm.refcount(zero), 3);

    // Growing from the aligned end maps right above it.
    assert_eq!(space.expand_heap(&pmm, 100, USER), Ok(HEAP + 0x2000));
    assert_eq!(space.heap_cursor().end, HEAP + 0x2064);
    assert_eq!(space.mapped_pages(), 3);
}

#[test]
fn already_mapped_pages_are_left_alone() {
    let pmm = boot();
    let mut space = user_space(&pmm);
    let private = pmm.allocate_page(AddressClass::Any);
    space.map(private, HEAP + 0x1000, MappingFlags::WRITE).unwrap();

    space.expand_heap(&pmm, 3 * PAGE, USER).unwrap();
    let zero = pmm.zero_page().unwrap();
    assert_eq!(space.mapping(HEAP + 0x1000), Some((private, MappingFlags::WRITE)));
    assert_eq!(pmm.refcount(zero), 3);

    space.expand_heap(&pmm, -3 * PAGE, USER).unwrap();
    assert_eq!(pmm.refcount(zero), 1);
    assert_eq!(pmm.free_page_count(), BOOT_FREE_PAGES - 1);
}

#[test]
fn first_write_gets_a_private_zeroed_frame() {
    let pmm = boot();
    let mut space = user_space(&pmm);
    space.expand_heap(&pmm, 2 * PAGE, USER).unwrap();
    let zero = pmm.zero_page().unwrap();

    assert_eq!(space.write_byte(HEAP + 0x10, 7), Err(MapError::WriteProtected(HEAP)));
    assert_eq!(resolve_zero_page_write(&space, &pmm, HEAP + 0x10), Ok(true));
    assert_eq!(pmm.refcount(zero), 2);

    let (private, flags) = space.mapping(HEAP).unwrap();
    assert_ne!(private, zero);
    assert!(flags.contains(MappingFlags::WRITE));
    assert!(!flags.contains(MappingFlags::COPY_ON_WRITE));

    space.write_byte(HEAP + 0x10, 7).unwrap();
    assert_eq!(space.read_byte(HEAP + 0x10), Ok(7));
    assert_eq!(space.read_byte(HEAP + 0x20), Ok(0));
    assert_eq!(space.read_byte(HEAP + 0x1010), Ok(0));

    // Not a zero page mapping (any more), or not mapped at all.
    assert_eq!(resolve_zero_page_write(&space, &pmm, HEAP + 0x10), Ok(false));
    assert_eq!(resolve_zero_page_write(&space, &pmm, HEAP + 0x5000), Ok(false));

    space.expand_heap(&pmm, -2 * PAGE, USER).unwrap();
    assert_eq!(pmm.refcount(zero), 1);
    assert_eq!(pmm.free_page_count(), BOOT_FREE_PAGES - 1);
}

#[test]
fn failed_resolution_restores_the_zero_mapping() {
    let pmm = boot();
    let mut space = user_space(&pmm);
    space.expand_heap(&pmm, PAGE, USER).unwrap();
    let zero = pmm.zero_page().unwrap();

    space.set_map_budget(Some(0));
    assert_eq!(resolve_zero_page_write(&space, &pmm, HEAP), Err(MapError::OutOfTables));
    space.set_map_budget(None);

    // The restore itself was refused as well, so the page lost its mapping
    // and its pin, and the private frame went back.
    assert!(!space.is_mapped(HEAP));
    assert_eq!(pmm.refcount(zero), 1);
    assert_eq!(pmm.free_page_count(), BOOT_FREE_PAGES - 1);
}

#[test]
fn rollback_frees_private_frames() {
    let pmm = boot();
    let mut space = user_space(&pmm);
    let start = space.expand_heap(&pmm, 2 * PAGE, USER).unwrap();
    let zero = pmm.zero_page().unwrap();
    resolve_zero_page_write(&space, &pmm, start).unwrap();
    resolve_zero_page_write(&space, &pmm, start + 0x1000).unwrap();
    assert_eq!(pmm.free_page_count(), BOOT_FREE_PAGES - 3);

    space.rollback_heap_expansion(&pmm, start, 2);
    assert_eq!(space.mapped_pages(), 0);
    assert_eq!(pmm.refcount(zero), 1);
    assert_eq!(pmm.free_page_count(), BOOT_FREE_PAGES - 1);
}

#[test]
fn boundaries_are_checked_before_anything_changes() {
    let pmm = boot();

    let mut space = space_at(&pmm, USER_DYNAMIC_START - 0x1000, HeapLayout::user());
    assert_eq!(
        space.expand_heap(&pmm, PAGE, USER),
        Err(HeapError::DynamicRegionOverrun(VirtualAddress::new(USER_DYNAMIC_START)))
    );
    assert_eq!(space.heap_cursor().end, VirtualAddress::new(USER_DYNAMIC_START - 0x1000));
    assert_eq!(space.mapped_pages(), 0);
    assert_eq!(pmm.zero_page(), None);

    let no_dynamic = HeapLayout {
        dynamic_start: None,
        ..HeapLayout::user()
    };
    let mut space = space_at(&pmm, KERNEL_SPACE_START - 0x1000, no_dynamic);
    assert_eq!(
        space.expand_heap(&pmm, 2 * PAGE, USER),
        Err(HeapError::KernelRegionOverrun(VirtualAddress::new(KERNEL_SPACE_START + 0x1000)))
    );

    let mut space = space_at(&pmm, KERNEL_HEAP_START - 0x1000, no_dynamic);
    assert_eq!(
        space.expand_heap(&pmm, PAGE, USER),
        Err(HeapError::KernelHeapOverrun(VirtualAddress::new(KERNEL_HEAP_START)))
    );

    let mut space = user_space(&pmm);
    assert_eq!(space.expand_heap(&pmm, -1, USER), Err(HeapError::HeapUnderflow));

    let mut space = space_at(&pmm, 0, HeapLayout::user());
    assert_eq!(space.expand_heap(&pmm, -1, USER), Err(HeapError::AddressOverflow));

    assert_eq!(space.mapped_pages(), 0);
    assert_eq!(pmm.zero_page(), None);
    assert_eq!(pmm.free_page_count(), BOOT_FREE_PAGES);
}
