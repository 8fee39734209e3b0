mod common;

use common::{BOOT_FREE_PAGES, Pmm, STACK_TOP, boot};
use kernel_alloc::{AddressClass, MemoryPressureHandler, Priority, Segment};
use kernel_info::boot::{MemoryKind, MemoryMapEntry};
use kernel_memory_addresses::PhysicalAddress;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, Mutex, Weak};
use std::thread;
use std::time::Duration;

#[test]
fn freed_frame_is_next_allocated() {
    let pmm = boot();
    assert_eq!(pmm.free_page_count(), BOOT_FREE_PAGES);

    let a = pmm.allocate_page(AddressClass::Any);
    assert_eq!(a, STACK_TOP);
    pmm.free_page(a);
    assert_eq!(pmm.allocate_page(AddressClass::Any), a);
    assert_eq!(pmm.allocate_page(AddressClass::Below4G), PhysicalAddress::new(0x1FF_E000));
}

#[test]
fn pinned_stack_frame_needs_one_free_per_pin() {
    let pmm = boot();
    let a = pmm.allocate_page(AddressClass::Any);
    assert_eq!(pmm.pin(a), 1);
    assert_eq!(pmm.pin(a), 2);

    pmm.free_page(a);
    assert_eq!(pmm.refcount(a), 1);
    let b = pmm.allocate_page(AddressClass::Any);
    assert_ne!(b, a);

    pmm.free_page(b);
    pmm.free_page(a);
    assert_eq!(pmm.refcount(a), 0);
    assert_eq!(pmm.allocate_page(AddressClass::Any), a);
}

#[test]
fn pinned_low_frame_reappears_only_after_last_free() {
    let pmm = boot();
    let target = PhysicalAddress::new(0x30_0000);

    // The below-16M tracker hands out 2 MiB.. first fit.
    let taken: Vec<_> = (0..=0x100).map(|_| pmm.allocate_page(AddressClass::Below16M)).collect();
    assert_eq!(taken.last(), Some(&target));

    assert_eq!(pmm.pin(target), 1);
    assert_eq!(pmm.pin(target), 2);
    pmm.free_page(target);
    assert_eq!(pmm.refcount(target), 1);
    assert_eq!(pmm.allocate_page(AddressClass::Any), STACK_TOP);

    pmm.free_page(target);
    assert_eq!(pmm.refcount(target), 0);
    assert_eq!(pmm.allocate_page(AddressClass::Any), target);
}

#[test]
fn freed_low_frames_join_the_page_stack() {
    let pmm = boot();
    let low = pmm.allocate_page(AddressClass::Below1M);
    assert_eq!(low, PhysicalAddress::zero());
    pmm.free_page(low);
    assert_eq!(pmm.free_page_count(), BOOT_FREE_PAGES + 1);
    assert_eq!(pmm.allocate_page(AddressClass::Any), low);

    let dma = pmm.allocate_page(AddressClass::Below16M);
    assert_eq!(dma, PhysicalAddress::new(0x20_0000));
    pmm.free_page(dma);
    assert_eq!(pmm.allocate_page(AddressClass::Any), dma);

    // The trackers do not see them again.
    assert_eq!(pmm.allocate_page(AddressClass::Below1M), PhysicalAddress::new(0x1000));
    assert_eq!(pmm.allocate_page(AddressClass::Below16M), PhysicalAddress::new(0x20_1000));
}

#[test]
fn queries() {
    let pmm = boot();
    assert_eq!(pmm.page_size(), 4096);
    assert_eq!(pmm.acpi_ranges().len(), 1);
    assert_eq!(pmm.acpi_ranges()[0].start, 0x200_0000);
    assert!(pmm.is_segment_ready(Segment::Below4G));
}

struct Hoard {
    pmm: Weak<Pmm>,
    frames: Mutex<Vec<PhysicalAddress>>,
    calls: AtomicUsize,
}

impl MemoryPressureHandler for Hoard {
    fn description(&self) -> &str {
        "hoard"
    }

    fn compact(&self) -> bool {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let Some(pmm) = self.pmm.upgrade() else {
            return false;
        };
        let frames: Vec<_> = self.frames.lock().unwrap().drain(..).collect();
        for pa in &frames {
            pmm.free_page(*pa);
        }
        !frames.is_empty()
    }
}

#[test]
fn pressure_handlers_run_under_the_high_watermark() {
    let pmm = Arc::new(boot());
    let hoard = Arc::new(Hoard {
        pmm: Arc::downgrade(&pmm),
        frames: Mutex::new((0..10).map(|_| pmm.allocate_page(AddressClass::Any)).collect()),
        calls: AtomicUsize::new(0),
    });
    pmm.pressure().register(Priority::High, hoard.clone());
    pmm.pressure().set_watermarks(BOOT_FREE_PAGES - 5, 0);

    // 4081 free, under the watermark: the hoard gives its ten frames back
    // and the last one it returned is handed out.
    let pa = pmm.allocate_page(AddressClass::Any);
    assert_eq!(hoard.calls.load(Ordering::SeqCst), 1);
    assert_eq!(pa, PhysicalAddress::new(STACK_TOP.as_u64() - 9 * 0x1000));
    assert_eq!(pmm.free_page_count(), BOOT_FREE_PAGES - 1);

    // Back above the watermark.
    let _ = pmm.allocate_page(AddressClass::Any);
    assert_eq!(hoard.calls.load(Ordering::SeqCst), 1);
}

struct Greedy {
    pmm: Weak<Pmm>,
    calls: AtomicUsize,
}

impl MemoryPressureHandler for Greedy {
    fn description(&self) -> &str {
        "greedy"
    }

    fn compact(&self) -> bool {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(pmm) = self.pmm.upgrade() {
            // Allocating from a handler must not recurse into the handlers.
            let pa = pmm.allocate_page(AddressClass::Any);
            pmm.free_page(pa);
        }
        false
    }
}

#[test]
fn compaction_does_not_recurse_and_failure_is_not_fatal() {
    let pmm = Arc::new(boot());
    let greedy = Arc::new(Greedy {
        pmm: Arc::downgrade(&pmm),
        calls: AtomicUsize::new(0),
    });
    pmm.pressure().register(Priority::Lowest, greedy.clone());
    pmm.pressure().set_watermarks(usize::MAX, 0);

    let pa = pmm.allocate_page(AddressClass::Any);
    assert_eq!(greedy.calls.load(Ordering::SeqCst), 1);
    pmm.free_page(pa);
}

#[test]
fn lock_holder_skips_pressure_handling() {
    let pmm = Arc::new(boot());
    let greedy = Arc::new(Greedy {
        pmm: Arc::downgrade(&pmm),
        calls: AtomicUsize::new(0),
    });
    pmm.pressure().register(Priority::Medium, greedy.clone());
    pmm.pressure().set_watermarks(usize::MAX, 0);

    let frames = pmm.lock_frames();
    let pa = pmm.allocate_page(AddressClass::Any);
    frames.free_page(pa);
    drop(frames);
    assert_eq!(greedy.calls.load(Ordering::SeqCst), 0);
}

#[test]
fn high_segment_waiters_spin_until_ready() {
    let pmm = Arc::new(boot());
    let waiter = {
        let pmm = Arc::clone(&pmm);
        thread::spawn(move || pmm.allocate_page(AddressClass::Below64G))
    };

    thread::sleep(Duration::from_millis(50));
    assert!(!waiter.is_finished());

    pmm.initialise_high(&[MemoryMapEntry::new(0x1_0000_0000, 0x10_0000, MemoryKind::Usable)]);
    let pa = waiter.join().unwrap();
    assert!(pa.as_u64() >= 0x1_0000_0000);
    assert!(pmm.is_segment_ready(Segment::Above64G));
}

#[test]
fn concurrent_allocations_never_share_a_frame() {
    const THREADS: usize = 8;
    const ROUNDS: usize = 200;

    let pmm = Arc::new(boot());
    let live = Arc::new(Mutex::new(HashSet::new()));
    let barrier = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let (pmm, live, barrier) = (Arc::clone(&pmm), Arc::clone(&live), Arc::clone(&barrier));
            thread::spawn(move || {
                barrier.wait();
                for _ in 0..ROUNDS {
                    let frames: Vec<_> = (0..4).map(|_| pmm.allocate_page(AddressClass::Any)).collect();
                    for pa in &frames {
                        assert!(live.lock().unwrap().insert(*pa), "{pa:?} handed out twice");
                    }
                    for pa in frames {
                        assert!(live.lock().unwrap().remove(&pa));
                        pmm.free_page(pa);
                    }
                }
            })
        })
        .collect();

    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(pmm.free_page_count(), BOOT_FREE_PAGES);
}
