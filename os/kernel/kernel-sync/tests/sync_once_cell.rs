use kernel_sync::SyncOnceCell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

#[test]
fn initialises_once() {
    let cell = SyncOnceCell::new();
    assert!(cell.get().is_none());
    assert_eq!(*cell.get_or_init(|| 0x20_0000_u64), 0x20_0000);
    assert_eq!(*cell.get_or_init(|| 0x30_0000), 0x20_0000);
    assert_eq!(cell.get(), Some(&0x20_0000));
}

#[test]
fn failed_init_can_be_retried() {
    let cell: SyncOnceCell<u64> = SyncOnceCell::new();
    assert_eq!(cell.get_or_try_init(|| Err("no frame")), Err("no frame"));
    assert!(cell.get().is_none());

    assert_eq!(cell.get_or_try_init(|| Ok::<_, &str>(7)), Ok(&7));
    assert_eq!(cell.get_or_try_init(|| Err("ignored")), Ok(&7));
}

#[test]
fn take_empties_the_cell() {
    let mut cell = SyncOnceCell::new();
    cell.get_or_init(|| String::from("zero"));
    assert_eq!(cell.take().as_deref(), Some("zero"));
    assert!(cell.get().is_none());
    assert!(cell.take().is_none());
}

#[test]
fn racing_initialisers_run_once() {
    let threads = 8;
    let cell = Arc::new(SyncOnceCell::new());
    let runs = Arc::new(AtomicUsize::new(0));
    let start = Arc::new(Barrier::new(threads));

    let handles: Vec<_> = (0..threads)
        .map(|i| {
            let cell = Arc::clone(&cell);
            let runs = Arc::clone(&runs);
            let start = Arc::clone(&start);
            thread::spawn(move || {
                start.wait();
                *cell.get_or_init(|| {
                    runs.fetch_add(1, Ordering::SeqCst);
                    i
                })
            })
        })
        .collect();

    let seen: Vec<usize> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert!(seen.windows(2).all(|w| w[0] == w[1]));
}
