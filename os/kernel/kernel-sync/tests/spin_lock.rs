use kernel_sync::SpinLock;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::{panic, thread};

#[test]
fn guard_releases_on_drop() {
    let l = SpinLock::new(0_u64);

    {
        let mut g = l.lock();
        assert!(l.is_locked());
        *g = 0x1000;
    }
    assert!(!l.is_locked());

    let mut g = l.lock();
    *g += 0x1000;
    assert_eq!(*g, 0x2000);
}

#[test]
fn try_lock_fails_while_held() {
    let l = SpinLock::new(Vec::<u64>::new());

    let g1 = l.try_lock().expect("uncontended try_lock");
    assert!(l.try_lock().is_none());

    drop(g1);
    let mut g2 = l.try_lock().expect("lock was released");
    g2.push(7);
    assert_eq!(g2.len(), 1);
}

#[test]
fn with_lock_returns_closure_result() {
    let l = SpinLock::new(vec![0x20_0000_u64]);
    let n = l.with_lock(|v| {
        v.push(0x30_0000);
        v.len()
    });
    assert_eq!(n, 2);
    assert!(!l.is_locked());
    assert_eq!(l.with_lock(|v| v.clone()), vec![0x20_0000, 0x30_0000]);
}

#[test]
fn get_mut_bypasses_locking() {
    let mut l = SpinLock::new(1_u32);
    *l.get_mut() = 5;
    assert_eq!(*l.lock(), 5);
}

#[test]
fn contended_increments_are_exact_and_exclusive() {
    let threads = 8;
    let iters = 5_000;

    let lock = Arc::new(SpinLock::new(0usize));
    let in_cs = Arc::new(AtomicUsize::new(0));
    let start = Arc::new(Barrier::new(threads));

    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let lock = Arc::clone(&lock);
            let in_cs = Arc::clone(&in_cs);
            let start = Arc::clone(&start);
            thread::spawn(move || {
                start.wait();
                for _ in 0..iters {
                    lock.with_lock(|v| {
                        assert_eq!(in_cs.fetch_add(1, Ordering::SeqCst), 0, "mutual exclusion violated");
                        *v += 1;
                        in_cs.fetch_sub(1, Ordering::SeqCst);
                    });
                    thread::yield_now();
                }
            })
        })
        .collect();

    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(lock.with_lock(|v| *v), threads * iters);
}

#[test]
fn lock_is_released_on_panic() {
    let l = SpinLock::new(0u32);

    let res = panic::catch_unwind(panic::AssertUnwindSafe(|| {
        l.with_lock(|v| {
            *v = 123;
            panic!("boom");
        });
    }));
    assert!(res.is_err(), "expected panic");
    assert!(!l.is_locked());
    assert_eq!(l.with_lock(|v| *v), 123);
}

#[test]
fn spinlock_is_sync_for_send_t() {
    fn takes_sync<S: Sync>(_s: &S) {}
    let l = SpinLock::new(0u8);
    takes_sync(&l);
}
