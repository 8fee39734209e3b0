use crate::RawSpin;
use core::{
    cell::UnsafeCell,
    ops::Deref,
    sync::atomic::{AtomicUsize, Ordering},
};

const NO_OWNER: usize = usize::MAX;

/// Spin lock that the owning CPU may acquire again while already holding it.
///
/// Ownership is tracked by CPU id, obtained from the function passed to
/// [`new`](Self::new). Other CPUs spin until the outermost guard of the
/// owner is dropped.
///
/// Because several guards of the owning CPU can be alive at once, a guard
/// only hands out `&T`. Wrap mutable state in a `RefCell` and keep borrows
/// short: a nested acquisition on the same CPU sees the same `RefCell`.
pub struct ReentrantSpinLock<T> {
    raw: RawSpin,
    owner: AtomicUsize,
    /// Nesting depth; only touched by the owner.
    depth: AtomicUsize,
    current_cpu: fn() -> usize,
    inner: UnsafeCell<T>,
}

// Safety: only the owning CPU reaches `inner`, one CPU at a time.
unsafe impl<T: Send> Sync for ReentrantSpinLock<T> {}

impl<T> ReentrantSpinLock<T> {
    /// `current_cpu` must return a stable id per CPU (or thread, in tests)
    /// that is never `usize::MAX`.
    pub const fn new(inner: T, current_cpu: fn() -> usize) -> Self {
        Self {
            raw: RawSpin::new(),
            owner: AtomicUsize::new(NO_OWNER),
            depth: AtomicUsize::new(0),
            current_cpu,
            inner: UnsafeCell::new(inner),
        }
    }

    pub fn lock(&self) -> ReentrantSpinLockGuard<'_, T> {
        let cpu = (self.current_cpu)();
        debug_assert_ne!(cpu, NO_OWNER, "invalid cpu id");

        // Only this CPU can have stored its own id, so a relaxed load suffices.
        if self.owner.load(Ordering::Relaxed) == cpu {
            self.depth.fetch_add(1, Ordering::Relaxed);
        } else {
            self.raw.lock();
            self.owner.store(cpu, Ordering::Relaxed);
            self.depth.store(1, Ordering::Relaxed);
        }
        ReentrantSpinLockGuard { lock: self }
    }

    pub fn try_lock(&self) -> Option<ReentrantSpinLockGuard<'_, T>> {
        let cpu = (self.current_cpu)();
        if self.owner.load(Ordering::Relaxed) == cpu {
            self.depth.fetch_add(1, Ordering::Relaxed);
            return Some(ReentrantSpinLockGuard { lock: self });
        }
        if !self.raw.try_lock() {
            return None;
        }
        self.owner.store(cpu, Ordering::Relaxed);
        self.depth.store(1, Ordering::Relaxed);
        Some(ReentrantSpinLockGuard { lock: self })
    }

    /// Whether the calling CPU currently holds the lock.
    pub fn is_held_by_current_cpu(&self) -> bool {
        self.owner.load(Ordering::Relaxed) == (self.current_cpu)()
    }

    pub fn with_lock<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        let g = self.lock();
        f(&g)
    }

    #[inline]
    pub const fn get_mut(&mut self) -> &mut T {
        self.inner.get_mut()
    }
}

pub struct ReentrantSpinLockGuard<'a, T> {
    lock: &'a ReentrantSpinLock<T>,
}

impl<T> ReentrantSpinLockGuard<'_, T> {
    /// Nesting depth of the owning CPU, including this guard.
    pub fn depth(&self) -> usize {
        self.lock.depth.load(Ordering::Relaxed)
    }
}

impl<T> Deref for ReentrantSpinLockGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        // SAFETY: only the owning CPU holds guards; shared access only.
        unsafe { &*self.lock.inner.get() }
    }
}

impl<T> Drop for ReentrantSpinLockGuard<'_, T> {
    fn drop(&mut self) {
        if self.lock.depth.fetch_sub(1, Ordering::Relaxed) == 1 {
            self.lock.owner.store(NO_OWNER, Ordering::Relaxed);
            // SAFETY: the outermost guard of the owner releases the lock.
            unsafe { self.lock.raw.unlock() }
        }
    }
}
