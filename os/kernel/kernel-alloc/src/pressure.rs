//! # Memory pressure
//!
//! Subsystems that hold reclaimable memory (caches, pools, mapped files)
//! register a [`MemoryPressureHandler`]. When the number of free frames
//! drops under the high watermark, the frame allocator asks the handlers to
//! give memory back, most important first, and stops at the first one that
//! reports success.
//!
//! The low watermark is advisory: caches compare against it to decide when
//! to trim on their own, before the allocator has to ask.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};
use kernel_info::memory::{DEFAULT_HIGH_WATERMARK, DEFAULT_LOW_WATERMARK};
use kernel_sync::SpinLock;
use log::{debug, info};

/// Order in which handlers are asked to compact.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Priority {
    Highest,
    High,
    Medium,
    Low,
    Lowest,
}

pub trait MemoryPressureHandler: Send + Sync {
    /// Human-readable name for the log.
    fn description(&self) -> &str;

    /// Releases what memory can be released. Returns `true` if any frames
    /// went back to the allocator.
    fn compact(&self) -> bool;
}

pub struct MemoryPressureManager {
    handlers: SpinLock<Vec<(Priority, Arc<dyn MemoryPressureHandler>)>>,
    high_watermark: AtomicUsize,
    low_watermark: AtomicUsize,
}

impl Default for MemoryPressureManager {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryPressureManager {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            handlers: SpinLock::new(Vec::new()),
            high_watermark: AtomicUsize::new(DEFAULT_HIGH_WATERMARK),
            low_watermark: AtomicUsize::new(DEFAULT_LOW_WATERMARK),
        }
    }

    pub fn register(&self, priority: Priority, handler: Arc<dyn MemoryPressureHandler>) {
        debug!("registering memory pressure handler '{}' at {priority:?}", handler.description());
        self.handlers.with_lock(|h| h.push((priority, handler)));
    }

    /// Removes every registration of `handler`. Returns whether one existed.
    pub fn unregister(&self, handler: &Arc<dyn MemoryPressureHandler>) -> bool {
        self.handlers.with_lock(|h| {
            let before = h.len();
            h.retain(|(_, other)| !Arc::ptr_eq(other, handler));
            h.len() != before
        })
    }

    /// Asks handlers to release memory, in priority order and in
    /// registration order within a priority. Returns `true` as soon as one
    /// succeeds, `false` if none did.
    ///
    /// The handler list is not locked while handlers run, so a handler may
    /// free frames or even register further handlers.
    pub fn compact(&self) -> bool {
        let mut snapshot = self.handlers.with_lock(|h| h.clone());
        snapshot.sort_by_key(|(priority, _)| *priority);

        for (priority, handler) in snapshot {
            if handler.compact() {
                info!("memory pressure handler '{}' ({priority:?}) released memory", handler.description());
                return true;
            }
        }
        false
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.with_lock(|h| h.len())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Free frame count under which the allocator triggers a compact.
    #[must_use]
    pub fn high_watermark(&self) -> usize {
        self.high_watermark.load(Ordering::Relaxed)
    }

    /// Free frame count under which caches should start trimming.
    #[must_use]
    pub fn low_watermark(&self) -> usize {
        self.low_watermark.load(Ordering::Relaxed)
    }

    pub fn set_watermarks(&self, high: usize, low: usize) {
        self.high_watermark.store(high, Ordering::Relaxed);
        self.low_watermark.store(low, Ordering::Relaxed);
    }
}
