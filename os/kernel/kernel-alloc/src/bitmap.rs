//! Allocation bitmap for catching double frees in debug builds.
//!
//! One bit per frame, grouped into 64-bit words that are only materialised
//! while they have a bit set, so a sparse physical address space costs
//! nothing for the holes.

use hashbrown::HashMap;
use kernel_memory_addresses::FrameNumber;

#[derive(Default)]
pub struct AllocationBitmap {
    words: HashMap<u64, u64>,
}

const fn locate(frame: FrameNumber) -> (u64, u64) {
    let n = frame.as_u64();
    (n / 64, 1 << (n % 64))
}

impl AllocationBitmap {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks `frame` allocated. Returns `false` if it already was.
    pub fn set(&mut self, frame: FrameNumber) -> bool {
        let (word, mask) = locate(frame);
        let bits = self.words.entry(word).or_insert(0);
        let was_clear = *bits & mask == 0;
        *bits |= mask;
        was_clear
    }

    /// Marks `frame` free. Returns `false` if it was not allocated.
    pub fn clear(&mut self, frame: FrameNumber) -> bool {
        let (word, mask) = locate(frame);
        let Some(bits) = self.words.get_mut(&word) else {
            return false;
        };
        let was_set = *bits & mask != 0;
        *bits &= !mask;
        if *bits == 0 {
            self.words.remove(&word);
        }
        was_set
    }

    /// Number of frames marked allocated.
    #[must_use]
    pub fn count(&self) -> usize {
        self.words.values().map(|w| w.count_ones() as usize).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_twice_is_reported() {
        let mut bitmap = AllocationBitmap::new();
        let frame = FrameNumber::new(130);
        assert!(bitmap.set(frame));
        assert!(!bitmap.set(frame));
        assert_eq!(bitmap.count(), 1);
    }

    #[test]
    fn clear_of_free_frame_is_reported() {
        let mut bitmap = AllocationBitmap::new();
        assert!(!bitmap.clear(FrameNumber::new(7)));
        bitmap.set(FrameNumber::new(7));
        bitmap.set(FrameNumber::new(8));
        assert!(bitmap.clear(FrameNumber::new(7)));
        assert!(!bitmap.clear(FrameNumber::new(7)));
        assert_eq!(bitmap.count(), 1);
        assert!(bitmap.clear(FrameNumber::new(8)));
        assert_eq!(bitmap.count(), 0);
    }
}
