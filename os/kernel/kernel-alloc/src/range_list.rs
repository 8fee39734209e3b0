//! Sorted list of disjoint address ranges.
//!
//! Tracks the low-memory pools, the non-RAM physical space and the virtual
//! window memory regions are carved from. Adjacent and overlapping ranges
//! are merged on insertion.

use alloc::vec::Vec;
use core::iter;

/// `start..start + length`, in bytes.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Range {
    pub start: u64,
    pub length: u64,
}

impl Range {
    #[must_use]
    pub const fn new(start: u64, length: u64) -> Self {
        Self { start, length }
    }

    #[must_use]
    pub const fn end(&self) -> u64 {
        self.start + self.length
    }

    #[must_use]
    pub const fn contains(&self, start: u64, length: u64) -> bool {
        self.start <= start && start + length <= self.end()
    }
}

#[derive(Clone, Debug, Default)]
pub struct RangeList {
    ranges: Vec<Range>,
}

impl RangeList {
    #[must_use]
    pub const fn new() -> Self {
        Self { ranges: Vec::new() }
    }

    /// Returns `start..start + length` to the list.
    pub fn free(&mut self, start: u64, length: u64) {
        if length == 0 {
            return;
        }

        let mut lo = start;
        let mut hi = start + length;

        // Everything before `first` ends strictly before us and stays apart.
        let first = self.ranges.partition_point(|r| r.end() < lo);
        let mut last = first;
        while last < self.ranges.len() && self.ranges[last].start <= hi {
            lo = lo.min(self.ranges[last].start);
            hi = hi.max(self.ranges[last].end());
            last += 1;
        }

        self.ranges
            .splice(first..last, iter::once(Range::new(lo, hi - lo)));
    }

    /// Takes `length` bytes from the first range large enough (first fit,
    /// lowest address).
    pub fn allocate(&mut self, length: u64) -> Option<u64> {
        let i = self.ranges.iter().position(|r| r.length >= length)?;
        let r = &mut self.ranges[i];
        let start = r.start;
        r.start += length;
        r.length -= length;
        if r.length == 0 {
            self.ranges.remove(i);
        }
        Some(start)
    }

    /// Takes exactly `start..start + length`; `false` if any byte of it is
    /// not in the list.
    pub fn allocate_specific(&mut self, start: u64, length: u64) -> bool {
        if length == 0 {
            return true;
        }
        let Some(i) = self.ranges.iter().position(|r| r.contains(start, length)) else {
            return false;
        };

        let r = self.ranges[i];
        let before = Range::new(r.start, start - r.start);
        let after = Range::new(start + length, r.end() - (start + length));
        let keep = [before, after];
        self.ranges
            .splice(i..=i, keep.into_iter().filter(|p| p.length > 0));
        true
    }

    /// Drops whatever part of `start..start + length` the list holds.
    pub fn remove(&mut self, start: u64, length: u64) {
        let end = start.saturating_add(length);
        if length == 0 {
            return;
        }
        self.ranges = self
            .ranges
            .iter()
            .flat_map(|r| {
                let before = Range::new(r.start, start.clamp(r.start, r.end()) - r.start);
                let after_start = end.clamp(r.start, r.end());
                let after = Range::new(after_start, r.end() - after_start);
                [before, after]
            })
            .filter(|r| r.length > 0)
            .collect();
    }

    #[must_use]
    pub fn contains(&self, start: u64, length: u64) -> bool {
        self.ranges.iter().any(|r| r.contains(start, length))
    }

    /// Total bytes held.
    #[must_use]
    pub fn total(&self) -> u64 {
        self.ranges.iter().map(|r| r.length).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = Range> + '_ {
        self.ranges.iter().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ranges(l: &RangeList) -> Vec<(u64, u64)> {
        l.iter().map(|r| (r.start, r.length)).collect()
    }

    #[test]
    fn free_merges_neighbours() {
        let mut l = RangeList::new();
        l.free(0x3000, 0x1000);
        l.free(0x1000, 0x1000);
        assert_eq!(ranges(&l), vec![(0x1000, 0x1000), (0x3000, 0x1000)]);

        l.free(0x2000, 0x1000);
        assert_eq!(ranges(&l), vec![(0x1000, 0x3000)]);

        // Overlap collapses into the union.
        l.free(0x3800, 0x1000);
        assert_eq!(ranges(&l), vec![(0x1000, 0x3800)]);

        l.free(0x9000, 0);
        assert_eq!(l.total(), 0x3800);
    }

    #[test]
    fn allocate_is_first_fit() {
        let mut l = RangeList::new();
        l.free(0x1000, 0x1000);
        l.free(0x8000, 0x4000);
        assert_eq!(l.allocate(0x2000), Some(0x8000));
        assert_eq!(l.allocate(0x1000), Some(0x1000));
        assert_eq!(ranges(&l), vec![(0xA000, 0x2000)]);
        assert_eq!(l.allocate(0x3000), None);
    }

    #[test]
    fn allocate_specific_splits() {
        let mut l = RangeList::new();
        l.free(0x10_0000, 0x10_0000);
        assert!(l.allocate_specific(0x14_0000, 0x1_0000));
        assert_eq!(ranges(&l), vec![(0x10_0000, 0x4_0000), (0x15_0000, 0xB_0000)]);

        // Already taken, partially or fully.
        assert!(!l.allocate_specific(0x14_0000, 0x1000));
        assert!(!l.allocate_specific(0x13_F000, 0x2000));

        // Exact fit removes the range.
        assert!(l.allocate_specific(0x10_0000, 0x4_0000));
        assert_eq!(ranges(&l), vec![(0x15_0000, 0xB_0000)]);
    }

    #[test]
    fn specific_then_free_restores() {
        let mut l = RangeList::new();
        l.free(0, 0x1_0000_0000);
        assert!(l.allocate_specific(0xFEC0_0000, 0x1000));
        assert!(!l.contains(0xFEC0_0000, 0x1000));
        l.free(0xFEC0_0000, 0x1000);
        assert_eq!(ranges(&l), vec![(0, 0x1_0000_0000)]);
    }

    #[test]
    fn remove_cuts_partial_overlaps() {
        let mut l = RangeList::new();
        l.free(0x1000, 0x3000);
        l.free(0x8000, 0x2000);
        l.remove(0x3000, 0x6000);
        assert_eq!(ranges(&l), vec![(0x1000, 0x2000), (0x9000, 0x1000)]);

        l.remove(0, 0x1_0000);
        assert!(l.is_empty());
    }
}
