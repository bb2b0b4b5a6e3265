//! Per-pack free-space tracking as an ordered set of coalesced regions.
//!
//! Regions partition `[0, total_tracks)` with no gaps, no zero-length
//! region, and no two adjacent regions sharing the same `allocated` flag.

use mfd_types::TrackId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::trace;

/// A contiguous run of tracks that is either wholly free or wholly allocated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    pub start: TrackId,
    pub count: u64,
    pub allocated: bool,
}

impl Region {
    #[must_use]
    pub fn end(&self) -> u64 {
        self.start.0 + self.count
    }
}

/// Free-space allocator for one physical pack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackAllocator {
    regions: BTreeMap<TrackId, Region>,
}

impl PackAllocator {
    /// Create an allocator whose whole volume is one free region.
    #[must_use]
    pub fn new(total_tracks: u64) -> Self {
        let mut alloc = Self {
            regions: BTreeMap::new(),
        };
        alloc.initialize(total_tracks);
        alloc
    }

    /// Reset to a single free region covering `total_tracks`.
    pub fn initialize(&mut self, total_tracks: u64) {
        self.regions.clear();
        if total_tracks > 0 {
            self.regions.insert(
                TrackId::ZERO,
                Region {
                    start: TrackId::ZERO,
                    count: total_tracks,
                    allocated: false,
                },
            );
        }
    }

    /// A free region of exactly `count` tracks, if one exists.
    #[must_use]
    pub fn find_unallocated_region(&self, count: u64) -> Option<TrackId> {
        self.free_regions()
            .find(|r| r.count == count)
            .map(|r| r.start)
    }

    /// The first free region (in track order) of at least `count` tracks.
    #[must_use]
    pub fn find_larger_unallocated_region(&self, count: u64) -> Option<TrackId> {
        self.free_regions()
            .find(|r| r.count >= count)
            .map(|r| r.start)
    }

    /// The biggest free region; the lowest-addressed one wins ties.
    #[must_use]
    pub fn find_largest_unallocated_region(&self) -> Option<(TrackId, u64)> {
        self.free_regions()
            .fold(None, |best: Option<&Region>, r| match best {
                Some(b) if b.count >= r.count => Some(b),
                _ => Some(r),
            })
            .map(|r| (r.start, r.count))
    }

    /// Mark `[start, start+count)` allocated.
    ///
    /// Returns `false` (and changes nothing) unless the span lies entirely
    /// within one free region.
    #[must_use]
    pub fn allocate(&mut self, start: TrackId, count: u64) -> bool {
        self.modify_area(start, count, true)
    }

    /// Mark `[start, start+count)` free.
    ///
    /// Returns `false` (and changes nothing) unless the span lies entirely
    /// within one allocated region.
    #[must_use]
    pub fn release(&mut self, start: TrackId, count: u64) -> bool {
        self.modify_area(start, count, false)
    }

    fn modify_area(&mut self, start: TrackId, count: u64, allocated: bool) -> bool {
        if count == 0 {
            return false;
        }
        let Some(end) = start.0.checked_add(count) else {
            return false;
        };
        let Some(container) = self
            .regions
            .range(..=start)
            .next_back()
            .map(|(_, r)| *r)
        else {
            return false;
        };
        if container.allocated == allocated || end > container.end() {
            return false;
        }

        self.regions.remove(&container.start);
        if start > container.start {
            self.insert(container.start, start.0 - container.start.0, container.allocated);
        }
        if end < container.end() {
            self.insert(TrackId(end), container.end() - end, container.allocated);
        }

        // Coalesce the target span with neighbours that now share its flag.
        let mut merged_start = start;
        let mut merged_count = count;
        if let Some(left) = self
            .regions
            .range(..start)
            .next_back()
            .map(|(_, r)| *r)
            .filter(|r| r.end() == start.0 && r.allocated == allocated)
        {
            self.regions.remove(&left.start);
            merged_start = left.start;
            merged_count += left.count;
        }
        if let Some(right) = self
            .regions
            .get(&TrackId(end))
            .copied()
            .filter(|r| r.allocated == allocated)
        {
            self.regions.remove(&right.start);
            merged_count += right.count;
        }
        self.insert(merged_start, merged_count, allocated);

        trace!(
            start = start.0,
            count,
            allocated,
            regions = self.regions.len(),
            "pack_modify_area"
        );
        true
    }

    fn insert(&mut self, start: TrackId, count: u64, allocated: bool) {
        self.regions.insert(
            start,
            Region {
                start,
                count,
                allocated,
            },
        );
    }

    /// Total tracks tracked: end of the last region.
    #[must_use]
    pub fn track_count(&self) -> u64 {
        self.regions.values().next_back().map_or(0, Region::end)
    }

    #[must_use]
    pub fn free_track_count(&self) -> u64 {
        self.free_regions().map(|r| r.count).sum()
    }

    /// Whether the whole span `[start, start+count)` is allocated.
    #[must_use]
    pub fn is_allocated(&self, start: TrackId, count: u64) -> bool {
        let Some(end) = start.0.checked_add(count) else {
            return false;
        };
        self.regions
            .range(..=start)
            .next_back()
            .is_some_and(|(_, r)| r.allocated && end <= r.end())
    }

    /// Regions in track order.
    pub fn regions(&self) -> impl Iterator<Item = &Region> {
        self.regions.values()
    }

    fn free_regions(&self) -> impl Iterator<Item = &Region> {
        self.regions.values().filter(|r| !r.allocated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn assert_partition(alloc: &PackAllocator, total: u64) {
        let mut expected_start = 0_u64;
        let mut prev_flag: Option<bool> = None;
        for r in alloc.regions() {
            assert_eq!(r.start.0, expected_start, "gap or overlap at {}", r.start);
            assert!(r.count > 0, "zero-length region at {}", r.start);
            assert_ne!(prev_flag, Some(r.allocated), "uncoalesced at {}", r.start);
            prev_flag = Some(r.allocated);
            expected_start = r.end();
        }
        assert_eq!(expected_start, total);
        assert_eq!(alloc.track_count(), total);
    }

    fn snapshot(alloc: &PackAllocator) -> Vec<Region> {
        alloc.regions().copied().collect()
    }

    #[test]
    fn initialize_is_one_free_region() {
        let alloc = PackAllocator::new(1000);
        assert_eq!(
            snapshot(&alloc),
            vec![Region {
                start: TrackId(0),
                count: 1000,
                allocated: false
            }]
        );
        assert_eq!(alloc.free_track_count(), 1000);
    }

    #[test]
    fn non_contiguous_free_regions_stay_separate() {
        let mut alloc = PackAllocator::new(100);
        assert!(alloc.allocate(TrackId(10), 10));
        assert!(alloc.allocate(TrackId(30), 10));
        assert_partition(&alloc, 100);

        let free: Vec<(u64, u64)> = alloc
            .regions()
            .filter(|r| !r.allocated)
            .map(|r| (r.start.0, r.count))
            .collect();
        assert_eq!(free, vec![(0, 10), (20, 10), (40, 60)]);
        assert_eq!(
            alloc.find_largest_unallocated_region(),
            Some((TrackId(40), 60))
        );
    }

    #[test]
    fn exact_and_larger_fit() {
        let mut alloc = PackAllocator::new(100);
        assert!(alloc.allocate(TrackId(10), 10));
        assert!(alloc.allocate(TrackId(30), 10));
        // Free: [0,10) [20,30) [40,100)
        assert_eq!(alloc.find_unallocated_region(10), Some(TrackId(0)));
        assert_eq!(alloc.find_unallocated_region(60), Some(TrackId(40)));
        assert_eq!(alloc.find_unallocated_region(11), None);
        assert_eq!(alloc.find_larger_unallocated_region(11), Some(TrackId(40)));
        assert_eq!(alloc.find_larger_unallocated_region(5), Some(TrackId(0)));
        assert_eq!(alloc.find_larger_unallocated_region(61), None);
    }

    #[test]
    fn largest_prefers_lowest_on_tie() {
        let mut alloc = PackAllocator::new(30);
        assert!(alloc.allocate(TrackId(10), 10));
        assert_eq!(
            alloc.find_largest_unallocated_region(),
            Some((TrackId(0), 10))
        );
    }

    #[test]
    fn release_merges_both_sides() {
        let mut alloc = PackAllocator::new(100);
        assert!(alloc.allocate(TrackId(0), 100));
        assert!(alloc.release(TrackId(10), 10));
        assert!(alloc.release(TrackId(30), 10));
        assert!(alloc.release(TrackId(20), 10));
        assert_partition(&alloc, 100);
        let free: Vec<(u64, u64)> = alloc
            .regions()
            .filter(|r| !r.allocated)
            .map(|r| (r.start.0, r.count))
            .collect();
        assert_eq!(free, vec![(10, 30)]);
    }

    #[test]
    fn rejects_spans_crossing_region_boundaries() {
        let mut alloc = PackAllocator::new(100);
        assert!(alloc.allocate(TrackId(10), 10));
        let before = snapshot(&alloc);

        // Already allocated.
        assert!(!alloc.allocate(TrackId(12), 2));
        // Crosses free -> allocated boundary.
        assert!(!alloc.allocate(TrackId(5), 10));
        // Releasing free space.
        assert!(!alloc.release(TrackId(30), 5));
        // Release crossing allocated -> free boundary.
        assert!(!alloc.release(TrackId(15), 10));
        // Zero length and past the end.
        assert!(!alloc.allocate(TrackId(40), 0));
        assert!(!alloc.allocate(TrackId(95), 10));
        assert!(!alloc.allocate(TrackId(200), 1));

        assert_eq!(snapshot(&alloc), before);
    }

    #[test]
    fn is_allocated_checks_whole_span() {
        let mut alloc = PackAllocator::new(100);
        assert!(alloc.allocate(TrackId(10), 10));
        assert!(alloc.is_allocated(TrackId(10), 10));
        assert!(alloc.is_allocated(TrackId(15), 2));
        assert!(!alloc.is_allocated(TrackId(15), 10));
        assert!(!alloc.is_allocated(TrackId(0), 1));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn operation_sequences_preserve_partition(
            ops in proptest::collection::vec((any::<bool>(), 0_u64..256, 1_u64..40), 1..120),
        ) {
            let total = 256_u64;
            let mut alloc = PackAllocator::new(total);
            let mut model = vec![false; 256];

            for (allocate, start, count) in ops {
                let end = (start + count).min(total);
                let span = &model[start as usize..end as usize];
                let applicable = end == start + count
                    && span.iter().all(|&bit| bit != allocate);
                let ok = if allocate {
                    alloc.allocate(TrackId(start), count)
                } else {
                    alloc.release(TrackId(start), count)
                };
                // A span of uniform opposite state always lies within one
                // region, since regions are coalesced.
                prop_assert_eq!(ok, applicable);
                if ok {
                    for bit in &mut model[start as usize..end as usize] {
                        *bit = allocate;
                    }
                }
                assert_partition(&alloc, total);
            }

            let free = model.iter().filter(|b| !**b).count() as u64;
            prop_assert_eq!(alloc.free_track_count(), free);
        }

        #[test]
        fn allocate_then_release_restores_regions(
            prefix in proptest::collection::vec((0_u64..128, 1_u64..16), 0..20),
            start in 0_u64..128,
            count in 1_u64..32,
        ) {
            let mut alloc = PackAllocator::new(128);
            for (s, c) in prefix {
                let _ = alloc.allocate(TrackId(s), c);
            }
            let before = snapshot(&alloc);
            if alloc.allocate(TrackId(start), count) {
                prop_assert!(alloc.release(TrackId(start), count));
            }
            prop_assert_eq!(snapshot(&alloc), before);
        }
    }
}
