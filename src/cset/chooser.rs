use std::cmp::Ordering as CmpOrdering;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use itertools::Itertools;

use super::claimer::HeapRegionClaimer;
use super::par_updater::CSetChooserParUpdater;
use super::region::HeapRegion;
use crate::util::conversions::align_up_to;
use crate::util::options::Options;

/// Slot value of an empty entry in the candidate array.
const EMPTY_SLOT: u32 = u32::MAX;

/// Keeps the old regions that are candidates for mixed collections, ordered by the
/// number of bytes evacuating them would reclaim, most profitable first.
///
/// The candidates are added either serially with [`CollectionSetChooser::add_region`] or by
/// parallel workers, each of which claims a chunk of the candidate array and fills it
/// through a [`CSetChooserParUpdater`]. After [`CollectionSetChooser::sort_regions`] the
/// candidates are consumed from the front with [`CollectionSetChooser::pop`].
///
/// The chooser borrows the heap's region table and stores region indices into it.
pub struct CollectionSetChooser<'h, R: HeapRegion> {
    heap: &'h [R],
    /// Candidate array. The active candidates are in `[front, end)`; all other slots are
    /// empty after sorting.
    regions: Vec<AtomicU32>,
    /// Index of the next candidate to pop.
    front: usize,
    /// One past the last valid candidate. Updated atomically by parallel workers.
    end: AtomicUsize,
    /// Claim cursor of the parallel workers.
    first_par_unreserved_idx: AtomicUsize,
    /// Regions with at least this many live bytes are not worth evacuating.
    region_live_threshold_bytes: usize,
    /// Sum of the reclaimable bytes of the candidates in `[front, end)`.
    remaining_reclaimable_bytes: AtomicUsize,
    verify: bool,
}

impl<'h, R: HeapRegion> CollectionSetChooser<'h, R> {
    pub fn new(heap: &'h [R], options: &Options) -> Self {
        debug_assert!(heap
            .iter()
            .enumerate()
            .all(|(i, r)| r.hrm_index() as usize == i));
        CollectionSetChooser {
            heap,
            regions: vec![],
            front: 0,
            end: AtomicUsize::new(0),
            first_par_unreserved_idx: AtomicUsize::new(0),
            region_live_threshold_bytes: Self::mixed_gc_live_threshold_bytes(
                options.region_bytes,
                options.mixed_gc_live_threshold_percent,
            ),
            remaining_reclaimable_bytes: AtomicUsize::new(0),
            verify: options.verify_metaspace,
        }
    }

    /// The live-bytes threshold above which a region is too full to be a candidate.
    pub fn mixed_gc_live_threshold_bytes(region_bytes: usize, percent: usize) -> usize {
        region_bytes * percent / 100
    }

    pub fn region_live_threshold_bytes(&self) -> usize {
        self.region_live_threshold_bytes
    }

    pub fn region_occupancy_low_enough_for_evac(&self, live_bytes: usize) -> bool {
        live_bytes < self.region_live_threshold_bytes
    }

    /// Whether a region should become a candidate: an old region that is not pinned, has
    /// few enough live bytes and a complete remembered set.
    pub fn should_add(&self, r: &R) -> bool {
        r.is_old()
            && !r.is_young()
            && !r.is_humongous()
            && !r.is_free()
            && !r.is_pinned()
            && self.region_occupancy_low_enough_for_evac(r.live_bytes())
            && r.rem_set_is_complete()
    }

    fn region_for_slot(&self, slot: u32) -> Option<&'h R> {
        if slot == EMPTY_SLOT {
            None
        } else {
            let heap: &'h [R] = self.heap;
            Some(&heap[slot as usize])
        }
    }

    fn regions_at(&self, i: usize) -> Option<&'h R> {
        self.region_for_slot(self.regions[i].load(Ordering::Relaxed))
    }

    fn regions_at_put(&self, i: usize, r: Option<&R>) {
        let slot = r.map_or(EMPTY_SLOT, |r| r.hrm_index());
        self.regions[i].store(slot, Ordering::Relaxed);
    }

    fn end(&self) -> usize {
        self.end.load(Ordering::Relaxed)
    }

    /// The number of filled slots, counting candidates that were already taken from the front.
    pub fn length(&self) -> usize {
        self.end()
    }

    /// The number of slots in the candidate array, including ones not filled yet.
    pub fn capacity(&self) -> usize {
        self.regions.len()
    }

    pub fn remaining_regions(&self) -> usize {
        let end = self.end();
        debug_assert!(self.front <= end);
        end - self.front
    }

    pub fn is_empty(&self) -> bool {
        self.remaining_regions() == 0
    }

    pub fn remaining_reclaimable_bytes(&self) -> usize {
        self.remaining_reclaimable_bytes.load(Ordering::Relaxed)
    }

    /// The next candidate, without removing it.
    pub fn peek(&self) -> Option<&'h R> {
        if self.front < self.end() {
            let r = self.regions_at(self.front);
            assert!(r.is_some(), "Unexpected empty slot at index {}", self.front);
            r
        } else {
            None
        }
    }

    /// Remove and return the next candidate.
    pub fn pop(&mut self) -> Option<&'h R> {
        if self.front >= self.end() {
            return None;
        }
        let Some(r) = self.regions_at(self.front) else {
            panic!("Unexpected empty slot at index {}", self.front);
        };
        let remaining = self.remaining_reclaimable_bytes.get_mut();
        assert!(
            r.reclaimable_bytes() <= *remaining,
            "Remaining reclaimable bytes inconsistent from region: {} remaining: {}",
            r.reclaimable_bytes(),
            *remaining
        );
        *remaining -= r.reclaimable_bytes();
        self.regions_at_put(self.front, None);
        self.front += 1;
        Some(r)
    }

    /// Put back the region most recently popped.
    pub fn push(&mut self, r: &'h R) {
        assert!(self.front >= 1, "Too many regions have been put back");
        self.front -= 1;
        assert!(
            self.regions_at(self.front).is_none(),
            "Slot {} is not empty",
            self.front
        );
        self.regions_at_put(self.front, Some(r));
        *self.remaining_reclaimable_bytes.get_mut() += r.reclaimable_bytes();
    }

    /// Append a candidate. Used when the candidates are collected by a single thread.
    pub fn add_region(&mut self, r: &'h R) {
        assert!(
            !r.is_pinned(),
            "Pinned region shouldn't be added to the collection set (index {})",
            r.hrm_index()
        );
        assert!(r.is_old(), "should be old but is {}", r.get_type_str());
        assert!(
            r.rem_set_is_complete(),
            "Trying to add region {} to the collection set with incomplete remembered set",
            r.hrm_index()
        );
        debug_assert_eq!(*self.end.get_mut(), self.regions.len());
        self.regions.push(AtomicU32::new(r.hrm_index()));
        *self.end.get_mut() += 1;
        *self.remaining_reclaimable_bytes.get_mut() += r.reclaimable_bytes();
    }

    /// Call `f` on each remaining candidate in order until it returns true. Returns false
    /// if the iteration was aborted.
    pub fn iterate(&self, mut f: impl FnMut(&'h R) -> bool) -> bool {
        for i in self.front..self.end() {
            if let Some(r) = self.regions_at(i) {
                if f(r) {
                    return false;
                }
            }
        }
        true
    }

    pub fn clear(&mut self) {
        self.regions.clear();
        self.front = 0;
        *self.end.get_mut() = 0;
        *self.first_par_unreserved_idx.get_mut() = 0;
        *self.remaining_reclaimable_bytes.get_mut() = 0;
    }

    // Most reclaimable bytes first, empty slots last.
    fn order_regions(r1: Option<&R>, r2: Option<&R>) -> CmpOrdering {
        match (r1, r2) {
            (None, None) => CmpOrdering::Equal,
            (None, Some(_)) => CmpOrdering::Greater,
            (Some(_), None) => CmpOrdering::Less,
            (Some(r1), Some(r2)) => r2.reclaimable_bytes().cmp(&r1.reclaimable_bytes()),
        }
    }

    /// Sort the candidates, trimming the unused tail left by parallel workers.
    pub fn sort_regions(&mut self) {
        let mut slots: Vec<u32> = self.regions.drain(..).map(AtomicU32::into_inner).collect();
        let first_par_unreserved_idx = *self.first_par_unreserved_idx.get_mut();
        if first_par_unreserved_idx > 0 {
            assert!(
                first_par_unreserved_idx <= slots.len(),
                "Not enough chunk space was reserved"
            );
            slots.truncate(first_par_unreserved_idx);
        }
        slots.sort_by(|a, b| {
            Self::order_regions(self.region_for_slot(*a), self.region_for_slot(*b))
        });
        let end = *self.end.get_mut();
        assert!(end <= slots.len(), "end {} beyond {} slots", end, slots.len());
        assert!(
            slots[..end].iter().all(|slot| *slot != EMPTY_SLOT),
            "Should be true by sorting!"
        );
        slots.truncate(end);
        self.regions = slots.into_iter().map(AtomicU32::new).collect();

        if log_enabled!(log::Level::Trace) {
            self.print_liveness_info("Post-Sorting");
        }
        if self.verify {
            self.verify();
        }
    }

    fn print_liveness_info(&self, phase: &str) {
        trace!("### {}", phase);
        trace!(
            "### {:>6} {:>8} {:>14} {:>14}",
            "type",
            "index",
            "live",
            "reclaimable"
        );
        for i in self.front..self.end() {
            if let Some(r) = self.regions_at(i) {
                trace!(
                    "### {:>6} {:>8} {:>14} {:>14}",
                    r.get_type_str(),
                    r.hrm_index(),
                    r.live_bytes(),
                    r.reclaimable_bytes()
                );
            }
        }
    }

    /// Check that the slots before `front` are empty, the remaining candidates are sorted
    /// and their reclaimable bytes add up. Panics on any inconsistency.
    pub fn verify(&self) {
        let end = self.end();
        assert!(
            end <= self.capacity(),
            "_end: {} regions capacity: {}",
            end,
            self.capacity()
        );
        assert!(self.front <= end, "_front: {} _end: {}", self.front, end);
        for i in 0..self.front {
            assert!(
                self.regions_at(i).is_none(),
                "all entries before _front should be empty"
            );
        }
        let active: Vec<&R> = (self.front..end)
            .map(|i| match self.regions_at(i) {
                Some(r) => r,
                None => panic!("Regions in the active range cannot be empty (index {})", i),
            })
            .collect();
        for r in active.iter() {
            assert!(!r.is_young(), "should not be young!");
            assert!(!r.is_pinned(), "should not be pinned!");
        }
        for (prev, curr) in active.iter().tuple_windows() {
            assert!(
                Self::order_regions(Some(*prev), Some(*curr)) != CmpOrdering::Greater,
                "Candidates out of order: prev {} reclaimable {} curr {} reclaimable {}",
                prev.hrm_index(),
                prev.reclaimable_bytes(),
                curr.hrm_index(),
                curr.reclaimable_bytes()
            );
        }
        let sum: usize = active.iter().map(|r| r.reclaimable_bytes()).sum();
        assert_eq!(
            sum,
            self.remaining_reclaimable_bytes(),
            "reclaimable bytes inconsistent, remaining: {} sum: {}",
            self.remaining_reclaimable_bytes(),
            sum
        );
    }

    /// Chunk size for parallel population: each worker should get several chunks, but
    /// never chunks smaller than an equal share.
    pub fn calculate_parallel_work_chunk_size(&self, n_workers: usize, n_regions: usize) -> usize {
        assert!(n_workers > 0, "Active gc workers should be greater than 0");
        const OVERPARTITION_FACTOR: usize = 4;
        let min_chunk_size = (n_regions / n_workers).max(1);
        (n_regions / (n_workers * OVERPARTITION_FACTOR)).max(min_chunk_size)
    }

    /// Grow the candidate array so that `n_threads` workers can each waste up to one chunk,
    /// and reset the claim cursor.
    pub fn prepare_for_par_region_addition(
        &mut self,
        n_threads: usize,
        n_regions: usize,
        chunk_size: usize,
    ) {
        assert!(chunk_size > 0);
        *self.first_par_unreserved_idx.get_mut() = 0;
        let max_waste = n_threads * chunk_size;
        let aligned_n_regions = align_up_to(n_regions, chunk_size);
        let new_len = aligned_n_regions + max_waste;
        if self.regions.len() < new_len {
            self.regions
                .resize_with(new_len, || AtomicU32::new(EMPTY_SLOT));
        }
    }

    /// Reserve `chunk_size` consecutive slots. Returns the index of the first one.
    pub fn claim_array_chunk(&self, chunk_size: usize) -> usize {
        let res = self
            .first_par_unreserved_idx
            .fetch_add(chunk_size, Ordering::Relaxed);
        assert!(
            self.regions.len() >= res + chunk_size,
            "Should already have been expanded"
        );
        res
    }

    /// Fill a claimed slot.
    pub fn set_region(&self, index: usize, r: &'h R) {
        assert!(r.is_old(), "should be old but is {}", r.get_type_str());
        let prev = self.regions[index].compare_exchange(
            EMPTY_SLOT,
            r.hrm_index(),
            Ordering::Relaxed,
            Ordering::Relaxed,
        );
        assert!(prev.is_ok(), "Slot {} is already taken", index);
    }

    /// Account for the regions a worker has added to its claimed slots.
    pub fn update_totals(&self, region_num: usize, reclaimable_bytes: usize) {
        if region_num > 0 {
            self.end.fetch_add(region_num, Ordering::Relaxed);
            self.remaining_reclaimable_bytes
                .fetch_add(reclaimable_bytes, Ordering::Relaxed);
        } else {
            assert_eq!(reclaimable_bytes, 0, "No regions but reclaimable bytes");
        }
    }

    /// Recollect the candidates among the first `n_regions` regions of the heap with
    /// `n_workers` parallel workers, then sort them.
    pub fn rebuild(&mut self, n_workers: usize, n_regions: usize) {
        assert!(n_regions <= self.heap.len(), "Only {} regions in the heap", self.heap.len());
        self.clear();
        let chunk_size = self.calculate_parallel_work_chunk_size(n_workers, n_regions);
        self.prepare_for_par_region_addition(n_workers, n_regions, chunk_size);

        let claimer = HeapRegionClaimer::new(n_workers, n_regions);
        let chooser: &Self = self;
        crossbeam::scope(|s| {
            for worker_id in 0..n_workers {
                let claimer = &claimer;
                s.spawn(move |_| chooser.par_known_garbage_work(claimer, worker_id, chunk_size));
            }
        })
        .unwrap_or_else(|e| std::panic::resume_unwind(e));

        self.sort_regions();
        info!(
            "Rebuilt collection set candidates: {} of {} regions, {} reclaimable bytes",
            self.remaining_regions(),
            n_regions,
            self.remaining_reclaimable_bytes()
        );
    }

    fn par_known_garbage_work(&self, claimer: &HeapRegionClaimer, worker_id: usize, chunk_size: usize) {
        let heap: &'h [R] = self.heap;
        let mut updater = CSetChooserParUpdater::new(self, chunk_size);
        claimer.par_iterate_from_worker_offset(worker_id, |index| {
            let r = &heap[index];
            // Old regions still used for allocation are considered once they are full.
            if updater.should_add(r) && !r.is_old_gc_alloc_region() {
                updater.add_region(r);
            }
            false
        });
        trace!(
            "Worker {} added {} candidates",
            worker_id,
            updater.regions_added()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::test_util::{chooser_options, MockRegion};

    fn r1_r2_r3() -> Vec<MockRegion> {
        vec![
            MockRegion::old(0, 100, 500),
            MockRegion::old(1, 100, 1500),
            MockRegion::old(2, 100, 900).pinned(),
        ]
    }

    fn serial_build<'h>(
        heap: &'h [MockRegion],
        options: &Options,
    ) -> CollectionSetChooser<'h, MockRegion> {
        let mut chooser = CollectionSetChooser::new(heap, options);
        for r in heap.iter() {
            if chooser.should_add(r) {
                chooser.add_region(r);
            }
        }
        chooser.sort_regions();
        chooser
    }

    #[test]
    fn test_pinned_region_is_excluded_and_order_is_by_reclaimable() {
        let heap = r1_r2_r3();
        let options = chooser_options();
        let mut chooser = CollectionSetChooser::new(&heap, &options);
        for r in heap.iter() {
            if chooser.should_add(r) {
                chooser.add_region(r);
            }
        }
        assert_eq!(chooser.remaining_regions(), 2);
        assert_eq!(chooser.remaining_reclaimable_bytes(), 2000);
        chooser.sort_regions();

        assert_eq!(chooser.peek().map(|r| r.hrm_index()), Some(1));
        assert_eq!(chooser.pop().map(|r| r.hrm_index()), Some(1));
        assert_eq!(chooser.remaining_reclaimable_bytes(), 500);
        assert_eq!(chooser.pop().map(|r| r.hrm_index()), Some(0));
        assert_eq!(chooser.remaining_reclaimable_bytes(), 0);
        assert!(chooser.is_empty());
        assert!(chooser.pop().is_none());
        assert!(chooser.peek().is_none());
        chooser.verify();
    }

    #[test]
    fn test_should_add() {
        let options = chooser_options();
        let threshold = CollectionSetChooser::<MockRegion>::mixed_gc_live_threshold_bytes(
            options.region_bytes,
            options.mixed_gc_live_threshold_percent,
        );
        let heap = vec![
            MockRegion::old(0, threshold - 1, 10),
            MockRegion::old(1, threshold, 10),
            MockRegion::old(2, 0, 10).young(),
            MockRegion::old(3, 0, 10).humongous(),
            MockRegion::old(4, 0, 10).free(),
            MockRegion::old(5, 0, 10).incomplete_rem_set(),
            MockRegion::old(6, 0, 10).pinned(),
        ];
        let chooser = CollectionSetChooser::new(&heap, &options);
        let added: Vec<bool> = heap.iter().map(|r| chooser.should_add(r)).collect();
        assert_eq!(added, vec![true, false, false, false, false, false, false]);
    }

    #[test]
    fn test_threshold() {
        assert_eq!(
            CollectionSetChooser::<MockRegion>::mixed_gc_live_threshold_bytes(1 << 20, 85),
            891_289
        );
    }

    #[test]
    fn test_push_back() {
        let heap = r1_r2_r3();
        let options = chooser_options();
        let mut chooser = serial_build(&heap, &options);
        let r = chooser.pop().unwrap();
        assert_eq!(chooser.remaining_regions(), 1);
        chooser.push(r);
        assert_eq!(chooser.remaining_regions(), 2);
        assert_eq!(chooser.remaining_reclaimable_bytes(), 2000);
        assert_eq!(chooser.peek().map(|r| r.hrm_index()), Some(1));
        chooser.verify();
    }

    #[test]
    #[should_panic(expected = "Too many regions have been put back")]
    fn test_push_without_pop() {
        let heap = r1_r2_r3();
        let options = chooser_options();
        let mut chooser = serial_build(&heap, &options);
        chooser.push(&heap[0]);
    }

    #[test]
    fn test_stable_sort_keeps_insertion_order_for_ties() {
        let heap = vec![
            MockRegion::old(0, 0, 300),
            MockRegion::old(1, 0, 700),
            MockRegion::old(2, 0, 300),
            MockRegion::old(3, 0, 700),
        ];
        let options = chooser_options();
        let mut chooser = serial_build(&heap, &options);
        let order: Vec<u32> = std::iter::from_fn(|| chooser.pop())
            .map(|r| r.hrm_index())
            .collect();
        assert_eq!(order, vec![1, 3, 0, 2]);
    }

    #[test]
    fn test_iterate_can_abort() {
        let heap = r1_r2_r3();
        let options = chooser_options();
        let chooser = serial_build(&heap, &options);
        let mut seen = vec![];
        let complete = chooser.iterate(|r| {
            seen.push(r.hrm_index());
            false
        });
        assert!(complete);
        assert_eq!(seen, vec![1, 0]);
        let mut count = 0;
        assert!(!chooser.iterate(|_| {
            count += 1;
            true
        }));
        assert_eq!(count, 1);
    }

    #[test]
    fn test_clear() {
        let heap = r1_r2_r3();
        let options = chooser_options();
        let mut chooser = serial_build(&heap, &options);
        chooser.clear();
        assert!(chooser.is_empty());
        assert_eq!(chooser.length(), 0);
        assert_eq!(chooser.remaining_reclaimable_bytes(), 0);
        chooser.verify();
    }

    #[test]
    fn test_chunk_size() {
        let heap: Vec<MockRegion> = vec![];
        let options = chooser_options();
        let chooser = CollectionSetChooser::new(&heap, &options);
        assert_eq!(chooser.calculate_parallel_work_chunk_size(4, 100), 25);
        assert_eq!(chooser.calculate_parallel_work_chunk_size(8, 3), 1);
        assert_eq!(chooser.calculate_parallel_work_chunk_size(1, 0), 1);
    }

    #[test]
    fn test_claims_are_disjoint_and_increasing() {
        let heap: Vec<MockRegion> = vec![];
        let options = chooser_options();
        let mut chooser = CollectionSetChooser::new(&heap, &options);
        chooser.prepare_for_par_region_addition(2, 10, 3);
        assert_eq!(chooser.capacity(), 12 + 6);
        assert_eq!(chooser.length(), 0);
        let claims: Vec<usize> = (0..6).map(|_| chooser.claim_array_chunk(3)).collect();
        assert_eq!(claims, vec![0, 3, 6, 9, 12, 15]);
    }

    #[test]
    fn test_parallel_population_via_updaters() {
        let heap: Vec<MockRegion> = (0..10)
            .map(|i| MockRegion::old(i, 0, 100 + i as usize))
            .collect();
        let options = chooser_options();
        let mut chooser = CollectionSetChooser::new(&heap, &options);
        chooser.prepare_for_par_region_addition(2, heap.len(), 3);
        {
            let mut even = CSetChooserParUpdater::new(&chooser, 3);
            let mut odd = CSetChooserParUpdater::new(&chooser, 3);
            for r in heap.iter() {
                if r.hrm_index() % 2 == 0 {
                    even.add_region(r);
                } else {
                    odd.add_region(r);
                }
            }
        }
        assert_eq!(chooser.remaining_regions(), 10);
        chooser.sort_regions();
        let order: Vec<u32> = std::iter::from_fn(|| chooser.pop())
            .map(|r| r.hrm_index())
            .collect();
        assert_eq!(order, (0..10).rev().collect::<Vec<u32>>());
    }

    #[test]
    fn test_rebuild_skips_alloc_regions() {
        let heap = vec![
            MockRegion::old(0, 0, 100),
            MockRegion::old(1, 0, 200).old_gc_alloc(),
            MockRegion::old(2, 0, 300),
        ];
        let options = chooser_options();
        let mut chooser = CollectionSetChooser::new(&heap, &options);
        chooser.rebuild(2, heap.len());
        assert_eq!(chooser.remaining_regions(), 2);
        assert_eq!(chooser.remaining_reclaimable_bytes(), 400);
        assert_eq!(chooser.length(), 2);
        assert_eq!(chooser.pop().map(|r| r.hrm_index()), Some(2));
        // Taking a candidate does not shrink the filled part.
        assert_eq!(chooser.length(), 2);
        assert_eq!(chooser.remaining_regions(), 1);
    }

    #[test]
    #[should_panic(expected = "Remaining reclaimable bytes inconsistent")]
    fn test_pop_detects_drift() {
        let heap = r1_r2_r3();
        let options = chooser_options();
        let mut chooser = serial_build(&heap, &options);
        *chooser.remaining_reclaimable_bytes.get_mut() = 100;
        chooser.pop();
    }

    #[test]
    #[should_panic(expected = "reclaimable bytes inconsistent")]
    fn test_verify_detects_bad_total() {
        let heap = r1_r2_r3();
        let options = chooser_options();
        let mut chooser = serial_build(&heap, &options);
        *chooser.remaining_reclaimable_bytes.get_mut() += 1;
        chooser.verify();
    }
}
