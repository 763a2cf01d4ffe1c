use std::sync::atomic::{AtomicBool, Ordering};

/// Lets the workers of a parallel heap iteration claim each region exactly once.
///
/// Every worker visits all regions, starting at its own offset and wrapping around, and
/// processes only the regions it manages to claim.
pub struct HeapRegionClaimer {
    n_workers: usize,
    claims: Vec<AtomicBool>,
}

impl HeapRegionClaimer {
    pub fn new(n_workers: usize, n_regions: usize) -> Self {
        assert!(n_workers > 0, "Need at least one worker");
        HeapRegionClaimer {
            n_workers,
            claims: (0..n_regions).map(|_| AtomicBool::new(false)).collect(),
        }
    }

    pub fn n_regions(&self) -> usize {
        self.claims.len()
    }

    /// The index at which `worker_id` starts its iteration.
    pub fn offset_for_worker(&self, worker_id: usize) -> usize {
        assert!(worker_id < self.n_workers, "Invalid worker_id {}", worker_id);
        self.n_regions() * worker_id / self.n_workers
    }

    pub fn is_region_claimed(&self, region_index: usize) -> bool {
        self.claims[region_index].load(Ordering::Relaxed)
    }

    /// Returns true if this call claimed the region.
    pub fn claim_region(&self, region_index: usize) -> bool {
        self.claims[region_index]
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }

    /// Visit every region index once from the worker's offset, calling `f` for the
    /// regions this worker claims. `f` returns true to stop the iteration.
    pub fn par_iterate_from_worker_offset(
        &self,
        worker_id: usize,
        mut f: impl FnMut(usize) -> bool,
    ) {
        let n_regions = self.n_regions();
        let start_index = self.offset_for_worker(worker_id);
        for count in 0..n_regions {
            let index = (start_index + count) % n_regions;
            if !self.claim_region(index) {
                continue;
            }
            if f(index) {
                return;
            }
        }
    }
}
