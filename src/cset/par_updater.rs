use super::chooser::CollectionSetChooser;
use super::region::HeapRegion;

/// A worker's handle for adding candidates to a [`CollectionSetChooser`] in parallel.
///
/// The updater claims chunks of the chooser's candidate array one at a time and fills
/// them. Its totals are added to the chooser once, when it is dropped.
pub struct CSetChooserParUpdater<'a, 'h, R: HeapRegion> {
    chooser: &'a CollectionSetChooser<'h, R>,
    chunk_size: usize,
    cur_chunk_idx: usize,
    cur_chunk_end: usize,
    regions_added: usize,
    reclaimable_bytes_added: usize,
}

impl<'a, 'h, R: HeapRegion> CSetChooserParUpdater<'a, 'h, R> {
    pub fn new(chooser: &'a CollectionSetChooser<'h, R>, chunk_size: usize) -> Self {
        CSetChooserParUpdater {
            chooser,
            chunk_size,
            cur_chunk_idx: 0,
            cur_chunk_end: 0,
            regions_added: 0,
            reclaimable_bytes_added: 0,
        }
    }

    pub fn should_add(&self, r: &R) -> bool {
        self.chooser.should_add(r)
    }

    pub fn add_region(&mut self, r: &'h R) {
        if self.cur_chunk_idx == self.cur_chunk_end {
            self.cur_chunk_idx = self.chooser.claim_array_chunk(self.chunk_size);
            self.cur_chunk_end = self.cur_chunk_idx + self.chunk_size;
        }
        debug_assert!(self.cur_chunk_idx < self.cur_chunk_end);
        self.chooser.set_region(self.cur_chunk_idx, r);
        self.cur_chunk_idx += 1;
        self.regions_added += 1;
        self.reclaimable_bytes_added += r.reclaimable_bytes();
    }

    pub fn regions_added(&self) -> usize {
        self.regions_added
    }

    pub fn reclaimable_bytes_added(&self) -> usize {
        self.reclaimable_bytes_added
    }
}

impl<R: HeapRegion> Drop for CSetChooserParUpdater<'_, '_, R> {
    fn drop(&mut self) {
        if self.regions_added > 0 {
            self.chooser
                .update_totals(self.regions_added, self.reclaimable_bytes_added);
        }
    }
}
