/// The read-only view of a heap region the collection set chooser needs.
///
/// Regions are identified by their index in the heap's region table: for a heap given as
/// a slice `heap`, `heap[i].hrm_index() == i` must hold.
pub trait HeapRegion: Sync {
    /// Index of the region in the heap's region table.
    fn hrm_index(&self) -> u32;
    /// Bytes found live by the last marking.
    fn live_bytes(&self) -> usize;
    /// Bytes that evacuating this region would free.
    fn reclaimable_bytes(&self) -> usize;
    fn is_pinned(&self) -> bool;
    fn is_young(&self) -> bool;
    fn is_old(&self) -> bool;
    fn is_humongous(&self) -> bool;
    fn is_free(&self) -> bool;
    /// Whether the remembered set of the region tracks all incoming references.
    fn rem_set_is_complete(&self) -> bool;
    /// Old regions currently used as allocation targets by the collector are not
    /// considered until they are filled up.
    fn is_old_gc_alloc_region(&self) -> bool {
        false
    }

    fn get_type_str(&self) -> &'static str {
        if self.is_free() {
            "FREE"
        } else if self.is_young() {
            "YOUNG"
        } else if self.is_humongous() {
            "HUMS"
        } else if self.is_old() {
            "OLD"
        } else {
            "UNKNOWN"
        }
    }
}
