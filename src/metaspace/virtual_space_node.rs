use spin::Mutex;

use super::address::{MetaWord, MetaWordPtr, NodeId};
use super::chunk_index::{chunk_size_name, ChunkIndex, ChunkOrigin, ChunkSizes};
use super::chunk_manager::ChunkManager;
use super::metachunk::{ChunkHeader, Metachunk, CHUNK_SENTINEL_INVALID};
use super::occupancy_map::OccupancyMap;
use crate::util::constants::UNINIT_META_WORD_VAL;
use crate::util::conversions::{
    align_up_to, bytes_to_formatted_string, is_aligned_to, words_to_bytes,
};

/// A contiguous reserved range of metaspace words that is committed incrementally and
/// carved into chunks from the bottom up.
///
/// Everything below the carve top belongs to some chunk, free or in use; every chunk
/// starts with its header, so the carved part can be walked header by header. The
/// occupancy map mirrors the chunk starts and the in-use state of every granule.
pub struct VirtualSpaceNode {
    id: NodeId,
    sizes: ChunkSizes,
    reserved_words: usize,
    verify: bool,
    state: Mutex<NodeState>,
}

struct NodeState {
    /// The committed words. Its length is the committed size.
    words: Vec<MetaWord>,
    /// Carve top. Words in `[top, words.len())` are committed but not yet part of any chunk.
    top: usize,
    /// The number of chunks of this node that are currently in use.
    container_count: usize,
    occupancy_map: OccupancyMap,
}

impl NodeState {
    fn committed_words(&self) -> usize {
        self.words.len()
    }

    fn read_header(&self, offset: usize) -> ChunkHeader {
        ChunkHeader::decode([self.words[offset], self.words[offset + 1]])
    }

    fn write_header(&mut self, chunk: &Metachunk) {
        let offset = chunk.bottom().offset();
        let encoded = chunk.header().encode();
        self.words[offset..offset + encoded.len()].copy_from_slice(&encoded);
    }

    fn invalidate_header(&mut self, offset: usize) {
        self.words[offset] = CHUNK_SENTINEL_INVALID;
    }

    fn fill(&mut self, offset: usize, len: usize, value: MetaWord) {
        self.words[offset..offset + len].fill(value);
    }

    /// Carve a chunk at the current top. Chunks are born in use.
    fn carve(
        &mut self,
        node: &VirtualSpaceNode,
        chunk_type: ChunkIndex,
        word_size: usize,
        origin: ChunkOrigin,
    ) -> Metachunk {
        let bottom = self.top;
        debug_assert!(bottom + word_size <= self.committed_words());
        self.top += word_size;
        let mut chunk = Metachunk::new(chunk_type, node.is_class(), word_size, bottom, node.id);
        chunk.set_origin(origin);
        self.occupancy_map.set_chunk_starts_at_address(bottom, true);
        self.occupancy_map.set_region_in_use(bottom, word_size, true);
        self.write_header(&chunk);
        if node.verify {
            self.fill(
                chunk.initial_top().offset(),
                word_size - Metachunk::overhead(),
                UNINIT_META_WORD_VAL,
            );
        }
        self.container_count += 1;
        chunk
    }
}

impl VirtualSpaceNode {
    pub fn new(id: NodeId, word_size: usize, sizes: ChunkSizes, verify: bool) -> Self {
        assert!(
            word_size > 0 && is_aligned_to(word_size, sizes.specialized()),
            "Node size {} must be a non-zero multiple of the specialized chunk size {}",
            word_size,
            sizes.specialized()
        );
        info!(
            "Reserved {} node {} of {} words ({})",
            if id.mdtype().is_class() { "class" } else { "non-class" },
            id,
            word_size,
            bytes_to_formatted_string(words_to_bytes(word_size))
        );
        VirtualSpaceNode {
            id,
            sizes,
            reserved_words: word_size,
            verify,
            state: Mutex::new(NodeState {
                words: Vec::new(),
                top: 0,
                container_count: 0,
                occupancy_map: OccupancyMap::new(word_size, sizes.specialized()),
            }),
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn is_class(&self) -> bool {
        self.id.mdtype().is_class()
    }

    pub fn chunk_sizes(&self) -> &ChunkSizes {
        &self.sizes
    }

    pub fn reserved_words(&self) -> usize {
        self.reserved_words
    }

    pub fn committed_words(&self) -> usize {
        self.state.lock().committed_words()
    }

    /// Words already carved into chunks.
    pub fn used_words_in_vs(&self) -> usize {
        self.state.lock().top
    }

    /// Committed words not yet carved into chunks.
    pub fn free_words_in_vs(&self) -> usize {
        let state = self.state.lock();
        state.committed_words() - state.top
    }

    pub fn is_available(&self, word_size: usize) -> bool {
        word_size <= self.free_words_in_vs()
    }

    pub fn container_count(&self) -> usize {
        self.state.lock().container_count
    }

    pub(crate) fn dec_container_count(&self) {
        let mut state = self.state.lock();
        assert!(
            state.container_count > 0,
            "Node {}: container count underflow",
            self.id
        );
        state.container_count -= 1;
    }

    pub(crate) fn inc_container_count(&self) {
        self.state.lock().container_count += 1;
    }

    pub fn contains(&self, p: MetaWordPtr) -> bool {
        p.node() == self.id && p.offset() < self.state.lock().top
    }

    /// Commit more of the reserved range: at least `min_words`, at most `preferred_words`
    /// rounded up to the specialized chunk size. Returns false if fewer than `min_words`
    /// words are left uncommitted.
    pub fn expand_by(&self, min_words: usize, preferred_words: usize) -> bool {
        let mut state = self.state.lock();
        let uncommitted = self.reserved_words - state.committed_words();
        if uncommitted < min_words {
            return false;
        }
        let commit =
            align_up_to(preferred_words.max(min_words), self.sizes.specialized()).min(uncommitted);
        let new_committed = state.committed_words() + commit;
        state.words.resize(new_committed, 0);
        trace!(
            "Expanded node {} by {} words, committed {} of {}",
            self.id,
            commit,
            new_committed,
            self.reserved_words
        );
        true
    }

    /// Carve a chunk of `chunk_word_size` words from the committed, uncarved part of the
    /// node. Returns `None` if the node cannot fit the chunk at its required alignment.
    ///
    /// If the carve top is not suitably aligned, padding chunks are carved first and
    /// handed to `chunk_manager` as free chunks.
    pub fn take_from_committed(
        &self,
        chunk_word_size: usize,
        chunk_manager: &mut ChunkManager,
    ) -> Option<Metachunk> {
        self.carve_aligned(chunk_word_size, ChunkOrigin::VirtualSpace, chunk_manager)
    }

    fn carve_aligned(
        &self,
        chunk_word_size: usize,
        origin: ChunkOrigin,
        chunk_manager: &mut ChunkManager,
    ) -> Option<Metachunk> {
        let chunk_type = self.sizes.chunk_type_by_size(chunk_word_size);
        let required_alignment = self.sizes.required_alignment(chunk_type, chunk_word_size);

        let (result, padding) = {
            let mut state = self.state.lock();
            let next_aligned = align_up_to(state.top, required_alignment);
            if (next_aligned - state.top) + chunk_word_size
                > state.committed_words() - state.top
            {
                return None;
            }
            let mut padding = vec![];
            if next_aligned > state.top {
                trace!(
                    "Creating padding chunks in {} between {:#x} and {:#x}",
                    self.id,
                    state.top,
                    next_aligned
                );
            }
            while state.top < next_aligned {
                let here = state.top;
                let padding_word_size = if is_aligned_to(here, self.sizes.small()) {
                    self.sizes.small()
                } else {
                    debug_assert!(is_aligned_to(here, self.sizes.specialized()));
                    self.sizes.specialized()
                };
                assert!(here + padding_word_size <= next_aligned);
                let padding_type = self.sizes.chunk_type_by_size(padding_word_size);
                padding.push(state.carve(self, padding_type, padding_word_size, ChunkOrigin::Pad));
            }
            let result = state.carve(self, chunk_type, chunk_word_size, origin);
            (result, padding)
        };

        for chunk in padding {
            chunk_manager.return_single_chunk(self, chunk);
        }

        debug!("Carved {}", result);
        if self.verify {
            chunk_manager.verify();
            self.verify();
            self.verify_chunk(&result);
        }
        Some(result)
    }

    /// Carve all committed but uncarved words into the largest chunks that fit and hand
    /// them to `chunk_manager`. Called when the node is abandoned for a new one.
    pub fn retire(&self, chunk_manager: &mut ChunkManager) {
        assert_eq!(self.is_class(), chunk_manager.is_class(), "Wrong chunk manager");
        let mut retired = 0;
        for index in ChunkIndex::NON_HUMONGOUS.iter().rev() {
            let chunk_size = self.sizes.size_for_nonhumongous_chunktype(*index);
            while self.free_words_in_vs() >= chunk_size {
                // Alignment padding may make the carve fail; the next smaller size will fit.
                let Some(chunk) = self.carve_aligned(chunk_size, ChunkOrigin::Leftover, chunk_manager)
                else {
                    break;
                };
                chunk_manager.return_single_chunk(self, chunk);
                retired += 1;
            }
        }
        assert_eq!(self.free_words_in_vs(), 0, "Node {} should be empty now", self.id);
        debug!("Retired node {} into {} chunks", self.id, retired);
    }

    /// Set the chunk's tagged-free flag and the in-use bits of its range together.
    pub fn update_in_use_info_for_chunk(&self, chunk: &mut Metachunk, inuse: bool) {
        assert_eq!(chunk.container(), self.id, "Chunk {} is not in node {}", chunk, self.id);
        let mut state = self.state.lock();
        chunk.set_is_tagged_free(!inuse);
        state.write_header(chunk);
        state
            .occupancy_map
            .set_region_in_use(chunk.bottom().offset(), chunk.word_size(), inuse);
    }

    /// Verify the chunk itself, then cross-check it with its in-memory header and the
    /// occupancy map.
    pub fn verify_chunk(&self, chunk: &Metachunk) {
        chunk.verify(&self.sizes);
        assert_eq!(chunk.container(), self.id, "Chunk {} is not in node {}", chunk, self.id);
        let state = self.state.lock();
        let offset = chunk.bottom().offset();
        assert!(
            offset + chunk.word_size() <= state.top,
            "Chunk {} is outside of the carved part of node {}",
            chunk,
            self.id
        );
        assert_eq!(
            state.read_header(offset),
            chunk.header(),
            "Chunk {}: header in memory does not match",
            chunk
        );
        state.occupancy_map.verify_for_chunk(chunk);
    }

    fn verify_header_at(&self, offset: usize, header: &ChunkHeader) {
        assert!(
            header.is_valid_sentinel(),
            "Node {}: chunk at {:#x} has an invalid sentinel",
            self.id,
            offset
        );
        let Some(chunk_type) = header.chunk_type() else {
            panic!("Node {}: chunk at {:#x}: Invalid chunk type.", self.id, offset);
        };
        assert!(
            header.origin().is_some(),
            "Node {}: chunk at {:#x}: Invalid chunk origin.",
            self.id,
            offset
        );
        assert_eq!(header.is_class, self.is_class(), "Chunk at {:#x}: wrong space", offset);
        assert!(
            self.sizes.is_valid_chunk_size(header.word_size)
                && self.sizes.chunk_type_by_size(header.word_size) == chunk_type,
            "Node {}: chunk at {:#x}: wordsize {} does not fit chunk type {}.",
            self.id,
            offset,
            header.word_size,
            chunk_size_name(chunk_type)
        );
        let required_alignment = self.sizes.required_alignment(chunk_type, header.word_size);
        assert!(
            is_aligned_to(offset, required_alignment),
            "Node {}: chunk at {:#x} not aligned to {} words.",
            self.id,
            offset,
            required_alignment
        );
    }

    /// Walk all chunks of the node and check them, the container count and the occupancy map.
    pub fn verify(&self) {
        let state = self.state.lock();
        assert!(
            state.top <= state.committed_words() && state.committed_words() <= self.reserved_words,
            "Node {}: top {} committed {} reserved {}",
            self.id,
            state.top,
            state.committed_words(),
            self.reserved_words
        );
        let mut p = 0;
        let mut in_use_chunks = 0;
        while p < state.top {
            let header = state.read_header(p);
            self.verify_header_at(p, &header);
            if !header.is_tagged_free {
                in_use_chunks += 1;
            }
            p += header.word_size;
        }
        assert_eq!(p, state.top, "Node {}: last chunk overlaps top", self.id);
        assert_eq!(
            in_use_chunks, state.container_count,
            "Node {}: container count does not match the number of chunks in use",
            self.id
        );
        state
            .occupancy_map
            .verify(0, state.top, |offset| state.read_header(offset));
    }

    /// Whether the free chunks in `[start, start + word_size)` can be merged into one chunk.
    pub(crate) fn can_coalesce(&self, start: usize, word_size: usize) -> bool {
        let state = self.state.lock();
        let end = start + word_size;
        // The area must be carved completely.
        if end > state.top {
            return false;
        }
        // A chunk starts at both ends. Otherwise a chunk straddles one of them.
        if !state.occupancy_map.chunk_starts_at_address(start) {
            return false;
        }
        if end < state.top && !state.occupancy_map.chunk_starts_at_address(end) {
            return false;
        }
        !state.occupancy_map.is_region_in_use(start, word_size)
    }

    /// The offsets and headers of the chunks that tile `[start, start + word_size)`.
    pub(crate) fn chunk_headers_in_area(
        &self,
        start: usize,
        word_size: usize,
    ) -> Vec<(usize, ChunkHeader)> {
        let state = self.state.lock();
        let end = start + word_size;
        assert!(end <= state.top, "Area [{:#x}-{:#x}) is not carved", start, end);
        let mut headers = vec![];
        let mut p = start;
        while p < end {
            let header = state.read_header(p);
            assert!(
                header.is_valid_sentinel() && header.word_size > 0,
                "No chunk header at {:#x} in node {}",
                p,
                self.id
            );
            headers.push((p, header));
            p += header.word_size;
        }
        assert_eq!(p, end, "A chunk straddles the end of area [{:#x}-{:#x})", start, end);
        headers
    }

    /// Replace the free chunks covering `[start, start + target size)` with one free chunk.
    pub(crate) fn merge_free_chunks(
        &self,
        start: usize,
        target_type: ChunkIndex,
        absorbed: Vec<Metachunk>,
    ) -> Metachunk {
        let word_size = self.sizes.size_for_nonhumongous_chunktype(target_type);
        let mut state = self.state.lock();
        debug_assert!(!state.occupancy_map.is_region_in_use(start, word_size));
        for mut chunk in absorbed {
            debug_assert!(chunk.is_tagged_free());
            chunk.remove_sentinel();
            state.invalidate_header(chunk.bottom().offset());
        }
        let mut merged = Metachunk::new(target_type, self.is_class(), word_size, start, self.id);
        merged.set_origin(ChunkOrigin::Merge);
        merged.set_is_tagged_free(true);
        state.occupancy_map.wipe_chunk_start_bits_in_region(start, word_size);
        state.occupancy_map.set_chunk_starts_at_address(start, true);
        state.write_header(&merged);
        merged
    }

    /// Split a free non-humongous chunk into a free chunk of `target_type` at its start
    /// and the largest aligned free chunks that cover the rest.
    pub(crate) fn split_free_chunk(
        &self,
        mut larger: Metachunk,
        target_type: ChunkIndex,
    ) -> (Metachunk, Vec<Metachunk>) {
        let larger_type = larger.get_chunk_type();
        assert!(
            larger.is_tagged_free() && !larger_type.is_humongous() && target_type < larger_type,
            "Cannot split {} into {} chunks",
            larger,
            chunk_size_name(target_type)
        );
        let region_start = larger.bottom().offset();
        let region_end = larger.end().offset();
        let target_word_size = self.sizes.size_for_nonhumongous_chunktype(target_type);
        assert!(is_aligned_to(region_start, target_word_size));

        let mut state = self.state.lock();
        larger.remove_sentinel();
        state.invalidate_header(region_start);

        // The target chunk starts where the old chunk started, so its start bit is set.
        let mut target = Metachunk::new(
            target_type,
            self.is_class(),
            target_word_size,
            region_start,
            self.id,
        );
        target.set_origin(ChunkOrigin::Split);
        target.set_is_tagged_free(true);
        state.write_header(&target);

        let mut remainders = vec![];
        let mut p = region_start + target_word_size;
        while p < region_end {
            let mut index = larger_type.prev();
            let this_type = loop {
                let Some(candidate) = index else {
                    panic!("No chunk type fits at {:#x} in node {}", p, self.id);
                };
                assert!(candidate >= target_type);
                if is_aligned_to(p, self.sizes.size_for_nonhumongous_chunktype(candidate)) {
                    break candidate;
                }
                index = candidate.prev();
            };
            let this_word_size = self.sizes.size_for_nonhumongous_chunktype(this_type);
            assert!(p + this_word_size <= region_end);
            let mut chunk = Metachunk::new(this_type, self.is_class(), this_word_size, p, self.id);
            chunk.set_origin(ChunkOrigin::Split);
            chunk.set_is_tagged_free(true);
            state.occupancy_map.set_chunk_starts_at_address(p, true);
            state.write_header(&chunk);
            remainders.push(chunk);
            p += this_word_size;
        }
        (target, remainders)
    }

    fn check_access(&self, state: &NodeState, p: MetaWordPtr, len: usize) {
        assert_eq!(p.node(), self.id, "{} is not in node {}", p, self.id);
        assert!(
            p.offset() + len <= state.top,
            "Access to {} words at {} is outside of the carved part of node {}",
            len,
            p,
            self.id
        );
    }

    pub fn read_word(&self, p: MetaWordPtr) -> MetaWord {
        let state = self.state.lock();
        self.check_access(&state, p, 1);
        state.words[p.offset()]
    }

    pub fn read_words(&self, p: MetaWordPtr, len: usize) -> Vec<MetaWord> {
        let state = self.state.lock();
        self.check_access(&state, p, len);
        state.words[p.offset()..p.offset() + len].to_vec()
    }

    pub fn write_words(&self, p: MetaWordPtr, data: &[MetaWord]) {
        let mut state = self.state.lock();
        self.check_access(&state, p, data.len());
        state.words[p.offset()..p.offset() + data.len()].copy_from_slice(data);
    }

    pub fn fill_words(&self, p: MetaWordPtr, len: usize, value: MetaWord) {
        let mut state = self.state.lock();
        self.check_access(&state, p, len);
        state.fill(p.offset(), len, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metaspace::MetadataType;

    const SPEC: usize = 40;
    const SMALL: usize = 160;
    const MEDIUM: usize = 640;

    fn sizes() -> ChunkSizes {
        ChunkSizes::new(SPEC, SMALL, MEDIUM)
    }

    fn node(words: usize) -> VirtualSpaceNode {
        crate::util::logger::init_for_test();
        VirtualSpaceNode::new(NodeId::new(MetadataType::NonClass, 0), words, sizes(), true)
    }

    #[test]
    fn test_four_specialized_chunks() {
        let node = node(4 * SPEC);
        let mut cm = ChunkManager::new(false, sizes(), true);
        assert!(node.expand_by(4 * SPEC, 4 * SPEC));
        let mut chunks: Vec<_> = (0..4)
            .map(|_| node.take_from_committed(SPEC, &mut cm))
            .collect::<Option<_>>()
            .unwrap();
        assert!(node.take_from_committed(SPEC, &mut cm).is_none());
        assert_eq!(node.free_words_in_vs(), 0);
        assert_eq!(node.container_count(), 4);

        let chunk = &mut chunks[0];
        for _ in 0..3 {
            assert!(chunk.allocate(10).is_some());
        }
        assert_eq!(chunk.allocate(10), None);
        assert_eq!(chunk.free_word_size(), 8);
        assert!(chunk.allocate(8).is_some());
        assert_eq!(chunk.free_word_size(), 0);
        for chunk in chunks.iter() {
            node.verify_chunk(chunk);
        }
        node.verify();
    }

    #[test]
    fn test_padding_before_aligned_chunk() {
        let node = node(2 * MEDIUM);
        let mut cm = ChunkManager::new(false, sizes(), true);
        assert!(node.expand_by(2 * MEDIUM, 2 * MEDIUM));
        let spec = node.take_from_committed(SPEC, &mut cm).unwrap();
        let medium = node.take_from_committed(MEDIUM, &mut cm).unwrap();
        assert_eq!(medium.bottom().offset(), MEDIUM);
        assert_eq!(medium.get_origin(), ChunkOrigin::VirtualSpace);
        // Three specialized pads up to the small boundary, then three small pads.
        assert_eq!(cm.num_free_chunks(ChunkIndex::Specialized), 3);
        assert_eq!(cm.num_free_chunks(ChunkIndex::Small), 3);
        assert_eq!(cm.free_chunks_total_words(), MEDIUM - SPEC);
        assert_eq!(node.container_count(), 2);
        node.verify_chunk(&spec);
        node.verify_chunk(&medium);
        node.verify();
    }

    #[test]
    fn test_expand_respects_reserve() {
        let node = node(4 * SPEC);
        assert!(!node.expand_by(5 * SPEC, 5 * SPEC));
        assert!(node.expand_by(SPEC, 10));
        assert_eq!(node.committed_words(), SPEC);
        assert!(node.expand_by(SPEC, 100 * SPEC));
        assert_eq!(node.committed_words(), 4 * SPEC);
        assert!(!node.expand_by(1, 1));
    }

    #[test]
    fn test_retire_carves_everything() {
        let node = node(4 * MEDIUM);
        let mut cm = ChunkManager::new(false, sizes(), true);
        assert!(node.expand_by(MEDIUM + SMALL + 2 * SPEC, 0));
        let used = node.take_from_committed(SPEC, &mut cm).unwrap();
        node.retire(&mut cm);
        assert_eq!(node.free_words_in_vs(), 0);
        assert_eq!(node.container_count(), 1);
        assert_eq!(
            cm.free_chunks_total_words(),
            MEDIUM + SMALL + 2 * SPEC - used.word_size()
        );
        node.verify();
    }

    #[test]
    fn test_word_access() {
        let node = node(4 * SPEC);
        let mut cm = ChunkManager::new(false, sizes(), false);
        assert!(node.expand_by(SPEC, SPEC));
        let mut chunk = node.take_from_committed(SPEC, &mut cm).unwrap();
        assert_eq!(node.read_word(chunk.initial_top()), UNINIT_META_WORD_VAL);
        let p = chunk.allocate(3).unwrap();
        node.write_words(p, &[1, 2, 3]);
        assert_eq!(node.read_words(p, 3), vec![1, 2, 3]);
        node.fill_words(p, 2, 7);
        assert_eq!(node.read_words(p, 3), vec![7, 7, 3]);
        assert!(node.contains(p));
    }

    #[test]
    #[should_panic(expected = "outside of the carved part")]
    fn test_word_access_beyond_top() {
        let node = node(4 * SPEC);
        assert!(node.expand_by(4 * SPEC, 4 * SPEC));
        node.read_word(MetaWordPtr::new(node.id(), 0));
    }

    #[test]
    #[should_panic(expected = "in use but marked as free")]
    fn test_verify_chunk_detects_stale_map() {
        let node = node(4 * SPEC);
        let mut cm = ChunkManager::new(false, sizes(), false);
        assert!(node.expand_by(SPEC, SPEC));
        let chunk = node.take_from_committed(SPEC, &mut cm).unwrap();
        node.state
            .lock()
            .occupancy_map
            .set_region_in_use(0, SPEC, false);
        node.verify_chunk(&chunk);
    }

    #[test]
    #[should_panic(expected = "container count")]
    fn test_verify_detects_bad_container_count() {
        let node = node(4 * SPEC);
        let mut cm = ChunkManager::new(false, sizes(), false);
        assert!(node.expand_by(SPEC, SPEC));
        let _chunk = node.take_from_committed(SPEC, &mut cm).unwrap();
        node.inc_container_count();
        node.verify();
    }
}
