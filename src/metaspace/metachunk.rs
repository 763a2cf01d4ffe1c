use std::fmt;

use static_assertions::{const_assert, const_assert_eq};

use super::address::{MetaWord, MetaWordPtr, NodeId};
use super::chunk_index::{chunk_size_name, ChunkIndex, ChunkOrigin, ChunkSizes};
use super::virtual_space_node::VirtualSpaceNode;
use crate::util::constants::{BYTES_IN_WORD, METADATA_ALIGNMENT};
use crate::util::conversions::{align_up_to, is_aligned_to};

/// Written into the first header word of every live chunk.
pub const CHUNK_SENTINEL: usize = 0x4d4554EF;
/// Written over the sentinel when a chunk is absorbed into a larger one.
pub const CHUNK_SENTINEL_INVALID: usize = 0xFEEEEEEF;

const_assert!(METADATA_ALIGNMENT.is_power_of_two());
const_assert_eq!(METADATA_ALIGNMENT, 8);

// Layout of the second header word.
const TYPE_SHIFT: usize = 0;
const TYPE_MASK: usize = 0b111;
const CLASS_SHIFT: usize = 3;
const ORIGIN_SHIFT: usize = 4;
const ORIGIN_MASK: usize = 0b111;
const FREE_SHIFT: usize = 7;
const SIZE_SHIFT: usize = 8;

/// The chunk header as stored in the first words of the chunk's memory.
///
/// The node only sees chunks through their headers: walking from the bottom of a node
/// to its top by header word sizes visits every chunk carved from that node.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ChunkHeader {
    pub sentinel: usize,
    pub chunk_type_code: u8,
    pub is_class: bool,
    pub origin_code: u8,
    pub is_tagged_free: bool,
    pub word_size: usize,
}

impl ChunkHeader {
    pub fn decode(words: [MetaWord; 2]) -> Self {
        let info = words[1];
        ChunkHeader {
            sentinel: words[0],
            chunk_type_code: ((info >> TYPE_SHIFT) & TYPE_MASK) as u8,
            is_class: (info >> CLASS_SHIFT) & 1 != 0,
            origin_code: ((info >> ORIGIN_SHIFT) & ORIGIN_MASK) as u8,
            is_tagged_free: (info >> FREE_SHIFT) & 1 != 0,
            word_size: info >> SIZE_SHIFT,
        }
    }

    pub fn encode(&self) -> [MetaWord; 2] {
        let info = ((self.chunk_type_code as usize & TYPE_MASK) << TYPE_SHIFT)
            | ((self.is_class as usize) << CLASS_SHIFT)
            | ((self.origin_code as usize & ORIGIN_MASK) << ORIGIN_SHIFT)
            | ((self.is_tagged_free as usize) << FREE_SHIFT)
            | (self.word_size << SIZE_SHIFT);
        [self.sentinel, info]
    }

    pub fn is_valid_sentinel(&self) -> bool {
        self.sentinel == CHUNK_SENTINEL
    }

    pub fn chunk_type(&self) -> Option<ChunkIndex> {
        ChunkIndex::from_repr(self.chunk_type_code)
    }

    pub fn origin(&self) -> Option<ChunkOrigin> {
        if ChunkOrigin::is_valid(self.origin_code) {
            ChunkOrigin::from_repr(self.origin_code)
        } else {
            None
        }
    }
}

/// A contiguous range of metaspace words carved from one virtual space node, with a
/// bump pointer for allocation.
///
/// A `Metachunk` value is the handle to the chunk and is owned by whoever currently holds
/// the chunk: either a chunk manager free list or a metadata user. The first
/// [`Metachunk::overhead`] words of the range hold the chunk header.
#[derive(Debug, PartialEq, Eq)]
pub struct Metachunk {
    container: NodeId,
    bottom: usize,
    word_size: usize,
    top: usize,
    chunk_type: ChunkIndex,
    is_class: bool,
    sentinel: usize,
    origin: ChunkOrigin,
    use_count: u32,
    is_tagged_free: bool,
}

impl Metachunk {
    pub(crate) fn new(
        chunk_type: ChunkIndex,
        is_class: bool,
        word_size: usize,
        bottom: usize,
        container: NodeId,
    ) -> Self {
        debug_assert!(word_size > Self::overhead());
        Metachunk {
            container,
            bottom,
            word_size,
            top: bottom + Self::overhead(),
            chunk_type,
            is_class,
            sentinel: CHUNK_SENTINEL,
            origin: ChunkOrigin::Normal,
            use_count: 0,
            is_tagged_free: false,
        }
    }

    /// Alignment of metadata objects in bytes.
    pub const fn object_alignment() -> usize {
        METADATA_ALIGNMENT
    }

    /// Size of the chunk header in words, rounded up to the object alignment.
    pub const fn overhead() -> usize {
        align_up_to(2 * BYTES_IN_WORD, Self::object_alignment()) / BYTES_IN_WORD
    }

    /// Bump-allocate `word_size` words. Returns `None` if the chunk does not have that
    /// many free words left; the chunk is unchanged in that case.
    pub fn allocate(&mut self, word_size: usize) -> Option<MetaWordPtr> {
        if self.free_word_size() < word_size {
            return None;
        }
        let result = MetaWordPtr::new(self.container, self.top);
        self.top += word_size;
        Some(result)
    }

    pub fn container(&self) -> NodeId {
        self.container
    }

    pub fn bottom(&self) -> MetaWordPtr {
        MetaWordPtr::new(self.container, self.bottom)
    }

    /// The first word after the header.
    pub fn initial_top(&self) -> MetaWordPtr {
        MetaWordPtr::new(self.container, self.bottom + Self::overhead())
    }

    pub fn top(&self) -> MetaWordPtr {
        MetaWordPtr::new(self.container, self.top)
    }

    pub fn end(&self) -> MetaWordPtr {
        MetaWordPtr::new(self.container, self.bottom + self.word_size)
    }

    pub fn word_size(&self) -> usize {
        self.word_size
    }

    /// Words handed out by [`Metachunk::allocate`], not counting the header.
    pub fn used_word_size(&self) -> usize {
        self.top - (self.bottom + Self::overhead())
    }

    pub fn free_word_size(&self) -> usize {
        self.bottom + self.word_size - self.top
    }

    pub fn contains(&self, p: MetaWordPtr) -> bool {
        p.node() == self.container && self.bottom <= p.offset() && p.offset() < self.top
    }

    pub fn get_chunk_type(&self) -> ChunkIndex {
        self.chunk_type
    }

    pub fn is_class(&self) -> bool {
        self.is_class
    }

    pub fn get_origin(&self) -> ChunkOrigin {
        self.origin
    }

    pub fn set_origin(&mut self, origin: ChunkOrigin) {
        self.origin = origin;
    }

    pub fn is_tagged_free(&self) -> bool {
        self.is_tagged_free
    }

    pub(crate) fn set_is_tagged_free(&mut self, v: bool) {
        self.is_tagged_free = v;
    }

    pub fn use_count(&self) -> u32 {
        self.use_count
    }

    pub fn inc_use_count(&mut self) {
        self.use_count += 1;
    }

    pub fn dec_use_count(&mut self) {
        assert!(self.use_count > 0, "Chunk {}: use count underflow", self);
        self.use_count -= 1;
    }

    pub fn is_valid_sentinel(&self) -> bool {
        self.sentinel == CHUNK_SENTINEL
    }

    pub(crate) fn remove_sentinel(&mut self) {
        self.sentinel = CHUNK_SENTINEL_INVALID;
    }

    /// Forget all allocations made in this chunk.
    pub(crate) fn reset_empty(&mut self) {
        self.top = self.bottom + Self::overhead();
    }

    pub(crate) fn header(&self) -> ChunkHeader {
        ChunkHeader {
            sentinel: self.sentinel,
            chunk_type_code: self.chunk_type as u8,
            is_class: self.is_class,
            origin_code: self.origin as u8,
            is_tagged_free: self.is_tagged_free,
            word_size: self.word_size,
        }
    }

    /// Fill the payload of this chunk with `word_value`.
    pub fn mangle(&self, node: &VirtualSpaceNode, word_value: MetaWord) {
        node.fill_words(self.initial_top(), self.word_size - Self::overhead(), word_value);
    }

    /// Check the chunk's own invariants. Panics if any of them is broken.
    pub fn verify(&self, sizes: &ChunkSizes) {
        assert!(self.is_valid_sentinel(), "Chunk {}: sentinel invalid", self.bottom());
        if !self.chunk_type.is_humongous() {
            assert_eq!(
                self.word_size,
                sizes.size_for_nonhumongous_chunktype(self.chunk_type),
                "Chunk {}: wordsize {} does not fit chunk type {}.",
                self.bottom(),
                self.word_size,
                chunk_size_name(self.chunk_type)
            );
        } else {
            assert!(
                sizes.is_valid_humongous_size(self.word_size),
                "Chunk {}: wordsize {} is not a humongous size.",
                self.bottom(),
                self.word_size
            );
        }
        assert!(
            self.bottom + Self::overhead() <= self.top && self.top <= self.bottom + self.word_size,
            "Chunk {}: Chunk top out of chunk bounds.",
            self.bottom()
        );
        let required_alignment = sizes.required_alignment(self.chunk_type, self.word_size);
        assert!(
            is_aligned_to(self.bottom, required_alignment),
            "Chunk {}: (size {}) not aligned to {} words.",
            self.bottom(),
            self.word_size,
            required_alignment
        );
    }

    #[cfg(test)]
    pub(crate) fn corrupt_sentinel_for_test(&mut self) {
        self.sentinel = 0;
    }
}

impl fmt::Display for Metachunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Metachunk {} [{:#x}, {:#x}, {:#x}) size {} type {} origin {} {}",
            self.container,
            self.bottom,
            self.top,
            self.bottom + self.word_size,
            self.word_size,
            chunk_size_name(self.chunk_type),
            <&'static str>::from(self.origin),
            if self.is_tagged_free { "free" } else { "in use" }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metaspace::MetadataType;

    fn chunk_at(bottom: usize, word_size: usize, sizes: &ChunkSizes) -> Metachunk {
        Metachunk::new(
            sizes.chunk_type_by_size(word_size),
            false,
            word_size,
            bottom,
            NodeId::new(MetadataType::NonClass, 0),
        )
    }

    #[test]
    fn test_overhead() {
        assert_eq!(Metachunk::overhead(), 2);
        assert_eq!(Metachunk::object_alignment(), 8);
    }

    #[test]
    fn test_allocate_until_full() {
        let sizes = ChunkSizes::new(40, 160, 640);
        let mut chunk = chunk_at(80, 40, &sizes);
        assert_eq!(chunk.free_word_size(), 38);
        for i in 0..3 {
            let p = chunk.allocate(10);
            assert_eq!(p.map(|p| p.offset()), Some(82 + i * 10));
        }
        assert_eq!(chunk.used_word_size(), 30);
        assert_eq!(chunk.free_word_size(), 8);
        assert_eq!(chunk.allocate(10), None);
        assert_eq!(chunk.free_word_size(), 8);
        assert!(chunk.allocate(8).is_some());
        assert_eq!(chunk.free_word_size(), 0);
        assert_eq!(
            chunk.used_word_size() + chunk.free_word_size(),
            chunk.word_size() - Metachunk::overhead()
        );
        chunk.verify(&sizes);
    }

    #[test]
    fn test_header_roundtrip_keeps_flags() {
        let sizes = ChunkSizes::new(40, 160, 640);
        let mut chunk = chunk_at(0, 680, &sizes);
        chunk.set_origin(ChunkOrigin::Merge);
        chunk.set_is_tagged_free(true);
        let header = ChunkHeader::decode(chunk.header().encode());
        assert!(header.is_valid_sentinel());
        assert_eq!(header.chunk_type(), Some(ChunkIndex::Humongous));
        assert_eq!(header.origin(), Some(ChunkOrigin::Merge));
        assert!(header.is_tagged_free);
        assert_eq!(header.word_size, 680);
    }

    #[test]
    fn test_invalid_header_codes() {
        let header = ChunkHeader::decode([CHUNK_SENTINEL, 0b0111_0111]);
        assert_eq!(header.chunk_type(), None);
        assert_eq!(header.origin(), None);
    }

    #[test]
    fn test_reset_empty() {
        let sizes = ChunkSizes::new(40, 160, 640);
        let mut chunk = chunk_at(160, 160, &sizes);
        chunk.allocate(100);
        chunk.reset_empty();
        assert_eq!(chunk.top(), chunk.initial_top());
        assert_eq!(chunk.used_word_size(), 0);
    }

    #[test]
    #[should_panic(expected = "sentinel invalid")]
    fn test_verify_bad_sentinel() {
        let sizes = ChunkSizes::new(40, 160, 640);
        let mut chunk = chunk_at(0, 40, &sizes);
        chunk.corrupt_sentinel_for_test();
        chunk.verify(&sizes);
    }

    #[test]
    #[should_panic(expected = "not aligned")]
    fn test_verify_misaligned() {
        let sizes = ChunkSizes::new(40, 160, 640);
        chunk_at(40, 160, &sizes).verify(&sizes);
    }

    #[test]
    #[should_panic(expected = "use count underflow")]
    fn test_use_count_underflow() {
        let sizes = ChunkSizes::new(40, 160, 640);
        let mut chunk = chunk_at(0, 40, &sizes);
        chunk.inc_use_count();
        chunk.dec_use_count();
        chunk.dec_use_count();
    }
}
