use super::metachunk::{ChunkHeader, Metachunk};
use super::ChunkIndex;
use crate::util::constants::BITS_IN_BYTE;
use crate::util::conversions::is_aligned_to;

const LAYER_CHUNK_START_MAP: usize = 0;
const LAYER_IN_USE_MAP: usize = 1;

/// A two-layer bitmap over the word range of a virtual space node, with one bit per
/// smallest-chunk-sized granule in each layer.
///
/// Layer 0 records where chunks start, layer 1 records which granules belong to chunks
/// that are in use. Merging free chunks needs both: the start bits tell where the
/// neighbours begin and end, the in-use bits tell whether any of them is still alive.
/// All positions are word offsets from the bottom of the node.
pub struct OccupancyMap {
    word_size: usize,
    smallest_chunk_word_size: usize,
    map: [Vec<u8>; 2],
    map_size: usize,
}

impl OccupancyMap {
    pub fn new(word_size: usize, smallest_chunk_word_size: usize) -> Self {
        assert!(smallest_chunk_word_size > 0);
        assert!(
            is_aligned_to(word_size, smallest_chunk_word_size),
            "Node size {} is not a multiple of the map granule {}",
            word_size,
            smallest_chunk_word_size
        );
        let num_bits = word_size / smallest_chunk_word_size;
        let map_size = num_bits.div_ceil(BITS_IN_BYTE);
        OccupancyMap {
            word_size,
            smallest_chunk_word_size,
            map: [vec![0u8; map_size], vec![0u8; map_size]],
            map_size,
        }
    }

    pub fn word_size(&self) -> usize {
        self.word_size
    }

    pub fn granule_words(&self) -> usize {
        self.smallest_chunk_word_size
    }

    /// Size of one layer in bytes.
    pub fn map_size(&self) -> usize {
        self.map_size
    }

    fn get_bitpos_for_address(&self, p: usize) -> usize {
        debug_assert!(
            is_aligned_to(p, self.smallest_chunk_word_size),
            "Offset {:#x} is not granule aligned",
            p
        );
        debug_assert!(p < self.word_size, "Offset {:#x} outside of the map", p);
        p / self.smallest_chunk_word_size
    }

    fn get_bit_at_position(&self, pos: usize, layer: usize) -> bool {
        let byte = self.map[layer][pos / BITS_IN_BYTE];
        byte & (1u8 << (pos % BITS_IN_BYTE)) != 0
    }

    fn set_bit_at_position(&mut self, pos: usize, layer: usize, v: bool) {
        let mask = 1u8 << (pos % BITS_IN_BYTE);
        let byte = &mut self.map[layer][pos / BITS_IN_BYTE];
        if v {
            *byte |= mask;
        } else {
            *byte &= !mask;
        }
    }

    fn set_bits_of_region(&mut self, p: usize, word_size: usize, layer: usize, v: bool) {
        let (mut pos, end) = self.bit_range(p, word_size);
        // Single bits up to the next byte boundary, then whole bytes, then the tail.
        while pos < end && pos % BITS_IN_BYTE != 0 {
            self.set_bit_at_position(pos, layer, v);
            pos += 1;
        }
        let fill = if v { 0xFF } else { 0 };
        while end - pos >= BITS_IN_BYTE {
            self.map[layer][pos / BITS_IN_BYTE] = fill;
            pos += BITS_IN_BYTE;
        }
        while pos < end {
            self.set_bit_at_position(pos, layer, v);
            pos += 1;
        }
    }

    fn is_any_bit_set_in_region(&self, p: usize, word_size: usize, layer: usize) -> bool {
        let (mut pos, end) = self.bit_range(p, word_size);
        while pos < end && pos % BITS_IN_BYTE != 0 {
            if self.get_bit_at_position(pos, layer) {
                return true;
            }
            pos += 1;
        }
        while end - pos >= BITS_IN_BYTE {
            if self.map[layer][pos / BITS_IN_BYTE] != 0 {
                return true;
            }
            pos += BITS_IN_BYTE;
        }
        while pos < end {
            if self.get_bit_at_position(pos, layer) {
                return true;
            }
            pos += 1;
        }
        false
    }

    fn bit_range(&self, p: usize, word_size: usize) -> (usize, usize) {
        debug_assert!(is_aligned_to(word_size, self.smallest_chunk_word_size));
        debug_assert!(p + word_size <= self.word_size);
        let pos = self.get_bitpos_for_address(p);
        (pos, pos + word_size / self.smallest_chunk_word_size)
    }

    /// Returns true if a chunk starts at `p`.
    pub fn chunk_starts_at_address(&self, p: usize) -> bool {
        let pos = self.get_bitpos_for_address(p);
        self.get_bit_at_position(pos, LAYER_CHUNK_START_MAP)
    }

    pub fn set_chunk_starts_at_address(&mut self, p: usize, v: bool) {
        let pos = self.get_bitpos_for_address(p);
        self.set_bit_at_position(pos, LAYER_CHUNK_START_MAP, v);
    }

    /// Removes all chunk-start bits inside a region, typically after a merge.
    pub fn wipe_chunk_start_bits_in_region(&mut self, p: usize, word_size: usize) {
        self.set_bits_of_region(p, word_size, LAYER_CHUNK_START_MAP, false);
    }

    /// Returns true if any granule in `[p, p + word_size)` belongs to an in-use chunk.
    pub fn is_region_in_use(&self, p: usize, word_size: usize) -> bool {
        if word_size == self.smallest_chunk_word_size {
            let pos = self.get_bitpos_for_address(p);
            self.get_bit_at_position(pos, LAYER_IN_USE_MAP)
        } else {
            self.is_any_bit_set_in_region(p, word_size, LAYER_IN_USE_MAP)
        }
    }

    /// Marks `[p, p + word_size)` as in use or free.
    pub fn set_region_in_use(&mut self, p: usize, word_size: usize, v: bool) {
        self.set_bits_of_region(p, word_size, LAYER_IN_USE_MAP, v);
    }

    /// Check the map for `[from, to)` against the chunk headers found at the chunk starts.
    ///
    /// `header_at` decodes the chunk header at a given offset. The range must begin with a
    /// chunk start; only the carved part of a node is meaningful.
    pub fn verify(&self, from: usize, to: usize, header_at: impl Fn(usize) -> ChunkHeader) {
        let mut current: Option<(usize, ChunkHeader)> = None;
        let mut chunk_end = from;
        let mut nth_bit_for_chunk = 0;
        let mut p = from;
        while p < to {
            let pos = self.get_bitpos_for_address(p);
            if self.get_bit_at_position(pos, LAYER_CHUNK_START_MAP) {
                assert_eq!(
                    chunk_end, p,
                    "Unexpected chunk start found at {:#x} (expected the next chunk to start at {:#x}).",
                    p, chunk_end
                );
                let header = header_at(p);
                assert!(header.is_valid_sentinel(), "Invalid chunk at {:#x}.", p);
                let chunk_type = header.chunk_type();
                assert!(chunk_type.is_some(), "Chunk {:#x}: Invalid chunk type.", p);
                if chunk_type != Some(ChunkIndex::Humongous) {
                    assert!(
                        is_aligned_to(p, header.word_size),
                        "Chunk {:#x} not aligned.",
                        p
                    );
                }
                chunk_end = p + header.word_size;
                assert!(chunk_end <= to, "Chunk end overlaps test address range.");
                current = Some((p, header));
                nth_bit_for_chunk = 0;
            } else {
                assert!(
                    current.is_some(),
                    "Chunk should start at start of address range {:#x}.",
                    from
                );
                assert!(p < chunk_end, "Did not find expected chunk start at {:#x}.", p);
                nth_bit_for_chunk += 1;
            }
            if let Some((start, header)) = current {
                let in_use_bit = self.get_bit_at_position(pos, LAYER_IN_USE_MAP);
                if in_use_bit {
                    assert!(
                        !header.is_tagged_free,
                        "Chunk {:#x}: marked in-use in map but is free (bit {}).",
                        start,
                        nth_bit_for_chunk
                    );
                } else {
                    assert!(
                        header.is_tagged_free,
                        "Chunk {:#x}: marked free in map but is in use (bit {}).",
                        start,
                        nth_bit_for_chunk
                    );
                }
            }
            p += self.smallest_chunk_word_size;
        }
    }

    /// Verify that a given chunk is correctly accounted for in the map.
    pub fn verify_for_chunk(&self, chunk: &Metachunk) {
        let start = chunk.bottom().offset();
        assert!(
            self.chunk_starts_at_address(start),
            "No chunk start marked in map for chunk {}.",
            chunk
        );
        // A chunk larger than the granule must not contain another chunk start.
        if chunk.word_size() > self.smallest_chunk_word_size {
            assert!(
                !self.is_any_bit_set_in_region(
                    start + self.smallest_chunk_word_size,
                    chunk.word_size() - self.smallest_chunk_word_size,
                    LAYER_CHUNK_START_MAP
                ),
                "No chunk must start within another chunk: {}.",
                chunk
            );
        }
        if !chunk.is_tagged_free() {
            assert!(
                self.is_all_in_use(start, chunk.word_size()),
                "Chunk {} is in use but marked as free in map.",
                chunk
            );
        } else {
            assert!(
                !self.is_region_in_use(start, chunk.word_size()),
                "Chunk {} is free but marked as in-use in map.",
                chunk
            );
        }
    }

    fn is_all_in_use(&self, p: usize, word_size: usize) -> bool {
        let (start, end) = self.bit_range(p, word_size);
        (start..end).all(|pos| self.get_bit_at_position(pos, LAYER_IN_USE_MAP))
    }
}
