use enum_map::Enum;
use strum_macros::{EnumIter, FromRepr, IntoStaticStr};

use super::Metachunk;
use crate::util::conversions::align_up_to;
use crate::util::options::Options;

/// The two kinds of metadata. Class space holds compressed class structures and is a
/// single node; the non-class space grows by reserving more nodes.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Enum, EnumIter)]
pub enum MetadataType {
    NonClass,
    Class,
}

impl MetadataType {
    pub fn is_class(self) -> bool {
        self == MetadataType::Class
    }

    pub fn from_is_class(is_class: bool) -> Self {
        if is_class {
            MetadataType::Class
        } else {
            MetadataType::NonClass
        }
    }
}

/// Chunk size classes. All but `Humongous` have a fixed size per metadata type.
#[repr(u8)]
#[derive(
    Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Enum, EnumIter, FromRepr, IntoStaticStr,
)]
#[strum(serialize_all = "lowercase")]
pub enum ChunkIndex {
    Specialized = 0,
    Small = 1,
    Medium = 2,
    Humongous = 3,
}

impl ChunkIndex {
    /// The number of free lists kept by a chunk manager (one per non-humongous size class).
    pub const NUMBER_OF_FREE_LISTS: usize = 3;
    /// Non-humongous chunk types from the smallest to the largest.
    pub const NON_HUMONGOUS: [ChunkIndex; 3] =
        [ChunkIndex::Specialized, ChunkIndex::Small, ChunkIndex::Medium];

    pub fn is_humongous(self) -> bool {
        self == ChunkIndex::Humongous
    }

    pub fn next(self) -> Option<ChunkIndex> {
        ChunkIndex::from_repr(self as u8 + 1)
    }

    pub fn prev(self) -> Option<ChunkIndex> {
        (self as u8).checked_sub(1).and_then(ChunkIndex::from_repr)
    }

    /// Index of the free list for a non-humongous type.
    pub fn free_list_index(self) -> usize {
        debug_assert!(!self.is_humongous());
        self as usize
    }
}

/// Returns a descriptive name for the given chunk type.
pub fn chunk_size_name(index: ChunkIndex) -> &'static str {
    index.into()
}

/// Where a chunk came from. Kept in the chunk header for diagnostics.
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, FromRepr, IntoStaticStr)]
#[strum(serialize_all = "lowercase")]
pub enum ChunkOrigin {
    /// Handed out to a metadata user.
    Normal = 1,
    /// Freshly carved from a node's committed space.
    VirtualSpace = 2,
    /// Carved from the tail of a retired node.
    Leftover = 3,
    /// Inserted in front of a larger chunk to get the larger chunk aligned.
    Pad = 4,
    /// Result of coalescing free neighbours.
    Merge = 5,
    /// Remainder of splitting a larger free chunk.
    Split = 6,
}

impl ChunkOrigin {
    pub const MINIMUM: u8 = ChunkOrigin::Normal as u8;
    pub const MAXIMUM: u8 = ChunkOrigin::Split as u8;

    pub fn is_valid(code: u8) -> bool {
        (Self::MINIMUM..=Self::MAXIMUM).contains(&code)
    }
}

/// The word sizes of the non-humongous chunk types of one metadata type.
///
/// Sizes need not be powers of two, but each size must be a multiple of the next smaller
/// one so that a larger chunk can always be split into (and merged from) smaller aligned
/// chunks. The specialized size is the granule of the occupancy map.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ChunkSizes {
    specialized: usize,
    small: usize,
    medium: usize,
}

impl ChunkSizes {
    pub fn new(specialized: usize, small: usize, medium: usize) -> Self {
        assert!(
            specialized > Metachunk::overhead(),
            "Specialized chunk size {} cannot hold the chunk header",
            specialized
        );
        assert!(
            specialized < small && small < medium,
            "Chunk sizes must be strictly increasing: {} {} {}",
            specialized,
            small,
            medium
        );
        assert!(
            small % specialized == 0 && medium % small == 0,
            "Each chunk size must be a multiple of the next smaller one: {} {} {}",
            specialized,
            small,
            medium
        );
        Self {
            specialized,
            small,
            medium,
        }
    }

    pub fn from_options(options: &Options, mdtype: MetadataType) -> Self {
        match mdtype {
            MetadataType::NonClass => Self::new(
                options.specialized_chunk_words,
                options.small_chunk_words,
                options.medium_chunk_words,
            ),
            MetadataType::Class => Self::new(
                options.class_specialized_chunk_words,
                options.class_small_chunk_words,
                options.class_medium_chunk_words,
            ),
        }
    }

    pub fn specialized(&self) -> usize {
        self.specialized
    }

    pub fn small(&self) -> usize {
        self.small
    }

    pub fn medium(&self) -> usize {
        self.medium
    }

    /// The fixed size of a non-humongous chunk type.
    pub fn size_for_nonhumongous_chunktype(&self, index: ChunkIndex) -> usize {
        match index {
            ChunkIndex::Specialized => self.specialized,
            ChunkIndex::Small => self.small,
            ChunkIndex::Medium => self.medium,
            ChunkIndex::Humongous => panic!("Humongous chunks have no fixed size"),
        }
    }

    /// Chunk type of a valid chunk size. Any size that is not one of the fixed sizes must
    /// be a humongous size: larger than medium and a multiple of the specialized size.
    pub fn chunk_type_by_size(&self, word_size: usize) -> ChunkIndex {
        if word_size == self.specialized {
            ChunkIndex::Specialized
        } else if word_size == self.small {
            ChunkIndex::Small
        } else if word_size == self.medium {
            ChunkIndex::Medium
        } else {
            assert!(
                self.is_valid_humongous_size(word_size),
                "Invalid chunk word size {}",
                word_size
            );
            ChunkIndex::Humongous
        }
    }

    pub fn is_valid_humongous_size(&self, word_size: usize) -> bool {
        word_size > self.medium && word_size % self.specialized == 0
    }

    pub fn is_valid_chunk_size(&self, word_size: usize) -> bool {
        word_size == self.specialized
            || word_size == self.small
            || word_size == self.medium
            || self.is_valid_humongous_size(word_size)
    }

    /// Alignment (in words) of a chunk's start: its own size, or the specialized size for
    /// humongous chunks.
    pub fn required_alignment(&self, index: ChunkIndex, word_size: usize) -> usize {
        if index.is_humongous() {
            self.specialized
        } else {
            word_size
        }
    }

    /// The smallest chunk size that can hold `payload_words` words after the chunk header.
    pub fn chunk_word_size_for(&self, payload_words: usize) -> usize {
        let needed = payload_words + Metachunk::overhead();
        for index in ChunkIndex::NON_HUMONGOUS {
            let size = self.size_for_nonhumongous_chunktype(index);
            if needed <= size {
                return size;
            }
        }
        // Humongous sizes must be strictly larger than medium.
        align_up_to(needed.max(self.medium + 1), self.specialized)
    }
}
