use std::fmt;
use std::ops::Add;

use super::chunk_index::MetadataType;

/// A metadata word. All metaspace sizes and offsets are counted in words.
pub type MetaWord = usize;

/// Handle of a virtual space node. Chunks refer to their container through this
/// handle instead of a pointer, so nodes can be purged without dangling references.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId {
    mdtype: MetadataType,
    index: u32,
}

impl NodeId {
    pub const fn new(mdtype: MetadataType, index: u32) -> Self {
        Self { mdtype, index }
    }

    pub const fn mdtype(self) -> MetadataType {
        self.mdtype
    }

    pub const fn index(self) -> u32 {
        self.index
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let prefix = match self.mdtype {
            MetadataType::NonClass => "vsn",
            MetadataType::Class => "cvsn",
        };
        write!(f, "{}#{}", prefix, self.index)
    }
}

/// Location of a word inside a virtual space node: the node handle and the word
/// offset from the node's bottom.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MetaWordPtr {
    node: NodeId,
    offset: usize,
}

impl MetaWordPtr {
    pub const fn new(node: NodeId, offset: usize) -> Self {
        Self { node, offset }
    }

    pub const fn node(self) -> NodeId {
        self.node
    }

    /// Word offset from the bottom of the node.
    pub const fn offset(self) -> usize {
        self.offset
    }

    /// The distance in words from `other` to `self`. Both must be in the same node.
    pub fn delta(self, other: MetaWordPtr) -> usize {
        debug_assert_eq!(self.node, other.node);
        debug_assert!(self.offset >= other.offset);
        self.offset - other.offset
    }
}

impl Add<usize> for MetaWordPtr {
    type Output = MetaWordPtr;
    fn add(self, words: usize) -> MetaWordPtr {
        MetaWordPtr::new(self.node, self.offset + words)
    }
}

impl fmt::Display for MetaWordPtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}+{:#x}", self.node, self.offset)
    }
}
