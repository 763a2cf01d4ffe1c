use std::sync::Arc;

use super::address::{MetaWordPtr, NodeId};
use super::chunk_index::{ChunkSizes, MetadataType};
use super::chunk_manager::ChunkManager;
use super::metachunk::Metachunk;
use super::virtual_space_node::VirtualSpaceNode;
use crate::util::conversions::{align_up_to, is_aligned_to};
use crate::util::options::Options;

/// The nodes of one metadata type, oldest first. Chunks are carved from the last node,
/// the current one.
///
/// The non-class list reserves a new node whenever the current node is exhausted, as long
/// as the total reservation stays within the reserve limit. The class list consists of a
/// single node.
pub struct VirtualSpaceList {
    mdtype: MetadataType,
    sizes: ChunkSizes,
    verify: bool,
    nodes: Vec<Arc<VirtualSpaceNode>>,
    next_node_index: u32,
    node_words: usize,
    reserve_limit_words: usize,
    commit_granule_words: usize,
}

impl VirtualSpaceList {
    pub fn new(mdtype: MetadataType, options: &Options) -> Self {
        let sizes = ChunkSizes::from_options(options, mdtype);
        let commit_granule_words = options.commit_granule_words;
        assert!(
            is_aligned_to(commit_granule_words, sizes.specialized()),
            "Commit granule {} must be a multiple of the specialized chunk size {}",
            commit_granule_words,
            sizes.specialized()
        );
        let (node_words, reserve_limit_words) = match mdtype {
            MetadataType::NonClass => (
                align_up_to(options.virtual_space_node_words, commit_granule_words),
                options.max_metaspace_words,
            ),
            MetadataType::Class => {
                let words = align_up_to(options.class_space_words, commit_granule_words);
                (words, words)
            }
        };
        let mut vsl = VirtualSpaceList {
            mdtype,
            sizes,
            verify: options.verify_metaspace,
            nodes: vec![],
            next_node_index: 0,
            node_words,
            reserve_limit_words,
            commit_granule_words,
        };
        if !vsl.create_new_virtual_space(node_words) {
            warn!(
                "Could not reserve the initial {:?} node of {} words (limit {})",
                mdtype, node_words, reserve_limit_words
            );
        }
        vsl
    }

    pub fn is_class(&self) -> bool {
        self.mdtype.is_class()
    }

    pub fn chunk_sizes(&self) -> &ChunkSizes {
        &self.sizes
    }

    pub fn current_virtual_space(&self) -> Option<&Arc<VirtualSpaceNode>> {
        self.nodes.last()
    }

    pub fn node(&self, id: NodeId) -> Option<&Arc<VirtualSpaceNode>> {
        if id.mdtype() != self.mdtype {
            return None;
        }
        self.nodes
            .binary_search_by_key(&id.index(), |node| node.id().index())
            .ok()
            .map(|i| &self.nodes[i])
    }

    pub fn iter_nodes(&self) -> impl Iterator<Item = &Arc<VirtualSpaceNode>> {
        self.nodes.iter()
    }

    pub fn virtual_space_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn reserved_words(&self) -> usize {
        self.nodes.iter().map(|node| node.reserved_words()).sum()
    }

    pub fn committed_words(&self) -> usize {
        self.nodes.iter().map(|node| node.committed_words()).sum()
    }

    pub fn contains(&self, p: MetaWordPtr) -> bool {
        self.node(p.node()).is_some_and(|node| node.contains(p))
    }

    fn create_new_virtual_space(&mut self, word_size: usize) -> bool {
        if self.is_class() && !self.nodes.is_empty() {
            return false;
        }
        if self.reserved_words() + word_size > self.reserve_limit_words {
            debug!(
                "Cannot reserve a node of {} words: {} of {} words already reserved",
                word_size,
                self.reserved_words(),
                self.reserve_limit_words
            );
            return false;
        }
        let id = NodeId::new(self.mdtype, self.next_node_index);
        self.next_node_index += 1;
        self.nodes.push(Arc::new(VirtualSpaceNode::new(
            id,
            word_size,
            self.sizes,
            self.verify,
        )));
        true
    }

    fn retire_current_virtual_space(&self, chunk_manager: &mut ChunkManager) {
        if let Some(current) = self.current_virtual_space() {
            current.retire(chunk_manager);
        }
    }

    // Non-humongous chunks are aligned to their own size, so they may need up to their
    // size minus one specialized chunk of padding.
    fn largest_possible_padding_size_for_chunk(&self, chunk_word_size: usize) -> usize {
        if self.sizes.chunk_type_by_size(chunk_word_size).is_humongous() {
            0
        } else {
            chunk_word_size - self.sizes.specialized()
        }
    }

    fn allowed_expansion_words(&self) -> usize {
        self.reserve_limit_words
            .saturating_sub(self.committed_words())
    }

    /// Commit at least `min_words`, preferably `preferred_words`, either in the current
    /// node or, for the non-class list, in a new node after retiring the current one.
    pub fn expand_by(
        &mut self,
        min_words: usize,
        preferred_words: usize,
        chunk_manager: &mut ChunkManager,
    ) -> bool {
        let allowed = self.allowed_expansion_words();
        if allowed < min_words {
            debug!(
                "Cannot expand {:?} metaspace by {} words, only {} allowed",
                self.mdtype, min_words, allowed
            );
            return false;
        }
        let max_expansion_words = preferred_words.min(allowed);
        if let Some(current) = self.current_virtual_space() {
            if current.expand_by(min_words, max_expansion_words) {
                return true;
            }
        }
        // The class space cannot grow beyond its single node.
        if self.is_class() {
            return false;
        }
        self.retire_current_virtual_space(chunk_manager);
        let grow_words = align_up_to(self.node_words.max(preferred_words), self.commit_granule_words);
        if !self.create_new_virtual_space(grow_words) {
            return false;
        }
        self.current_virtual_space()
            .is_some_and(|current| current.expand_by(min_words, max_expansion_words))
    }

    /// Carve a new chunk from the current node, expanding the list if necessary.
    pub fn get_new_chunk(
        &mut self,
        chunk_word_size: usize,
        suggested_commit_granularity: usize,
        chunk_manager: &mut ChunkManager,
    ) -> Option<Metachunk> {
        if let Some(current) = self.current_virtual_space() {
            if let Some(chunk) = current.take_from_committed(chunk_word_size, chunk_manager) {
                return Some(chunk);
            }
        }
        // Commit enough for the chunk and any padding needed in front of it.
        let padding = self.largest_possible_padding_size_for_chunk(chunk_word_size);
        let min_words = align_up_to(chunk_word_size + padding, self.commit_granule_words);
        let preferred_words =
            align_up_to(suggested_commit_granularity, self.commit_granule_words).max(min_words);
        if !self.expand_by(min_words, preferred_words, chunk_manager) {
            return None;
        }
        let chunk = self
            .current_virtual_space()?
            .take_from_committed(chunk_word_size, chunk_manager);
        if chunk.is_none() {
            warn!(
                "Carving a chunk of {} words failed right after expansion",
                chunk_word_size
            );
        }
        chunk
    }

    /// Remove nodes that hold no chunk in use, except the current node, together with
    /// their free chunks. Returns the number of nodes removed.
    pub fn purge(&mut self, chunk_manager: &mut ChunkManager) -> usize {
        let current = self.current_virtual_space().map(|node| node.id());
        let mut purged = 0;
        self.nodes.retain(|node| {
            if node.container_count() == 0 && Some(node.id()) != current {
                info!(
                    "Purging node {} (capacity: {} words, used: {} words)",
                    node.id(),
                    node.committed_words(),
                    node.used_words_in_vs()
                );
                chunk_manager.remove_chunks_in_node(node.id());
                purged += 1;
                false
            } else {
                true
            }
        });
        purged
    }

    pub fn verify(&self) {
        for node in self.nodes.iter() {
            node.verify();
        }
        assert!(
            self.reserved_words() <= self.reserve_limit_words,
            "{:?} metaspace reserved {} words over the limit {}",
            self.mdtype,
            self.reserved_words(),
            self.reserve_limit_words
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::test_util::small_chunk_options;

    fn setup(mdtype: MetadataType) -> (VirtualSpaceList, ChunkManager, ChunkSizes) {
        crate::util::logger::init_for_test();
        let options = small_chunk_options();
        let vsl = VirtualSpaceList::new(mdtype, &options);
        let sizes = *vsl.chunk_sizes();
        let cm = ChunkManager::new(mdtype.is_class(), sizes, true);
        (vsl, cm, sizes)
    }

    #[test]
    fn test_initial_node_is_uncommitted() {
        let (vsl, _, _) = setup(MetadataType::NonClass);
        assert_eq!(vsl.virtual_space_count(), 1);
        assert_eq!(vsl.committed_words(), 0);
        assert_eq!(vsl.reserved_words(), small_chunk_options().virtual_space_node_words);
    }

    #[test]
    fn test_grows_into_new_node() {
        let (mut vsl, mut cm, sizes) = setup(MetadataType::NonClass);
        let node_words = small_chunk_options().virtual_space_node_words;
        let per_node = node_words / sizes.medium();
        let chunks: Vec<_> = (0..per_node + 1)
            .map(|_| vsl.get_new_chunk(sizes.medium(), 0, &mut cm).unwrap())
            .collect();
        assert_eq!(vsl.virtual_space_count(), 2);
        assert_ne!(chunks[0].container(), chunks[per_node].container());
        assert!(vsl.contains(chunks[0].bottom()));
        assert!(vsl.contains(chunks[per_node].bottom()));
        let ids: Vec<NodeId> = vsl.iter_nodes().map(|node| node.id()).collect();
        assert_eq!(ids, vec![chunks[0].container(), chunks[per_node].container()]);
        vsl.verify();
        cm.verify();
    }

    #[test]
    fn test_reserve_limit() {
        let (mut vsl, mut cm, sizes) = setup(MetadataType::NonClass);
        let options = small_chunk_options();
        let max_chunks = options.max_metaspace_words / sizes.medium();
        let mut chunks = vec![];
        while let Some(chunk) = vsl.get_new_chunk(sizes.medium(), 0, &mut cm) {
            chunks.push(chunk);
            assert!(chunks.len() <= max_chunks);
        }
        assert_eq!(chunks.len(), max_chunks);
        assert!(vsl.reserved_words() <= options.max_metaspace_words);
        vsl.verify();
    }

    #[test]
    fn test_class_space_is_single_node() {
        let (mut vsl, mut cm, sizes) = setup(MetadataType::Class);
        let class_words = small_chunk_options().class_space_words;
        let mut n = 0;
        while vsl.get_new_chunk(sizes.medium(), 0, &mut cm).is_some() {
            n += 1;
        }
        assert_eq!(n, class_words / sizes.medium());
        assert_eq!(vsl.virtual_space_count(), 1);
    }

    #[test]
    fn test_purge_removes_empty_nodes() {
        let (mut vsl, mut cm, sizes) = setup(MetadataType::NonClass);
        let node_words = small_chunk_options().virtual_space_node_words;
        let per_node = node_words / sizes.medium();
        let mut chunks: Vec<_> = (0..per_node + 1)
            .map(|_| vsl.get_new_chunk(sizes.medium(), 0, &mut cm).unwrap())
            .collect();
        let last = chunks.pop().unwrap();
        let first_node = chunks[0].container();
        for chunk in chunks {
            let node = vsl.node(chunk.container()).unwrap().clone();
            cm.return_single_chunk(&node, chunk);
        }
        assert_eq!(vsl.purge(&mut cm), 1);
        assert!(vsl.node(first_node).is_none());
        assert_eq!(vsl.virtual_space_count(), 1);
        assert_eq!(cm.free_chunks_count(), 0);
        // The current node is never purged, even when empty.
        let node = vsl.node(last.container()).unwrap().clone();
        cm.return_single_chunk(&node, last);
        assert_eq!(vsl.purge(&mut cm), 0);
        vsl.verify();
        cm.verify();
    }

    #[test]
    fn test_node_lookup_rejects_other_type() {
        let (vsl, _, _) = setup(MetadataType::NonClass);
        assert!(vsl.node(NodeId::new(MetadataType::NonClass, 0)).is_some());
        assert!(vsl.node(NodeId::new(MetadataType::Class, 0)).is_none());
        assert!(vsl.node(NodeId::new(MetadataType::NonClass, 7)).is_none());
    }
}
