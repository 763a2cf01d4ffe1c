use std::collections::BTreeMap;
use std::fmt;

use super::address::NodeId;
use super::chunk_index::{chunk_size_name, ChunkIndex, ChunkSizes, MetadataType};
use super::metachunk::{ChunkHeader, Metachunk};
use super::virtual_space_list::VirtualSpaceList;
use super::virtual_space_node::VirtualSpaceNode;
use crate::util::constants::BAD_META_WORD_VAL;
use crate::util::conversions::align_down_to;

// Humongous chunks are kept ordered by size, so the first entry at or above a requested
// size is the best fit. The node and offset make the key unique.
type HumongousKey = (usize, NodeId, usize);

fn humongous_key(chunk: &Metachunk) -> HumongousKey {
    (chunk.word_size(), chunk.container(), chunk.bottom().offset())
}

// Free lists are keyed by location, so a chunk found by walking a node's headers can be
// unlinked directly. Taking from a list takes the lowest address.
type FreeListKey = (NodeId, usize);

fn free_list_key(chunk: &Metachunk) -> FreeListKey {
    (chunk.container(), chunk.bottom().offset())
}

/// The free pool of one metadata type.
///
/// Chunks of the three fixed sizes live in one free list each, ordered by node and offset;
/// humongous chunks live in a size-ordered dictionary. Returned chunks are merged with free
/// neighbours into larger chunks where possible, and larger chunks are split when a list
/// runs empty.
pub struct ChunkManager {
    is_class: bool,
    sizes: ChunkSizes,
    verify: bool,
    free_chunks: [BTreeMap<FreeListKey, Metachunk>; ChunkIndex::NUMBER_OF_FREE_LISTS],
    humongous_dictionary: BTreeMap<HumongousKey, Metachunk>,
    /// Sum of the word sizes of all free chunks.
    free_chunks_total: usize,
    free_chunks_count: usize,
    /// Free list entries looked at by area removals.
    #[cfg(test)]
    area_lookups: usize,
}

impl ChunkManager {
    pub fn new(is_class: bool, sizes: ChunkSizes, verify: bool) -> Self {
        ChunkManager {
            is_class,
            sizes,
            verify,
            free_chunks: Default::default(),
            humongous_dictionary: BTreeMap::new(),
            free_chunks_total: 0,
            free_chunks_count: 0,
            #[cfg(test)]
            area_lookups: 0,
        }
    }

    pub fn is_class(&self) -> bool {
        self.is_class
    }

    fn space_name(&self) -> &'static str {
        if self.is_class {
            "class space"
        } else {
            "metaspace"
        }
    }

    pub fn size_by_index(&self, index: ChunkIndex) -> usize {
        self.sizes.size_for_nonhumongous_chunktype(index)
    }

    pub fn free_chunks_total_words(&self) -> usize {
        self.free_chunks_total
    }

    pub fn free_chunks_count(&self) -> usize {
        self.free_chunks_count
    }

    pub fn num_free_chunks(&self, index: ChunkIndex) -> usize {
        if index.is_humongous() {
            self.humongous_dictionary.len()
        } else {
            self.free_chunks[index.free_list_index()].len()
        }
    }

    pub fn iter_free_chunks(&self) -> impl Iterator<Item = &Metachunk> {
        self.free_chunks
            .iter()
            .flat_map(|list| list.values())
            .chain(self.humongous_dictionary.values())
    }

    fn account_for_added_chunk(&mut self, chunk: &Metachunk) {
        self.free_chunks_total += chunk.word_size();
        self.free_chunks_count += 1;
    }

    fn account_for_removed_chunk(&mut self, chunk: &Metachunk) {
        debug_assert!(self.free_chunks_total >= chunk.word_size());
        debug_assert!(self.free_chunks_count > 0);
        self.free_chunks_total -= chunk.word_size();
        self.free_chunks_count -= 1;
    }

    fn node_of<'a>(vsl: &'a VirtualSpaceList, chunk: &Metachunk) -> &'a VirtualSpaceNode {
        match vsl.node(chunk.container()) {
            Some(node) => node,
            None => panic!("Chunk {} refers to a node that is not in the list", chunk),
        }
    }

    fn push_free(&mut self, chunk: Metachunk) {
        let index = chunk.get_chunk_type();
        if index.is_humongous() {
            self.humongous_dictionary.insert(humongous_key(&chunk), chunk);
        } else {
            self.free_chunks[index.free_list_index()].insert(free_list_key(&chunk), chunk);
        }
    }

    /// Take a free chunk of `word_size` words, or for humongous sizes the smallest free
    /// humongous chunk of at least that size. If the matching list is empty, the smallest
    /// available larger chunk is split. The chunk is marked in use before it is returned.
    pub fn free_chunks_get(
        &mut self,
        word_size: usize,
        vsl: &VirtualSpaceList,
    ) -> Option<Metachunk> {
        let index = self.sizes.chunk_type_by_size(word_size);
        let mut chunk = if !index.is_humongous() {
            if self.free_chunks[index.free_list_index()].is_empty() {
                self.split_larger_chunk(index, vsl)?;
            }
            self.free_chunks[index.free_list_index()].pop_first()?.1
        } else {
            let lowest = (word_size, NodeId::new(MetadataType::NonClass, 0), 0);
            let key = *self.humongous_dictionary.range(lowest..).next()?.0;
            self.humongous_dictionary.remove(&key)?
        };
        self.account_for_removed_chunk(&chunk);

        let node = Self::node_of(vsl, &chunk);
        node.update_in_use_info_for_chunk(&mut chunk, true);
        node.inc_container_count();
        trace!(
            "{}: took {} from the free pool, {} chunks left",
            self.space_name(),
            chunk,
            self.free_chunks_count
        );
        if self.verify {
            self.verify();
            node.verify();
        }
        Some(chunk)
    }

    /// Split the head of the next non-empty larger list so that the list for `target`
    /// holds a chunk. Returns `None` if there is no larger free chunk.
    fn split_larger_chunk(&mut self, target: ChunkIndex, vsl: &VirtualSpaceList) -> Option<()> {
        let mut larger_index = target.next();
        let larger = loop {
            match larger_index {
                Some(index) if !index.is_humongous() => {
                    let list = &mut self.free_chunks[index.free_list_index()];
                    if let Some((_, chunk)) = list.pop_first() {
                        break chunk;
                    }
                    larger_index = index.next();
                }
                _ => return None,
            }
        };
        debug!(
            "{}: splitting {} to get a {} chunk",
            self.space_name(),
            larger,
            chunk_size_name(target)
        );
        let node = Self::node_of(vsl, &larger);
        let (target_chunk, remainders) = node.split_free_chunk(larger, target);
        if self.verify {
            node.verify_chunk(&target_chunk);
        }
        // The target chunk takes the place of the split chunk in the counters.
        self.free_chunks_count += remainders.len();
        for chunk in remainders {
            if self.verify {
                node.verify_chunk(&chunk);
            }
            self.push_free(chunk);
        }
        self.push_free(target_chunk);
        Some(())
    }

    /// Put a chunk that is no longer used back into the free pool, then try to merge it
    /// with its free neighbours: into a medium chunk, or failing that, for a specialized
    /// chunk, into a small chunk.
    pub fn return_single_chunk(&mut self, node: &VirtualSpaceNode, mut chunk: Metachunk) {
        let index = chunk.get_chunk_type();
        assert_eq!(
            chunk.container(),
            node.id(),
            "Chunk {} returned with the wrong node",
            chunk
        );
        assert_eq!(chunk.is_class(), self.is_class, "Chunk {} returned to the wrong space", chunk);
        if self.verify {
            node.verify_chunk(&chunk);
        }
        assert!(!chunk.is_tagged_free(), "Chunk {} should be in use.", chunk);

        chunk.reset_empty();
        if self.verify {
            chunk.mangle(node, BAD_META_WORD_VAL);
        }
        node.dec_container_count();
        node.update_in_use_info_for_chunk(&mut chunk, false);
        self.account_for_added_chunk(&chunk);
        trace!("{}: returned {} to the free pool", self.space_name(), chunk);

        let start = chunk.bottom().offset();
        self.push_free(chunk);

        if matches!(index, ChunkIndex::Small | ChunkIndex::Specialized)
            && !self.attempt_to_coalesce_around_chunk(node, start, index, ChunkIndex::Medium)
            && index == ChunkIndex::Specialized
        {
            self.attempt_to_coalesce_around_chunk(node, start, index, ChunkIndex::Small);
        }
    }

    /// Merge the free chunks in the `target_type`-aligned area around the chunk at
    /// `chunk_start` into one chunk of `target_type`. Returns false if any chunk in the
    /// area is in use, a chunk straddles the area bounds or the area is not carved yet.
    fn attempt_to_coalesce_around_chunk(
        &mut self,
        node: &VirtualSpaceNode,
        chunk_start: usize,
        chunk_type: ChunkIndex,
        target_type: ChunkIndex,
    ) -> bool {
        assert!(
            (chunk_type == ChunkIndex::Specialized
                && matches!(target_type, ChunkIndex::Small | ChunkIndex::Medium))
                || (chunk_type == ChunkIndex::Small && target_type == ChunkIndex::Medium),
            "Invalid chunk merge combination."
        );
        let target_word_size = self.size_by_index(target_type);
        let area_start = align_down_to(chunk_start, target_word_size);
        if !node.can_coalesce(area_start, target_word_size) {
            return false;
        }
        trace!(
            "{}: coalescing chunks in area [{:#x}-{:#x}) of {}",
            self.space_name(),
            area_start,
            area_start + target_word_size,
            node.id()
        );
        let removed = self.remove_chunks_in_area(node, area_start, target_word_size);
        debug_assert_eq!(
            removed.iter().map(|c| c.word_size()).sum::<usize>(),
            target_word_size
        );
        let num_removed = removed.len();
        let merged = node.merge_free_chunks(area_start, target_type, removed);
        debug!("{}: created coalesced chunk {}", self.space_name(), merged);
        self.push_free(merged);
        // The free words stay the same, only the number of chunks changes.
        self.free_chunks_count = self.free_chunks_count + 1 - num_removed;
        if self.verify {
            self.verify();
            node.verify();
        }
        true
    }

    /// Unlink the free chunks in `[start, start + word_size)` of `node`, found by walking
    /// the chunk headers of the area.
    fn remove_chunks_in_area(
        &mut self,
        node: &VirtualSpaceNode,
        start: usize,
        word_size: usize,
    ) -> Vec<Metachunk> {
        node.chunk_headers_in_area(start, word_size)
            .into_iter()
            .map(|(offset, header)| self.remove_free_chunk(node.id(), offset, &header))
            .collect()
    }

    fn remove_free_chunk(
        &mut self,
        node_id: NodeId,
        offset: usize,
        header: &ChunkHeader,
    ) -> Metachunk {
        #[cfg(test)]
        {
            self.area_lookups += 1;
        }
        let removed = match header.chunk_type() {
            Some(index) if index.is_humongous() => self
                .humongous_dictionary
                .remove(&(header.word_size, node_id, offset)),
            Some(index) => self.free_chunks[index.free_list_index()].remove(&(node_id, offset)),
            None => None,
        };
        match removed {
            Some(chunk) => chunk,
            None => panic!(
                "{}: chunk at {:#x} in node {} is not in the free pool",
                self.space_name(),
                offset,
                node_id
            ),
        }
    }

    /// Drop all free chunks of a node that is about to be purged. Returns the number of
    /// chunks removed.
    pub fn remove_chunks_in_node(&mut self, node_id: NodeId) -> usize {
        let mut removed = vec![];
        for list in self.free_chunks.iter_mut() {
            let keys: Vec<FreeListKey> = list
                .range((node_id, 0)..=(node_id, usize::MAX))
                .map(|(key, _)| *key)
                .collect();
            for key in keys {
                if let Some(chunk) = list.remove(&key) {
                    removed.push(chunk);
                }
            }
        }
        let keys: Vec<HumongousKey> = self
            .humongous_dictionary
            .keys()
            .filter(|(_, id, _)| *id == node_id)
            .copied()
            .collect();
        for key in keys {
            if let Some(chunk) = self.humongous_dictionary.remove(&key) {
                removed.push(chunk);
            }
        }
        for chunk in removed.iter() {
            self.account_for_removed_chunk(chunk);
        }
        removed.len()
    }

    /// Check the free lists and the counters. Panics on any inconsistency.
    pub fn verify(&self) {
        let mut count = 0;
        let mut total = 0;
        for (list, expected) in self.free_chunks.iter().zip(ChunkIndex::NON_HUMONGOUS) {
            for (key, chunk) in list.iter() {
                assert_eq!(*key, free_list_key(chunk), "Free chunk {} under a wrong key", chunk);
                assert_eq!(
                    chunk.get_chunk_type(),
                    expected,
                    "Chunk {} is in the {} free list",
                    chunk,
                    chunk_size_name(expected)
                );
                self.verify_free_chunk(chunk);
                count += 1;
                total += chunk.word_size();
            }
        }
        for (key, chunk) in self.humongous_dictionary.iter() {
            assert_eq!(*key, humongous_key(chunk), "Humongous chunk {} under a wrong key", chunk);
            assert!(
                chunk.get_chunk_type().is_humongous(),
                "Chunk {} in the humongous dictionary",
                chunk
            );
            self.verify_free_chunk(chunk);
            count += 1;
            total += chunk.word_size();
        }
        assert_eq!(count, self.free_chunks_count, "{}: free chunk count mismatch", self.space_name());
        assert_eq!(total, self.free_chunks_total, "{}: free chunk total mismatch", self.space_name());
    }

    fn verify_free_chunk(&self, chunk: &Metachunk) {
        chunk.verify(&self.sizes);
        assert!(chunk.is_tagged_free(), "Chunk {} in the free pool is not free", chunk);
        assert_eq!(chunk.is_class(), self.is_class, "Chunk {} in the wrong space", chunk);
    }
}

impl fmt::Display for ChunkManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} free chunks:", self.space_name())?;
        for index in ChunkIndex::NON_HUMONGOUS {
            write!(f, " {} {},", chunk_size_name(index), self.num_free_chunks(index))?;
        }
        write!(
            f,
            " humongous {}, total {} chunks / {} words",
            self.humongous_dictionary.len(),
            self.free_chunks_count,
            self.free_chunks_total
        )
    }
}
