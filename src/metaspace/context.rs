use std::fmt;
use std::sync::Arc;

use enum_map::EnumMap;
use spin::Mutex;

use super::address::{MetaWord, MetaWordPtr, NodeId};
use super::chunk_index::{ChunkSizes, MetadataType};
use super::chunk_manager::ChunkManager;
use super::metachunk::Metachunk;
use super::virtual_space_list::VirtualSpaceList;
use super::virtual_space_node::VirtualSpaceNode;
use crate::util::options::Options;

/// Returned when neither the free pool nor the virtual space list can provide a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkAllocFail {
    pub mdtype: MetadataType,
    pub word_size: usize,
}

impl fmt::Display for ChunkAllocFail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "out of {:?} metaspace: cannot allocate a chunk of {} words",
            self.mdtype, self.word_size
        )
    }
}

impl std::error::Error for ChunkAllocFail {}

/// The free pool and the nodes of one metadata type. Guarded by one lock.
struct MetaspaceSpace {
    vsl: VirtualSpaceList,
    chunk_manager: ChunkManager,
}

/// The allocator context: the chunk pools and virtual space lists of the class and the
/// non-class metaspace, built from explicit [`Options`].
///
/// Chunk allocation and return take the lock of the metadata type. Allocation inside a
/// chunk needs no lock, as the chunk is owned by its user.
pub struct MetaspaceContext {
    options: Options,
    spaces: EnumMap<MetadataType, Mutex<MetaspaceSpace>>,
}

impl MetaspaceContext {
    pub fn new(options: Options) -> Self {
        let spaces = EnumMap::from_fn(|mdtype: MetadataType| {
            let vsl = VirtualSpaceList::new(mdtype, &options);
            let chunk_manager =
                ChunkManager::new(mdtype.is_class(), *vsl.chunk_sizes(), options.verify_metaspace);
            Mutex::new(MetaspaceSpace { vsl, chunk_manager })
        });
        info!(
            "Initialized metaspace context (verify: {})",
            options.verify_metaspace
        );
        MetaspaceContext { options, spaces }
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn chunk_sizes(&self, mdtype: MetadataType) -> ChunkSizes {
        *self.spaces[mdtype].lock().vsl.chunk_sizes()
    }

    /// Get a chunk of `word_size` words for the metadata type: from the free pool if it
    /// has one, otherwise carved from the virtual space list.
    pub fn allocate_chunk(
        &self,
        mdtype: MetadataType,
        word_size: usize,
    ) -> Result<Metachunk, ChunkAllocFail> {
        let mut space = self.spaces[mdtype].lock();
        let space = &mut *space;
        assert!(
            space.vsl.chunk_sizes().is_valid_chunk_size(word_size),
            "Invalid chunk word size {} for {:?} metaspace",
            word_size,
            mdtype
        );
        let chunk = match space.chunk_manager.free_chunks_get(word_size, &space.vsl) {
            Some(chunk) => Some(chunk),
            None => space.vsl.get_new_chunk(
                word_size,
                self.options.commit_granule_words,
                &mut space.chunk_manager,
            ),
        };
        match chunk {
            Some(mut chunk) => {
                chunk.inc_use_count();
                debug!("Allocated {}", chunk);
                Ok(chunk)
            }
            None => {
                warn!(
                    "Chunk allocation of {} words failed. {}",
                    word_size, space.chunk_manager
                );
                Err(ChunkAllocFail { mdtype, word_size })
            }
        }
    }

    /// Hand a chunk back to the free pool of its metadata type.
    pub fn return_chunk(&self, chunk: Metachunk) {
        let mdtype = chunk.container().mdtype();
        let mut space = self.spaces[mdtype].lock();
        let space = &mut *space;
        let Some(node) = space.vsl.node(chunk.container()) else {
            panic!("Chunk {} returned after its node was purged", chunk);
        };
        space.chunk_manager.return_single_chunk(node, chunk);
    }

    /// The node with the given handle, if it has not been purged.
    pub fn node(&self, id: NodeId) -> Option<Arc<VirtualSpaceNode>> {
        self.spaces[id.mdtype()].lock().vsl.node(id).cloned()
    }

    fn node_of(&self, chunk: &Metachunk) -> Arc<VirtualSpaceNode> {
        match self.node(chunk.container()) {
            Some(node) => node,
            None => panic!("Chunk {} refers to a purged node", chunk),
        }
    }

    fn check_chunk_access(chunk: &Metachunk, p: MetaWordPtr, len: usize) {
        assert!(
            p.node() == chunk.container()
                && p.offset() >= chunk.initial_top().offset()
                && p.offset() + len <= chunk.top().offset(),
            "Access to {} words at {} is outside of the allocated part of {}",
            len,
            p,
            chunk
        );
    }

    /// Read `len` words at `p`, which must lie in the allocated part of `chunk`.
    pub fn read_words(&self, chunk: &Metachunk, p: MetaWordPtr, len: usize) -> Vec<MetaWord> {
        Self::check_chunk_access(chunk, p, len);
        self.node_of(chunk).read_words(p, len)
    }

    /// Write `data` at `p`, which must lie in the allocated part of `chunk`.
    pub fn write_words(&self, chunk: &Metachunk, p: MetaWordPtr, data: &[MetaWord]) {
        Self::check_chunk_access(chunk, p, data.len());
        self.node_of(chunk).write_words(p, data)
    }

    /// Remove the nodes of the metadata type that have no chunk in use.
    pub fn purge(&self, mdtype: MetadataType) -> usize {
        let mut space = self.spaces[mdtype].lock();
        let space = &mut *space;
        let purged = space.vsl.purge(&mut space.chunk_manager);
        if purged > 0 {
            info!("Purged {} {:?} nodes. {}", purged, mdtype, space.chunk_manager);
        }
        purged
    }

    pub fn free_chunks_total_words(&self, mdtype: MetadataType) -> usize {
        self.spaces[mdtype].lock().chunk_manager.free_chunks_total_words()
    }

    pub fn free_chunks_count(&self, mdtype: MetadataType) -> usize {
        self.spaces[mdtype].lock().chunk_manager.free_chunks_count()
    }

    pub fn reserved_words(&self, mdtype: MetadataType) -> usize {
        self.spaces[mdtype].lock().vsl.reserved_words()
    }

    pub fn committed_words(&self, mdtype: MetadataType) -> usize {
        self.spaces[mdtype].lock().vsl.committed_words()
    }

    pub fn virtual_space_count(&self, mdtype: MetadataType) -> usize {
        self.spaces[mdtype].lock().vsl.virtual_space_count()
    }

    /// Verify both metadata types: the free pools, every free chunk against its node, and
    /// every node.
    pub fn verify(&self) {
        for (_, space) in self.spaces.iter() {
            let space = space.lock();
            space.chunk_manager.verify();
            for chunk in space.chunk_manager.iter_free_chunks() {
                match space.vsl.node(chunk.container()) {
                    Some(node) => node.verify_chunk(chunk),
                    None => panic!("Free chunk {} refers to a purged node", chunk),
                }
            }
            space.vsl.verify();
        }
    }
}

/// Mark a chunk in use or free, keeping its node's occupancy map in step.
pub fn do_update_in_use_info_for_chunk(
    context: &MetaspaceContext,
    chunk: &mut Metachunk,
    inuse: bool,
) {
    context.node_of(chunk).update_in_use_info_for_chunk(chunk, inuse);
}

/// Verify a chunk and cross-check it with its node's occupancy map.
pub fn do_verify_chunk(context: &MetaspaceContext, chunk: &Metachunk) {
    context.node_of(chunk).verify_chunk(chunk);
}
