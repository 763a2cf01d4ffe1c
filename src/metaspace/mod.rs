//! Chunk-granularity metadata space.
//!
//! Metadata is bump-allocated in [`Metachunk`]s. Chunks come in four size classes and are
//! carved from [`VirtualSpaceNode`]s, which are committed incrementally and track chunk
//! starts and in-use granules in an [`OccupancyMap`]. Free chunks are pooled per metadata
//! type by a [`ChunkManager`], which splits and merges them so that free space stays as
//! coalesced as possible. [`MetaspaceContext`] is the entry point.

mod address;
mod chunk_index;
mod chunk_manager;
mod context;
mod metachunk;
mod occupancy_map;
mod virtual_space_list;
mod virtual_space_node;

pub use address::{MetaWord, MetaWordPtr, NodeId};
pub use chunk_index::{chunk_size_name, ChunkIndex, ChunkOrigin, ChunkSizes, MetadataType};
pub use chunk_manager::ChunkManager;
pub use context::{do_update_in_use_info_for_chunk, do_verify_chunk, ChunkAllocFail, MetaspaceContext};
pub use metachunk::{ChunkHeader, Metachunk, CHUNK_SENTINEL, CHUNK_SENTINEL_INVALID};
pub use occupancy_map::OccupancyMap;
pub use virtual_space_list::VirtualSpaceList;
pub use virtual_space_node::VirtualSpaceNode;
