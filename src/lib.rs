//! A chunk-granularity metadata allocator and a collection set candidate chooser.
//!
//! * [`metaspace`] carves coarse virtual space nodes into size-classed chunks, hands them
//!   out for bump allocation of metadata, and pools returned chunks per metadata type,
//!   merging free neighbours back into larger chunks.
//! * [`cset`] ranks old heap regions by the bytes that evacuating them would reclaim, and
//!   hands them out incrementally to mixed collections.
//!
//! Both are configured through [`util::options::Options`]. Nothing in this crate is global:
//! a [`MetaspaceContext`] or a [`CollectionSetChooser`] is created from options and passed
//! to whoever needs it.
//!
//! Logging goes through the `log` crate. Call [`util::logger::try_init`] to install the
//! built-in `env_logger`, or install your own logger.

#[macro_use]
extern crate log;

pub mod cset;
pub mod metaspace;
pub mod util;

pub use crate::cset::{CSetChooserParUpdater, CollectionSetChooser, HeapRegion};
pub use crate::metaspace::{ChunkAllocFail, Metachunk, MetadataType, MetaspaceContext};
pub use crate::util::options::Options;
