//! Selection of old regions for mixed collections.
//!
//! After marking, the old regions that are worth evacuating are collected into a
//! [`CollectionSetChooser`], either serially or by parallel workers that claim heap regions
//! through a [`HeapRegionClaimer`] and add candidates through a [`CSetChooserParUpdater`].
//! The sorted candidates are then taken from the chooser, most reclaimable first, by the
//! mixed collections that follow.

mod chooser;
mod claimer;
mod par_updater;
mod region;

pub use chooser::CollectionSetChooser;
pub use claimer::HeapRegionClaimer;
pub use par_updater::CSetChooserParUpdater;
pub use region::HeapRegion;
