//! Resource slot allocation (§4.2).
//!
//! Two sibling stores per resource kind: a [`TransientRegistry`] whose whole generation is
//! invalidated at once on [`TransientRegistry::reset`], and a [`PersistentRegistry`] with a
//! chunked free-list and per-slot generations, reused the way `screen-13`'s `HashPool` caches
//! reuse backing resources across frames rather than recreating them.

mod persistent;
mod transient;

pub use persistent::{PersistentRegistry, PersistentSlotHandle};
pub use transient::TransientRegistry;
