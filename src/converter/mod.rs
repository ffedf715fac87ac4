//! Converters for extracting images from the dyld shared cache.
//!
//! The conversion steps reverse the optimizations applied by Apple's
//! SharedCacheBuilder. The LINKEDIT reconstructor is the load-bearing one:
//! a raw dump of an in-cache image references coalesced cache-wide tables
//! and is not a standalone Mach-O until its LINKEDIT is rebuilt.

pub mod linkedit;

pub use linkedit::{
    audit_load_commands, reconstruct_for_width, reconstruct_linkedit, LinkeditReconstruction,
    LinkeditTracker, RecoveredLocals, StringPool, TrackedRegion,
};
