//! LINKEDIT reconstruction.
//!
//! Rebuilds a self-contained `__LINKEDIT` segment for an image extracted
//! from the shared cache. The submodules split along the format's seams:
//!
//! - [`pool`] - deduplicating string pool for the new string table
//! - [`tracker`] - correlates LINKEDIT regions with load-command offset fields
//! - [`locals`] - recovery of redacted local symbols from the symbols subcache
//! - [`optimizer`] - the fixed copy/rebuild pass pipeline

pub mod locals;
pub mod optimizer;
pub mod pool;
pub mod tracker;

pub use locals::{recover_local_symbols, RecoveredLocals};
pub use optimizer::{
    audit_load_commands, reconstruct_for_width, reconstruct_linkedit, LinkeditReconstruction,
};
pub use pool::StringPool;
pub use tracker::{LinkeditTracker, TrackedRegion};
