//! Dyld shared cache parsing.

pub mod context;
pub mod structs;

pub use context::{DyldContext, ImageEntry, MappingEntry, SubcacheFile};
pub use structs::*;
