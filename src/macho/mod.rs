//! Mach-O parsing and modification.

pub mod constants;
pub mod context;
pub mod structs;
pub mod width;

pub use constants::*;
pub use context::{LoadCommandInfo, MachoContext, SectionInfo, SegmentInfo};
pub use structs::*;
pub use width::{NlistRecord, Pointer32, Pointer64, PointerWidth};
