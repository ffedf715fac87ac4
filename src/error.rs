//! Error types for the dyld cache extractor.
//!
//! This module provides error handling for all extraction operations,
//! including cache parsing, Mach-O processing, and LINKEDIT reconstruction.

use std::path::PathBuf;

use thiserror::Error;

/// The main error type for dyld cache extraction operations.
#[derive(Error, Debug)]
pub enum Error {
    // ==================== I/O Errors ====================
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to open file '{path}': {source}")]
    FileOpen {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to memory map file '{path}': {source}")]
    MemoryMap {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write output file '{path}': {source}")]
    FileWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ==================== Cache Format Errors ====================
    #[error("invalid dyld cache magic: expected 'dyld', got {0:?}")]
    InvalidMagic([u8; 4]),

    #[error("address {addr:#x} not found in any cache mapping")]
    AddressNotFound { addr: u64 },

    #[error("subcache file not found: {path}")]
    SubcacheNotFound { path: PathBuf },

    #[error("subcache UUID mismatch for '{path}': expected {expected}, got {actual}")]
    SubcacheUuidMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    // ==================== Mach-O Errors ====================
    #[error("invalid Mach-O magic: {0:#x}")]
    InvalidMachoMagic(u32),

    #[error("Mach-O segment '{name}' not found")]
    SegmentNotFound { name: String },

    #[error("Mach-O section '{segment},{section}' not found")]
    SectionNotFound { segment: String, section: String },

    #[error("load command at offset {offset:#x} extends beyond header")]
    LoadCommandOverflow { offset: usize },

    // ==================== Image Errors ====================
    #[error("image not found: {name}")]
    ImageNotFound { name: String },

    // ==================== Parse Errors ====================
    #[error("parse error at offset {offset:#x}: {reason}")]
    Parse { offset: usize, reason: String },

    #[error("buffer too small: need {needed} bytes, have {available}")]
    BufferTooSmall { needed: usize, available: usize },
}

/// A specialized Result type for dyld cache operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Creates a parse error with a formatted message.
    #[inline]
    pub fn parse(offset: usize, reason: impl Into<String>) -> Self {
        Error::Parse {
            offset,
            reason: reason.into(),
        }
    }

    /// Creates a buffer too small error.
    #[inline]
    pub fn buffer_too_small(needed: usize, available: usize) -> Self {
        Error::BufferTooSmall { needed, available }
    }
}
