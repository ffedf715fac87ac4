//! Pointer-width abstraction over the Mach-O record layouts.
//!
//! The shared cache carries 64-bit images on every modern platform, but the
//! format itself is dual-width and watchOS caches shipped 32-bit images for
//! years. Everything that touches raw records is parameterized by
//! [`PointerWidth`] so the exact same reconstruction logic is monomorphized
//! once per width; the width is fixed per image and selected from the magic.

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use super::structs::{
    MachHeader32, MachHeader64, Nlist32, Nlist64, Section32, Section64, SegmentCommand32,
    SegmentCommand64,
};

/// A fixed-size symbol table record at some pointer width.
pub trait NlistRecord:
    FromBytes + IntoBytes + KnownLayout + Immutable + Copy + Default + 'static
{
    /// Size of the record in bytes.
    const SIZE: usize;

    /// Returns the string table index.
    fn strx(&self) -> u32;

    /// Sets the string table index.
    fn set_strx(&mut self, strx: u32);

    /// Returns the type flag.
    fn n_type(&self) -> u8;

    /// Sets the type flag.
    fn set_n_type(&mut self, n_type: u8);
}

impl NlistRecord for Nlist64 {
    const SIZE: usize = Nlist64::SIZE;

    #[inline]
    fn strx(&self) -> u32 {
        self.n_strx
    }

    #[inline]
    fn set_strx(&mut self, strx: u32) {
        self.n_strx = strx;
    }

    #[inline]
    fn n_type(&self) -> u8 {
        self.n_type
    }

    #[inline]
    fn set_n_type(&mut self, n_type: u8) {
        self.n_type = n_type;
    }
}

impl NlistRecord for Nlist32 {
    const SIZE: usize = Nlist32::SIZE;

    #[inline]
    fn strx(&self) -> u32 {
        self.n_strx
    }

    #[inline]
    fn set_strx(&mut self, strx: u32) {
        self.n_strx = strx;
    }

    #[inline]
    fn n_type(&self) -> u8 {
        self.n_type
    }

    #[inline]
    fn set_n_type(&mut self, n_type: u8) {
        self.n_type = n_type;
    }
}

/// Compile-time selector for the 32- or 64-bit Mach-O record layouts.
///
/// Supplies the record sizes and the integer type used for `vmaddr`/`vmsize`
/// at that width. There is no runtime dispatch per record; callers
/// monomorphize over [`Pointer32`] or [`Pointer64`] once per image.
pub trait PointerWidth: Copy + Send + Sync + 'static {
    /// Integer type of `vmaddr`/`vmsize` fields.
    type Addr: Copy + Into<u64> + TryFrom<u64>;

    /// Concrete nlist record type.
    type Nlist: NlistRecord;

    /// Pointer width in bytes (4 or 8).
    const WIDTH: usize;
    /// Size of `mach_header` at this width.
    const HEADER_SIZE: usize;
    /// Size of `segment_command` at this width.
    const SEGMENT_COMMAND_SIZE: usize;
    /// Size of `section` at this width.
    const SECTION_SIZE: usize;
    /// Size of `nlist` at this width.
    const NLIST_SIZE: usize;
}

/// 32-bit Mach-O record layouts.
#[derive(Debug, Clone, Copy)]
pub struct Pointer32;

/// 64-bit Mach-O record layouts.
#[derive(Debug, Clone, Copy)]
pub struct Pointer64;

impl PointerWidth for Pointer32 {
    type Addr = u32;
    type Nlist = Nlist32;

    const WIDTH: usize = 4;
    const HEADER_SIZE: usize = MachHeader32::SIZE;
    const SEGMENT_COMMAND_SIZE: usize = SegmentCommand32::SIZE;
    const SECTION_SIZE: usize = Section32::SIZE;
    const NLIST_SIZE: usize = Nlist32::SIZE;
}

impl PointerWidth for Pointer64 {
    type Addr = u64;
    type Nlist = Nlist64;

    const WIDTH: usize = 8;
    const HEADER_SIZE: usize = MachHeader64::SIZE;
    const SEGMENT_COMMAND_SIZE: usize = SegmentCommand64::SIZE;
    const SECTION_SIZE: usize = Section64::SIZE;
    const NLIST_SIZE: usize = Nlist64::SIZE;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_sizes() {
        assert_eq!(Pointer32::HEADER_SIZE, 28);
        assert_eq!(Pointer64::HEADER_SIZE, 32);
        assert_eq!(Pointer32::SEGMENT_COMMAND_SIZE, 56);
        assert_eq!(Pointer64::SEGMENT_COMMAND_SIZE, 72);
        assert_eq!(Pointer32::NLIST_SIZE, 12);
        assert_eq!(Pointer64::NLIST_SIZE, 16);
    }

    #[test]
    fn test_nlist_accessors() {
        let mut n = Nlist64::default();
        n.set_strx(42);
        n.set_n_type(1);
        assert_eq!(n.strx(), 42);
        assert_eq!(n.n_type(), 1);

        let mut n = Nlist32::default();
        n.set_strx(7);
        assert_eq!(n.strx(), 7);
    }
}
