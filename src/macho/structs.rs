//! Mach-O binary structures.
//!
//! These structures match the on-disk format of Mach-O files at both
//! pointer widths. All records are little-endian and zero-copy parseable.

use std::fmt;

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use super::constants::*;

// =============================================================================
// Header Structures
// =============================================================================

/// 64-bit Mach-O header.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct MachHeader64 {
    /// Magic number (MH_MAGIC_64)
    pub magic: u32,
    /// CPU type
    pub cputype: u32,
    /// CPU subtype
    pub cpusubtype: u32,
    /// File type
    pub filetype: u32,
    /// Number of load commands
    pub ncmds: u32,
    /// Size of load commands
    pub sizeofcmds: u32,
    /// Flags
    pub flags: u32,
    /// Reserved
    pub reserved: u32,
}

impl MachHeader64 {
    /// Size of the header in bytes.
    pub const SIZE: usize = 32;
}

/// 32-bit Mach-O header.
///
/// Identical to [`MachHeader64`] minus the trailing `reserved` field;
/// the shared leading fields sit at the same offsets at both widths.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct MachHeader32 {
    /// Magic number (MH_MAGIC)
    pub magic: u32,
    /// CPU type
    pub cputype: u32,
    /// CPU subtype
    pub cpusubtype: u32,
    /// File type
    pub filetype: u32,
    /// Number of load commands
    pub ncmds: u32,
    /// Size of load commands
    pub sizeofcmds: u32,
    /// Flags
    pub flags: u32,
}

impl MachHeader32 {
    /// Size of the header in bytes.
    pub const SIZE: usize = 28;
}

// =============================================================================
// Load Command Header
// =============================================================================

/// Generic load command header.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct LoadCommand {
    /// Type of load command
    pub cmd: u32,
    /// Size of load command
    pub cmdsize: u32,
}

impl LoadCommand {
    /// Size of the load command header.
    pub const SIZE: usize = 8;
}

// =============================================================================
// Segment Commands
// =============================================================================

/// 64-bit segment command.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct SegmentCommand64 {
    /// LC_SEGMENT_64
    pub cmd: u32,
    /// Size of this load command
    pub cmdsize: u32,
    /// Segment name (16 bytes, null-padded)
    pub segname: [u8; 16],
    /// Virtual memory address
    pub vmaddr: u64,
    /// Virtual memory size
    pub vmsize: u64,
    /// File offset
    pub fileoff: u64,
    /// Amount of file to map
    pub filesize: u64,
    /// Maximum VM protection
    pub maxprot: u32,
    /// Initial VM protection
    pub initprot: u32,
    /// Number of sections
    pub nsects: u32,
    /// Flags
    pub flags: u32,
}

impl SegmentCommand64 {
    /// Size of the segment command (without sections).
    pub const SIZE: usize = 72;
}

/// 32-bit segment command.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct SegmentCommand32 {
    /// LC_SEGMENT
    pub cmd: u32,
    /// Size of this load command
    pub cmdsize: u32,
    /// Segment name (16 bytes, null-padded)
    pub segname: [u8; 16],
    /// Virtual memory address
    pub vmaddr: u32,
    /// Virtual memory size
    pub vmsize: u32,
    /// File offset
    pub fileoff: u32,
    /// Amount of file to map
    pub filesize: u32,
    /// Maximum VM protection
    pub maxprot: u32,
    /// Initial VM protection
    pub initprot: u32,
    /// Number of sections
    pub nsects: u32,
    /// Flags
    pub flags: u32,
}

impl SegmentCommand32 {
    /// Size of the segment command (without sections).
    pub const SIZE: usize = 56;
}

// =============================================================================
// Sections
// =============================================================================

/// 64-bit section.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct Section64 {
    /// Section name (16 bytes, null-padded)
    pub sectname: [u8; 16],
    /// Segment name (16 bytes, null-padded)
    pub segname: [u8; 16],
    /// Virtual memory address
    pub addr: u64,
    /// Size in bytes
    pub size: u64,
    /// File offset
    pub offset: u32,
    /// Alignment (power of 2)
    pub align: u32,
    /// File offset of relocation entries
    pub reloff: u32,
    /// Number of relocation entries
    pub nreloc: u32,
    /// Flags
    pub flags: u32,
    /// Reserved (for runtime use)
    pub reserved1: u32,
    /// Reserved (for runtime use)
    pub reserved2: u32,
    /// Reserved
    pub reserved3: u32,
}

impl Section64 {
    /// Size of a section entry.
    pub const SIZE: usize = 80;
}

/// 32-bit section.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct Section32 {
    /// Section name (16 bytes, null-padded)
    pub sectname: [u8; 16],
    /// Segment name (16 bytes, null-padded)
    pub segname: [u8; 16],
    /// Virtual memory address
    pub addr: u32,
    /// Size in bytes
    pub size: u32,
    /// File offset
    pub offset: u32,
    /// Alignment (power of 2)
    pub align: u32,
    /// File offset of relocation entries
    pub reloff: u32,
    /// Number of relocation entries
    pub nreloc: u32,
    /// Flags
    pub flags: u32,
    /// Reserved (for runtime use)
    pub reserved1: u32,
    /// Reserved (for runtime use)
    pub reserved2: u32,
}

impl Section32 {
    /// Size of a section entry.
    pub const SIZE: usize = 68;
}

// =============================================================================
// Symbol Table Commands
// =============================================================================

/// Symbol table command.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct SymtabCommand {
    /// LC_SYMTAB
    pub cmd: u32,
    /// Size of this load command
    pub cmdsize: u32,
    /// Symbol table offset
    pub symoff: u32,
    /// Number of symbol table entries
    pub nsyms: u32,
    /// String table offset
    pub stroff: u32,
    /// String table size in bytes
    pub strsize: u32,
}

impl SymtabCommand {
    /// Size of this command.
    pub const SIZE: usize = 24;
}

impl Default for SymtabCommand {
    fn default() -> Self {
        Self {
            cmd: LC_SYMTAB,
            cmdsize: Self::SIZE as u32,
            symoff: 0,
            nsyms: 0,
            stroff: 0,
            strsize: 0,
        }
    }
}

/// Dynamic symbol table command.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct DysymtabCommand {
    /// LC_DYSYMTAB
    pub cmd: u32,
    /// Size of this load command
    pub cmdsize: u32,
    /// Index of local symbols
    pub ilocalsym: u32,
    /// Number of local symbols
    pub nlocalsym: u32,
    /// Index of externally defined symbols
    pub iextdefsym: u32,
    /// Number of externally defined symbols
    pub nextdefsym: u32,
    /// Index of undefined symbols
    pub iundefsym: u32,
    /// Number of undefined symbols
    pub nundefsym: u32,
    /// File offset to table of contents
    pub tocoff: u32,
    /// Number of entries in table of contents
    pub ntoc: u32,
    /// File offset to module table
    pub modtaboff: u32,
    /// Number of module table entries
    pub nmodtab: u32,
    /// Offset to referenced symbol table
    pub extrefsymoff: u32,
    /// Number of referenced symbol table entries
    pub nextrefsyms: u32,
    /// File offset to the indirect symbol table
    pub indirectsymoff: u32,
    /// Number of indirect symbol table entries
    pub nindirectsyms: u32,
    /// Offset to external relocation entries
    pub extreloff: u32,
    /// Number of external relocation entries
    pub nextrel: u32,
    /// Offset to local relocation entries
    pub locreloff: u32,
    /// Number of local relocation entries
    pub nlocrel: u32,
}

impl DysymtabCommand {
    /// Size of this command.
    pub const SIZE: usize = 80;
}

impl Default for DysymtabCommand {
    fn default() -> Self {
        Self {
            cmd: LC_DYSYMTAB,
            cmdsize: Self::SIZE as u32,
            ilocalsym: 0,
            nlocalsym: 0,
            iextdefsym: 0,
            nextdefsym: 0,
            iundefsym: 0,
            nundefsym: 0,
            tocoff: 0,
            ntoc: 0,
            modtaboff: 0,
            nmodtab: 0,
            extrefsymoff: 0,
            nextrefsyms: 0,
            indirectsymoff: 0,
            nindirectsyms: 0,
            extreloff: 0,
            nextrel: 0,
            locreloff: 0,
            nlocrel: 0,
        }
    }
}

// =============================================================================
// Symbol Records
// =============================================================================

/// 64-bit symbol table entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct Nlist64 {
    /// Index into string table
    pub n_strx: u32,
    /// Type flag
    pub n_type: u8,
    /// Section number or NO_SECT
    pub n_sect: u8,
    /// Flags (see <mach-o/stab.h>)
    pub n_desc: u16,
    /// Value
    pub n_value: u64,
}

impl Nlist64 {
    /// Size of an nlist entry.
    pub const SIZE: usize = 16;
}

/// 32-bit symbol table entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct Nlist32 {
    /// Index into string table
    pub n_strx: u32,
    /// Type flag
    pub n_type: u8,
    /// Section number or NO_SECT
    pub n_sect: u8,
    /// Flags (see <mach-o/stab.h>)
    pub n_desc: u16,
    /// Value
    pub n_value: u32,
}

impl Nlist32 {
    /// Size of an nlist entry.
    pub const SIZE: usize = 12;
}

// =============================================================================
// Dyld Info Command
// =============================================================================

/// Dyld info command (compressed LINKEDIT information).
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct DyldInfoCommand {
    /// LC_DYLD_INFO or LC_DYLD_INFO_ONLY
    pub cmd: u32,
    /// Size of this load command
    pub cmdsize: u32,
    /// File offset to rebase info
    pub rebase_off: u32,
    /// Size of rebase info
    pub rebase_size: u32,
    /// File offset to binding info
    pub bind_off: u32,
    /// Size of binding info
    pub bind_size: u32,
    /// File offset to weak binding info
    pub weak_bind_off: u32,
    /// Size of weak binding info
    pub weak_bind_size: u32,
    /// File offset to lazy binding info
    pub lazy_bind_off: u32,
    /// Size of lazy binding info
    pub lazy_bind_size: u32,
    /// File offset to export info
    pub export_off: u32,
    /// Size of export info
    pub export_size: u32,
}

impl DyldInfoCommand {
    /// Size of this command.
    pub const SIZE: usize = 48;
}

impl Default for DyldInfoCommand {
    fn default() -> Self {
        Self {
            cmd: LC_DYLD_INFO_ONLY,
            cmdsize: Self::SIZE as u32,
            rebase_off: 0,
            rebase_size: 0,
            bind_off: 0,
            bind_size: 0,
            weak_bind_off: 0,
            weak_bind_size: 0,
            lazy_bind_off: 0,
            lazy_bind_size: 0,
            export_off: 0,
            export_size: 0,
        }
    }
}

// =============================================================================
// Linkedit Data Command
// =============================================================================

/// Generic linkedit data command.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct LinkeditDataCommand {
    /// Command type (LC_FUNCTION_STARTS, LC_DATA_IN_CODE, etc.)
    pub cmd: u32,
    /// Size of this load command
    pub cmdsize: u32,
    /// File offset
    pub dataoff: u32,
    /// Size
    pub datasize: u32,
}

impl LinkeditDataCommand {
    /// Size of this command.
    pub const SIZE: usize = 16;
}

impl Default for LinkeditDataCommand {
    fn default() -> Self {
        Self {
            cmd: 0,
            cmdsize: Self::SIZE as u32,
            dataoff: 0,
            datasize: 0,
        }
    }
}

// =============================================================================
// Display Implementations
// =============================================================================

impl fmt::Display for SymtabCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Symtab {{ symoff: {:#x}, nsyms: {}, stroff: {:#x}, strsize: {:#x} }}",
            self.symoff, self.nsyms, self.stroff, self.strsize
        )
    }
}

/// Returns a segment or section name as a string slice.
pub fn name_str(name: &[u8; 16]) -> &str {
    let end = name.iter().position(|&b| b == 0).unwrap_or(16);
    std::str::from_utf8(&name[..end]).unwrap_or("")
}

/// Fills a 16-byte name field from a string, truncating if needed.
pub fn set_name(field: &mut [u8; 16], name: &str) {
    *field = [0u8; 16];
    let bytes = name.as_bytes();
    let len = bytes.len().min(16);
    field[..len].copy_from_slice(&bytes[..len]);
}
