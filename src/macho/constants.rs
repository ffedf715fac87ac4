//! Mach-O constants per the public loader.h contract.

// =============================================================================
// Magic Numbers
// =============================================================================

/// 32-bit Mach-O magic (little-endian)
pub const MH_MAGIC: u32 = 0xFEEDFACE;

/// 64-bit Mach-O magic (little-endian)
pub const MH_MAGIC_64: u32 = 0xFEEDFACF;

// =============================================================================
// File Types
// =============================================================================

/// Executable
pub const MH_EXECUTE: u32 = 0x2;
/// Dynamically bound shared library
pub const MH_DYLIB: u32 = 0x6;

// =============================================================================
// CPU Types
// =============================================================================

/// 64-bit architecture flag
pub const CPU_ARCH_ABI64: u32 = 0x0100_0000;

/// ARM CPU type
pub const CPU_TYPE_ARM: u32 = 12;
/// ARM64 CPU type
pub const CPU_TYPE_ARM64: u32 = CPU_TYPE_ARM | CPU_ARCH_ABI64;
/// x86 CPU type
pub const CPU_TYPE_X86: u32 = 7;
/// x86_64 CPU type
pub const CPU_TYPE_X86_64: u32 = CPU_TYPE_X86 | CPU_ARCH_ABI64;

// =============================================================================
// Load Commands
// =============================================================================

/// Load command requiring dynamic linker
pub const LC_REQ_DYLD: u32 = 0x8000_0000;

/// Segment of this file (32-bit)
pub const LC_SEGMENT: u32 = 0x1;
/// Link-edit symbol table info
pub const LC_SYMTAB: u32 = 0x2;
/// Link-edit gdb symbol table info (deprecated)
pub const LC_SYMSEG: u32 = 0x3;
/// Thread
pub const LC_THREAD: u32 = 0x4;
/// Unix thread
pub const LC_UNIXTHREAD: u32 = 0x5;
/// Load a fixed VM shared library
pub const LC_LOADFVMLIB: u32 = 0x6;
/// Fixed VM shared library identification
pub const LC_IDFVMLIB: u32 = 0x7;
/// Object identification
pub const LC_IDENT: u32 = 0x8;
/// Fixed VM file inclusion
pub const LC_FVMFILE: u32 = 0x9;
/// Dynamic link-edit symbol table info
pub const LC_DYSYMTAB: u32 = 0xB;
/// Load a dynamically linked shared library
pub const LC_LOAD_DYLIB: u32 = 0xC;
/// Dynamically linked shared lib identification
pub const LC_ID_DYLIB: u32 = 0xD;
/// Load a dynamic linker
pub const LC_LOAD_DYLINKER: u32 = 0xE;
/// Dynamic linker identification
pub const LC_ID_DYLINKER: u32 = 0xF;
/// Prebound modules
pub const LC_PREBOUND_DYLIB: u32 = 0x10;
/// Image routines
pub const LC_ROUTINES: u32 = 0x11;
/// Sub framework
pub const LC_SUB_FRAMEWORK: u32 = 0x12;
/// Sub umbrella
pub const LC_SUB_UMBRELLA: u32 = 0x13;
/// Sub client
pub const LC_SUB_CLIENT: u32 = 0x14;
/// Sub library
pub const LC_SUB_LIBRARY: u32 = 0x15;
/// Two-level namespace hints
pub const LC_TWOLEVEL_HINTS: u32 = 0x16;
/// Prebind checksum
pub const LC_PREBIND_CKSUM: u32 = 0x17;
/// Load a weak dynamically linked shared library
pub const LC_LOAD_WEAK_DYLIB: u32 = 0x18 | LC_REQ_DYLD;
/// 64-bit segment
pub const LC_SEGMENT_64: u32 = 0x19;
/// 64-bit image routines
pub const LC_ROUTINES_64: u32 = 0x1A;
/// UUID
pub const LC_UUID: u32 = 0x1B;
/// Runpath additions
pub const LC_RPATH: u32 = 0x1C | LC_REQ_DYLD;
/// Location of code signature
pub const LC_CODE_SIGNATURE: u32 = 0x1D;
/// Location of segment split info
pub const LC_SEGMENT_SPLIT_INFO: u32 = 0x1E;
/// Load and re-export dylib
pub const LC_REEXPORT_DYLIB: u32 = 0x1F | LC_REQ_DYLD;
/// Delay load of dylib
pub const LC_LAZY_LOAD_DYLIB: u32 = 0x20;
/// Encrypted segment information
pub const LC_ENCRYPTION_INFO: u32 = 0x21;
/// Compressed dyld info
pub const LC_DYLD_INFO: u32 = 0x22;
/// Compressed dyld info only
pub const LC_DYLD_INFO_ONLY: u32 = 0x22 | LC_REQ_DYLD;
/// Load upward dylib
pub const LC_LOAD_UPWARD_DYLIB: u32 = 0x23 | LC_REQ_DYLD;
/// Build for macOS min version
pub const LC_VERSION_MIN_MACOSX: u32 = 0x24;
/// Build for iOS min version
pub const LC_VERSION_MIN_IPHONEOS: u32 = 0x25;
/// Location of function starts
pub const LC_FUNCTION_STARTS: u32 = 0x26;
/// Environment variable string
pub const LC_DYLD_ENVIRONMENT: u32 = 0x27;
/// Main entry point
pub const LC_MAIN: u32 = 0x28 | LC_REQ_DYLD;
/// Table of non-instructions in __text
pub const LC_DATA_IN_CODE: u32 = 0x29;
/// Source version
pub const LC_SOURCE_VERSION: u32 = 0x2A;
/// Code signing DRs copied from linked dylibs
pub const LC_DYLIB_CODE_SIGN_DRS: u32 = 0x2B;
/// 64-bit encrypted segment information
pub const LC_ENCRYPTION_INFO_64: u32 = 0x2C;
/// Linker options
pub const LC_LINKER_OPTION: u32 = 0x2D;
/// Optimization hints
pub const LC_LINKER_OPTIMIZATION_HINT: u32 = 0x2E;
/// Build for tvOS min version
pub const LC_VERSION_MIN_TVOS: u32 = 0x2F;
/// Build for watchOS min version
pub const LC_VERSION_MIN_WATCHOS: u32 = 0x30;
/// Arbitrary data included within a Mach-O file
pub const LC_NOTE: u32 = 0x31;
/// Build for platform min version
pub const LC_BUILD_VERSION: u32 = 0x32;
/// Export trie in its own linkedit_data_command
pub const LC_DYLD_EXPORTS_TRIE: u32 = 0x33 | LC_REQ_DYLD;
/// Chained fixups, linkedit_data_command payload
pub const LC_DYLD_CHAINED_FIXUPS: u32 = 0x34 | LC_REQ_DYLD;
/// File set entry
pub const LC_FILESET_ENTRY: u32 = 0x35 | LC_REQ_DYLD;

// =============================================================================
// Symbol Types
// =============================================================================

/// If any of these bits set, a symbolic debugging entry
pub const N_STAB: u8 = 0xE0;
/// Private external symbol bit
pub const N_PEXT: u8 = 0x10;
/// Mask for the type bits
pub const N_TYPE: u8 = 0x0E;
/// External symbol bit
pub const N_EXT: u8 = 0x01;

/// Undefined symbol
pub const N_UNDF: u8 = 0x0;
/// Defined in section number n_sect
pub const N_SECT: u8 = 0xE;

// =============================================================================
// Indirect Symbol Table
// =============================================================================

/// Stub resolves to a local symbol
pub const INDIRECT_SYMBOL_LOCAL: u32 = 0x8000_0000;
/// Stub resolves to an absolute symbol
pub const INDIRECT_SYMBOL_ABS: u32 = 0x4000_0000;
