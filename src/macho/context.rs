//! Mach-O context for reading and modifying extracted images.

use std::collections::HashMap;

use zerocopy::{FromBytes, Immutable, IntoBytes};

use super::constants::*;
use super::structs::*;
use crate::error::{Error, Result};
use crate::util;

// =============================================================================
// Segment Info
// =============================================================================

/// Parsed segment information, normalized to 64-bit field widths.
///
/// The raw command in the buffer keeps its native width; writes go through
/// [`MachoContext::update_segment_bounds`] which patches the native layout.
#[derive(Debug, Clone)]
pub struct SegmentInfo {
    /// Segment name (16 bytes, null-padded)
    pub segname: [u8; 16],
    /// Virtual memory address
    pub vmaddr: u64,
    /// Virtual memory size
    pub vmsize: u64,
    /// File offset
    pub fileoff: u64,
    /// Amount of file mapped
    pub filesize: u64,
    /// Offset of the segment command in the image buffer
    pub command_offset: usize,
    /// Sections in this segment
    pub sections: Vec<SectionInfo>,
}

impl SegmentInfo {
    /// Returns the segment name.
    pub fn name(&self) -> &str {
        name_str(&self.segname)
    }

    /// Returns a section by name.
    pub fn section(&self, name: &str) -> Option<&SectionInfo> {
        self.sections.iter().find(|s| s.name() == name)
    }
}

/// Parsed section information, normalized to 64-bit field widths.
#[derive(Debug, Clone)]
pub struct SectionInfo {
    /// Section name (16 bytes, null-padded)
    pub sectname: [u8; 16],
    /// Owning segment name (16 bytes, null-padded)
    pub segname: [u8; 16],
    /// Virtual memory address
    pub addr: u64,
    /// Size in bytes
    pub size: u64,
    /// File offset
    pub offset: u32,
    /// Offset of the section structure in the image buffer
    pub struct_offset: usize,
}

impl SectionInfo {
    /// Returns the section name.
    pub fn name(&self) -> &str {
        name_str(&self.sectname)
    }
}

// =============================================================================
// Load Command Info
// =============================================================================

/// Parsed load command information.
#[derive(Debug, Clone)]
#[allow(missing_docs)] // Variants are self-documenting via names
pub enum LoadCommandInfo {
    Segment(SegmentInfo),
    Symtab {
        command: SymtabCommand,
        offset: usize,
    },
    Dysymtab {
        command: DysymtabCommand,
        offset: usize,
    },
    DyldInfo {
        command: DyldInfoCommand,
        offset: usize,
    },
    LinkeditData {
        command: LinkeditDataCommand,
        offset: usize,
    },
    Other {
        cmd: u32,
        cmdsize: u32,
        offset: usize,
    },
}

impl LoadCommandInfo {
    /// Returns the load command offset in the image buffer.
    pub fn offset(&self) -> usize {
        match self {
            LoadCommandInfo::Segment(s) => s.command_offset,
            LoadCommandInfo::Symtab { offset, .. } => *offset,
            LoadCommandInfo::Dysymtab { offset, .. } => *offset,
            LoadCommandInfo::DyldInfo { offset, .. } => *offset,
            LoadCommandInfo::LinkeditData { offset, .. } => *offset,
            LoadCommandInfo::Other { offset, .. } => *offset,
        }
    }

    /// Returns the raw `LC_*` command identifier.
    pub fn cmd(&self, is_64: bool) -> u32 {
        match self {
            LoadCommandInfo::Segment(_) => {
                if is_64 {
                    LC_SEGMENT_64
                } else {
                    LC_SEGMENT
                }
            }
            LoadCommandInfo::Symtab { command, .. } => command.cmd,
            LoadCommandInfo::Dysymtab { command, .. } => command.cmd,
            LoadCommandInfo::DyldInfo { command, .. } => command.cmd,
            LoadCommandInfo::LinkeditData { command, .. } => command.cmd,
            LoadCommandInfo::Other { cmd, .. } => *cmd,
        }
    }
}

// =============================================================================
// Mach-O Context
// =============================================================================

/// Context for working with a Mach-O image laid out at file offsets.
///
/// Owns a mutable byte buffer of the image and a typed view of its load
/// commands. The context has exclusive write access for the duration of
/// reconstruction; all mutation goes through its write primitives so the
/// typed view and the raw bytes stay coherent.
#[derive(Debug)]
pub struct MachoContext {
    /// Normalized header view (for 32-bit images `reserved` is unused)
    pub header: MachHeader64,
    /// Mutable image data positioned at file offsets
    pub data: Vec<u8>,
    /// Parsed load commands
    pub load_commands: Vec<LoadCommandInfo>,
    /// True for MH_MAGIC_64 images
    is_64: bool,
    /// Segment lookup by name
    segment_indices: HashMap<String, usize>,
}

impl MachoContext {
    /// Creates a new Mach-O context from raw image data.
    pub fn new(data: Vec<u8>) -> Result<Self> {
        if data.len() < MachHeader32::SIZE {
            return Err(Error::buffer_too_small(MachHeader32::SIZE, data.len()));
        }

        let magic = util::read_u32_le(&data);
        let (header, is_64) = match magic {
            MH_MAGIC_64 => {
                let header = MachHeader64::read_from_prefix(&data)
                    .map_err(|_| Error::InvalidMachoMagic(magic))?
                    .0;
                (header, true)
            }
            MH_MAGIC => {
                let h = MachHeader32::read_from_prefix(&data)
                    .map_err(|_| Error::InvalidMachoMagic(magic))?
                    .0;
                let header = MachHeader64 {
                    magic: h.magic,
                    cputype: h.cputype,
                    cpusubtype: h.cpusubtype,
                    filetype: h.filetype,
                    ncmds: h.ncmds,
                    sizeofcmds: h.sizeofcmds,
                    flags: h.flags,
                    reserved: 0,
                };
                (header, false)
            }
            other => return Err(Error::InvalidMachoMagic(other)),
        };

        let mut ctx = Self {
            header,
            data,
            load_commands: Vec::new(),
            is_64,
            segment_indices: HashMap::new(),
        };

        ctx.parse_load_commands()?;

        Ok(ctx)
    }

    /// Returns true if this is a 64-bit image.
    #[inline]
    pub fn is_64(&self) -> bool {
        self.is_64
    }

    /// Returns the size of the Mach-O header for this image's width.
    #[inline]
    pub fn header_size(&self) -> usize {
        if self.is_64 {
            MachHeader64::SIZE
        } else {
            MachHeader32::SIZE
        }
    }

    /// Re-parses the load command region after an in-place mutation that
    /// changed command layout (e.g. a load command insertion).
    pub fn reparse_load_commands(&mut self) -> Result<()> {
        self.load_commands.clear();
        self.segment_indices.clear();
        self.parse_load_commands()
    }

    /// Parses all load commands.
    fn parse_load_commands(&mut self) -> Result<()> {
        let mut offset = self.header_size();
        let end_offset = self.header_size() + self.header.sizeofcmds as usize;

        for _ in 0..self.header.ncmds {
            if offset + LoadCommand::SIZE > end_offset
                || offset + LoadCommand::SIZE > self.data.len()
            {
                return Err(Error::LoadCommandOverflow { offset });
            }

            let lc = LoadCommand::read_from_prefix(&self.data[offset..])
                .map_err(|_| Error::parse(offset, "failed to parse load command"))?
                .0;

            if lc.cmdsize < LoadCommand::SIZE as u32
                || offset + lc.cmdsize as usize > self.data.len()
            {
                return Err(Error::LoadCommandOverflow { offset });
            }

            let cmd_data = &self.data[offset..offset + lc.cmdsize as usize];
            let cmd_info = self.parse_load_command(lc.cmd, lc.cmdsize, cmd_data, offset)?;

            if let LoadCommandInfo::Segment(ref seg) = cmd_info {
                self.segment_indices
                    .insert(seg.name().to_string(), self.load_commands.len());
            }

            self.load_commands.push(cmd_info);
            offset += lc.cmdsize as usize;
        }

        Ok(())
    }

    /// Parses a single load command.
    fn parse_load_command(
        &self,
        cmd: u32,
        cmdsize: u32,
        data: &[u8],
        offset: usize,
    ) -> Result<LoadCommandInfo> {
        match cmd {
            LC_SEGMENT_64 => {
                let seg = SegmentCommand64::read_from_prefix(data)
                    .map_err(|_| Error::parse(offset, "failed to parse segment command"))?
                    .0;

                let mut sections = Vec::with_capacity(seg.nsects as usize);
                let mut sect_offset = offset + SegmentCommand64::SIZE;

                for _ in 0..seg.nsects {
                    let sect = Section64::read_from_prefix(&self.data[sect_offset..])
                        .map_err(|_| Error::parse(sect_offset, "failed to parse section"))?
                        .0;

                    sections.push(SectionInfo {
                        sectname: sect.sectname,
                        segname: sect.segname,
                        addr: sect.addr,
                        size: sect.size,
                        offset: sect.offset,
                        struct_offset: sect_offset,
                    });

                    sect_offset += Section64::SIZE;
                }

                Ok(LoadCommandInfo::Segment(SegmentInfo {
                    segname: seg.segname,
                    vmaddr: seg.vmaddr,
                    vmsize: seg.vmsize,
                    fileoff: seg.fileoff,
                    filesize: seg.filesize,
                    command_offset: offset,
                    sections,
                }))
            }

            LC_SEGMENT => {
                let seg = SegmentCommand32::read_from_prefix(data)
                    .map_err(|_| Error::parse(offset, "failed to parse segment command"))?
                    .0;

                let mut sections = Vec::with_capacity(seg.nsects as usize);
                let mut sect_offset = offset + SegmentCommand32::SIZE;

                for _ in 0..seg.nsects {
                    let sect = Section32::read_from_prefix(&self.data[sect_offset..])
                        .map_err(|_| Error::parse(sect_offset, "failed to parse section"))?
                        .0;

                    sections.push(SectionInfo {
                        sectname: sect.sectname,
                        segname: sect.segname,
                        addr: sect.addr as u64,
                        size: sect.size as u64,
                        offset: sect.offset,
                        struct_offset: sect_offset,
                    });

                    sect_offset += Section32::SIZE;
                }

                Ok(LoadCommandInfo::Segment(SegmentInfo {
                    segname: seg.segname,
                    vmaddr: seg.vmaddr as u64,
                    vmsize: seg.vmsize as u64,
                    fileoff: seg.fileoff as u64,
                    filesize: seg.filesize as u64,
                    command_offset: offset,
                    sections,
                }))
            }

            LC_SYMTAB => {
                let symtab = SymtabCommand::read_from_prefix(data)
                    .map_err(|_| Error::parse(offset, "failed to parse symtab command"))?
                    .0;

                Ok(LoadCommandInfo::Symtab {
                    command: symtab,
                    offset,
                })
            }

            LC_DYSYMTAB => {
                let dysymtab = DysymtabCommand::read_from_prefix(data)
                    .map_err(|_| Error::parse(offset, "failed to parse dysymtab command"))?
                    .0;

                Ok(LoadCommandInfo::Dysymtab {
                    command: dysymtab,
                    offset,
                })
            }

            LC_DYLD_INFO | LC_DYLD_INFO_ONLY => {
                let dyld_info = DyldInfoCommand::read_from_prefix(data)
                    .map_err(|_| Error::parse(offset, "failed to parse dyld info command"))?
                    .0;

                Ok(LoadCommandInfo::DyldInfo {
                    command: dyld_info,
                    offset,
                })
            }

            LC_CODE_SIGNATURE
            | LC_SEGMENT_SPLIT_INFO
            | LC_FUNCTION_STARTS
            | LC_DATA_IN_CODE
            | LC_DYLIB_CODE_SIGN_DRS
            | LC_DYLD_EXPORTS_TRIE
            | LC_DYLD_CHAINED_FIXUPS
            | LC_LINKER_OPTIMIZATION_HINT => {
                let linkedit = LinkeditDataCommand::read_from_prefix(data)
                    .map_err(|_| Error::parse(offset, "failed to parse linkedit data command"))?
                    .0;

                Ok(LoadCommandInfo::LinkeditData {
                    command: linkedit,
                    offset,
                })
            }

            _ => Ok(LoadCommandInfo::Other {
                cmd,
                cmdsize,
                offset,
            }),
        }
    }

    // =========================================================================
    // Lookups
    // =========================================================================

    /// Returns a reference to a segment by name.
    pub fn segment(&self, name: &str) -> Option<&SegmentInfo> {
        self.segment_indices.get(name).and_then(|&idx| {
            if let LoadCommandInfo::Segment(ref seg) = self.load_commands[idx] {
                Some(seg)
            } else {
                None
            }
        })
    }

    /// Returns an iterator over all segments.
    pub fn segments(&self) -> impl Iterator<Item = &SegmentInfo> {
        self.load_commands.iter().filter_map(|lc| {
            if let LoadCommandInfo::Segment(seg) = lc {
                Some(seg)
            } else {
                None
            }
        })
    }

    /// Returns a section by segment and section name.
    pub fn section(&self, segment: &str, section: &str) -> Option<&SectionInfo> {
        self.segment(segment)?.section(section)
    }

    /// Returns the __TEXT segment.
    pub fn text_segment(&self) -> Option<&SegmentInfo> {
        self.segment("__TEXT")
    }

    /// Returns the __LINKEDIT segment.
    pub fn linkedit_segment(&self) -> Option<&SegmentInfo> {
        self.segment("__LINKEDIT")
    }

    /// Returns the symbol table command and its offset in the buffer.
    pub fn symtab(&self) -> Option<(SymtabCommand, usize)> {
        self.load_commands.iter().find_map(|lc| {
            if let LoadCommandInfo::Symtab { command, offset } = lc {
                Some((*command, *offset))
            } else {
                None
            }
        })
    }

    /// Returns the dynamic symbol table command and its offset.
    pub fn dysymtab(&self) -> Option<(DysymtabCommand, usize)> {
        self.load_commands.iter().find_map(|lc| {
            if let LoadCommandInfo::Dysymtab { command, offset } = lc {
                Some((*command, *offset))
            } else {
                None
            }
        })
    }

    /// Returns the dyld info command and its offset.
    pub fn dyld_info(&self) -> Option<(DyldInfoCommand, usize)> {
        self.load_commands.iter().find_map(|lc| {
            if let LoadCommandInfo::DyldInfo { command, offset } = lc {
                Some((*command, *offset))
            } else {
                None
            }
        })
    }

    /// Returns the first linkedit data command matching one of the given
    /// command identifiers, with its offset.
    pub fn linkedit_data(&self, cmds: &[u32]) -> Option<(LinkeditDataCommand, usize)> {
        self.load_commands.iter().find_map(|lc| {
            if let LoadCommandInfo::LinkeditData { command, offset } = lc {
                if cmds.contains(&command.cmd) {
                    return Some((*command, *offset));
                }
            }
            None
        })
    }

    // =========================================================================
    // Address Conversion
    // =========================================================================

    /// Converts a virtual address to a file offset within this image.
    pub fn addr_to_offset(&self, addr: u64) -> Option<usize> {
        for seg in self.segments() {
            if addr >= seg.vmaddr && addr < seg.vmaddr + seg.vmsize {
                return Some((seg.fileoff + (addr - seg.vmaddr)) as usize);
            }
        }
        None
    }

    // =========================================================================
    // Raw Access
    // =========================================================================

    /// Reads data at the specified offset within the image.
    pub fn read_at(&self, offset: usize, len: usize) -> Result<&[u8]> {
        if offset + len > self.data.len() {
            return Err(Error::buffer_too_small(offset + len, self.data.len()));
        }
        Ok(&self.data[offset..offset + len])
    }

    /// Reads a u32 at the specified offset.
    pub fn read_u32(&self, offset: usize) -> Result<u32> {
        let bytes = self.read_at(offset, 4)?;
        Ok(util::read_u32_le(bytes))
    }

    /// Writes data at the specified offset.
    pub fn write_at(&mut self, offset: usize, data: &[u8]) -> Result<()> {
        if offset + data.len() > self.data.len() {
            return Err(Error::buffer_too_small(offset + data.len(), self.data.len()));
        }
        self.data[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    /// Writes a u32 at the specified offset.
    pub fn write_u32(&mut self, offset: usize, value: u32) -> Result<()> {
        self.write_at(offset, &value.to_le_bytes())
    }

    /// Writes a u64 at the specified offset.
    pub fn write_u64(&mut self, offset: usize, value: u64) -> Result<()> {
        self.write_at(offset, &value.to_le_bytes())
    }

    /// Writes a structure at the specified offset.
    pub fn write_struct<T: IntoBytes + Immutable>(
        &mut self,
        offset: usize,
        value: &T,
    ) -> Result<()> {
        self.write_at(offset, value.as_bytes())
    }

    /// Updates the header in the data buffer, writing only the bytes the
    /// image's width actually has.
    pub fn sync_header(&mut self) -> Result<()> {
        let header = self.header;
        let size = self.header_size();
        let bytes = header.as_bytes()[..size].to_vec();
        self.write_at(0, &bytes)
    }

    // =========================================================================
    // Header Space Accounting
    // =========================================================================

    /// Returns the header space: the byte distance from the end of the
    /// Mach-O header to the start of `__TEXT,__text`. Load commands must
    /// fit within it.
    pub fn header_space(&self) -> Result<u32> {
        let text_sect = self
            .section("__TEXT", "__text")
            .ok_or_else(|| Error::SectionNotFound {
                segment: "__TEXT".into(),
                section: "__text".into(),
            })?;
        Ok(text_sect.offset.saturating_sub(self.header_size() as u32))
    }

    // =========================================================================
    // Segment Updates
    // =========================================================================

    /// Updates a segment's `vmsize` and `filesize`, patching the native
    /// command layout and the cached view.
    pub fn update_segment_bounds(&mut self, name: &str, vmsize: u64, filesize: u64) -> Result<()> {
        let idx = *self
            .segment_indices
            .get(name)
            .ok_or_else(|| Error::SegmentNotFound { name: name.into() })?;

        let cmd_offset = if let LoadCommandInfo::Segment(ref mut seg) = self.load_commands[idx] {
            seg.vmsize = vmsize;
            seg.filesize = filesize;
            seg.command_offset
        } else {
            return Err(Error::SegmentNotFound { name: name.into() });
        };

        if self.is_64 {
            self.write_u64(cmd_offset + std::mem::offset_of!(SegmentCommand64, vmsize), vmsize)?;
            self.write_u64(
                cmd_offset + std::mem::offset_of!(SegmentCommand64, filesize),
                filesize,
            )?;
        } else {
            self.write_u32(
                cmd_offset + std::mem::offset_of!(SegmentCommand32, vmsize),
                vmsize as u32,
            )?;
            self.write_u32(
                cmd_offset + std::mem::offset_of!(SegmentCommand32, filesize),
                filesize as u32,
            )?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_minimal_macho() -> Vec<u8> {
        let mut data = vec![0u8; 0x1000];

        let header = MachHeader64 {
            magic: MH_MAGIC_64,
            cputype: CPU_TYPE_ARM64,
            cpusubtype: 0,
            filetype: MH_DYLIB,
            ncmds: 1,
            sizeofcmds: (SegmentCommand64::SIZE + Section64::SIZE) as u32,
            flags: 0,
            reserved: 0,
        };
        data[..MachHeader64::SIZE].copy_from_slice(header.as_bytes());

        let mut seg = SegmentCommand64 {
            cmd: LC_SEGMENT_64,
            cmdsize: (SegmentCommand64::SIZE + Section64::SIZE) as u32,
            segname: [0u8; 16],
            vmaddr: 0x1_0000_0000,
            vmsize: 0x1000,
            fileoff: 0,
            filesize: 0x1000,
            maxprot: 5,
            initprot: 5,
            nsects: 1,
            flags: 0,
        };
        set_name(&mut seg.segname, "__TEXT");
        data[MachHeader64::SIZE..MachHeader64::SIZE + SegmentCommand64::SIZE]
            .copy_from_slice(seg.as_bytes());

        let mut sect = Section64 {
            sectname: [0u8; 16],
            segname: seg.segname,
            addr: 0x1_0000_0400,
            size: 0x100,
            offset: 0x400,
            align: 2,
            reloff: 0,
            nreloc: 0,
            flags: 0,
            reserved1: 0,
            reserved2: 0,
            reserved3: 0,
        };
        set_name(&mut sect.sectname, "__text");
        let sect_off = MachHeader64::SIZE + SegmentCommand64::SIZE;
        data[sect_off..sect_off + Section64::SIZE].copy_from_slice(sect.as_bytes());

        data
    }

    #[test]
    fn test_parse_minimal_macho() {
        let ctx = MachoContext::new(create_minimal_macho()).unwrap();

        assert!(ctx.is_64());
        assert_eq!(ctx.header.ncmds, 1);
        assert!(ctx.segment("__TEXT").is_some());
        assert!(ctx.section("__TEXT", "__text").is_some());
        assert_eq!(
            ctx.header_space().unwrap(),
            0x400 - MachHeader64::SIZE as u32
        );
    }

    #[test]
    fn test_addr_to_offset() {
        let ctx = MachoContext::new(create_minimal_macho()).unwrap();
        assert_eq!(ctx.addr_to_offset(0x1_0000_0010), Some(0x10));
        assert_eq!(ctx.addr_to_offset(0x2_0000_0000), None);
    }

    #[test]
    fn test_update_segment_bounds() {
        let mut ctx = MachoContext::new(create_minimal_macho()).unwrap();
        ctx.update_segment_bounds("__TEXT", 0x2000, 0x1800).unwrap();

        let seg = ctx.segment("__TEXT").unwrap();
        assert_eq!(seg.vmsize, 0x2000);
        assert_eq!(seg.filesize, 0x1800);

        // The raw buffer reflects the patch too.
        let reparsed = MachoContext::new(ctx.data.clone()).unwrap();
        assert_eq!(reparsed.segment("__TEXT").unwrap().vmsize, 0x2000);
    }

    #[test]
    fn test_invalid_magic() {
        let data = vec![0u8; 64];
        assert!(matches!(
            MachoContext::new(data),
            Err(Error::InvalidMachoMagic(0))
        ));
    }
}
