//! Tracks LINKEDIT regions and the load-command fields that name them.
//!
//! Load commands embed byte offsets into the LINKEDIT file region (`symoff`,
//! `stroff`, `bind_off`, `dataoff`, `indirectsymoff`, ...). Any later shift
//! of a region must rewrite every such field. The tracker is the sole
//! authority correlating a LINKEDIT region with the offset field that names
//! it, and arbitrates insertions into both the load-command header region
//! and the LINKEDIT data region.
//!
//! Regions are identified by offsets into the image buffer rather than raw
//! pointers; one `u32` field names exactly one region.

use crate::error::{Error, Result};
use crate::macho::MachoContext;
use crate::util::{align_up, is_aligned};

/// A contiguous blob inside the LINKEDIT named by one load-command field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackedRegion {
    /// Offset (in the image buffer) of the `u32` offset field in the owning
    /// load command.
    pub field_offset: usize,
    /// Offset of the region's data from the LINKEDIT base.
    pub data_offset: u32,
    /// Region size, padded to 8 bytes.
    pub size: u32,
}

impl TrackedRegion {
    /// Offset of the first byte past this region, from the LINKEDIT base.
    #[inline]
    pub fn end(&self) -> u32 {
        self.data_offset + self.size
    }
}

/// Tracks every load-command field that points into the LINKEDIT region.
///
/// The registry is kept sorted by `data_offset` after every mutation. The
/// LINKEDIT capacity is captured at construction from the segment's vmsize,
/// before reconstruction shrinks it, so downstream passes can still grow
/// the region back up to the original bound.
#[derive(Debug)]
pub struct LinkeditTracker {
    /// Offset of the first load command (end of the Mach-O header).
    commands_start: usize,
    /// Byte distance from the end of the header to `__TEXT,__text`.
    header_space: u32,
    /// File offset of the LINKEDIT region.
    linkedit_fileoff: u32,
    /// Maximum LINKEDIT size, captured at construction.
    capacity: u64,
    /// Tracked regions, sorted by `data_offset`.
    regions: Vec<TrackedRegion>,
}

impl LinkeditTracker {
    /// Creates a tracker for the given image.
    ///
    /// Fails if the image lacks a `__TEXT,__text` section or a `__LINKEDIT`
    /// segment.
    pub fn new(macho: &MachoContext) -> Result<Self> {
        let header_space = macho.header_space()?;
        let linkedit = macho
            .linkedit_segment()
            .ok_or_else(|| Error::SegmentNotFound {
                name: "__LINKEDIT".into(),
            })?;

        Ok(Self {
            commands_start: macho.header_size(),
            header_space,
            linkedit_fileoff: linkedit.fileoff as u32,
            capacity: linkedit.vmsize,
            regions: Vec::new(),
        })
    }

    /// Returns the file offset of the LINKEDIT region.
    #[inline]
    pub fn linkedit_fileoff(&self) -> u32 {
        self.linkedit_fileoff
    }

    /// Returns the LINKEDIT capacity captured at construction.
    #[inline]
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Returns the tracked regions, sorted by data offset.
    #[inline]
    pub fn regions(&self) -> &[TrackedRegion] {
        &self.regions
    }

    /// Inserts a region into the sorted registry.
    pub fn track(&mut self, region: TrackedRegion) {
        debug_assert!(is_aligned(region.data_offset as u64, 8));
        debug_assert!(is_aligned(region.size as u64, 8));
        let pos = self
            .regions
            .partition_point(|r| r.data_offset < region.data_offset);
        self.regions.insert(pos, region);
    }

    /// Inserts a new load command immediately after the command at
    /// `after_offset` in the header region.
    ///
    /// Returns `Ok(false)` without modifying anything if the grown command
    /// area would exceed the header space. On success the tail commands are
    /// shifted, `ncmds`/`sizeofcmds` are updated, the typed load-command
    /// view is reparsed, and every tracked field at or beyond the shift
    /// point is moved along.
    pub fn insert_load_command(
        &mut self,
        macho: &mut MachoContext,
        after_offset: usize,
        command: &[u8],
    ) -> Result<bool> {
        let new_size = command.len();

        if macho.header.sizeofcmds + new_size as u32 > self.header_space {
            return Ok(false);
        }

        let cmds_end = self.commands_start + macho.header.sizeofcmds as usize;
        if cmds_end + new_size > macho.data.len() {
            return Err(Error::buffer_too_small(cmds_end + new_size, macho.data.len()));
        }

        let after_cmdsize = macho.read_u32(after_offset + 4)? as usize;
        let shift_start = after_offset + after_cmdsize;
        if shift_start < self.commands_start || shift_start > cmds_end {
            return Err(Error::parse(after_offset, "insertion point outside load commands"));
        }

        macho
            .data
            .copy_within(shift_start..cmds_end, shift_start + new_size);
        macho.write_at(shift_start, command)?;

        macho.header.ncmds += 1;
        macho.header.sizeofcmds += new_size as u32;
        macho.sync_header()?;
        macho.reparse_load_commands()?;

        for region in &mut self.regions {
            if region.field_offset >= shift_start {
                region.field_offset += new_size;
            }
        }

        Ok(true)
    }

    /// Inserts new data into the LINKEDIT region after the tracked region at
    /// index `after` (or at the LINKEDIT start if `None`).
    ///
    /// The reservation is `payload.len()` rounded up to a multiple of 8, with
    /// the padding tail zeroed. Returns `Ok(false)` without modifying
    /// anything if the grown region would exceed the LINKEDIT capacity. On
    /// success every following region is shifted and its offset field
    /// rewritten, and the new region is tracked with `field_offset` as its
    /// owning field.
    pub fn insert_linkedit_data(
        &mut self,
        macho: &mut MachoContext,
        after: Option<usize>,
        field_offset: usize,
        payload: &[u8],
    ) -> Result<bool> {
        let shift = align_up(payload.len() as u64, 8) as u32;

        let last_end = self.regions.last().map(|r| r.end()).unwrap_or(0);
        if last_end as u64 + shift as u64 > self.capacity {
            return Ok(false);
        }

        let insert_at = match after {
            Some(idx) => self.regions[idx].end(),
            None => 0,
        };

        let base = self.linkedit_fileoff as usize;
        let abs_insert = base + insert_at as usize;
        let abs_last_end = base + last_end as usize;
        if abs_last_end + shift as usize > macho.data.len() {
            return Err(Error::buffer_too_small(
                abs_last_end + shift as usize,
                macho.data.len(),
            ));
        }

        macho
            .data
            .copy_within(abs_insert..abs_last_end, abs_insert + shift as usize);
        macho.data[abs_insert..abs_insert + payload.len()].copy_from_slice(payload);
        macho.data[abs_insert + payload.len()..abs_insert + shift as usize].fill(0);

        for region in &mut self.regions {
            if region.data_offset >= insert_at {
                region.data_offset += shift;
                let value = self.linkedit_fileoff + region.data_offset;
                macho.write_u32(region.field_offset, value)?;
            }
        }

        macho.write_u32(field_offset, self.linkedit_fileoff + insert_at)?;
        self.track(TrackedRegion {
            field_offset,
            data_offset: insert_at,
            size: shift,
        });

        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::macho::{
        set_name, MachHeader64, Section64, SegmentCommand64, LC_SEGMENT_64, MH_MAGIC_64,
    };
    use zerocopy::IntoBytes;

    /// Builds an image with __TEXT (one __text section) and __LINKEDIT.
    ///
    /// `header_space` controls the distance from the end of the header to
    /// the __text section; `linkedit_vmsize` bounds LINKEDIT insertions.
    fn build_macho(header_space: u32, linkedit_vmsize: u64) -> MachoContext {
        let text_fileoff = MachHeader64::SIZE as u32 + header_space;
        let linkedit_fileoff = 0x1000u64;
        let mut data = vec![0u8; linkedit_fileoff as usize + linkedit_vmsize as usize];

        let seg_size = (SegmentCommand64::SIZE + Section64::SIZE) as u32;
        let header = MachHeader64 {
            magic: MH_MAGIC_64,
            cputype: 0,
            cpusubtype: 0,
            filetype: 6,
            ncmds: 2,
            sizeofcmds: seg_size + SegmentCommand64::SIZE as u32,
            flags: 0,
            reserved: 0,
        };
        data[..MachHeader64::SIZE].copy_from_slice(header.as_bytes());

        let mut text = SegmentCommand64 {
            cmd: LC_SEGMENT_64,
            cmdsize: seg_size,
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
        set_name(&mut text.segname, "__TEXT");
        let mut off = MachHeader64::SIZE;
        data[off..off + SegmentCommand64::SIZE].copy_from_slice(text.as_bytes());
        off += SegmentCommand64::SIZE;

        let mut sect = Section64 {
            sectname: [0u8; 16],
            segname: text.segname,
            addr: 0x1_0000_0000 + text_fileoff as u64,
            size: 0x100,
            offset: text_fileoff,
            align: 2,
            reloff: 0,
            nreloc: 0,
            flags: 0,
            reserved1: 0,
            reserved2: 0,
            reserved3: 0,
        };
        set_name(&mut sect.sectname, "__text");
        data[off..off + Section64::SIZE].copy_from_slice(sect.as_bytes());
        off += Section64::SIZE;

        let mut linkedit = SegmentCommand64 {
            cmd: LC_SEGMENT_64,
            cmdsize: SegmentCommand64::SIZE as u32,
            segname: [0u8; 16],
            vmaddr: 0x1_0001_0000,
            vmsize: linkedit_vmsize,
            fileoff: linkedit_fileoff,
            filesize: linkedit_vmsize,
            maxprot: 1,
            initprot: 1,
            nsects: 0,
            flags: 0,
        };
        set_name(&mut linkedit.segname, "__LINKEDIT");
        data[off..off + SegmentCommand64::SIZE].copy_from_slice(linkedit.as_bytes());

        MachoContext::new(data).unwrap()
    }

    /// A writable u32 slot in the dead space between the load commands and
    /// `__text`, standing in for a load-command offset field.
    fn scratch_field(macho: &MachoContext, index: usize) -> usize {
        macho.header_size() + macho.header.sizeofcmds as usize + index * 4
    }

    #[test]
    fn test_insert_linkedit_data_pads_to_eight() {
        let mut macho = build_macho(0x400, 32);
        let mut tracker = LinkeditTracker::new(&macho).unwrap();

        // 13 bytes of payload reserve 16, with the tail zeroed.
        let field = scratch_field(&macho, 0);
        let ok = tracker
            .insert_linkedit_data(&mut macho, None, field, &[0xAA; 13])
            .unwrap();
        assert!(ok);

        let region = tracker.regions()[0];
        assert_eq!(region.size, 16);
        assert_eq!(region.data_offset, 0);

        let base = tracker.linkedit_fileoff() as usize;
        assert_eq!(&macho.data[base..base + 13], &[0xAA; 13]);
        assert_eq!(&macho.data[base + 13..base + 16], &[0, 0, 0]);

        // The owning field holds the absolute file offset.
        assert_eq!(macho.read_u32(field).unwrap(), tracker.linkedit_fileoff());

        // The next insertion lands at offset 16.
        let field2 = field + 4;
        let ok = tracker
            .insert_linkedit_data(&mut macho, Some(0), field2, &[0xBB; 8])
            .unwrap();
        assert!(ok);
        assert_eq!(tracker.regions()[1].data_offset, 16);
    }

    #[test]
    fn test_insert_linkedit_data_capacity() {
        let mut macho = build_macho(0x400, 32);
        let mut tracker = LinkeditTracker::new(&macho).unwrap();

        let field = scratch_field(&macho, 0);
        assert!(tracker
            .insert_linkedit_data(&mut macho, None, field, &[1; 24])
            .unwrap());
        // 24 used, 8 left: a 13-byte payload (16 padded) does not fit.
        assert!(!tracker
            .insert_linkedit_data(&mut macho, Some(0), field + 4, &[2; 13])
            .unwrap());
        assert_eq!(tracker.regions().len(), 1);
    }

    #[test]
    fn test_insert_linkedit_data_shifts_following_fields() {
        let mut macho = build_macho(0x400, 64);
        let mut tracker = LinkeditTracker::new(&macho).unwrap();

        let field_a = scratch_field(&macho, 0);
        let field_b = field_a + 4;
        tracker
            .insert_linkedit_data(&mut macho, None, field_a, &[1; 8])
            .unwrap();
        tracker
            .insert_linkedit_data(&mut macho, Some(0), field_b, &[2; 8])
            .unwrap();

        // Insert at the front; both existing regions shift by 16.
        let field_c = field_a + 8;
        tracker
            .insert_linkedit_data(&mut macho, None, field_c, &[3; 16])
            .unwrap();

        let base = tracker.linkedit_fileoff();
        assert_eq!(macho.read_u32(field_c).unwrap(), base);
        assert_eq!(macho.read_u32(field_a).unwrap(), base + 16);
        assert_eq!(macho.read_u32(field_b).unwrap(), base + 24);

        // Registry stays sorted and coherent with the fields.
        let offs: Vec<u32> = tracker.regions().iter().map(|r| r.data_offset).collect();
        assert_eq!(offs, vec![0, 16, 24]);
        for region in tracker.regions() {
            assert_eq!(
                macho.read_u32(region.field_offset).unwrap(),
                base + region.data_offset
            );
        }

        // Data moved with the regions.
        assert_eq!(macho.data[base as usize + 16], 1);
        assert_eq!(macho.data[base as usize + 24], 2);
    }

    #[test]
    fn test_insert_load_command_overflow() {
        let mut macho = build_macho(0x400, 32);
        let mut tracker = LinkeditTracker::new(&macho).unwrap();

        let field = scratch_field(&macho, 0);
        tracker
            .insert_linkedit_data(&mut macho, None, field, &[9; 8])
            .unwrap();

        // Fill sizeofcmds up to header_space - 8.
        let space = macho.header_space().unwrap();
        macho.header.sizeofcmds = space - 8;
        let ncmds_before = macho.header.ncmds;

        let command = [0u8; 16];
        let after = macho.header_size();
        let ok = tracker
            .insert_load_command(&mut macho, after, &command)
            .unwrap();
        assert!(!ok);
        assert_eq!(macho.header.ncmds, ncmds_before);
        assert_eq!(macho.header.sizeofcmds, space - 8);

        // The tracked region was not shifted.
        assert_eq!(tracker.regions()[0].field_offset, field);
        assert_eq!(tracker.regions()[0].data_offset, 0);
    }

    #[test]
    fn test_insert_load_command_shifts_tracked_fields() {
        let mut macho = build_macho(0x400, 32);
        let mut tracker = LinkeditTracker::new(&macho).unwrap();

        // Track a region whose field lives in the second load command
        // (the flags slot of the __LINKEDIT segment command).
        let linkedit_cmd_off = macho.linkedit_segment().unwrap().command_offset;
        let field = linkedit_cmd_off + std::mem::offset_of!(SegmentCommand64, flags);
        tracker
            .insert_linkedit_data(&mut macho, None, field, &[7; 8])
            .unwrap();

        // Insert a fresh 16-byte command after the first (__TEXT) command.
        let text_cmd_off = macho.text_segment().unwrap().command_offset;
        let mut command = [0u8; 16];
        command[0..4].copy_from_slice(&0x26u32.to_le_bytes()); // LC_FUNCTION_STARTS
        command[4..8].copy_from_slice(&16u32.to_le_bytes());

        let sizeofcmds_before = macho.header.sizeofcmds;
        let ok = tracker
            .insert_load_command(&mut macho, text_cmd_off, &command)
            .unwrap();
        assert!(ok);
        assert_eq!(macho.header.sizeofcmds, sizeofcmds_before + 16);
        assert_eq!(macho.header.ncmds, 3);

        // The tracked field moved with the shifted command bytes.
        let region = tracker.regions()[0];
        assert_eq!(region.field_offset, field + 16);
        assert_eq!(
            macho.read_u32(region.field_offset).unwrap(),
            tracker.linkedit_fileoff()
        );
    }
}
