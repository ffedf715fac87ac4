//! LINKEDIT reconstruction pipeline.
//!
//! In the shared cache every image's `__LINKEDIT` has been coalesced into
//! cache-wide tables: symbol entries point into a shared string pool, local
//! symbols are stripped into a separate subcache, and indirect symbol
//! indices reference the coalesced symbol table. This module rebuilds a
//! self-contained LINKEDIT for one image by running a fixed sequence of
//! copy passes into a fresh buffer, rewriting every load-command offset
//! that points into the region as it goes.
//!
//! The pass order is load-bearing: later passes consume state set by
//! earlier ones (the remapping table, the symbol count, the redacted
//! placeholder).

use std::collections::HashMap;
use std::marker::PhantomData;
use std::mem::offset_of;

use tracing::{debug, warn};
use zerocopy::{FromBytes, IntoBytes};

use super::locals::{recover_local_symbols, RecoveredLocals};
use super::pool::StringPool;
use super::tracker::{LinkeditTracker, TrackedRegion};
use crate::activity::Activity;
use crate::dyld::DyldContext;
use crate::error::{Error, Result};
use crate::macho::{
    DyldInfoCommand, DysymtabCommand, LinkeditDataCommand, MachoContext, NlistRecord, Pointer32,
    Pointer64, PointerWidth, SymtabCommand, INDIRECT_SYMBOL_ABS, INDIRECT_SYMBOL_LOCAL,
};
use crate::macho::{
    LC_BUILD_VERSION, LC_CODE_SIGNATURE, LC_DATA_IN_CODE, LC_DYLD_CHAINED_FIXUPS,
    LC_DYLD_ENVIRONMENT, LC_DYLD_EXPORTS_TRIE, LC_DYLD_INFO, LC_DYLD_INFO_ONLY,
    LC_DYLIB_CODE_SIGN_DRS, LC_DYSYMTAB, LC_ENCRYPTION_INFO, LC_ENCRYPTION_INFO_64, LC_FVMFILE,
    LC_FILESET_ENTRY, LC_FUNCTION_STARTS, LC_ID_DYLIB, LC_ID_DYLINKER, LC_IDENT, LC_IDFVMLIB,
    LC_LAZY_LOAD_DYLIB, LC_LINKER_OPTIMIZATION_HINT, LC_LINKER_OPTION, LC_LOAD_DYLIB,
    LC_LOAD_DYLINKER, LC_LOAD_UPWARD_DYLIB, LC_LOAD_WEAK_DYLIB, LC_LOADFVMLIB, LC_MAIN, LC_NOTE,
    LC_PREBIND_CKSUM, LC_PREBOUND_DYLIB, LC_REEXPORT_DYLIB, LC_ROUTINES, LC_ROUTINES_64,
    LC_RPATH, LC_SEGMENT, LC_SEGMENT_64, LC_SEGMENT_SPLIT_INFO, LC_SOURCE_VERSION,
    LC_SUB_CLIENT, LC_SUB_FRAMEWORK, LC_SUB_LIBRARY, LC_SUB_UMBRELLA, LC_SYMSEG, LC_SYMTAB,
    LC_THREAD, LC_TWOLEVEL_HINTS, LC_UNIXTHREAD, LC_UUID, LC_VERSION_MIN_IPHONEOS,
    LC_VERSION_MIN_MACOSX, LC_VERSION_MIN_TVOS, LC_VERSION_MIN_WATCHOS,
};
use crate::util::{align_up, cstr_at};

/// The literal name given to symbols the cache builder stripped.
const REDACTED_NAME: &[u8] = b"<redacted>";

/// Outcome of a LINKEDIT reconstruction.
///
/// Carries the live tracker so downstream passes can perform further
/// LINKEDIT or load-command insertions with the offsets kept coherent.
#[derive(Debug)]
pub struct LinkeditReconstruction {
    /// Tracker over the rebuilt regions, live for downstream passes
    pub tracker: LinkeditTracker,
    /// True if the indirect symbol table referenced stripped symbols; the
    /// symbol table then leads with one `<redacted>` placeholder and ends
    /// with a reserved slot per stripped entry
    pub has_redacted_indirect: bool,
    /// Number of symbol entries in the rebuilt table
    pub symbol_count: u32,
    /// Final size of the rebuilt LINKEDIT
    pub new_size: u32,
}

/// Rebuilds the `__LINKEDIT` segment of the given image.
///
/// Audits the load commands, recovers redacted local symbols from the
/// cache's symbols subcache when one is available, and runs the
/// reconstruction pipeline at the image's pointer width.
pub fn reconstruct_linkedit(
    macho: &mut MachoContext,
    cache: Option<&DyldContext>,
    activity: &Activity,
) -> Result<LinkeditReconstruction> {
    activity.update_task("Reconstructing LINKEDIT");
    audit_load_commands(macho);

    if macho.is_64() {
        let locals = cache.and_then(|c| recover_local_symbols::<Pointer64>(c, macho));
        reconstruct_for_width::<Pointer64>(macho, locals.as_ref(), activity)
    } else {
        let locals = cache.and_then(|c| recover_local_symbols::<Pointer32>(c, macho));
        reconstruct_for_width::<Pointer32>(macho, locals.as_ref(), activity)
    }
}

/// Runs the reconstruction pipeline at a fixed pointer width.
pub fn reconstruct_for_width<W: PointerWidth>(
    macho: &mut MachoContext,
    locals: Option<&RecoveredLocals>,
    activity: &Activity,
) -> Result<LinkeditReconstruction> {
    let optimizer = LinkeditOptimizer::<W>::new(macho, activity)?;
    optimizer.run(locals)
}

// =============================================================================
// Optimizer
// =============================================================================

struct LinkeditOptimizer<'a, W: PointerWidth> {
    macho: &'a mut MachoContext,
    activity: &'a Activity,
    tracker: LinkeditTracker,
    pool: StringPool,

    /// Scratch buffer the size of the current __LINKEDIT vmsize
    new_linkedit: Vec<u8>,
    /// Write cursor into the scratch buffer
    offset: u32,
    /// File offset of the LINKEDIT region
    linkedit_fileoff: u32,

    // Load command snapshots taken before any field is rewritten; passes
    // read old offsets from these and write new offsets to the buffer.
    symtab: Option<(SymtabCommand, usize)>,
    dysymtab: Option<(DysymtabCommand, usize)>,
    dyld_info: Option<(DyldInfoCommand, usize)>,
    export_trie: Option<(LinkeditDataCommand, usize)>,
    function_starts: Option<(LinkeditDataCommand, usize)>,
    data_in_code: Option<(LinkeditDataCommand, usize)>,

    symbol_count: u32,
    redacted_count: u32,
    new_symbol_entries_start: u32,
    has_redacted_indirect: bool,
    /// Old symbol index -> new symbol index, for exported and imported syms
    remap: HashMap<u32, u32>,

    _width: PhantomData<W>,
}

impl<'a, W: PointerWidth> LinkeditOptimizer<'a, W> {
    fn new(macho: &'a mut MachoContext, activity: &'a Activity) -> Result<Self> {
        let tracker = LinkeditTracker::new(macho)?;
        let linkedit_fileoff = tracker.linkedit_fileoff();
        let new_linkedit = vec![0u8; tracker.capacity() as usize];

        let symtab = macho.symtab();
        let dysymtab = macho.dysymtab();
        let dyld_info = macho.dyld_info();
        let export_trie = macho.linkedit_data(&[LC_DYLD_EXPORTS_TRIE]);
        let function_starts = macho.linkedit_data(&[LC_FUNCTION_STARTS]);
        let data_in_code = macho.linkedit_data(&[LC_DATA_IN_CODE]);

        Ok(Self {
            macho,
            activity,
            tracker,
            pool: StringPool::new(),
            new_linkedit,
            offset: 0,
            linkedit_fileoff,
            symtab,
            dysymtab,
            dyld_info,
            export_trie,
            function_starts,
            data_in_code,
            symbol_count: 0,
            redacted_count: 0,
            new_symbol_entries_start: 0,
            has_redacted_indirect: false,
            remap: HashMap::new(),
            _width: PhantomData,
        })
    }

    /// Runs all passes in order and writes the result back over the old
    /// LINKEDIT region.
    fn run(mut self, locals: Option<&RecoveredLocals>) -> Result<LinkeditReconstruction> {
        self.copy_binding_info()?;
        self.copy_weak_binding_info()?;
        self.copy_lazy_binding_info()?;
        self.copy_export_info()?;

        self.start_symbol_entries();
        self.search_redacted_symbol()?;
        self.copy_local_symbols(locals)?;
        self.copy_exported_symbols()?;
        self.copy_imported_symbols()?;
        self.end_symbol_entries()?;

        self.copy_function_starts()?;
        self.copy_data_in_code()?;
        self.copy_indirect_symbol_table()?;
        self.copy_string_pool()?;

        self.finalize()
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    fn ensure_capacity(&self, end: u32) -> Result<()> {
        if end as usize > self.new_linkedit.len() {
            return Err(Error::buffer_too_small(end as usize, self.new_linkedit.len()));
        }
        Ok(())
    }

    /// Copies `size` bytes from the old LINKEDIT verbatim, tracks the new
    /// region, and rewrites the owning offset field.
    fn copy_verbatim(
        &mut self,
        src_off: u32,
        size: u32,
        field_offset: usize,
        task: &str,
    ) -> Result<()> {
        if size == 0 {
            return Ok(());
        }
        self.activity.update_task(task);

        let padded = align_up(size as u64, 8) as u32;
        self.ensure_capacity(self.offset + padded)?;

        let dst_start = self.offset as usize;
        let src = self.macho.read_at(src_off as usize, size as usize)?;
        self.new_linkedit[dst_start..dst_start + size as usize].copy_from_slice(src);

        self.tracker.track(TrackedRegion {
            field_offset,
            data_offset: self.offset,
            size: padded,
        });
        self.macho
            .write_u32(field_offset, self.linkedit_fileoff + self.offset)?;

        self.offset += padded;
        self.activity.update();
        Ok(())
    }

    /// Appends one nlist record to the symbol-entry region.
    fn push_nlist(&mut self, nlist: &W::Nlist) -> Result<()> {
        self.ensure_capacity(self.offset + W::NLIST_SIZE as u32)?;
        let start = self.offset as usize;
        self.new_linkedit[start..start + W::NLIST_SIZE].copy_from_slice(nlist.as_bytes());
        self.offset += W::NLIST_SIZE as u32;
        Ok(())
    }

    /// Reads an nlist record from the old symbol table.
    fn read_old_nlist(&self, symtab: &SymtabCommand, index: u32) -> Result<W::Nlist> {
        let offset = symtab.symoff as usize + index as usize * W::NLIST_SIZE;
        let bytes = self.macho.read_at(offset, W::NLIST_SIZE)?;
        Ok(W::Nlist::read_from_prefix(bytes)
            .map_err(|_| Error::parse(offset, "failed to parse nlist"))?
            .0)
    }

    /// Writes a u32 field of a load command in the header region.
    fn write_command_field(&mut self, command_offset: usize, field: usize, value: u32) -> Result<()> {
        self.macho.write_u32(command_offset + field, value)
    }

    // =========================================================================
    // Passes 1-4: opaque blobs ahead of the symbol entries
    // =========================================================================

    fn copy_binding_info(&mut self) -> Result<()> {
        let Some((info, offset)) = self.dyld_info else {
            return Ok(());
        };
        self.copy_verbatim(
            info.bind_off,
            info.bind_size,
            offset + offset_of!(DyldInfoCommand, bind_off),
            "Copying binding info",
        )
    }

    fn copy_weak_binding_info(&mut self) -> Result<()> {
        let Some((info, offset)) = self.dyld_info else {
            return Ok(());
        };
        self.copy_verbatim(
            info.weak_bind_off,
            info.weak_bind_size,
            offset + offset_of!(DyldInfoCommand, weak_bind_off),
            "Copying weak binding info",
        )
    }

    fn copy_lazy_binding_info(&mut self) -> Result<()> {
        let Some((info, offset)) = self.dyld_info else {
            return Ok(());
        };
        self.copy_verbatim(
            info.lazy_bind_off,
            info.lazy_bind_size,
            offset + offset_of!(DyldInfoCommand, lazy_bind_off),
            "Copying lazy binding info",
        )
    }

    /// Copies the export trie, preferring the detached
    /// `LC_DYLD_EXPORTS_TRIE` command over the `dyld_info` embedding.
    fn copy_export_info(&mut self) -> Result<()> {
        let (src_off, size, field_offset) = if let Some((trie, offset)) = self.export_trie {
            (
                trie.dataoff,
                trie.datasize,
                offset + offset_of!(LinkeditDataCommand, dataoff),
            )
        } else if let Some((info, offset)) = self.dyld_info {
            (
                info.export_off,
                info.export_size,
                offset + offset_of!(DyldInfoCommand, export_off),
            )
        } else {
            return Ok(());
        };

        self.copy_verbatim(src_off, size, field_offset, "Copying export info")
    }

    // =========================================================================
    // Passes 5-10: symbol entries
    // =========================================================================

    fn start_symbol_entries(&mut self) {
        self.new_symbol_entries_start = self.offset;
    }

    /// Scans the indirect symbol table for stripped (zero) entries and, if
    /// any exist, emits a single `<redacted>` placeholder at the front of
    /// the symbol region.
    fn search_redacted_symbol(&mut self) -> Result<()> {
        let Some((dysymtab, _)) = self.dysymtab else {
            return Ok(());
        };
        self.activity.update_task("Searching for redacted symbols");

        for i in 0..dysymtab.nindirectsyms as usize {
            let entry = self.macho.read_u32(dysymtab.indirectsymoff as usize + i * 4)?;
            if entry == 0 {
                self.redacted_count += 1;
            }
        }

        if self.redacted_count > 0 {
            let strx = self.pool.add(REDACTED_NAME);
            let mut placeholder = W::Nlist::default();
            placeholder.set_strx(strx);
            placeholder.set_n_type(1);
            self.push_nlist(&placeholder)?;
            self.symbol_count += 1;
            self.has_redacted_indirect = true;
            debug!(
                stripped = self.redacted_count,
                "indirect symbol table references stripped symbols"
            );
        }

        Ok(())
    }

    /// Copies the image's public local symbols, then any locals recovered
    /// from the symbols subcache, and rewrites the dysymtab local range.
    fn copy_local_symbols(&mut self, locals: Option<&RecoveredLocals>) -> Result<()> {
        self.activity.update_task("Copying local symbols");

        let start_index = self.symbol_count;
        let mut count = self.copy_public_local_symbols()?;
        count += self.copy_redacted_local_symbols(locals)?;

        if let Some((_, offset)) = self.dysymtab {
            self.write_command_field(offset, offset_of!(DysymtabCommand, ilocalsym), start_index)?;
            self.write_command_field(offset, offset_of!(DysymtabCommand, nlocalsym), count)?;
        }
        Ok(())
    }

    fn copy_public_local_symbols(&mut self) -> Result<u32> {
        let (Some((dysymtab, _)), Some((symtab, _))) = (self.dysymtab, self.symtab) else {
            return Ok(0);
        };
        if dysymtab.nlocalsym == 0 {
            return Ok(0);
        }

        let mut copied = 0u32;
        let end = dysymtab.ilocalsym.saturating_add(dysymtab.nlocalsym);
        for index in dysymtab.ilocalsym..end {
            let mut nlist = self.read_old_nlist(&symtab, index)?;
            let name_off = (symtab.stroff + nlist.strx()) as usize;
            let strx = {
                let name = cstr_at(&self.macho.data, name_off)
                    .ok_or_else(|| Error::parse(name_off, "symbol name out of bounds"))?;
                if name == REDACTED_NAME {
                    continue;
                }
                self.pool.add(name)
            };
            nlist.set_strx(strx);
            self.push_nlist(&nlist)?;
            self.symbol_count += 1;
            copied += 1;
            self.activity.update();
        }
        Ok(copied)
    }

    fn copy_redacted_local_symbols(&mut self, locals: Option<&RecoveredLocals>) -> Result<u32> {
        let Some(locals) = locals else {
            return Ok(0);
        };

        let mut copied = 0u32;
        for index in 0..locals.count as usize {
            let offset = index * W::NLIST_SIZE;
            let bytes = locals
                .nlists
                .get(offset..offset + W::NLIST_SIZE)
                .ok_or_else(|| Error::parse(offset, "recovered nlist out of bounds"))?;
            let mut nlist = W::Nlist::read_from_prefix(bytes)
                .map_err(|_| Error::parse(offset, "failed to parse recovered nlist"))?
                .0;

            let name_off = nlist.strx() as usize;
            let strx = {
                let name = cstr_at(locals.strings, name_off)
                    .ok_or_else(|| Error::parse(name_off, "recovered name out of bounds"))?;
                self.pool.add(name)
            };
            nlist.set_strx(strx);
            self.push_nlist(&nlist)?;
            self.symbol_count += 1;
            copied += 1;
            self.activity.update();
        }
        Ok(copied)
    }

    /// Copies one dysymtab symbol range, re-interning names and recording
    /// old -> new indices in the remapping table.
    fn copy_symbol_range(&mut self, range_start: u32, range_count: u32) -> Result<u32> {
        let Some((symtab, _)) = self.symtab else {
            return Ok(0);
        };

        let mut copied = 0u32;
        let end = range_start.saturating_add(range_count);
        for index in range_start..end {
            let mut nlist = self.read_old_nlist(&symtab, index)?;
            let name_off = (symtab.stroff + nlist.strx()) as usize;
            let strx = {
                let name = cstr_at(&self.macho.data, name_off)
                    .ok_or_else(|| Error::parse(name_off, "symbol name out of bounds"))?;
                self.pool.add(name)
            };
            nlist.set_strx(strx);

            self.remap.insert(index, self.symbol_count);
            self.push_nlist(&nlist)?;
            self.symbol_count += 1;
            copied += 1;
            self.activity.update();
        }
        Ok(copied)
    }

    fn copy_exported_symbols(&mut self) -> Result<()> {
        self.activity.update_task("Copying exported symbols");
        let Some((dysymtab, offset)) = self.dysymtab else {
            warn!("no dysymtab, unable to copy exported symbols");
            return Ok(());
        };

        let start_index = self.symbol_count;
        let count = self.copy_symbol_range(dysymtab.iextdefsym, dysymtab.nextdefsym)?;
        if count > 0 {
            self.write_command_field(offset, offset_of!(DysymtabCommand, iextdefsym), start_index)?;
            self.write_command_field(offset, offset_of!(DysymtabCommand, nextdefsym), count)?;
        }
        Ok(())
    }

    fn copy_imported_symbols(&mut self) -> Result<()> {
        self.activity.update_task("Copying imported symbols");
        let Some((dysymtab, offset)) = self.dysymtab else {
            warn!("no dysymtab, unable to copy imported symbols");
            return Ok(());
        };

        let start_index = self.symbol_count;
        let count = self.copy_symbol_range(dysymtab.iundefsym, dysymtab.nundefsym)?;
        if count > 0 {
            self.write_command_field(offset, offset_of!(DysymtabCommand, iundefsym), start_index)?;
            self.write_command_field(offset, offset_of!(DysymtabCommand, nundefsym), count)?;
        }
        Ok(())
    }

    /// Closes the symbol-entry region: reserves one nlist slot per stripped
    /// indirect entry (downstream stub fixing may fill these with real
    /// per-stub names), aligns the region, and rewrites the symtab.
    fn end_symbol_entries(&mut self) -> Result<()> {
        let Some((_, offset)) = self.symtab else {
            return Ok(());
        };

        self.offset += self.redacted_count * W::NLIST_SIZE as u32;

        let size = self.offset - self.new_symbol_entries_start;
        let padded = align_up(size as u64, 8) as u32;
        self.ensure_capacity(self.new_symbol_entries_start + padded)?;
        self.offset = self.new_symbol_entries_start + padded;

        self.tracker.track(TrackedRegion {
            field_offset: offset + offset_of!(SymtabCommand, symoff),
            data_offset: self.new_symbol_entries_start,
            size: padded,
        });
        self.write_command_field(
            offset,
            offset_of!(SymtabCommand, symoff),
            self.linkedit_fileoff + self.new_symbol_entries_start,
        )?;
        self.write_command_field(offset, offset_of!(SymtabCommand, nsyms), self.symbol_count)?;
        Ok(())
    }

    // =========================================================================
    // Passes 11-14: trailing regions
    // =========================================================================

    fn copy_function_starts(&mut self) -> Result<()> {
        let Some((cmd, offset)) = self.function_starts else {
            return Ok(());
        };
        self.copy_verbatim(
            cmd.dataoff,
            cmd.datasize,
            offset + offset_of!(LinkeditDataCommand, dataoff),
            "Copying function starts",
        )
    }

    fn copy_data_in_code(&mut self) -> Result<()> {
        let Some((cmd, offset)) = self.data_in_code else {
            return Ok(());
        };
        self.copy_verbatim(
            cmd.dataoff,
            cmd.datasize,
            offset + offset_of!(LinkeditDataCommand, dataoff),
            "Copying data in code",
        )
    }

    /// Copies the indirect symbol table, preserving the sentinel entries
    /// (`ABS`, `LOCAL`, their combination, and stripped zeros) and remapping
    /// every real index through the remapping table.
    fn copy_indirect_symbol_table(&mut self) -> Result<()> {
        let Some((dysymtab, offset)) = self.dysymtab else {
            return Ok(());
        };
        if dysymtab.nindirectsyms == 0 {
            return Ok(());
        }
        self.activity.update_task("Copying indirect symbol table");

        let size = dysymtab.nindirectsyms * 4;
        let padded = align_up(size as u64, 8) as u32;
        self.ensure_capacity(self.offset + padded)?;

        let start = self.offset as usize;
        for i in 0..dysymtab.nindirectsyms as usize {
            let entry = self.macho.read_u32(dysymtab.indirectsymoff as usize + i * 4)?;

            let value = if entry == INDIRECT_SYMBOL_ABS
                || entry == INDIRECT_SYMBOL_LOCAL
                || entry == (INDIRECT_SYMBOL_ABS | INDIRECT_SYMBOL_LOCAL)
                || entry == 0
            {
                entry
            } else if let Some(&new_index) = self.remap.get(&entry) {
                new_index
            } else {
                warn!(index = entry, "indirect symbol has no remapped index");
                INDIRECT_SYMBOL_LOCAL
            };

            self.new_linkedit[start + i * 4..start + i * 4 + 4]
                .copy_from_slice(&value.to_le_bytes());
            self.activity.update();
        }

        self.tracker.track(TrackedRegion {
            field_offset: offset + offset_of!(DysymtabCommand, indirectsymoff),
            data_offset: self.offset,
            size: padded,
        });
        self.write_command_field(
            offset,
            offset_of!(DysymtabCommand, indirectsymoff),
            self.linkedit_fileoff + self.offset,
        )?;

        self.offset += padded;
        Ok(())
    }

    /// Writes the deduplicated string pool and rewrites the symtab string
    /// table fields.
    fn copy_string_pool(&mut self) -> Result<()> {
        let Some((_, offset)) = self.symtab else {
            return Ok(());
        };
        self.activity.update_task("Writing string pool");

        let size = self.pool.len();
        let padded = align_up(size as u64, 8) as u32;
        self.ensure_capacity(self.offset + padded)?;

        let start = self.offset as usize;
        self.pool
            .write(&mut self.new_linkedit[start..start + size as usize]);

        self.tracker.track(TrackedRegion {
            field_offset: offset + offset_of!(SymtabCommand, stroff),
            data_offset: self.offset,
            size: padded,
        });
        self.write_command_field(
            offset,
            offset_of!(SymtabCommand, stroff),
            self.linkedit_fileoff + self.offset,
        )?;
        self.write_command_field(offset, offset_of!(SymtabCommand, strsize), size)?;

        self.offset += padded;
        self.activity.update();
        Ok(())
    }

    // =========================================================================
    // Pass 15: finalize
    // =========================================================================

    /// Copies the rebuilt buffer back over the original LINKEDIT bytes and
    /// updates the segment bounds to the final cursor.
    fn finalize(self) -> Result<LinkeditReconstruction> {
        let base = self.linkedit_fileoff as usize;
        let len = self.offset as usize;
        if base + len > self.macho.data.len() {
            return Err(Error::buffer_too_small(base + len, self.macho.data.len()));
        }
        self.macho.data[base..base + len].copy_from_slice(&self.new_linkedit[..len]);

        self.macho
            .update_segment_bounds("__LINKEDIT", self.offset as u64, self.offset as u64)?;
        self.macho.reparse_load_commands()?;

        debug!(
            symbols = self.symbol_count,
            size = self.offset,
            "LINKEDIT reconstructed"
        );

        Ok(LinkeditReconstruction {
            tracker: self.tracker,
            has_redacted_indirect: self.has_redacted_indirect,
            symbol_count: self.symbol_count,
            new_size: self.offset,
        })
    }
}

// =============================================================================
// Load Command Auditor
// =============================================================================

/// Classifies all load commands ahead of reconstruction, warning about
/// commands that may carry LINKEDIT data this pipeline does not rebuild.
///
/// Advisory only; reconstruction proceeds regardless.
pub fn audit_load_commands(macho: &MachoContext) {
    for lc in &macho.load_commands {
        let cmd = lc.cmd(macho.is_64());
        match cmd {
            // No data in the linkedit.
            LC_SEGMENT
            | LC_SEGMENT_64
            | LC_IDFVMLIB
            | LC_LOADFVMLIB
            | LC_ID_DYLIB
            | LC_LOAD_DYLIB
            | LC_LOAD_WEAK_DYLIB
            | LC_REEXPORT_DYLIB
            | LC_LOAD_UPWARD_DYLIB
            | LC_LAZY_LOAD_DYLIB
            | LC_SUB_FRAMEWORK
            | LC_SUB_CLIENT
            | LC_SUB_UMBRELLA
            | LC_SUB_LIBRARY
            | LC_PREBOUND_DYLIB
            | LC_ID_DYLINKER
            | LC_LOAD_DYLINKER
            | LC_DYLD_ENVIRONMENT
            | LC_THREAD
            | LC_UNIXTHREAD
            | LC_ROUTINES
            | LC_ROUTINES_64
            | LC_PREBIND_CKSUM
            | LC_UUID
            | LC_RPATH
            | LC_FILESET_ENTRY
            | LC_ENCRYPTION_INFO
            | LC_ENCRYPTION_INFO_64
            | LC_VERSION_MIN_MACOSX
            | LC_VERSION_MIN_IPHONEOS
            | LC_VERSION_MIN_WATCHOS
            | LC_VERSION_MIN_TVOS
            | LC_BUILD_VERSION
            | LC_LINKER_OPTION
            | LC_IDENT
            | LC_FVMFILE
            | LC_MAIN
            | LC_SOURCE_VERSION => {}

            // Contains linkedit data, properly rebuilt by the pipeline.
            LC_SYMTAB
            | LC_DYSYMTAB
            | LC_DYLD_EXPORTS_TRIE
            | LC_FUNCTION_STARTS
            | LC_DATA_IN_CODE
            | LC_DYLD_INFO
            | LC_DYLD_INFO_ONLY => {}

            // May contain linkedit data, not handled.
            LC_TWOLEVEL_HINTS
            | LC_CODE_SIGNATURE
            | LC_SEGMENT_SPLIT_INFO
            | LC_DYLIB_CODE_SIGN_DRS
            | LC_LINKER_OPTIMIZATION_HINT
            | LC_DYLD_CHAINED_FIXUPS
            | LC_SYMSEG
            | LC_NOTE => {
                warn!("unhandled load command {:#x} may contain linkedit data", cmd);
            }

            _ => {
                warn!("unknown load command {:#x} may contain linkedit data", cmd);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::macho::{
        set_name, MachHeader64, Nlist64, Section64, SegmentCommand64, MH_MAGIC_64, N_EXT, N_SECT,
        N_UNDF,
    };
    use crate::util::is_aligned;

    const TEXT_VMADDR: u64 = 0x1_8000_0000;
    const LINKEDIT_FILEOFF: u32 = 0x1000;
    const LINKEDIT_VMSIZE: u64 = 0x1000;

    /// Describes a synthetic in-cache image for pipeline tests.
    #[derive(Default)]
    struct ImageSpec {
        /// (name, n_type, n_value) triples; n_strx is assigned by the builder
        syms: Vec<(&'static [u8], u8, u64)>,
        /// ilocalsym, nlocalsym, iextdefsym, nextdefsym, iundefsym, nundefsym
        ranges: [u32; 6],
        indirect: Vec<u32>,
        bind: Vec<u8>,
        export: Vec<u8>,
        function_starts: Vec<u8>,
    }

    /// Assembles a 64-bit image with __TEXT, __LINKEDIT, symtab, dysymtab,
    /// and optional dyld_info / function starts commands, with the old
    /// LINKEDIT content laid out the way the cache would.
    fn build_image(spec: &ImageSpec) -> MachoContext {
        let has_dyld_info = !spec.bind.is_empty() || !spec.export.is_empty();
        let has_fn_starts = !spec.function_starts.is_empty();

        let mut ncmds = 4u32;
        let mut sizeofcmds =
            (SegmentCommand64::SIZE + Section64::SIZE + SegmentCommand64::SIZE) as u32
                + SymtabCommand::SIZE as u32
                + DysymtabCommand::SIZE as u32;
        if has_dyld_info {
            ncmds += 1;
            sizeofcmds += DyldInfoCommand::SIZE as u32;
        }
        if has_fn_starts {
            ncmds += 1;
            sizeofcmds += LinkeditDataCommand::SIZE as u32;
        }

        let mut data = vec![0u8; LINKEDIT_FILEOFF as usize + LINKEDIT_VMSIZE as usize];

        // Old LINKEDIT content.
        let mut cursor = LINKEDIT_FILEOFF;
        let mut place = |blob: &[u8], data: &mut Vec<u8>| -> (u32, u32) {
            let start = cursor;
            data[cursor as usize..cursor as usize + blob.len()].copy_from_slice(blob);
            cursor += align_up(blob.len() as u64, 8) as u32;
            (start, blob.len() as u32)
        };

        let (bind_off, bind_size) = place(&spec.bind, &mut data);
        let (export_off, export_size) = place(&spec.export, &mut data);
        let (fn_starts_off, fn_starts_size) = place(&spec.function_starts, &mut data);

        // Old string pool and nlists.
        let mut old_strings = vec![0u8];
        let mut nlist_blob = Vec::new();
        for (name, n_type, n_value) in &spec.syms {
            let strx = old_strings.len() as u32;
            old_strings.extend_from_slice(name);
            old_strings.push(0);
            let nlist = Nlist64 {
                n_strx: strx,
                n_type: *n_type,
                n_sect: 0,
                n_desc: 0,
                n_value: *n_value,
            };
            nlist_blob.extend_from_slice(nlist.as_bytes());
        }
        let (symoff, _) = place(&nlist_blob, &mut data);

        let mut indirect_blob = Vec::new();
        for entry in &spec.indirect {
            indirect_blob.extend_from_slice(&entry.to_le_bytes());
        }
        let (indirectsymoff, _) = place(&indirect_blob, &mut data);
        let (stroff, strsize) = place(&old_strings, &mut data);

        // Header and load commands.
        let header = MachHeader64 {
            magic: MH_MAGIC_64,
            cputype: 0,
            cpusubtype: 0,
            filetype: 6,
            ncmds,
            sizeofcmds,
            flags: 0,
            reserved: 0,
        };
        data[..MachHeader64::SIZE].copy_from_slice(header.as_bytes());
        let mut off = MachHeader64::SIZE;

        let mut text = SegmentCommand64 {
            cmd: LC_SEGMENT_64,
            cmdsize: (SegmentCommand64::SIZE + Section64::SIZE) as u32,
            segname: [0u8; 16],
            vmaddr: TEXT_VMADDR,
            vmsize: LINKEDIT_FILEOFF as u64,
            fileoff: 0,
            filesize: LINKEDIT_FILEOFF as u64,
            maxprot: 5,
            initprot: 5,
            nsects: 1,
            flags: 0,
        };
        set_name(&mut text.segname, "__TEXT");
        data[off..off + SegmentCommand64::SIZE].copy_from_slice(text.as_bytes());
        off += SegmentCommand64::SIZE;

        let mut sect = Section64 {
            sectname: [0u8; 16],
            segname: text.segname,
            addr: TEXT_VMADDR + 0x400,
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
        data[off..off + Section64::SIZE].copy_from_slice(sect.as_bytes());
        off += Section64::SIZE;

        let mut linkedit = SegmentCommand64 {
            cmd: LC_SEGMENT_64,
            cmdsize: SegmentCommand64::SIZE as u32,
            segname: [0u8; 16],
            vmaddr: TEXT_VMADDR + LINKEDIT_FILEOFF as u64,
            vmsize: LINKEDIT_VMSIZE,
            fileoff: LINKEDIT_FILEOFF as u64,
            filesize: LINKEDIT_VMSIZE,
            maxprot: 1,
            initprot: 1,
            nsects: 0,
            flags: 0,
        };
        set_name(&mut linkedit.segname, "__LINKEDIT");
        data[off..off + SegmentCommand64::SIZE].copy_from_slice(linkedit.as_bytes());
        off += SegmentCommand64::SIZE;

        let symtab = SymtabCommand {
            symoff,
            nsyms: spec.syms.len() as u32,
            stroff,
            strsize,
            ..Default::default()
        };
        data[off..off + SymtabCommand::SIZE].copy_from_slice(symtab.as_bytes());
        off += SymtabCommand::SIZE;

        let [il, nl, ie, ne, iu, nu] = spec.ranges;
        let dysymtab = DysymtabCommand {
            ilocalsym: il,
            nlocalsym: nl,
            iextdefsym: ie,
            nextdefsym: ne,
            iundefsym: iu,
            nundefsym: nu,
            indirectsymoff,
            nindirectsyms: spec.indirect.len() as u32,
            ..Default::default()
        };
        data[off..off + DysymtabCommand::SIZE].copy_from_slice(dysymtab.as_bytes());
        off += DysymtabCommand::SIZE;

        if has_dyld_info {
            let dyld_info = DyldInfoCommand {
                bind_off,
                bind_size,
                export_off,
                export_size,
                ..Default::default()
            };
            data[off..off + DyldInfoCommand::SIZE].copy_from_slice(dyld_info.as_bytes());
            off += DyldInfoCommand::SIZE;
        }

        if has_fn_starts {
            let fn_starts = LinkeditDataCommand {
                cmd: LC_FUNCTION_STARTS,
                cmdsize: LinkeditDataCommand::SIZE as u32,
                dataoff: fn_starts_off,
                datasize: fn_starts_size,
            };
            data[off..off + LinkeditDataCommand::SIZE].copy_from_slice(fn_starts.as_bytes());
        }

        MachoContext::new(data).unwrap()
    }

    fn run(macho: &mut MachoContext, locals: Option<&RecoveredLocals>) -> LinkeditReconstruction {
        reconstruct_for_width::<Pointer64>(macho, locals, &Activity::disabled()).unwrap()
    }

    fn read_new_indirect(macho: &MachoContext, count: usize) -> Vec<u32> {
        let (dysymtab, _) = macho.dysymtab().unwrap();
        (0..count)
            .map(|i| {
                macho
                    .read_u32(dysymtab.indirectsymoff as usize + i * 4)
                    .unwrap()
            })
            .collect()
    }

    fn read_new_nlist(macho: &MachoContext, index: u32) -> Nlist64 {
        let (symtab, _) = macho.symtab().unwrap();
        let off = symtab.symoff as usize + index as usize * Nlist64::SIZE;
        Nlist64::read_from_prefix(&macho.data[off..]).unwrap().0
    }

    fn symbol_name(macho: &MachoContext, nlist: &Nlist64) -> Vec<u8> {
        let (symtab, _) = macho.symtab().unwrap();
        cstr_at(&macho.data, (symtab.stroff + nlist.n_strx) as usize)
            .unwrap()
            .to_vec()
    }

    fn assert_invariants(macho: &MachoContext, res: &LinkeditReconstruction) {
        let base = res.tracker.linkedit_fileoff();
        let mut prev_end = 0u32;
        for region in res.tracker.regions() {
            assert!(is_aligned(region.data_offset as u64, 8));
            assert!(region.data_offset >= prev_end, "regions overlap");
            prev_end = region.end();
            assert_eq!(
                macho.read_u32(region.field_offset).unwrap(),
                base + region.data_offset
            );
        }
        assert!(prev_end <= res.new_size);

        let linkedit = macho.linkedit_segment().unwrap();
        assert_eq!(linkedit.vmsize, res.new_size as u64);
        assert_eq!(linkedit.filesize, res.new_size as u64);

        // String pool starts with the NUL sentinel.
        let (symtab, _) = macho.symtab().unwrap();
        assert_eq!(macho.data[symtab.stroff as usize], 0);
    }

    #[test]
    fn test_exported_and_imported_symbols() {
        let spec = ImageSpec {
            syms: vec![
                (b"_foo", N_SECT | N_EXT, 0x100),
                (b"_bar", N_UNDF | N_EXT, 0),
            ],
            ranges: [0, 0, 0, 1, 1, 1],
            indirect: vec![1],
            ..Default::default()
        };
        let mut macho = build_image(&spec);
        let res = run(&mut macho, None);

        assert_eq!(res.symbol_count, 2);
        assert!(!res.has_redacted_indirect);

        let (symtab, _) = macho.symtab().unwrap();
        assert_eq!(symtab.nsyms, 2);

        let (dysymtab, _) = macho.dysymtab().unwrap();
        assert_eq!(dysymtab.ilocalsym, 0);
        assert_eq!(dysymtab.nlocalsym, 0);
        assert_eq!(dysymtab.iextdefsym, 0);
        assert_eq!(dysymtab.nextdefsym, 1);
        assert_eq!(dysymtab.iundefsym, 1);
        assert_eq!(dysymtab.nundefsym, 1);

        assert_eq!(read_new_indirect(&macho, 1), vec![1]);

        let strings_start = symtab.stroff as usize;
        assert_eq!(
            &macho.data[strings_start..strings_start + 11],
            b"\0_foo\0_bar\0"
        );

        let foo = read_new_nlist(&macho, 0);
        assert_eq!(symbol_name(&macho, &foo), b"_foo");
        assert_eq!(foo.n_value, 0x100);

        assert_invariants(&macho, &res);
    }

    #[test]
    fn test_redacted_indirect_placeholder() {
        let spec = ImageSpec {
            syms: vec![
                (b"_foo", N_SECT | N_EXT, 0x100),
                (b"_bar", N_UNDF | N_EXT, 0),
            ],
            ranges: [0, 0, 0, 1, 1, 1],
            indirect: vec![0, 1],
            ..Default::default()
        };
        let mut macho = build_image(&spec);
        let res = run(&mut macho, None);

        assert_eq!(res.symbol_count, 3);
        assert!(res.has_redacted_indirect);

        let (symtab, symtab_offset) = macho.symtab().unwrap();
        assert_eq!(symtab.nsyms, 3);

        // The first entry is the <redacted> placeholder with n_type 1.
        let placeholder = read_new_nlist(&macho, 0);
        assert_eq!(symbol_name(&macho, &placeholder), b"<redacted>");
        assert_eq!(placeholder.n_type, 1);
        assert_eq!(placeholder.n_value, 0);

        let (dysymtab, _) = macho.dysymtab().unwrap();
        assert_eq!(dysymtab.iextdefsym, 1);
        assert_eq!(dysymtab.nextdefsym, 1);
        assert_eq!(dysymtab.iundefsym, 2);
        assert_eq!(dysymtab.nundefsym, 1);

        // The stripped entry is preserved, the real one remapped.
        assert_eq!(read_new_indirect(&macho, 2), vec![0, 2]);

        // One reserved slot trails the 3 emitted entries: 4 * 16 bytes.
        let symtab_region = res
            .tracker
            .regions()
            .iter()
            .find(|r| r.field_offset == symtab_offset + offset_of!(SymtabCommand, symoff))
            .unwrap();
        assert_eq!(symtab_region.size, 64);

        assert_invariants(&macho, &res);
    }

    #[test]
    fn test_recovered_local_symbols() {
        // No public locals; four locals live only in the symbols subcache.
        let spec = ImageSpec {
            syms: vec![],
            ranges: [0; 6],
            ..Default::default()
        };
        let mut macho = build_image(&spec);

        let names: [&[u8]; 4] = [b"_l0", b"_l1", b"_l2", b"_l3"];
        let mut strings = vec![0u8];
        let mut nlists = Vec::new();
        for (i, name) in names.iter().enumerate() {
            let nlist = Nlist64 {
                n_strx: strings.len() as u32,
                n_type: N_SECT,
                n_sect: 1,
                n_desc: 0,
                n_value: 0x1000 + i as u64 * 8,
            };
            strings.extend_from_slice(name);
            strings.push(0);
            nlists.extend_from_slice(nlist.as_bytes());
        }
        let locals = RecoveredLocals {
            nlists: &nlists,
            count: 4,
            strings: &strings,
        };

        let res = run(&mut macho, Some(&locals));

        assert_eq!(res.symbol_count, 4);
        let (dysymtab, _) = macho.dysymtab().unwrap();
        assert_eq!(dysymtab.ilocalsym, 0);
        assert_eq!(dysymtab.nlocalsym, 4);

        for (i, name) in names.iter().enumerate() {
            let nlist = read_new_nlist(&macho, i as u32);
            assert_eq!(&symbol_name(&macho, &nlist), name);
        }

        assert_invariants(&macho, &res);
    }

    #[test]
    fn test_locals_follow_redacted_placeholder() {
        let spec = ImageSpec {
            syms: vec![],
            ranges: [0; 6],
            indirect: vec![0],
            ..Default::default()
        };
        let mut macho = build_image(&spec);

        let strings = b"\0_only\0".to_vec();
        let nlist = Nlist64 {
            n_strx: 1,
            n_type: N_SECT,
            n_sect: 1,
            n_desc: 0,
            n_value: 0x2000,
        };
        let nlists = nlist.as_bytes().to_vec();
        let locals = RecoveredLocals {
            nlists: &nlists,
            count: 1,
            strings: &strings,
        };

        let res = run(&mut macho, Some(&locals));

        // The recovered local starts right after the placeholder.
        assert!(res.has_redacted_indirect);
        let (dysymtab, _) = macho.dysymtab().unwrap();
        assert_eq!(dysymtab.ilocalsym, 1);
        assert_eq!(dysymtab.nlocalsym, 1);
        assert_eq!(res.symbol_count, 2);

        assert_invariants(&macho, &res);
    }

    #[test]
    fn test_unrecoverable_locals_are_dropped() {
        // Two stripped locals in the old table, no symbols subcache: the
        // `<redacted>` entries are skipped and the local range is emptied.
        let spec = ImageSpec {
            syms: vec![
                (b"<redacted>", N_SECT, 0x10),
                (b"<redacted>", N_SECT, 0x20),
                (b"_foo", N_SECT | N_EXT, 0x100),
            ],
            ranges: [0, 2, 2, 1, 0, 0],
            ..Default::default()
        };
        let mut macho = build_image(&spec);
        let res = run(&mut macho, None);

        assert_eq!(res.symbol_count, 1);
        let (dysymtab, _) = macho.dysymtab().unwrap();
        assert_eq!(dysymtab.nlocalsym, 0);
        assert_eq!(dysymtab.iextdefsym, 0);
        assert_eq!(dysymtab.nextdefsym, 1);

        assert_invariants(&macho, &res);
    }

    #[test]
    fn test_verbatim_regions_and_layout_order() {
        let spec = ImageSpec {
            syms: vec![(b"_foo", N_SECT | N_EXT, 0x100)],
            ranges: [0, 0, 0, 1, 0, 0],
            bind: vec![0x11; 10],
            export: vec![0x22; 6],
            function_starts: vec![0x33; 5],
            ..Default::default()
        };
        let mut macho = build_image(&spec);
        let res = run(&mut macho, None);

        let base = res.tracker.linkedit_fileoff();
        let (dyld_info, _) = macho.dyld_info().unwrap();
        let (symtab, _) = macho.symtab().unwrap();
        let (fn_starts, _) = macho.linkedit_data(&[LC_FUNCTION_STARTS]).unwrap();

        // Bind info leads, export follows, then symbols, function starts,
        // and the string pool closes the region.
        assert_eq!(dyld_info.bind_off, base);
        assert_eq!(dyld_info.export_off, base + 16);
        assert_eq!(symtab.symoff, base + 24);
        assert_eq!(fn_starts.dataoff, base + 40);
        assert_eq!(symtab.stroff, base + 48);

        // Verbatim bytes survive, padding is zero.
        let bind_start = dyld_info.bind_off as usize;
        assert_eq!(&macho.data[bind_start..bind_start + 10], &[0x11; 10]);
        assert_eq!(&macho.data[bind_start + 10..bind_start + 16], &[0; 6]);
        let fs_start = fn_starts.dataoff as usize;
        assert_eq!(&macho.data[fs_start..fs_start + 5], &[0x33; 5]);

        assert_eq!(symtab.strsize, 6); // "\0_foo\0"
        assert_invariants(&macho, &res);
    }

    #[test]
    fn test_width_dispatch_without_cache() {
        let spec = ImageSpec {
            syms: vec![(b"_foo", N_SECT | N_EXT, 0x100)],
            ranges: [0, 0, 0, 1, 0, 0],
            ..Default::default()
        };
        let mut macho = build_image(&spec);

        // No cache: recovery is skipped, the audit and pipeline still run.
        let res = reconstruct_linkedit(&mut macho, None, &Activity::disabled()).unwrap();
        assert_eq!(res.symbol_count, 1);
        assert!(!res.has_redacted_indirect);
    }

    /// Assembles a minimal 32-bit image: one exported symbol and one
    /// stripped indirect entry.
    fn build_image32() -> MachoContext {
        use crate::macho::{MachHeader32, Nlist32, Section32, SegmentCommand32, MH_MAGIC};

        let linkedit_fileoff = 0x1000u32;
        let linkedit_vmsize = 0x200u32;
        let mut data = vec![0u8; (linkedit_fileoff + linkedit_vmsize) as usize];

        // Old LINKEDIT: one nlist, one zeroed indirect entry, strings.
        let symoff = linkedit_fileoff;
        let old_nlist = Nlist32 {
            n_strx: 1,
            n_type: N_SECT | N_EXT,
            n_sect: 1,
            n_desc: 0,
            n_value: 0x50,
        };
        data[symoff as usize..symoff as usize + Nlist32::SIZE]
            .copy_from_slice(old_nlist.as_bytes());
        let indirectsymoff = symoff + Nlist32::SIZE as u32;
        let stroff = indirectsymoff + 4;
        data[stroff as usize..stroff as usize + 4].copy_from_slice(b"\0_x\0");

        let sizeofcmds = (SegmentCommand32::SIZE
            + Section32::SIZE
            + SegmentCommand32::SIZE
            + SymtabCommand::SIZE
            + DysymtabCommand::SIZE) as u32;
        let header = MachHeader32 {
            magic: MH_MAGIC,
            cputype: 12,
            cpusubtype: 0,
            filetype: 6,
            ncmds: 4,
            sizeofcmds,
            flags: 0,
        };
        data[..MachHeader32::SIZE].copy_from_slice(header.as_bytes());
        let mut off = MachHeader32::SIZE;

        let mut text = SegmentCommand32 {
            cmd: LC_SEGMENT,
            cmdsize: (SegmentCommand32::SIZE + Section32::SIZE) as u32,
            segname: [0u8; 16],
            vmaddr: 0x4000,
            vmsize: linkedit_fileoff,
            fileoff: 0,
            filesize: linkedit_fileoff,
            maxprot: 5,
            initprot: 5,
            nsects: 1,
            flags: 0,
        };
        set_name(&mut text.segname, "__TEXT");
        data[off..off + SegmentCommand32::SIZE].copy_from_slice(text.as_bytes());
        off += SegmentCommand32::SIZE;

        let mut sect = Section32 {
            sectname: [0u8; 16],
            segname: text.segname,
            addr: 0x4400,
            size: 0x100,
            offset: 0x400,
            align: 2,
            reloff: 0,
            nreloc: 0,
            flags: 0,
            reserved1: 0,
            reserved2: 0,
        };
        set_name(&mut sect.sectname, "__text");
        data[off..off + Section32::SIZE].copy_from_slice(sect.as_bytes());
        off += Section32::SIZE;

        let mut linkedit = SegmentCommand32 {
            cmd: LC_SEGMENT,
            cmdsize: SegmentCommand32::SIZE as u32,
            segname: [0u8; 16],
            vmaddr: 0x4000 + linkedit_fileoff,
            vmsize: linkedit_vmsize,
            fileoff: linkedit_fileoff,
            filesize: linkedit_vmsize,
            maxprot: 1,
            initprot: 1,
            nsects: 0,
            flags: 0,
        };
        set_name(&mut linkedit.segname, "__LINKEDIT");
        data[off..off + SegmentCommand32::SIZE].copy_from_slice(linkedit.as_bytes());
        off += SegmentCommand32::SIZE;

        let symtab = SymtabCommand {
            symoff,
            nsyms: 1,
            stroff,
            strsize: 4,
            ..Default::default()
        };
        data[off..off + SymtabCommand::SIZE].copy_from_slice(symtab.as_bytes());
        off += SymtabCommand::SIZE;

        let dysymtab = DysymtabCommand {
            nextdefsym: 1,
            indirectsymoff,
            nindirectsyms: 1,
            ..Default::default()
        };
        data[off..off + DysymtabCommand::SIZE].copy_from_slice(dysymtab.as_bytes());

        MachoContext::new(data).unwrap()
    }

    #[test]
    fn test_32bit_pipeline() {
        use crate::macho::Nlist32;

        let mut macho = build_image32();
        assert!(!macho.is_64());

        let res =
            reconstruct_for_width::<Pointer32>(&mut macho, None, &Activity::disabled()).unwrap();

        // Placeholder plus one exported symbol, one reserved 12-byte slot,
        // region padded from 36 to 40.
        assert!(res.has_redacted_indirect);
        assert_eq!(res.symbol_count, 2);

        let (symtab, _) = macho.symtab().unwrap();
        let (dysymtab, _) = macho.dysymtab().unwrap();
        let base = res.tracker.linkedit_fileoff();
        assert_eq!(symtab.nsyms, 2);
        assert_eq!(symtab.symoff, base);
        assert_eq!(dysymtab.iextdefsym, 1);
        assert_eq!(dysymtab.nextdefsym, 1);
        assert_eq!(dysymtab.indirectsymoff, base + 40);

        // The stripped indirect entry is preserved.
        assert_eq!(macho.read_u32(dysymtab.indirectsymoff as usize).unwrap(), 0);

        // The placeholder is a 12-byte record with n_type 1.
        let placeholder = Nlist32::read_from_prefix(&macho.data[symtab.symoff as usize..])
            .unwrap()
            .0;
        assert_eq!(placeholder.n_type, 1);
        assert_eq!(
            cstr_at(&macho.data, (symtab.stroff + placeholder.n_strx) as usize).unwrap(),
            b"<redacted>"
        );

        for region in res.tracker.regions() {
            assert!(is_aligned(region.data_offset as u64, 8));
        }
    }

    #[test]
    fn test_rerun_is_stable() {
        // Re-running the optimizer on an already-reconstructed image keeps
        // every offset and the string pool identical.
        let spec = ImageSpec {
            syms: vec![
                (b"_foo", N_SECT | N_EXT, 0x100),
                (b"_bar", N_UNDF | N_EXT, 0),
            ],
            ranges: [0, 0, 0, 1, 1, 1],
            indirect: vec![1],
            ..Default::default()
        };
        let mut macho = build_image(&spec);

        let first = run(&mut macho, None);
        let symtab_before = macho.symtab().unwrap().0;
        let dysymtab_before = macho.dysymtab().unwrap().0;

        let second = run(&mut macho, None);
        let symtab_after = macho.symtab().unwrap().0;
        let dysymtab_after = macho.dysymtab().unwrap().0;

        assert_eq!(first.new_size, second.new_size);
        assert_eq!(symtab_before.symoff, symtab_after.symoff);
        assert_eq!(symtab_before.stroff, symtab_after.stroff);
        assert_eq!(symtab_before.strsize, symtab_after.strsize);
        assert_eq!(dysymtab_before.indirectsymoff, dysymtab_after.indirectsymoff);
    }
}
