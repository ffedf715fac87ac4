//! Recovery of redacted local symbols from the symbols subcache.
//!
//! The shared-cache builder strips local symbols out of each image's symbol
//! table and parks them in a separate subcache, keyed per image. Two entry
//! layouts coexist: newer caches (header extends through `symbolFileUUID`)
//! key entries by the image's `__TEXT` vmaddr minus the shared region start
//! and use 64-bit keys; older caches key by the `__TEXT` file offset with
//! 32-bit keys.

use std::mem::offset_of;

use tracing::warn;
use zerocopy::FromBytes;

use crate::dyld::{
    DyldCacheHeader, DyldCacheLocalSymbolsEntry, DyldCacheLocalSymbolsEntry64,
    DyldCacheLocalSymbolsInfo, DyldContext,
};
use crate::macho::{MachoContext, PointerWidth};

/// The nlist slice and strings region recovered for one image.
///
/// Both slices borrow the mapped symbols subcache; string indices in the
/// nlist records resolve against `strings`, not the image's own pool.
#[derive(Debug, Clone, Copy)]
pub struct RecoveredLocals<'a> {
    /// Raw nlist records, `count * nlist_size` bytes
    pub nlists: &'a [u8],
    /// Number of recovered records
    pub count: u32,
    /// The subcache's separate string pool
    pub strings: &'a [u8],
}

/// Locates the local symbols stripped from the given image.
///
/// Returns `None` (after logging a warning) when the symbols subcache is
/// missing or holds no entry for this image; local symbols are simply
/// unavailable in that case.
pub fn recover_local_symbols<'a, W: PointerWidth>(
    cache: &'a DyldContext,
    macho: &MachoContext,
) -> Option<RecoveredLocals<'a>> {
    let Some((data, local_off)) = cache.symbols_cache() else {
        warn!("no symbols cache available, redacted local symbols are unrecoverable");
        return None;
    };
    let local_off = local_off as usize;

    let info = DyldCacheLocalSymbolsInfo::read_from_prefix(data.get(local_off..)?)
        .ok()?
        .0;

    let text = macho.text_segment()?;

    // Newer caches key by vm offset, older ones by cache file offset.
    let new_layout =
        cache.header_contains_member(offset_of!(DyldCacheHeader, symbol_file_uuid));
    let key = if new_layout {
        text.vmaddr.wrapping_sub(cache.header.shared_region_start)
    } else {
        match cache.addr_to_offset(text.vmaddr) {
            Some(offset) => offset,
            None => {
                warn!("__TEXT address not mapped by the cache, cannot key local symbols");
                return None;
            }
        }
    };

    let entries_off = local_off + info.entries_offset as usize;
    let entry_size = if new_layout {
        DyldCacheLocalSymbolsEntry64::SIZE
    } else {
        DyldCacheLocalSymbolsEntry::SIZE
    };
    let entries_len = info.entries_count as usize * entry_size;
    let entries = data.get(entries_off..entries_off + entries_len)?;

    let Some((start, count)) = find_symbols_entry(entries, info.entries_count, new_layout, key)
    else {
        warn!("no local symbols entry for image at key {:#x}", key);
        return None;
    };

    slice_locals::<W>(data, local_off, &info, start, count)
}

/// Linear-scans the per-image entry table for a matching key.
///
/// Returns the `(nlist_start_index, nlist_count)` of the matching entry.
pub(crate) fn find_symbols_entry(
    entries: &[u8],
    count: u32,
    entry64: bool,
    key: u64,
) -> Option<(u32, u32)> {
    for i in 0..count as usize {
        if entry64 {
            let offset = i * DyldCacheLocalSymbolsEntry64::SIZE;
            let entry = DyldCacheLocalSymbolsEntry64::read_from_prefix(entries.get(offset..)?)
                .ok()?
                .0;
            if entry.dylib_offset == key {
                return Some((entry.nlist_start_index, entry.nlist_count));
            }
        } else {
            let offset = i * DyldCacheLocalSymbolsEntry::SIZE;
            let entry = DyldCacheLocalSymbolsEntry::read_from_prefix(entries.get(offset..)?)
                .ok()?
                .0;
            if entry.dylib_offset as u64 == key {
                return Some((entry.nlist_start_index, entry.nlist_count));
            }
        }
    }
    None
}

/// Slices the nlist range and strings region out of the symbols cache.
pub(crate) fn slice_locals<'a, W: PointerWidth>(
    data: &'a [u8],
    local_off: usize,
    info: &DyldCacheLocalSymbolsInfo,
    start: u32,
    count: u32,
) -> Option<RecoveredLocals<'a>> {
    let nlist_off = local_off + info.nlist_offset as usize + start as usize * W::NLIST_SIZE;
    let nlist_len = count as usize * W::NLIST_SIZE;
    let nlists = data.get(nlist_off..nlist_off + nlist_len)?;

    let strings_off = local_off + info.strings_offset as usize;
    let strings = data.get(strings_off..strings_off + info.strings_size as usize)?;

    Some(RecoveredLocals {
        nlists,
        count,
        strings,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::macho::{Nlist64, Pointer64};
    use zerocopy::IntoBytes;

    #[test]
    fn test_find_symbols_entry_32() {
        let entries: Vec<DyldCacheLocalSymbolsEntry> = vec![
            DyldCacheLocalSymbolsEntry {
                dylib_offset: 0x4000,
                nlist_start_index: 0,
                nlist_count: 3,
            },
            DyldCacheLocalSymbolsEntry {
                dylib_offset: 0x8000,
                nlist_start_index: 3,
                nlist_count: 7,
            },
        ];
        let mut bytes = Vec::new();
        for e in &entries {
            bytes.extend_from_slice(e.as_bytes());
        }

        assert_eq!(find_symbols_entry(&bytes, 2, false, 0x8000), Some((3, 7)));
        assert_eq!(find_symbols_entry(&bytes, 2, false, 0x4000), Some((0, 3)));
        assert_eq!(find_symbols_entry(&bytes, 2, false, 0xC000), None);
    }

    #[test]
    fn test_find_symbols_entry_64() {
        let entries: Vec<DyldCacheLocalSymbolsEntry64> = vec![
            DyldCacheLocalSymbolsEntry64 {
                dylib_offset: 0x2_0000_0000,
                nlist_start_index: 10,
                nlist_count: 4,
            },
        ];
        let mut bytes = Vec::new();
        for e in &entries {
            bytes.extend_from_slice(e.as_bytes());
        }

        assert_eq!(
            find_symbols_entry(&bytes, 1, true, 0x2_0000_0000),
            Some((10, 4))
        );
        assert_eq!(find_symbols_entry(&bytes, 1, true, 0), None);
    }

    #[test]
    fn test_slice_locals() {
        // Symbols cache blob: info at 0x10, nlists at 0x40, strings at 0x80.
        let mut data = vec![0u8; 0x100];
        let info = DyldCacheLocalSymbolsInfo {
            nlist_offset: 0x30,
            nlist_count: 4,
            strings_offset: 0x70,
            strings_size: 0x10,
            entries_offset: 0x90,
            entries_count: 1,
        };

        let mut nlist = Nlist64::default();
        nlist.n_strx = 1;
        nlist.n_value = 0xAB;
        let nlist_abs = 0x10 + 0x30 + 2 * Nlist64::SIZE;
        data[nlist_abs..nlist_abs + Nlist64::SIZE].copy_from_slice(nlist.as_bytes());
        data[0x10 + 0x70..0x10 + 0x70 + 6].copy_from_slice(b"\0_locl");

        let locals = slice_locals::<Pointer64>(&data, 0x10, &info, 2, 2).unwrap();
        assert_eq!(locals.count, 2);
        assert_eq!(locals.nlists.len(), 2 * Nlist64::SIZE);
        let parsed = Nlist64::read_from_prefix(locals.nlists).unwrap().0;
        assert_eq!(parsed.n_value, 0xAB);
        assert_eq!(&locals.strings[1..6], b"_locl");

        // Out-of-bounds ranges are rejected.
        assert!(slice_locals::<Pointer64>(&data, 0x10, &info, 100, 2).is_none());
    }
}
