//! Dyld shared cache context and file handling.
//!
//! This module provides the main interface for working with dyld shared
//! caches, including memory mapping, address conversion, and subcache
//! management.

use std::fs::File;
use std::path::{Path, PathBuf};

use memmap2::Mmap;
use zerocopy::FromBytes;

use super::structs::*;
use crate::error::{Error, Result};
use crate::util;

// =============================================================================
// Mapping Entry
// =============================================================================

/// A unified mapping entry covering both basic and extended mapping formats.
#[derive(Debug, Clone)]
pub struct MappingEntry {
    /// Virtual memory address
    pub address: u64,
    /// Size in bytes
    pub size: u64,
    /// File offset
    pub file_offset: u64,
    /// Maximum protection
    pub max_prot: u32,
    /// Initial protection
    pub init_prot: u32,
    /// Mapping flags (extended mappings only)
    pub flags: MappingFlags,
    /// Index of the subcache containing this mapping (0 = main cache)
    pub subcache_index: usize,
}

impl MappingEntry {
    /// Creates a mapping entry from basic mapping info.
    pub fn from_basic(info: &DyldCacheMappingInfo, subcache_index: usize) -> Self {
        Self {
            address: info.address,
            size: info.size,
            file_offset: info.file_offset,
            max_prot: info.max_prot,
            init_prot: info.init_prot,
            flags: MappingFlags::empty(),
            subcache_index,
        }
    }

    /// Creates a mapping entry from extended mapping info.
    pub fn from_extended(info: &DyldCacheMappingAndSlideInfo, subcache_index: usize) -> Self {
        Self {
            address: info.address,
            size: info.size,
            file_offset: info.file_offset,
            max_prot: info.max_prot,
            init_prot: info.init_prot,
            flags: MappingFlags::from_bits_truncate(info.flags),
            subcache_index,
        }
    }

    /// Returns true if this mapping contains the given virtual address.
    #[inline]
    pub fn contains_addr(&self, addr: u64) -> bool {
        addr >= self.address && addr < self.address + self.size
    }

    /// Converts a virtual address to a file offset.
    #[inline]
    pub fn addr_to_offset(&self, addr: u64) -> u64 {
        self.file_offset + (addr - self.address)
    }
}

// =============================================================================
// Image Entry
// =============================================================================

/// Information about a dylib in the cache.
#[derive(Debug, Clone)]
pub struct ImageEntry {
    /// Index in the images array
    pub index: usize,
    /// Virtual address of the Mach-O header
    pub address: u64,
    /// Path of the dylib (e.g., "/usr/lib/libc.dylib")
    pub path: String,
    /// Index of the subcache containing this image
    pub subcache_index: usize,
}

impl ImageEntry {
    /// Returns the basename of the path.
    pub fn basename(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }

    /// Returns true if the path matches the given filter.
    pub fn matches_filter(&self, filter: &str) -> bool {
        self.path.contains(filter) || self.basename().contains(filter)
    }
}

// =============================================================================
// Subcache Entry
// =============================================================================

/// A loaded subcache file.
#[derive(Debug)]
pub struct SubcacheFile {
    /// Memory-mapped file data
    pub mmap: Mmap,
    /// Path to the file
    pub path: PathBuf,
    /// UUID of the subcache
    pub uuid: [u8; 16],
    /// Parsed header
    pub header: DyldCacheHeader,
}

// =============================================================================
// Dyld Context
// =============================================================================

/// Main context for working with a dyld shared cache.
///
/// Holds the memory-mapped main cache, any subcaches, and the separate
/// `.symbols` file if the cache advertises one. All mappings are read-only;
/// extraction copies data out into per-image buffers.
#[derive(Debug)]
pub struct DyldContext {
    /// Main cache file (memory-mapped)
    pub mmap: Mmap,
    /// Path to the main cache file
    pub path: PathBuf,
    /// Parsed header
    pub header: DyldCacheHeader,
    /// All mappings (including from subcaches)
    pub mappings: Vec<MappingEntry>,
    /// All images
    pub images: Vec<ImageEntry>,
    /// Subcache files
    pub subcaches: Vec<SubcacheFile>,
    /// Symbols file (if separate)
    pub symbols_file: Option<SubcacheFile>,
}

impl DyldContext {
    /// Opens a dyld shared cache from the given path.
    ///
    /// This will automatically detect and load any subcaches and the
    /// separate symbols file.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let file = File::open(&path).map_err(|e| Error::FileOpen {
            path: path.clone(),
            source: e,
        })?;

        let mmap = unsafe { Mmap::map(&file) }.map_err(|e| Error::MemoryMap {
            path: path.clone(),
            source: e,
        })?;

        let header = Self::parse_header(&mmap)?;
        let mappings = Self::parse_mappings(&mmap, &header, 0)?;

        let mut ctx = Self {
            mmap,
            path: path.clone(),
            header,
            mappings,
            images: Vec::new(),
            subcaches: Vec::new(),
            symbols_file: None,
        };

        ctx.load_subcaches(&path)?;
        ctx.load_symbols_file(&path)?;
        ctx.images = ctx.parse_images()?;

        Ok(ctx)
    }

    /// Parses and validates a cache header.
    fn parse_header(data: &[u8]) -> Result<DyldCacheHeader> {
        if data.len() < std::mem::size_of::<DyldCacheHeader>() {
            return Err(Error::buffer_too_small(
                std::mem::size_of::<DyldCacheHeader>(),
                data.len(),
            ));
        }

        let header = DyldCacheHeader::read_from_prefix(data)
            .map_err(|_| Error::parse(0, "failed to parse dyld cache header"))?
            .0;

        if !header.is_valid() {
            return Err(Error::InvalidMagic([
                header.magic[0],
                header.magic[1],
                header.magic[2],
                header.magic[3],
            ]));
        }

        Ok(header)
    }

    /// Parses mapping entries from a cache file.
    fn parse_mappings(
        data: &[u8],
        header: &DyldCacheHeader,
        subcache_index: usize,
    ) -> Result<Vec<MappingEntry>> {
        let mut mappings = Vec::with_capacity(header.mapping_count as usize);

        let use_extended = header.contains_field(std::mem::offset_of!(
            DyldCacheHeader,
            mapping_with_slide_offset
        )) && header.mapping_with_slide_offset != 0;

        if use_extended {
            let offset = header.mapping_with_slide_offset as usize;
            for i in 0..header.mapping_with_slide_count as usize {
                let entry_offset = offset + i * std::mem::size_of::<DyldCacheMappingAndSlideInfo>();
                let info = DyldCacheMappingAndSlideInfo::read_from_prefix(&data[entry_offset..])
                    .map_err(|_| Error::parse(entry_offset, "failed to parse extended mapping"))?
                    .0;
                mappings.push(MappingEntry::from_extended(&info, subcache_index));
            }
        } else {
            let offset = header.mapping_offset as usize;
            for i in 0..header.mapping_count as usize {
                let entry_offset = offset + i * std::mem::size_of::<DyldCacheMappingInfo>();
                let info = DyldCacheMappingInfo::read_from_prefix(&data[entry_offset..])
                    .map_err(|_| Error::parse(entry_offset, "failed to parse mapping"))?
                    .0;
                mappings.push(MappingEntry::from_basic(&info, subcache_index));
            }
        }

        Ok(mappings)
    }

    /// Loads subcache files next to the main cache.
    fn load_subcaches(&mut self, main_path: &Path) -> Result<()> {
        if !self.header.has_subcaches() {
            return Ok(());
        }

        let parent_dir = main_path.parent().unwrap_or(Path::new("."));
        let main_name = main_path.file_name().and_then(|n| n.to_str()).unwrap_or("");

        let count = self.header.sub_cache_array_count as usize;
        let offset = self.header.sub_cache_array_offset as usize;

        let v2 = self.has_v2_subcache_entries();
        let entry_size = if v2 {
            std::mem::size_of::<DyldSubcacheEntry2>()
        } else {
            std::mem::size_of::<DyldSubcacheEntry>()
        };

        for i in 0..count {
            let entry_offset = offset + i * entry_size;

            let (uuid, suffix) = if v2 {
                let entry = DyldSubcacheEntry2::read_from_prefix(&self.mmap[entry_offset..])
                    .map_err(|_| Error::parse(entry_offset, "failed to parse subcache entry v2"))?
                    .0;
                (entry.uuid, entry.suffix_str().to_string())
            } else {
                let entry = DyldSubcacheEntry::read_from_prefix(&self.mmap[entry_offset..])
                    .map_err(|_| Error::parse(entry_offset, "failed to parse subcache entry"))?
                    .0;
                (entry.uuid, format!(".{}", i + 1))
            };

            let subcache_path = parent_dir.join(format!("{}{}", main_name, suffix));
            self.load_subcache_file(&subcache_path, uuid, i + 1)?;
        }

        Ok(())
    }

    /// Loads a single subcache file.
    fn load_subcache_file(
        &mut self,
        path: &Path,
        expected_uuid: [u8; 16],
        subcache_index: usize,
    ) -> Result<()> {
        let file = File::open(path).map_err(|_| Error::SubcacheNotFound {
            path: path.to_path_buf(),
        })?;

        let mmap = unsafe { Mmap::map(&file) }.map_err(|e| Error::MemoryMap {
            path: path.to_path_buf(),
            source: e,
        })?;

        let header = Self::parse_header(&mmap)?;

        if header.uuid != expected_uuid {
            return Err(Error::SubcacheUuidMismatch {
                path: path.to_path_buf(),
                expected: uuid_to_string(&expected_uuid),
                actual: uuid_to_string(&header.uuid),
            });
        }

        let subcache_mappings = Self::parse_mappings(&mmap, &header, subcache_index)?;
        self.mappings.extend(subcache_mappings);

        self.subcaches.push(SubcacheFile {
            mmap,
            path: path.to_path_buf(),
            uuid: header.uuid,
            header,
        });

        Ok(())
    }

    /// Loads the separate .symbols file if the header advertises one.
    fn load_symbols_file(&mut self, main_path: &Path) -> Result<()> {
        if !self.header.has_symbol_file() {
            return Ok(());
        }

        let parent_dir = main_path.parent().unwrap_or(Path::new("."));
        let main_name = main_path.file_name().and_then(|n| n.to_str()).unwrap_or("");
        let symbols_path = parent_dir.join(format!("{}.symbols", main_name));

        if !symbols_path.exists() {
            // The symbols file is optional; redacted locals are simply
            // unrecoverable without it.
            return Ok(());
        }

        let file = File::open(&symbols_path).map_err(|e| Error::FileOpen {
            path: symbols_path.clone(),
            source: e,
        })?;

        let mmap = unsafe { Mmap::map(&file) }.map_err(|e| Error::MemoryMap {
            path: symbols_path.clone(),
            source: e,
        })?;

        let header = Self::parse_header(&mmap)?;

        if header.uuid != self.header.symbol_file_uuid {
            return Err(Error::SubcacheUuidMismatch {
                path: symbols_path.clone(),
                expected: uuid_to_string(&self.header.symbol_file_uuid),
                actual: uuid_to_string(&header.uuid),
            });
        }

        self.symbols_file = Some(SubcacheFile {
            mmap,
            path: symbols_path,
            uuid: header.uuid,
            header,
        });

        Ok(())
    }

    /// Parses the image list.
    fn parse_images(&self) -> Result<Vec<ImageEntry>> {
        let count = self.header.actual_images_count() as usize;
        let offset = self.header.actual_images_offset() as usize;

        let mut images = Vec::with_capacity(count);

        for i in 0..count {
            let entry_offset = offset + i * std::mem::size_of::<DyldCacheImageInfo>();
            let info = DyldCacheImageInfo::read_from_prefix(&self.mmap[entry_offset..])
                .map_err(|_| Error::parse(entry_offset, "failed to parse image info"))?
                .0;

            let path = self.read_string(info.path_file_offset as usize)?;
            let subcache_index = self.find_subcache_for_addr(info.address);

            images.push(ImageEntry {
                index: i,
                address: info.address,
                path,
                subcache_index,
            });
        }

        Ok(images)
    }

    /// Checks if this cache uses v2 subcache entries (with embedded suffix).
    fn has_v2_subcache_entries(&self) -> bool {
        if self.header.sub_cache_array_count == 0 {
            return false;
        }

        let offset = self.header.sub_cache_array_offset as usize;
        if offset + std::mem::size_of::<DyldSubcacheEntry2>() > self.mmap.len() {
            return false;
        }

        // V2 entries carry an ASCII suffix starting with '.'
        if let Ok((entry, _)) = DyldSubcacheEntry2::read_from_prefix(&self.mmap[offset..]) {
            entry.file_suffix[0] == b'.'
        } else {
            false
        }
    }

    /// Finds which subcache contains the given address.
    fn find_subcache_for_addr(&self, addr: u64) -> usize {
        for mapping in &self.mappings {
            if mapping.contains_addr(addr) {
                return mapping.subcache_index;
            }
        }
        0
    }

    /// Reads a null-terminated string from the main cache.
    pub fn read_string(&self, offset: usize) -> Result<String> {
        let bytes = util::cstr_at(&self.mmap, offset)
            .ok_or_else(|| Error::parse(offset, "string offset out of bounds"))?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| Error::parse(offset, "invalid UTF-8 string"))
    }

    /// Converts a virtual address to a file offset within its subcache.
    #[inline]
    pub fn addr_to_offset(&self, addr: u64) -> Option<u64> {
        self.mappings
            .iter()
            .find(|m| m.contains_addr(addr))
            .map(|m| m.addr_to_offset(addr))
    }

    /// Returns the file data for a given address.
    ///
    /// This handles both the main cache and subcaches.
    #[inline]
    pub fn data_at_addr(&self, addr: u64, len: usize) -> Result<&[u8]> {
        let mapping = self
            .mappings
            .iter()
            .find(|m| m.contains_addr(addr))
            .ok_or(Error::AddressNotFound { addr })?;

        let offset = mapping.addr_to_offset(addr) as usize;
        let data = self.data_for_subcache(mapping.subcache_index);
        if offset + len > data.len() {
            return Err(Error::buffer_too_small(offset + len, data.len()));
        }
        Ok(&data[offset..offset + len])
    }

    /// Returns the mmap data for a given subcache index.
    #[inline]
    pub fn data_for_subcache(&self, index: usize) -> &[u8] {
        if index == 0 {
            &self.mmap[..]
        } else if let Some(subcache) = self.subcaches.get(index - 1) {
            &subcache.mmap[..]
        } else {
            &[]
        }
    }

    /// Returns an iterator over all images.
    pub fn iter_images(&self) -> impl Iterator<Item = &ImageEntry> {
        self.images.iter()
    }

    /// Finds an image by path or basename.
    pub fn find_image(&self, name: &str) -> Option<&ImageEntry> {
        self.images.iter().find(|img| img.matches_filter(name))
    }

    /// Returns the number of images in the cache.
    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    /// Returns the architecture of this cache.
    pub fn architecture(&self) -> &str {
        self.header.architecture()
    }

    /// Returns the total size of all cache files.
    pub fn total_size(&self) -> u64 {
        let main_size = self.mmap.len() as u64;
        let subcache_size: u64 = self.subcaches.iter().map(|s| s.mmap.len() as u64).sum();
        let symbols_size = self
            .symbols_file
            .as_ref()
            .map(|s| s.mmap.len() as u64)
            .unwrap_or(0);
        main_size + subcache_size + symbols_size
    }

    /// Probes whether the main cache header extends through the field at
    /// the given structural offset.
    #[inline]
    pub fn header_contains_member(&self, field_offset: usize) -> bool {
        self.header.contains_field(field_offset)
    }

    /// Returns the symbols cache: the file holding stripped local symbols
    /// and the `localSymbolsOffset` of its info structure.
    ///
    /// Newer caches keep local symbols in a separate .symbols file; older
    /// caches keep them in the main cache file.
    pub fn symbols_cache(&self) -> Option<(&[u8], u64)> {
        if let Some(ref symbols_file) = self.symbols_file {
            if symbols_file.header.local_symbols_offset != 0 {
                return Some((
                    &symbols_file.mmap[..],
                    symbols_file.header.local_symbols_offset,
                ));
            }
        }

        if self.header.local_symbols_offset != 0 && self.header.local_symbols_size != 0 {
            return Some((&self.mmap[..], self.header.local_symbols_offset));
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mapping_entry_contains() {
        let mapping = MappingEntry {
            address: 0x1000,
            size: 0x1000,
            file_offset: 0x0,
            max_prot: 7,
            init_prot: 5,
            flags: MappingFlags::empty(),
            subcache_index: 0,
        };

        assert!(mapping.contains_addr(0x1000));
        assert!(mapping.contains_addr(0x1FFF));
        assert!(!mapping.contains_addr(0x2000));
        assert!(!mapping.contains_addr(0x0FFF));
    }

    #[test]
    fn test_mapping_conversion() {
        let mapping = MappingEntry {
            address: 0x1_0000_0000,
            size: 0x1000_0000,
            file_offset: 0x1000,
            max_prot: 7,
            init_prot: 5,
            flags: MappingFlags::empty(),
            subcache_index: 0,
        };

        assert_eq!(mapping.addr_to_offset(0x1_0000_0000), 0x1000);
        assert_eq!(mapping.addr_to_offset(0x1_0001_0000), 0x11000);
    }
}
