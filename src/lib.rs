//! dscex - extracts standalone Mach-O images from Apple's dyld shared cache.
//!
//! Images inside the cache have been post-processed by the shared-cache
//! builder: their `__LINKEDIT` segments are coalesced into cache-wide tables,
//! local symbols are stripped into a separate subcache, and indirect symbol
//! indices reference the coalesced symbol table. A raw dump of an image's
//! bytes is therefore not a loadable Mach-O. This crate reads the cache (and
//! its subcaches), copies an image out, and rebuilds a self-contained
//! `__LINKEDIT` for it.
//!
//! # Example
//!
//! ```no_run
//! use dscex::{Activity, DyldContext, extract_image};
//!
//! fn main() -> dscex::Result<()> {
//!     let cache = DyldContext::open("/path/to/dyld_shared_cache_arm64e")?;
//!     extract_image(
//!         &cache,
//!         "/usr/lib/system/libsystem_malloc.dylib",
//!         "out/libsystem_malloc.dylib",
//!         &Activity::disabled(),
//!     )
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod activity;
pub mod converter;
pub mod dyld;
pub mod error;
pub mod macho;
pub mod util;

pub use activity::Activity;
pub use converter::{reconstruct_linkedit, LinkeditReconstruction};
pub use dyld::{DyldContext, ImageEntry};
pub use error::{Error, Result};
pub use macho::MachoContext;

use std::fs;
use std::path::Path;

use tracing::{debug, info};
use zerocopy::FromBytes;

use macho::{MachHeader32, MachHeader64, MH_MAGIC, MH_MAGIC_64};

/// Copies an image out of the cache into a standalone buffer.
///
/// Each segment's bytes are copied from their cache address to the file
/// offset its load command names, so the resulting buffer is a Mach-O laid
/// out at file offsets. The LINKEDIT region still references the coalesced
/// cache tables until it is reconstructed.
pub fn build_image_buffer(cache: &DyldContext, image: &ImageEntry) -> Result<Vec<u8>> {
    let magic_bytes = cache.data_at_addr(image.address, 4)?;
    let magic = util::read_u32_le(magic_bytes);
    let header_size = match magic {
        MH_MAGIC_64 => MachHeader64::SIZE,
        MH_MAGIC => MachHeader32::SIZE,
        other => return Err(Error::InvalidMachoMagic(other)),
    };

    // The leading header fields are width-independent, so the 64-bit
    // layout reads sizeofcmds correctly for both.
    let header_bytes = cache.data_at_addr(image.address, MachHeader64::SIZE)?;
    let header = MachHeader64::read_from_prefix(header_bytes)
        .map_err(|_| Error::InvalidMachoMagic(magic))?
        .0;

    let head_size = header_size + header.sizeofcmds as usize;
    let head = cache.data_at_addr(image.address, head_size)?.to_vec();

    // Parse the commands to learn the segment layout.
    let probe = MachoContext::new(head.clone())?;

    let mut file_end = head_size as u64;
    for seg in probe.segments() {
        file_end = file_end.max(seg.fileoff + seg.filesize);
    }

    let mut buffer = vec![0u8; file_end as usize];
    buffer[..head_size].copy_from_slice(&head);

    for seg in probe.segments() {
        if seg.filesize == 0 {
            continue;
        }
        let src = cache.data_at_addr(seg.vmaddr, seg.filesize as usize)?;
        let dst = seg.fileoff as usize;
        buffer[dst..dst + seg.filesize as usize].copy_from_slice(src);
    }

    debug!(
        image = %image.path,
        size = buffer.len(),
        "copied image out of cache"
    );

    Ok(buffer)
}

/// Extracts a single image from the cache.
///
/// Finds the image, copies its segments out, rebuilds its LINKEDIT, and
/// writes the result to `output_path`. On failure no output is written and
/// the error describes why the image was skipped.
pub fn extract_image<P: AsRef<Path>>(
    cache: &DyldContext,
    image_path: &str,
    output_path: P,
    activity: &Activity,
) -> Result<()> {
    let output_path = output_path.as_ref();

    let image = cache
        .find_image(image_path)
        .ok_or_else(|| Error::ImageNotFound {
            name: image_path.to_string(),
        })?;

    activity.update_task("Copying segments");
    let buffer = build_image_buffer(cache, image)?;
    let mut macho = MachoContext::new(buffer)?;

    let reconstruction = reconstruct_linkedit(&mut macho, Some(cache), activity)?;

    // Everything past the rebuilt LINKEDIT is dead cache tail.
    let mut file_end = 0u64;
    for seg in macho.segments() {
        file_end = file_end.max(seg.fileoff + seg.filesize);
    }

    if let Some(parent) = output_path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(|e| Error::FileOpen {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }
    }

    activity.update_task("Writing output");
    fs::write(output_path, &macho.data[..file_end as usize]).map_err(|e| Error::FileWrite {
        path: output_path.to_path_buf(),
        source: e,
    })?;

    info!(
        image = %image.path,
        symbols = reconstruction.symbol_count,
        redacted_indirect = reconstruction.has_redacted_indirect,
        "extracted"
    );

    Ok(())
}

/// Finds images matching a substring filter.
pub fn find_images<'a>(
    cache: &'a DyldContext,
    filter: &'a str,
) -> impl Iterator<Item = &'a ImageEntry> {
    cache
        .iter_images()
        .filter(move |img| img.matches_filter(filter))
}
