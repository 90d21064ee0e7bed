//! Read-only mapping of a bundle file.
//!
//! A bundle is opened once and indexed once; after that, every sub-model
//! span the runtime hands out is a direct view into the mapping. Entry
//! bounds are checked when the central directory is parsed, not on every
//! access, so this type stays deliberately small: open the file, expose the
//! bytes, unmap on drop.

use std::fs::File;
use std::path::Path;

use memmap2::Mmap;

use crate::error::{EdgeLmError, Result};

/// A bundle file mapped read-only for the lifetime of this value.
#[derive(Debug)]
pub struct MappedFile {
    mmap: Mmap,
}

impl MappedFile {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| {
            EdgeLmError::InvalidArgument(format!("cannot open bundle {}: {e}", path.display()))
        })?;

        // Safety: the supported contract for bundles is write-once; nothing
        // in this process mutates the file, and replacing a bundle that a
        // running executor still holds open is not supported. Under that
        // contract the mapping stays stable for its whole lifetime.
        let mmap = unsafe { Mmap::map(&file) }.map_err(|e| {
            EdgeLmError::InvalidArgument(format!("cannot map bundle {}: {e}", path.display()))
        })?;

        Ok(MappedFile { mmap })
    }

    /// The full mapped contents.
    pub fn as_bytes(&self) -> &[u8] {
        &self.mmap
    }
}
