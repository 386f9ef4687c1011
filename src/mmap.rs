//! Memory-mapped file access
//!
//! Read-only, read-write and copy-on-write mappings over whole files, page
//! aligned partial regions for very large packs, and a zero-copy streaming
//! reader for bulk chunk data. Prefetch calls are advisory; the OS may
//! ignore them.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use memmap2::{Mmap, MmapMut, MmapOptions};

use crate::compression::{decompress, Compression};
use crate::error::{Error, Result};

/// Mapping access mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MapAccess {
    #[default]
    ReadOnly,
    ReadWrite,
    /// Writes are visible to this mapping only and never reach the file.
    CopyOnWrite,
}

/// Mapping granularity used to align partial regions. 64 KiB is a multiple
/// of every page size we run on and of the Windows allocation granularity.
pub const MAP_GRANULARITY: u64 = 64 * 1024;

enum MapInner {
    // Empty files cannot be mapped on every platform.
    Empty,
    ReadOnly(Mmap),
    Writable(MmapMut),
}

impl MapInner {
    fn as_slice(&self) -> &[u8] {
        match self {
            MapInner::Empty => &[],
            MapInner::ReadOnly(m) => m,
            MapInner::Writable(m) => m,
        }
    }
}

fn open_for(path: &Path, access: MapAccess) -> Result<File> {
    let mut options = OpenOptions::new();
    options.read(true);
    if access == MapAccess::ReadWrite {
        options.write(true);
    }
    options
        .open(path)
        .map_err(|e| Error::Io(format!("failed to open {}: {e}", path.display())))
}

fn map_file(file: &File, access: MapAccess, offset: u64, len: usize) -> Result<MapInner> {
    if len == 0 {
        return Ok(MapInner::Empty);
    }
    let mut options = MmapOptions::new();
    options.offset(offset).len(len);
    // Safety: the mapping is backed by a file we opened; mutating the file
    // underneath a live map is the documented hazard shared by every
    // memmap2 user, and packs are replaced by rename rather than rewritten
    // in place.
    let inner = unsafe {
        match access {
            MapAccess::ReadOnly => MapInner::ReadOnly(options.map(file)?),
            MapAccess::ReadWrite => MapInner::Writable(options.map_mut(file)?),
            MapAccess::CopyOnWrite => MapInner::Writable(options.map_copy(file)?),
        }
    };
    Ok(inner)
}

impl MapInner {
    fn prefetch(&self, offset: usize, len: usize) {
        #[cfg(unix)]
        {
            use memmap2::Advice;
            // Best effort; an error means the hint was ignored.
            let _ = match self {
                MapInner::Empty => Ok(()),
                MapInner::ReadOnly(m) => m.advise_range(Advice::WillNeed, offset, len),
                MapInner::Writable(m) => m.advise_range(Advice::WillNeed, offset, len),
            };
        }
        #[cfg(not(unix))]
        {
            // Touch one byte per page to pull the range in.
            let data = self.as_slice();
            let end = data.len().min(offset.saturating_add(len));
            let mut i = offset;
            while i < end {
                unsafe { std::ptr::read_volatile(data.as_ptr().add(i)) };
                i += 4096;
            }
        }
    }
}

/// A whole file mapped into memory.
pub struct MappedFile {
    path: PathBuf,
    inner: MapInner,
    len: usize,
}

impl MappedFile {
    pub fn open(path: impl AsRef<Path>, access: MapAccess) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = open_for(&path, access)?;
        let len = file.metadata()?.len() as usize;
        let inner = map_file(&file, access, 0, len)?;
        Ok(MappedFile { path, inner, len })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The full mapped contents.
    pub fn as_slice(&self) -> &[u8] {
        self.inner.as_slice()
    }

    /// Mutable view for read-write and copy-on-write mappings.
    pub fn as_mut_slice(&mut self) -> Option<&mut [u8]> {
        match &mut self.inner {
            MapInner::Writable(m) => Some(&mut m[..]),
            _ => None,
        }
    }

    /// Bounds-checked sub-slice.
    pub fn read(&self, offset: u64, len: usize) -> Result<&[u8]> {
        let end = offset
            .checked_add(len as u64)
            .ok_or_else(|| Error::Bounds("mapped read overflows".into()))?;
        if end > self.len as u64 {
            return Err(Error::Bounds(format!(
                "mapped read of {len} bytes at {offset} exceeds file size {}",
                self.len
            )));
        }
        Ok(&self.as_slice()[offset as usize..end as usize])
    }

    /// Hint the OS that a range will be read soon.
    pub fn prefetch(&self, offset: u64, len: usize) {
        if offset as usize >= self.len {
            return;
        }
        let len = len.min(self.len - offset as usize);
        self.inner.prefetch(offset as usize, len);
    }
}

/// A mapped window of a file. The start is aligned down to
/// [`MAP_GRANULARITY`]; callers see exactly the span they asked for.
pub struct MappedRegion {
    inner: MapInner,
    lead: usize,
    len: usize,
    file_offset: u64,
}

impl MappedRegion {
    pub fn map(path: impl AsRef<Path>, offset: u64, len: usize, access: MapAccess) -> Result<Self> {
        let path = path.as_ref();
        let file = open_for(path, access)?;
        let file_len = file.metadata()?.len();

        let end = offset
            .checked_add(len as u64)
            .ok_or_else(|| Error::Bounds("region overflows".into()))?;
        if end > file_len {
            return Err(Error::Bounds(format!(
                "region {offset}+{len} exceeds file size {file_len}"
            )));
        }

        let aligned = offset - (offset % MAP_GRANULARITY);
        let lead = (offset - aligned) as usize;
        let inner = map_file(&file, access, aligned, lead + len)?;

        Ok(MappedRegion {
            inner,
            lead,
            len,
            file_offset: offset,
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// File offset this region starts at, as requested by the caller.
    pub fn file_offset(&self) -> u64 {
        self.file_offset
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.inner.as_slice()[self.lead..self.lead + self.len]
    }
}

/// Zero-copy chunk access over a memory-mapped pack file.
pub struct StreamingBulkReader {
    file: MappedFile,
}

impl StreamingBulkReader {
    pub fn open(pack_path: impl AsRef<Path>) -> Result<Self> {
        Ok(StreamingBulkReader {
            file: MappedFile::open(pack_path, MapAccess::ReadOnly)?,
        })
    }

    pub fn pack_size(&self) -> usize {
        self.file.len()
    }

    /// Borrow raw chunk bytes straight out of the mapping.
    pub fn read_chunk(&self, offset: u64, size: usize) -> Result<&[u8]> {
        self.file.read(offset, size)
    }

    /// Read a compressed span and decompress it into a fresh buffer.
    pub fn read_and_decompress(
        &self,
        offset: u64,
        compressed_size: usize,
        uncompressed_size: usize,
        mode: Compression,
    ) -> Result<Vec<u8>> {
        let raw = self.file.read(offset, compressed_size)?;
        decompress(raw, uncompressed_size, mode)
    }

    pub fn prefetch_range(&self, offset: u64, size: usize) {
        self.file.prefetch(offset, size);
    }

    /// Map a dedicated region for longer-lived access.
    pub fn map_region(&self, offset: u64, size: usize) -> Result<MappedRegion> {
        MappedRegion::map(self.file.path(), offset, size, MapAccess::ReadOnly)
    }
}
