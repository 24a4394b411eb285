//! Memory-mapped paged byte store.
//!
//! A [`PagedRegion`] is a family of fixed-size files under one directory,
//! lazily created on first access. Each file is pre-sized to the segment
//! length and mapped read/write, so reads past the written tail observe
//! zero bytes. Element layout and alignment are the caller's concern.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use log::debug;
use memmap2::MmapMut;
use parking_lot::{Mutex, RwLock};

use crate::error::Result;

/// One mapped segment file.
///
/// Raw-pointer accessors allow concurrent appends under the publication
/// protocols defined by the owning component; the `entry_len` word of every
/// record is the only location accessed atomically.
pub struct Segment {
    _mmap: MmapMut,
    ptr: *mut u8,
    len: usize,
}

// SAFETY: the mapping lives as long as the segment; concurrent access is
// coordinated by the owning component's reservation/publication protocol.
unsafe impl Send for Segment {}
unsafe impl Sync for Segment {}

impl Segment {
    fn new(mut mmap: MmapMut) -> Self {
        let ptr = mmap.as_mut_ptr();
        let len = mmap.len();
        Self {
            _mmap: mmap,
            ptr,
            len,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    /// Copy `src` into the segment at `offset`.
    ///
    /// The caller must hold the exclusive right to this byte range (an
    /// offset reservation) and must stay within the segment.
    pub fn write_bytes(&self, offset: usize, src: &[u8]) {
        debug_assert!(offset + src.len() <= self.len);
        // SAFETY: the reservation protocol guarantees this range is owned by
        // exactly one writer and lies inside the mapping.
        unsafe {
            std::ptr::copy_nonoverlapping(src.as_ptr(), self.ptr.add(offset), src.len());
        }
    }

    /// Borrow `len` bytes at `offset`.
    pub fn read_bytes(&self, offset: usize, len: usize) -> &[u8] {
        debug_assert!(offset + len <= self.len);
        // SAFETY: range-checked above; the returned slice borrows `self`.
        unsafe { std::slice::from_raw_parts(self.ptr.add(offset), len) }
    }

    /// Read a little-endian `u32` at `offset` (no ordering).
    pub fn read_u32(&self, offset: usize) -> u32 {
        let mut buf = [0u8; 4];
        buf.copy_from_slice(self.read_bytes(offset, 4));
        u32::from_le_bytes(buf)
    }

    /// Read a little-endian `i64` at `offset`.
    pub fn read_i64(&self, offset: usize) -> i64 {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(self.read_bytes(offset, 8));
        i64::from_le_bytes(buf)
    }

    /// Write a little-endian `i64` at `offset`.
    pub fn write_i64(&self, offset: usize, value: i64) {
        self.write_bytes(offset, &value.to_le_bytes());
    }

    /// Publish a record length with release ordering.
    ///
    /// A reader observing the stored value via [`Segment::load_u32_acquire`]
    /// also observes every byte written before this call. `offset` must be
    /// 4-byte aligned.
    pub fn store_u32_release(&self, offset: usize, value: u32) {
        debug_assert!(offset % 4 == 0 && offset + 4 <= self.len);
        // SAFETY: aligned, in-bounds, and the word is only ever accessed
        // through these atomic helpers once published.
        let atom = unsafe { AtomicU32::from_ptr(self.ptr.add(offset) as *mut u32) };
        atom.store(value, Ordering::Release);
    }

    /// Acquire-load a record length published by [`Segment::store_u32_release`].
    pub fn load_u32_acquire(&self, offset: usize) -> u32 {
        debug_assert!(offset % 4 == 0 && offset + 4 <= self.len);
        // SAFETY: aligned and in-bounds.
        let atom = unsafe { AtomicU32::from_ptr(self.ptr.add(offset) as *mut u32) };
        atom.load(Ordering::Acquire)
    }

    /// Zero the byte range `[offset, offset + len)`.
    pub fn zero(&self, offset: usize, len: usize) {
        debug_assert!(offset + len <= self.len);
        // SAFETY: range-checked; used only during single-threaded recovery.
        unsafe {
            std::ptr::write_bytes(self.ptr.add(offset), 0, len);
        }
    }

    /// Flush the whole segment to durable storage.
    pub fn flush(&self) -> Result<()> {
        self._mmap.flush()?;
        Ok(())
    }

    /// Flush a byte range to durable storage.
    pub fn flush_range(&self, offset: usize, len: usize) -> Result<()> {
        self._mmap.flush_range(offset, len)?;
        Ok(())
    }
}

/// A lazily allocated family of fixed-size mapped segments.
pub struct PagedRegion {
    dir: PathBuf,
    prefix: String,
    suffix: String,
    segment_size: u64,
    segments: RwLock<HashMap<u64, Arc<Segment>>>,
    create_lock: Mutex<()>,
    mapped_bytes: AtomicU64,
}

impl PagedRegion {
    /// Open a region under `dir`. Segment `n` lives in `<prefix><n><suffix>`.
    pub fn open(
        dir: impl Into<PathBuf>,
        prefix: impl Into<String>,
        suffix: impl Into<String>,
        segment_size: u64,
    ) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            prefix: prefix.into(),
            suffix: suffix.into(),
            segment_size,
            segments: RwLock::new(HashMap::new()),
            create_lock: Mutex::new(()),
            mapped_bytes: AtomicU64::new(0),
        })
    }

    pub fn segment_size(&self) -> u64 {
        self.segment_size
    }

    /// Total bytes currently mapped by this region.
    pub fn mapped_bytes(&self) -> u64 {
        self.mapped_bytes.load(Ordering::Relaxed)
    }

    fn segment_path(&self, index: u64) -> PathBuf {
        self.dir
            .join(format!("{}{}{}", self.prefix, index, self.suffix))
    }

    /// The segment covering `[index * size, (index + 1) * size)`, creating
    /// and mapping it if needed. Creation is serialized per region.
    pub fn segment(&self, index: u64) -> Result<Arc<Segment>> {
        if let Some(segment) = self.segments.read().get(&index) {
            return Ok(segment.clone());
        }

        let _guard = self.create_lock.lock();
        if let Some(segment) = self.segments.read().get(&index) {
            return Ok(segment.clone());
        }

        let path = self.segment_path(index);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        if file.metadata()?.len() < self.segment_size {
            file.set_len(self.segment_size)?;
        }
        // SAFETY: the file is open read/write and pre-sized to cover the
        // whole mapping range.
        let mmap = unsafe { MmapMut::map_mut(&file)? };
        debug!("mapped segment {}", path.display());

        let segment = Arc::new(Segment::new(mmap));
        self.mapped_bytes
            .fetch_add(self.segment_size, Ordering::Relaxed);
        self.segments.write().insert(index, segment.clone());
        Ok(segment)
    }

    /// The segment containing `global_offset`, plus the offset within it.
    pub fn segment_for(&self, global_offset: u64) -> Result<(Arc<Segment>, usize)> {
        let index = global_offset / self.segment_size;
        let within = (global_offset % self.segment_size) as usize;
        Ok((self.segment(index)?, within))
    }

    /// Indices of segment files present on disk, ascending.
    pub fn existing_segments(&self) -> Result<Vec<u64>> {
        let mut indices = Vec::new();
        if !self.dir.exists() {
            return Ok(indices);
        }
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(rest) = name.strip_prefix(self.prefix.as_str()) {
                if let Some(digits) = rest.strip_suffix(self.suffix.as_str()) {
                    if let Ok(index) = digits.parse::<u64>() {
                        indices.push(index);
                    }
                }
            }
        }
        indices.sort_unstable();
        Ok(indices)
    }

    /// Delete the on-disk file of segment `index` and drop its mapping.
    pub fn remove_segment(&self, index: u64) -> Result<()> {
        if self.segments.write().remove(&index).is_some() {
            self.mapped_bytes
                .fetch_sub(self.segment_size, Ordering::Relaxed);
        }
        let path = self.segment_path(index);
        if path.exists() {
            std::fs::remove_file(&path)?;
            debug!("removed segment {}", path.display());
        }
        Ok(())
    }

    /// Flush every mapped segment.
    pub fn flush_all(&self) -> Result<()> {
        for segment in self.segments.read().values() {
            segment.flush()?;
        }
        Ok(())
    }

    /// Release all mappings. Subsequent access re-maps on demand.
    pub fn close(&self) {
        let mut segments = self.segments.write();
        let released = segments.len() as u64 * self.segment_size;
        segments.clear();
        self.mapped_bytes.fetch_sub(released, Ordering::Relaxed);
    }
}

impl std::fmt::Debug for PagedRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PagedRegion")
            .field("dir", &self.dir)
            .field("segment_size", &self.segment_size)
            .field("mapped", &self.segments.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_lazy_creation_and_zero_fill() {
        let dir = TempDir::new().unwrap();
        let region = PagedRegion::open(dir.path(), "seg-", ".dat", 4096).unwrap();
        assert!(region.existing_segments().unwrap().is_empty());

        let segment = region.segment(2).unwrap();
        assert_eq!(segment.len(), 4096);
        assert_eq!(segment.read_bytes(100, 8), &[0u8; 8]);
        assert_eq!(region.existing_segments().unwrap(), vec![2]);
    }

    #[test]
    fn test_write_read_round_trip() {
        let dir = TempDir::new().unwrap();
        let region = PagedRegion::open(dir.path(), "seg-", ".dat", 4096).unwrap();
        let segment = region.segment(0).unwrap();
        segment.write_bytes(16, b"vulcano");
        assert_eq!(segment.read_bytes(16, 7), b"vulcano");
        segment.write_i64(32, -1);
        assert_eq!(segment.read_i64(32), -1);
    }

    #[test]
    fn test_publication_atomics() {
        let dir = TempDir::new().unwrap();
        let region = PagedRegion::open(dir.path(), "seg-", ".dat", 4096).unwrap();
        let segment = region.segment(0).unwrap();
        assert_eq!(segment.load_u32_acquire(0), 0);
        segment.store_u32_release(0, 24);
        assert_eq!(segment.load_u32_acquire(0), 24);
        assert_eq!(segment.read_u32(0), 24);
    }

    #[test]
    fn test_segment_for_addresses_across_files() {
        let dir = TempDir::new().unwrap();
        let region = PagedRegion::open(dir.path(), "seg-", ".dat", 1024).unwrap();
        let (_seg, within) = region.segment_for(1024 + 40).unwrap();
        assert_eq!(within, 40);
        assert_eq!(region.existing_segments().unwrap(), vec![1]);
    }

    #[test]
    fn test_persistence_across_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let region = PagedRegion::open(dir.path(), "seg-", ".dat", 1024).unwrap();
            let segment = region.segment(0).unwrap();
            segment.write_bytes(0, b"durable");
            segment.flush().unwrap();
        }
        {
            let region = PagedRegion::open(dir.path(), "seg-", ".dat", 1024).unwrap();
            let segment = region.segment(0).unwrap();
            assert_eq!(segment.read_bytes(0, 7), b"durable");
        }
    }
}
