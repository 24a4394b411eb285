//! Paged vector index.
//!
//! Fixed-dimension float32 rows stored off-heap in memory-mapped pages of
//! `block_size` bytes. A page holds `floor(block_size / (dimensions * 4))`
//! rows; rows never move once written, and row `id` always lives at the
//! same page position, so ids double as stable arena indices.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{Result, VulcanoError};
use crate::storage::paged::{PagedRegion, Segment};

/// Zero-copy view of one stored vector.
pub struct VectorRow<'a> {
    segment: &'a Arc<Segment>,
    offset: usize,
    dimensions: usize,
}

impl VectorRow<'_> {
    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    /// Element `j` of the row.
    pub fn element(&self, j: usize) -> f32 {
        debug_assert!(j < self.dimensions);
        let bytes = self.segment.read_bytes(self.offset + j * 4, 4);
        f32::from_le_bytes(bytes.try_into().expect("4 bytes"))
    }

    /// Materialize the row.
    pub fn to_vec(&self) -> Vec<f32> {
        (0..self.dimensions).map(|j| self.element(j)).collect()
    }
}

/// Off-heap store of dense float32 vectors.
#[derive(Debug)]
pub struct PagedVectorIndex {
    region: PagedRegion,
    dimensions: usize,
    rows_per_page: u64,
    next_id: AtomicU64,
}

impl PagedVectorIndex {
    /// Open the vector pages under `dir`. `next_id` restores the
    /// auto-assignment high-water mark from the owning index's metadata.
    pub fn open(
        dir: impl Into<PathBuf>,
        dimensions: usize,
        block_size: u64,
        next_id: u64,
    ) -> Result<Self> {
        if dimensions == 0 {
            return Err(VulcanoError::validation("vector dimensions must be >= 1"));
        }
        let row_bytes = dimensions as u64 * 4;
        if block_size < row_bytes {
            return Err(VulcanoError::validation(format!(
                "block size {block_size} cannot hold a {dimensions}-dimension vector"
            )));
        }
        let region = PagedRegion::open(dir, "page-", ".dat", block_size)?;
        Ok(Self {
            region,
            dimensions,
            rows_per_page: block_size / row_bytes,
            next_id: AtomicU64::new(next_id),
        })
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    /// Ids assigned so far by [`PagedVectorIndex::add`] / recorded via
    /// [`PagedVectorIndex::put`].
    pub fn next_id(&self) -> u64 {
        self.next_id.load(Ordering::Acquire)
    }

    /// Store `vector` under the next monotonically assigned id.
    pub fn add(&self, vector: &[f32]) -> Result<u64> {
        let id = self.next_id.fetch_add(1, Ordering::AcqRel);
        self.write(id, vector)?;
        Ok(id)
    }

    /// Store `vector` at an externally assigned id.
    pub fn put(&self, id: u64, vector: &[f32]) -> Result<()> {
        self.write(id, vector)?;
        // Keep the high-water mark past every externally assigned id.
        self.next_id.fetch_max(id + 1, Ordering::AcqRel);
        Ok(())
    }

    fn write(&self, id: u64, vector: &[f32]) -> Result<()> {
        if vector.len() != self.dimensions {
            return Err(VulcanoError::validation(format!(
                "vector has {} dimensions, index expects {}",
                vector.len(),
                self.dimensions
            )));
        }
        let (segment, offset) = self.locate(id)?;
        let mut bytes = Vec::with_capacity(vector.len() * 4);
        for v in vector {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        segment.write_bytes(offset, &bytes);
        Ok(())
    }

    /// Copy the vector at `id` out of its page.
    pub fn get(&self, id: u64) -> Result<Vec<f32>> {
        let (segment, offset) = self.locate(id)?;
        let bytes = segment.read_bytes(offset, self.dimensions * 4);
        Ok(bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes(c.try_into().expect("4 bytes")))
            .collect())
    }

    /// Read one element without materializing the row.
    pub fn get_element(&self, id: u64, j: usize) -> Result<f32> {
        if j >= self.dimensions {
            return Err(VulcanoError::validation(format!(
                "element index {j} out of {} dimensions",
                self.dimensions
            )));
        }
        let (segment, offset) = self.locate(id)?;
        let bytes = segment.read_bytes(offset + j * 4, 4);
        Ok(f32::from_le_bytes(bytes.try_into().expect("4 bytes")))
    }

    /// Run `f` over a zero-copy view of the row at `id`.
    pub fn with_row<T>(&self, id: u64, f: impl FnOnce(&VectorRow<'_>) -> T) -> Result<T> {
        let (segment, offset) = self.locate(id)?;
        let row = VectorRow {
            segment: &segment,
            offset,
            dimensions: self.dimensions,
        };
        Ok(f(&row))
    }

    fn locate(&self, id: u64) -> Result<(Arc<Segment>, usize)> {
        let page = id / self.rows_per_page;
        let offset = (id % self.rows_per_page) as usize * self.dimensions * 4;
        Ok((self.region.segment(page)?, offset))
    }

    pub fn flush(&self) -> Result<()> {
        self.region.flush_all()
    }

    pub fn close(&self) {
        self.region.close();
    }

    pub fn mapped_bytes(&self) -> u64 {
        self.region.mapped_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_add_assigns_monotonic_ids() {
        let dir = TempDir::new().unwrap();
        let index = PagedVectorIndex::open(dir.path(), 2, 1024, 0).unwrap();
        assert_eq!(index.add(&[1.0, 2.0]).unwrap(), 0);
        assert_eq!(index.add(&[3.0, 4.0]).unwrap(), 1);
        assert_eq!(index.get(0).unwrap(), vec![1.0, 2.0]);
        assert_eq!(index.get(1).unwrap(), vec![3.0, 4.0]);
    }

    #[test]
    fn test_dimension_mismatch_fails() {
        let dir = TempDir::new().unwrap();
        let index = PagedVectorIndex::open(dir.path(), 2, 1024, 0).unwrap();
        assert!(index.add(&[1.0, 2.0, 3.0]).is_err());
        assert!(index.add(&[]).is_err());
    }

    #[test]
    fn test_block_too_small_rejected() {
        let dir = TempDir::new().unwrap();
        assert!(PagedVectorIndex::open(dir.path(), 100, 16, 0).is_err());
        assert!(PagedVectorIndex::open(dir.path(), 0, 1024, 0).is_err());
    }

    #[test]
    fn test_page_overflow_maps_new_page() {
        let dir = TempDir::new().unwrap();
        // 8 bytes per row, 16-byte pages: two rows per page.
        let index = PagedVectorIndex::open(dir.path(), 2, 16, 0).unwrap();
        for i in 0..5u64 {
            index.put(i, &[i as f32, 0.0]).unwrap();
        }
        assert_eq!(index.get(4).unwrap(), vec![4.0, 0.0]);
        assert_eq!(index.get_element(3, 0).unwrap(), 3.0);
    }

    #[test]
    fn test_put_keeps_high_water_mark() {
        let dir = TempDir::new().unwrap();
        let index = PagedVectorIndex::open(dir.path(), 2, 1024, 0).unwrap();
        index.put(10, &[1.0, 1.0]).unwrap();
        assert_eq!(index.next_id(), 11);
        assert_eq!(index.add(&[2.0, 2.0]).unwrap(), 11);
    }

    #[test]
    fn test_row_view_matches_copy() {
        let dir = TempDir::new().unwrap();
        let index = PagedVectorIndex::open(dir.path(), 3, 1024, 0).unwrap();
        index.put(0, &[0.1, 0.2, 0.3]).unwrap();
        let from_row = index.with_row(0, |row| row.to_vec()).unwrap();
        assert_eq!(from_row, index.get(0).unwrap());
    }

    #[test]
    fn test_persistence_across_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let index = PagedVectorIndex::open(dir.path(), 2, 1024, 0).unwrap();
            index.put(0, &[9.0, 8.0]).unwrap();
            index.flush().unwrap();
        }
        let index = PagedVectorIndex::open(dir.path(), 2, 1024, 1).unwrap();
        assert_eq!(index.get(0).unwrap(), vec![9.0, 8.0]);
        assert_eq!(index.next_id(), 1);
    }
}
