//! Paged graph index.
//!
//! Fixed-width adjacency rows stored off-heap, one file family per HNSW
//! layer. Adjacency lists hold node ids, never pointers, so rows are
//! position-independent and survive remapping.
//!
//! ## Row layout
//!
//! ```text
//! [ count:u32 ][ pad:u32 ][ neighbor_id:i64 x m_max ]
//! ```

use std::path::PathBuf;

use crate::error::{Result, VulcanoError};
use crate::storage::paged::PagedRegion;

/// Off-heap adjacency store with a hard per-row neighbor cap.
#[derive(Debug)]
pub struct PagedGraphIndex {
    region: PagedRegion,
    m_max: usize,
    row_bytes: u64,
    rows_per_page: u64,
}

impl PagedGraphIndex {
    /// Open the adjacency pages under `dir` with `m_max` neighbors per row.
    pub fn open(dir: impl Into<PathBuf>, m_max: usize, block_size: u64) -> Result<Self> {
        if m_max == 0 {
            return Err(VulcanoError::validation("graph m_max must be >= 1"));
        }
        let row_bytes = 8 + 8 * m_max as u64;
        if block_size < row_bytes {
            return Err(VulcanoError::validation(format!(
                "block size {block_size} cannot hold a row of {m_max} neighbors"
            )));
        }
        let region = PagedRegion::open(dir, "page-", ".dat", block_size)?;
        Ok(Self {
            region,
            m_max,
            row_bytes,
            rows_per_page: block_size / row_bytes,
        })
    }

    pub fn m_max(&self) -> usize {
        self.m_max
    }

    /// Overwrite the adjacency list of `id`. Fails fast past `m_max`.
    pub fn set_connections(&self, id: u64, neighbors: &[u64]) -> Result<()> {
        if neighbors.len() > self.m_max {
            return Err(VulcanoError::index(format!(
                "{} neighbors exceed cap {}",
                neighbors.len(),
                self.m_max
            )));
        }
        let (segment, offset) = self.locate(id)?;
        for (slot, neighbor) in neighbors.iter().enumerate() {
            segment.write_i64(offset + 8 + slot * 8, *neighbor as i64);
        }
        segment.write_bytes(offset, &(neighbors.len() as u32).to_le_bytes());
        Ok(())
    }

    /// Append one neighbor to `id`'s list. Fails fast when full.
    pub fn add_connection(&self, id: u64, neighbor: u64) -> Result<()> {
        let (segment, offset) = self.locate(id)?;
        let count = segment.read_u32(offset) as usize;
        if count >= self.m_max {
            return Err(VulcanoError::index(format!(
                "adjacency of node {id} is full ({count}/{})",
                self.m_max
            )));
        }
        // Neighbor slot is written before the count so a concurrent reader
        // never sees an unwritten slot.
        segment.write_i64(offset + 8 + count * 8, neighbor as i64);
        segment.write_bytes(offset, &((count + 1) as u32).to_le_bytes());
        Ok(())
    }

    /// The adjacency list of `id`, possibly empty.
    pub fn connections(&self, id: u64) -> Result<Vec<u64>> {
        let (segment, offset) = self.locate(id)?;
        let count = (segment.read_u32(offset) as usize).min(self.m_max);
        let mut neighbors = Vec::with_capacity(count);
        for slot in 0..count {
            neighbors.push(segment.read_i64(offset + 8 + slot * 8) as u64);
        }
        Ok(neighbors)
    }

    fn locate(&self, id: u64) -> Result<(std::sync::Arc<crate::storage::paged::Segment>, usize)> {
        let page = id / self.rows_per_page;
        let offset = (id % self.rows_per_page) as usize * self.row_bytes as usize;
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
