//! Hash-partitioned append-only index.
//!
//! Maps keys to data-log offsets. Keys are partitioned into
//! `bucket_count` buckets by a strong 64-bit hash; each bucket owns its own
//! paged segment family (`index-b<bucket>-seg<n>.idx`). Entries within a
//! bucket follow the same reserve-then-publish discipline as the data log;
//! collisions are resolved linearly with the most recent entry winning.
//!
//! ## Entry layout
//!
//! ```text
//! [ entry_len:u32 ][ key_len:u32 ][ key:bytes ][ pad -> 8 ][ data_offset:i64 ]
//! ```
//!
//! A `data_offset` of `-1` is a tombstone: the key is absent.

use std::collections::HashMap;
use std::hash::BuildHasher;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use log::debug;
use parking_lot::{Mutex, RwLock};

use crate::error::{Result, VulcanoError};
use crate::storage::data_log::align8;
use crate::storage::paged::PagedRegion;

/// Tombstone marker for removed keys.
pub const TOMBSTONE: i64 = -1;

// Fixed seeds: bucket selection must be stable across restarts.
const HASH_SEEDS: (u64, u64, u64, u64) = (
    0x7663_616e_6f64_6201,
    0x9e37_79b9_7f4a_7c15,
    0x85eb_ca77_c2b2_ae63,
    0xc2b2_ae3d_27d4_eb4f,
);

struct Bucket {
    region: PagedRegion,
    reserved: AtomicU64,
    committed: AtomicU64,
}

impl Bucket {
    fn entry_len(key_len: u64) -> u64 {
        align8(8 + key_len) + 8
    }

    fn insert(&self, key: &str, data_offset: i64) -> Result<()> {
        let key_len = key.len() as u64;
        let entry_len = Self::entry_len(key_len);
        if entry_len > self.region.segment_size() {
            return Err(VulcanoError::validation(format!(
                "index entry of {entry_len} bytes exceeds segment size {}",
                self.region.segment_size()
            )));
        }

        let offset = self.reserve(entry_len)?;
        let (segment, within) = self.region.segment_for(offset)?;
        segment.write_bytes(within + 4, &(key_len as u32).to_le_bytes());
        segment.write_bytes(within + 8, key.as_bytes());
        segment.write_i64(within + (entry_len - 8) as usize, data_offset);
        segment.store_u32_release(within, entry_len as u32);

        self.advance_committed();
        Ok(())
    }

    fn reserve(&self, len: u64) -> Result<u64> {
        let segment_size = self.region.segment_size();
        loop {
            let current = self.reserved.load(Ordering::Acquire);
            let segment_end = (current / segment_size + 1) * segment_size;
            let start = if current + len <= segment_end {
                current
            } else {
                segment_end
            };
            if self
                .reserved
                .compare_exchange(current, start + len, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                if start != current {
                    let (segment, within) = self.region.segment_for(current)?;
                    segment.write_bytes(within + 4, &0u32.to_le_bytes());
                    segment.store_u32_release(within, (segment_end - current) as u32);
                }
                return Ok(start);
            }
        }
    }

    fn advance_committed(&self) {
        loop {
            let committed = self.committed.load(Ordering::Acquire);
            if committed >= self.reserved.load(Ordering::Acquire) {
                return;
            }
            let Ok((segment, within)) = self.region.segment_for(committed) else {
                return;
            };
            let len = segment.load_u32_acquire(within);
            if len == 0 {
                return;
            }
            let _ = self.committed.compare_exchange(
                committed,
                committed + len as u64,
                Ordering::AcqRel,
                Ordering::Acquire,
            );
        }
    }

    /// Scan the bucket up to the committed snapshot; the last match wins.
    fn lookup(&self, key: &str) -> Result<Option<i64>> {
        self.advance_committed();
        let committed = self.committed.load(Ordering::Acquire);
        let mut result = None;
        self.for_each_entry(committed, |entry_key, data_offset| {
            if entry_key == key.as_bytes() {
                result = Some(data_offset);
            }
        })?;
        Ok(result)
    }

    /// Visit every committed `(key, data_offset)` entry in append order.
    fn for_each_entry(
        &self,
        committed: u64,
        mut visit: impl FnMut(&[u8], i64),
    ) -> Result<()> {
        let mut position = 0u64;
        while position < committed {
            let (segment, within) = self.region.segment_for(position)?;
            let entry_len = segment.load_u32_acquire(within) as u64;
            if entry_len == 0 {
                return Err(VulcanoError::corruption(format!(
                    "zero entry length inside committed bucket range at {position}"
                )));
            }
            let key_len = segment.read_u32(within + 4) as u64;
            if key_len > 0 {
                if align8(8 + key_len) + 8 != entry_len {
                    return Err(VulcanoError::corruption(format!(
                        "key length {key_len} inconsistent with entry length {entry_len}"
                    )));
                }
                let key = segment.read_bytes(within + 8, key_len as usize);
                let data_offset = segment.read_i64(within + (entry_len - 8) as usize);
                visit(key, data_offset);
            }
            position += entry_len;
        }
        Ok(())
    }

    /// Reconstruct the committed cursor after reopen: walk entries until a
    /// zero/partial entry or an entry whose data offset lies past the
    /// committed data offset, then zero the discarded tail.
    fn recover(&self, committed_data: u64) -> Result<()> {
        let segment_size = self.region.segment_size();
        let existing = self.region.existing_segments()?;
        let Some(&last) = existing.last() else {
            return Ok(());
        };
        let end = (last + 1) * segment_size;

        let mut position = 0u64;
        while position < end {
            let (segment, within) = self.region.segment_for(position)?;
            let entry_len = segment.load_u32_acquire(within) as u64;
            if entry_len == 0
                || entry_len % 8 != 0
                || within as u64 + entry_len > segment_size
            {
                break;
            }
            let key_len = segment.read_u32(within + 4) as u64;
            if key_len > 0 {
                if align8(8 + key_len) + 8 != entry_len {
                    break;
                }
                let data_offset = segment.read_i64(within + (entry_len - 8) as usize);
                if data_offset != TOMBSTONE && data_offset as u64 >= committed_data {
                    // Index publication not covered by the last metadata
                    // commit; the entry and everything after it is stale.
                    break;
                }
            }
            position += entry_len;
        }

        let tail_segment = position / segment_size;
        let within = (position % segment_size) as usize;
        for index in existing {
            if index > tail_segment || (index == tail_segment && within == 0 && position > 0) {
                self.region.remove_segment(index)?;
            } else if index == tail_segment {
                let segment = self.region.segment(tail_segment)?;
                segment.zero(within, segment.len() - within);
            }
        }

        self.reserved.store(position, Ordering::Release);
        self.committed.store(position, Ordering::Release);
        Ok(())
    }
}

/// Bucketed key -> data-offset index.
pub struct HashIndex {
    dir: PathBuf,
    bucket_count: u32,
    segment_size: u64,
    buckets: RwLock<HashMap<u32, Arc<Bucket>>>,
    create_lock: Mutex<()>,
    hasher: ahash::RandomState,
}

impl HashIndex {
    /// Open the index under `dir`, rebuilding per-bucket committed cursors
    /// for every bucket with on-disk segments. `committed_data` bounds the
    /// data offsets an entry may reference.
    pub fn open(
        dir: impl Into<PathBuf>,
        bucket_count: u32,
        segment_size: u64,
        committed_data: u64,
    ) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        let index = Self {
            dir,
            bucket_count,
            segment_size,
            buckets: RwLock::new(HashMap::new()),
            create_lock: Mutex::new(()),
            hasher: ahash::RandomState::with_seeds(
                HASH_SEEDS.0,
                HASH_SEEDS.1,
                HASH_SEEDS.2,
                HASH_SEEDS.3,
            ),
        };

        for bucket_id in index.buckets_on_disk()? {
            let bucket = index.bucket(bucket_id)?;
            bucket.recover(committed_data)?;
        }
        if !index.buckets.read().is_empty() {
            debug!(
                "hash index recovered {} buckets under {}",
                index.buckets.read().len(),
                index.dir.display()
            );
        }
        Ok(index)
    }

    fn buckets_on_disk(&self) -> Result<Vec<u32>> {
        let mut ids = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(rest) = name.strip_prefix("index-b") {
                if let Some(digits) = rest.split("-seg").next() {
                    if let Ok(id) = digits.parse::<u32>() {
                        if !ids.contains(&id) {
                            ids.push(id);
                        }
                    }
                }
            }
        }
        ids.sort_unstable();
        Ok(ids)
    }

    fn bucket_of(&self, key: &str) -> u32 {
        (self.hasher.hash_one(key) & (self.bucket_count as u64 - 1)) as u32
    }

    fn bucket(&self, id: u32) -> Result<Arc<Bucket>> {
        if let Some(bucket) = self.buckets.read().get(&id) {
            return Ok(bucket.clone());
        }
        let _guard = self.create_lock.lock();
        if let Some(bucket) = self.buckets.read().get(&id) {
            return Ok(bucket.clone());
        }
        let region = PagedRegion::open(
            &self.dir,
            format!("index-b{id}-seg"),
            ".idx",
            self.segment_size,
        )?;
        let bucket = Arc::new(Bucket {
            region,
            reserved: AtomicU64::new(0),
            committed: AtomicU64::new(0),
        });
        self.buckets.write().insert(id, bucket.clone());
        Ok(bucket)
    }

    /// Append `(key, data_offset)`. The most recent entry for a key wins.
    pub fn insert(&self, key: &str, data_offset: i64) -> Result<()> {
        self.bucket(self.bucket_of(key))?.insert(key, data_offset)
    }

    /// Append a tombstone for `key`.
    pub fn remove(&self, key: &str) -> Result<()> {
        self.insert(key, TOMBSTONE)
    }

    /// Latest data offset for `key`; `None` when absent or tombstoned.
    pub fn lookup(&self, key: &str) -> Result<Option<i64>> {
        let bucket_id = self.bucket_of(key);
        if !self.buckets.read().contains_key(&bucket_id) {
            // No bucket file was ever created for this partition.
            let region_probe = PagedRegion::open(
                &self.dir,
                format!("index-b{bucket_id}-seg"),
                ".idx",
                self.segment_size,
            )?;
            if region_probe.existing_segments()?.is_empty() {
                return Ok(None);
            }
        }
        match self.bucket(bucket_id)?.lookup(key)? {
            Some(TOMBSTONE) | None => Ok(None),
            Some(offset) => Ok(Some(offset)),
        }
    }

    /// Enumerate all live `(key, data_offset)` pairs with last-writer-wins
    /// de-duplication; tombstoned keys are omitted.
    pub fn scan(&self) -> Result<Vec<(String, i64)>> {
        let buckets: Vec<Arc<Bucket>> = self.buckets.read().values().cloned().collect();
        let mut live = Vec::new();
        for bucket in buckets {
            bucket.advance_committed();
            let committed = bucket.committed.load(Ordering::Acquire);
            let mut latest: HashMap<Vec<u8>, i64> = HashMap::new();
            bucket.for_each_entry(committed, |key, data_offset| {
                latest.insert(key.to_vec(), data_offset);
            })?;
            for (key, data_offset) in latest {
                if data_offset != TOMBSTONE {
                    let key = String::from_utf8(key).map_err(|e| {
                        VulcanoError::corruption(format!("invalid UTF-8 index key: {e}"))
                    })?;
                    live.push((key, data_offset));
                }
            }
        }
        Ok(live)
    }

    /// Sum of committed bytes across buckets; recorded in store metadata.
    pub fn committed_offset(&self) -> u64 {
        self.buckets
            .read()
            .values()
            .map(|bucket| {
                bucket.advance_committed();
                bucket.committed.load(Ordering::Acquire)
            })
            .sum()
    }

    /// Flush every bucket's mapped segments.
    pub fn flush(&self) -> Result<()> {
        for bucket in self.buckets.read().values() {
            bucket.region.flush_all()?;
        }
        Ok(())
    }

    /// Release all mappings.
    pub fn close(&self) {
        for bucket in self.buckets.read().values() {
            bucket.region.close();
        }
    }

    pub fn mapped_bytes(&self) -> u64 {
        self.buckets
            .read()
            .values()
            .map(|bucket| bucket.region.mapped_bytes())
            .sum()
    }
}

impl std::fmt::Debug for HashIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HashIndex")
            .field("dir", &self.dir)
            .field("bucket_count", &self.bucket_count)
            .field("open_buckets", &self.buckets.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_index(dir: &TempDir) -> HashIndex {
        HashIndex::open(dir.path(), 16, 1024, u64::MAX / 2).unwrap()
    }

    #[test]
    fn test_insert_lookup() {
        let dir = TempDir::new().unwrap();
        let index = open_index(&dir);
        index.insert("alpha", 0).unwrap();
        index.insert("beta", 24).unwrap();
        assert_eq!(index.lookup("alpha").unwrap(), Some(0));
        assert_eq!(index.lookup("beta").unwrap(), Some(24));
        assert_eq!(index.lookup("gamma").unwrap(), None);
    }

    #[test]
    fn test_last_write_wins() {
        let dir = TempDir::new().unwrap();
        let index = open_index(&dir);
        index.insert("key", 0).unwrap();
        index.insert("key", 48).unwrap();
        assert_eq!(index.lookup("key").unwrap(), Some(48));
    }

    #[test]
    fn test_tombstone_hides_key() {
        let dir = TempDir::new().unwrap();
        let index = open_index(&dir);
        index.insert("key", 16).unwrap();
        index.remove("key").unwrap();
        assert_eq!(index.lookup("key").unwrap(), None);
        // Earlier segments still contain the key; scan must omit it too.
        assert!(index.scan().unwrap().is_empty());
    }

    #[test]
    fn test_scan_deduplicates() {
        let dir = TempDir::new().unwrap();
        let index = open_index(&dir);
        index.insert("a", 0).unwrap();
        index.insert("a", 8).unwrap();
        index.insert("b", 16).unwrap();
        let mut live = index.scan().unwrap();
        live.sort();
        assert_eq!(live, vec![("a".to_string(), 8), ("b".to_string(), 16)]);
    }

    #[test]
    fn test_recovery_rebuilds_cursors() {
        let dir = TempDir::new().unwrap();
        {
            let index = open_index(&dir);
            index.insert("persisted", 8).unwrap();
            index.flush().unwrap();
        }
        let index = HashIndex::open(dir.path(), 16, 1024, 1024).unwrap();
        assert_eq!(index.lookup("persisted").unwrap(), Some(8));
        assert!(index.committed_offset() > 0);
    }

    #[test]
    fn test_recovery_discards_entries_past_committed_data() {
        let dir = TempDir::new().unwrap();
        {
            let index = open_index(&dir);
            index.insert("early", 8).unwrap();
            index.insert("late", 4096).unwrap();
            index.flush().unwrap();
        }
        // Only data offsets below 1024 were covered by the last commit.
        let index = HashIndex::open(dir.path(), 16, 1024, 1024).unwrap();
        assert_eq!(index.lookup("early").unwrap(), Some(8));
        assert_eq!(index.lookup("late").unwrap(), None);
    }
}
