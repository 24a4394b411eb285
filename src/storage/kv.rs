//! Durable key-value store.
//!
//! Composes the data log, the hash index, and the metadata file into a
//! crash-safe map. Every put appends the payload, publishes the index
//! entry, then commits both offsets to the fsynced metadata file. After a
//! crash, entries published before the last metadata commit are visible;
//! later payload bytes leak harmlessly and are reclaimed by the next
//! writer.
//!
//! ## On-disk layout
//!
//! ```text
//! <dir>/metadata.dat               committed (data, index) offsets
//! <dir>/data/segment/seg-<n>.dat   data log
//! <dir>/index/index-b<b>-seg<n>.idx hash index buckets
//! ```

use std::path::PathBuf;

use parking_lot::Mutex;

use crate::error::Result;
use crate::storage::data_log::DataLog;
use crate::storage::hash_index::HashIndex;
use crate::storage::metadata::MetadataFile;
use crate::storage::paged::PagedRegion;

/// Sizing for one KV store instance.
#[derive(Debug, Clone, Copy)]
pub struct KvConfig {
    pub data_segment_bytes: u64,
    pub index_segment_bytes: u64,
    pub buckets: u32,
}

impl Default for KvConfig {
    fn default() -> Self {
        Self {
            data_segment_bytes: crate::config::DEFAULT_DATA_SEGMENT_BYTES,
            index_segment_bytes: crate::config::DEFAULT_INDEX_SEGMENT_BYTES,
            buckets: crate::config::DEFAULT_INDEX_BUCKETS,
        }
    }
}

/// Durable append-only key-value store.
#[derive(Debug)]
pub struct KvStore {
    dir: PathBuf,
    data: DataLog,
    index: HashIndex,
    metadata: MetadataFile,
    commit_lock: Mutex<()>,
}

impl KvStore {
    /// Open or create a store under `dir`, replaying committed state.
    pub fn open(dir: impl Into<PathBuf>, config: KvConfig) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;

        let metadata = MetadataFile::open(dir.join("metadata.dat"))?;
        let committed = metadata.read()?;

        let data_region = PagedRegion::open(
            dir.join("data").join("segment"),
            "seg-",
            ".dat",
            config.data_segment_bytes,
        )?;
        let data = DataLog::open(data_region, committed.data as u64)?;
        let index = HashIndex::open(
            dir.join("index"),
            config.buckets,
            config.index_segment_bytes,
            committed.data as u64,
        )?;

        Ok(Self {
            dir,
            data,
            index,
            metadata,
            commit_lock: Mutex::new(()),
        })
    }

    pub fn put_string(&self, key: &str, value: &str) -> Result<()> {
        let offset = self.data.write_string(key, value)?;
        self.publish(key, offset)
    }

    pub fn put_int(&self, key: &str, value: i32) -> Result<()> {
        let offset = self.data.write_int(key, value)?;
        self.publish(key, offset)
    }

    pub fn put_float_array(&self, key: &str, value: &[f32]) -> Result<()> {
        let offset = self.data.write_float_array(key, value)?;
        self.publish(key, offset)
    }

    pub fn put_float_matrix(&self, key: &str, rows: u32, cols: u32, data: &[f32]) -> Result<()> {
        let offset = self.data.write_float_matrix(key, rows, cols, data)?;
        self.publish(key, offset)
    }

    pub fn put_bytes(&self, key: &str, value: &[u8]) -> Result<()> {
        let offset = self.data.write_bytes(key, value)?;
        self.publish(key, offset)
    }

    pub fn get_string(&self, key: &str) -> Result<Option<String>> {
        match self.index.lookup(key)? {
            Some(offset) => Ok(Some(self.data.read_string(offset as u64)?)),
            None => Ok(None),
        }
    }

    pub fn get_int(&self, key: &str) -> Result<Option<i32>> {
        match self.index.lookup(key)? {
            Some(offset) => Ok(Some(self.data.read_int(offset as u64)?)),
            None => Ok(None),
        }
    }

    pub fn get_float_array(&self, key: &str) -> Result<Option<Vec<f32>>> {
        match self.index.lookup(key)? {
            Some(offset) => Ok(Some(self.data.read_float_array(offset as u64)?)),
            None => Ok(None),
        }
    }

    pub fn get_float_matrix(&self, key: &str) -> Result<Option<(u32, u32, Vec<f32>)>> {
        match self.index.lookup(key)? {
            Some(offset) => Ok(Some(self.data.read_float_matrix(offset as u64)?)),
            None => Ok(None),
        }
    }

    pub fn get_bytes(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match self.index.lookup(key)? {
            Some(offset) => Ok(Some(self.data.read_bytes_value(offset as u64)?)),
            None => Ok(None),
        }
    }

    pub fn contains(&self, key: &str) -> Result<bool> {
        Ok(self.index.lookup(key)?.is_some())
    }

    /// Tombstone `key`. Later gets return absent even though earlier
    /// segments still hold the value.
    pub fn remove(&self, key: &str) -> Result<()> {
        self.index.remove(key)?;
        self.commit()
    }

    /// Enumerate all live keys with their data offsets.
    pub fn scan(&self) -> Result<Vec<(String, i64)>> {
        self.index.scan()
    }

    /// Direct typed reads at a scanned data offset.
    pub fn read_string_at(&self, offset: i64) -> Result<String> {
        self.data.read_string(offset as u64)
    }

    fn publish(&self, key: &str, data_offset: u64) -> Result<()> {
        self.index.insert(key, data_offset as i64)?;
        self.commit()
    }

    fn commit(&self) -> Result<()> {
        let _guard = self.commit_lock.lock();
        self.metadata.commit(
            self.data.committed_offset() as i64,
            self.index.committed_offset() as i64,
        )
    }

    /// Flush all mapped segments and re-commit metadata.
    pub fn sync(&self) -> Result<()> {
        self.data.flush()?;
        self.index.flush()?;
        self.commit()
    }

    /// Flush and release mappings.
    pub fn close(&self) -> Result<()> {
        self.sync()?;
        self.data.close();
        self.index.close();
        Ok(())
    }

    /// Total bytes currently memory-mapped by this store.
    pub fn mapped_bytes(&self) -> u64 {
        self.data.mapped_bytes() + self.index.mapped_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn small_config() -> KvConfig {
        KvConfig {
            data_segment_bytes: 64 * 1024,
            index_segment_bytes: 8 * 1024,
            buckets: 16,
        }
    }

    #[test]
    fn test_typed_round_trips() {
        let dir = TempDir::new().unwrap();
        let store = KvStore::open(dir.path(), small_config()).unwrap();

        store.put_string("s", "value").unwrap();
        store.put_int("i", 7).unwrap();
        store.put_float_array("f", &[0.25, 0.75]).unwrap();
        store.put_float_matrix("m", 1, 2, &[1.0, 2.0]).unwrap();
        store.put_bytes("b", &[1, 2, 3]).unwrap();

        assert_eq!(store.get_string("s").unwrap().as_deref(), Some("value"));
        assert_eq!(store.get_int("i").unwrap(), Some(7));
        assert_eq!(store.get_float_array("f").unwrap(), Some(vec![0.25, 0.75]));
        assert_eq!(
            store.get_float_matrix("m").unwrap(),
            Some((1, 2, vec![1.0, 2.0]))
        );
        assert_eq!(store.get_bytes("b").unwrap(), Some(vec![1, 2, 3]));
        assert_eq!(store.get_string("missing").unwrap(), None);
    }

    #[test]
    fn test_overwrite_is_last_writer_wins() {
        let dir = TempDir::new().unwrap();
        let store = KvStore::open(dir.path(), small_config()).unwrap();
        store.put_string("k", "one").unwrap();
        store.put_string("k", "two").unwrap();
        assert_eq!(store.get_string("k").unwrap().as_deref(), Some("two"));
    }

    #[test]
    fn test_remove_tombstones() {
        let dir = TempDir::new().unwrap();
        let store = KvStore::open(dir.path(), small_config()).unwrap();
        store.put_string("k", "v").unwrap();
        store.remove("k").unwrap();
        assert_eq!(store.get_string("k").unwrap(), None);
        assert!(!store.contains("k").unwrap());
    }

    #[test]
    fn test_durability_across_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let store = KvStore::open(dir.path(), small_config()).unwrap();
            store.put_string("alpha", "1").unwrap();
            store.put_int("beta", 2).unwrap();
            store.remove("alpha").unwrap();
            store.close().unwrap();
        }
        {
            let store = KvStore::open(dir.path(), small_config()).unwrap();
            assert_eq!(store.get_string("alpha").unwrap(), None);
            assert_eq!(store.get_int("beta").unwrap(), Some(2));
        }
    }

    #[test]
    fn test_scan_lists_live_keys() {
        let dir = TempDir::new().unwrap();
        let store = KvStore::open(dir.path(), small_config()).unwrap();
        store.put_string("keep", "v").unwrap();
        store.put_string("drop", "v").unwrap();
        store.remove("drop").unwrap();
        let scanned = store.scan().unwrap();
        assert_eq!(scanned.len(), 1);
        assert_eq!(scanned[0].0, "keep");
        assert_eq!(store.read_string_at(scanned[0].1).unwrap(), "v");
    }
}
