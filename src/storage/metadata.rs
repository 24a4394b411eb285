//! Committed-offset metadata file.
//!
//! A 16-byte file holding two little-endian `i64` offsets (data, index),
//! rewritten in place and fsynced on every commit. The pair is the crash
//! boundary: state published before the last commit survives a crash,
//! anything after is discarded on recovery.

use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom};
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use parking_lot::Mutex;

use crate::error::{Result, VulcanoError};

const METADATA_LEN: u64 = 16;

/// The two committed offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CommittedOffsets {
    pub data: i64,
    pub index: i64,
}

/// Durable metadata file for one store.
#[derive(Debug)]
pub struct MetadataFile {
    path: PathBuf,
    file: Mutex<File>,
}

impl MetadataFile {
    /// Open or create the metadata file. A fresh file starts at `(0, 0)`.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        if file.metadata()?.len() < METADATA_LEN {
            file.set_len(METADATA_LEN)?;
            file.sync_data()?;
        }
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    /// Read the committed offset pair.
    pub fn read(&self) -> Result<CommittedOffsets> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(0))?;
        let data = file.read_i64::<LittleEndian>()?;
        let index = file.read_i64::<LittleEndian>()?;
        if data < 0 || index < 0 {
            return Err(VulcanoError::corruption(format!(
                "negative committed offsets ({data}, {index}) in {}",
                self.path.display()
            )));
        }
        Ok(CommittedOffsets { data, index })
    }

    /// Persist a new committed offset pair with fsync.
    pub fn commit(&self, data: i64, index: i64) -> Result<()> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(0))?;
        file.write_i64::<LittleEndian>(data)?;
        file.write_i64::<LittleEndian>(index)?;
        file.sync_data()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_fresh_file_reads_zero() {
        let dir = TempDir::new().unwrap();
        let metadata = MetadataFile::open(dir.path().join("metadata.dat")).unwrap();
        assert_eq!(metadata.read().unwrap(), CommittedOffsets { data: 0, index: 0 });
    }

    #[test]
    fn test_commit_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("metadata.dat");
        {
            let metadata = MetadataFile::open(&path).unwrap();
            metadata.commit(1024, 256).unwrap();
        }
        {
            let metadata = MetadataFile::open(&path).unwrap();
            let offsets = metadata.read().unwrap();
            assert_eq!(offsets.data, 1024);
            assert_eq!(offsets.index, 256);
        }
    }

    #[test]
    fn test_last_commit_wins() {
        let dir = TempDir::new().unwrap();
        let metadata = MetadataFile::open(dir.path().join("metadata.dat")).unwrap();
        metadata.commit(8, 8).unwrap();
        metadata.commit(64, 32).unwrap();
        assert_eq!(metadata.read().unwrap(), CommittedOffsets { data: 64, index: 32 });
    }
}
