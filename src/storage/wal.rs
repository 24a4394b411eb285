//! Write-ahead log for the document catalog.
//!
//! A dedicated append-only log, separate from the generic KV store. Each
//! operation is recorded as a PENDING entry under a transaction id; a later
//! COMMITTED marker record with the same id retires it. Entries with no
//! marker are surfaced by [`WalLog::read_uncommitted`] for replay after a
//! crash.
//!
//! ## Record layout
//!
//! ```text
//! [ entry_len:u32 ][ status:u32 ][ tx_id:i64 ][ payload:bytes ][ pad -> 8 ]
//! ```
//!
//! An entry that would straddle a segment boundary starts at the next
//! segment instead; readers hitting a zero `entry_len` before the log end
//! jump to the next segment boundary.

use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use log::{debug, warn};
use parking_lot::Mutex;

use crate::document::{Document, DocumentId, FieldValue};
use crate::error::{Result, VulcanoError};
use crate::storage::data_log::align8;
use crate::storage::metadata::MetadataFile;
use crate::storage::paged::PagedRegion;

const STATUS_PENDING: u32 = 0;
const STATUS_COMMITTED: u32 = 1;

const PAYLOAD_ADD: u8 = 0;
const PAYLOAD_REMOVE: u8 = 1;

const TAG_STRING: u8 = 0;
const TAG_INTEGER: u8 = 1;
const TAG_FLOAT_ARRAY: u8 = 2;
const TAG_FLOAT_MATRIX: u8 = 3;
const TAG_BYTES: u8 = 4;

/// A logged catalog operation.
#[derive(Debug, Clone, PartialEq)]
pub enum WalEntry {
    Add(Document),
    Remove(DocumentId),
}

/// The write-ahead log.
#[derive(Debug)]
pub struct WalLog {
    region: PagedRegion,
    metadata: MetadataFile,
    cursor: Mutex<u64>,
    base: AtomicU64,
    next_tx: AtomicI64,
}

impl WalLog {
    /// Open or create the WAL under `dir`.
    ///
    /// `wal/metadata.dat` records `(end_offset, base_offset)`; the scan on
    /// open rebuilds the transaction counter, which starts at the current
    /// wall-clock milliseconds and only moves forward.
    pub fn open(dir: impl Into<PathBuf>, segment_bytes: u64) -> Result<Self> {
        let dir = dir.into();
        let region = PagedRegion::open(dir.join("segments"), "seg-", ".dat", segment_bytes)?;
        let metadata = MetadataFile::open(dir.join("metadata.dat"))?;
        let offsets = metadata.read()?;
        let end = offsets.data as u64;
        let base = offsets.index as u64;

        // Drop stale bytes past the committed end.
        let segment_size = region.segment_size();
        let tail_segment = end / segment_size;
        let within = (end % segment_size) as usize;
        for index in region.existing_segments()? {
            if index > tail_segment || (index == tail_segment && within == 0 && end > 0) {
                region.remove_segment(index)?;
            } else if index == tail_segment && within > 0 {
                let segment = region.segment(index)?;
                segment.zero(within, segment.len() - within);
            }
        }

        let wal = Self {
            region,
            metadata,
            cursor: Mutex::new(end),
            base: AtomicU64::new(base),
            next_tx: AtomicI64::new(0),
        };

        let mut max_tx = 0i64;
        wal.for_each_record(|_status, tx_id, _payload| {
            max_tx = max_tx.max(tx_id);
            Ok(())
        })?;
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);
        wal.next_tx.store(millis.max(max_tx + 1), Ordering::Release);

        Ok(wal)
    }

    /// Record a document addition. Returns the transaction id.
    pub fn record_add(&self, document: &Document) -> Result<i64> {
        let payload = encode_add(document);
        let tx_id = self.next_tx.fetch_add(1, Ordering::AcqRel);
        self.append(STATUS_PENDING, tx_id, &payload)?;
        Ok(tx_id)
    }

    /// Record a document removal. Returns the transaction id.
    pub fn record_remove(&self, document_id: DocumentId) -> Result<i64> {
        let payload = encode_remove(document_id);
        let tx_id = self.next_tx.fetch_add(1, Ordering::AcqRel);
        self.append(STATUS_PENDING, tx_id, &payload)?;
        Ok(tx_id)
    }

    /// Append the commit marker for `tx_id`.
    pub fn commit(&self, tx_id: i64) -> Result<()> {
        self.append(STATUS_COMMITTED, tx_id, &[])
    }

    /// Stream entries for which no commit marker exists, in append order.
    pub fn read_uncommitted(&self) -> Result<Vec<(i64, WalEntry)>> {
        let mut pending: Vec<(i64, WalEntry)> = Vec::new();
        let mut committed: std::collections::HashSet<i64> = std::collections::HashSet::new();
        self.for_each_record(|status, tx_id, payload| {
            match status {
                STATUS_PENDING => pending.push((tx_id, decode_entry(payload)?)),
                STATUS_COMMITTED => {
                    committed.insert(tx_id);
                }
                other => {
                    return Err(VulcanoError::corruption(format!(
                        "unknown WAL status {other} for tx {tx_id}"
                    )));
                }
            }
            Ok(())
        })?;
        pending.retain(|(tx_id, _)| !committed.contains(tx_id));
        Ok(pending)
    }

    /// Truncate the longest prefix of segments whose pending entries are
    /// all committed. Markers only ever follow their entry, so removing a
    /// wholly committed prefix never orphans a later entry.
    pub fn checkpoint(&self) -> Result<()> {
        let cursor = *self.cursor.lock();
        let segment_size = self.region.segment_size();
        let base = self.base.load(Ordering::Acquire);

        let mut committed: std::collections::HashSet<i64> = std::collections::HashSet::new();
        self.for_each_record(|status, tx_id, _payload| {
            if status == STATUS_COMMITTED {
                committed.insert(tx_id);
            }
            Ok(())
        })?;

        // The earliest surviving pending entry blocks truncation of its
        // segment and everything after it.
        let mut new_base = (cursor / segment_size) * segment_size;
        let mut first_live: Option<u64> = None;
        self.for_each_record_with_offset(|offset, status, tx_id, _payload| {
            if status == STATUS_PENDING && !committed.contains(&tx_id) && first_live.is_none() {
                first_live = Some(offset);
            }
            Ok(())
        })?;
        if let Some(offset) = first_live {
            new_base = new_base.min((offset / segment_size) * segment_size);
        }

        if new_base <= base {
            return Ok(());
        }
        for index in base / segment_size..new_base / segment_size {
            self.region.remove_segment(index)?;
            debug!("wal checkpoint removed segment {index}");
        }
        self.base.store(new_base, Ordering::Release);
        self.metadata.commit(cursor as i64, new_base as i64)?;
        Ok(())
    }

    /// Flush mapped segments and release them.
    pub fn close(&self) -> Result<()> {
        self.region.flush_all()?;
        self.region.close();
        Ok(())
    }

    pub fn mapped_bytes(&self) -> u64 {
        self.region.mapped_bytes()
    }

    fn append(&self, status: u32, tx_id: i64, payload: &[u8]) -> Result<()> {
        let entry_len = align8(16 + payload.len() as u64);
        let segment_size = self.region.segment_size();
        if entry_len > segment_size {
            return Err(VulcanoError::validation(format!(
                "WAL entry of {entry_len} bytes exceeds segment size {segment_size}"
            )));
        }

        let mut cursor = self.cursor.lock();
        let mut offset = *cursor;
        let segment_end = (offset / segment_size + 1) * segment_size;
        if offset + entry_len > segment_end {
            // Zero-length marker: the pre-zeroed remainder tells readers to
            // continue at the next segment.
            offset = segment_end;
        }

        let (segment, within) = self.region.segment_for(offset)?;
        segment.write_bytes(within + 4, &status.to_le_bytes());
        segment.write_i64(within + 8, tx_id);
        segment.write_bytes(within + 16, payload);
        segment.store_u32_release(within, entry_len as u32);
        segment.flush_range(within, entry_len as usize)?;

        *cursor = offset + entry_len;
        self.metadata
            .commit(*cursor as i64, self.base.load(Ordering::Acquire) as i64)?;
        Ok(())
    }

    fn for_each_record(
        &self,
        mut visit: impl FnMut(u32, i64, &[u8]) -> Result<()>,
    ) -> Result<()> {
        self.for_each_record_with_offset(|_offset, status, tx_id, payload| {
            visit(status, tx_id, payload)
        })
    }

    fn for_each_record_with_offset(
        &self,
        mut visit: impl FnMut(u64, u32, i64, &[u8]) -> Result<()>,
    ) -> Result<()> {
        let end = *self.cursor.lock();
        let segment_size = self.region.segment_size();
        let mut position = self.base.load(Ordering::Acquire);
        while position < end {
            let (segment, within) = self.region.segment_for(position)?;
            let entry_len = segment.load_u32_acquire(within) as u64;
            if entry_len == 0 {
                // Segment-boundary padding.
                position = (position / segment_size + 1) * segment_size;
                continue;
            }
            if entry_len < 16 || within as u64 + entry_len > segment_size {
                return Err(VulcanoError::corruption(format!(
                    "WAL entry length {entry_len} out of bounds at offset {position}"
                )));
            }
            let status = segment.read_u32(within + 4);
            let tx_id = segment.read_i64(within + 8);
            let payload = segment.read_bytes(within + 16, (entry_len - 16) as usize);
            visit(position, status, tx_id, payload)?;
            position += entry_len;
        }
        Ok(())
    }
}

fn push_string(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(&(s.len() as u32).to_le_bytes());
    buf.extend_from_slice(s.as_bytes());
}

fn push_value(buf: &mut Vec<u8>, value: &FieldValue) {
    match value {
        FieldValue::String(s) => {
            buf.push(TAG_STRING);
            push_string(buf, s);
        }
        FieldValue::Integer(i) => {
            buf.push(TAG_INTEGER);
            buf.extend_from_slice(&i.to_le_bytes());
        }
        FieldValue::Vector(v) => {
            buf.push(TAG_FLOAT_ARRAY);
            buf.extend_from_slice(&(v.len() as u32).to_le_bytes());
            for x in v {
                buf.extend_from_slice(&x.to_le_bytes());
            }
        }
        FieldValue::Matrix(m) => {
            buf.push(TAG_FLOAT_MATRIX);
            buf.extend_from_slice(&(m.rows() as u32).to_le_bytes());
            buf.extend_from_slice(&(m.cols() as u32).to_le_bytes());
            for x in m.data() {
                buf.extend_from_slice(&x.to_le_bytes());
            }
        }
        FieldValue::Bytes(b) => {
            buf.push(TAG_BYTES);
            buf.extend_from_slice(&(b.len() as u32).to_le_bytes());
            buf.extend_from_slice(b);
        }
    }
}

fn encode_add(document: &Document) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.push(PAYLOAD_ADD);
    push_string(&mut buf, &document.id().to_string());
    buf.extend_from_slice(&(document.fields().len() as u32).to_le_bytes());
    for field in document.fields() {
        push_string(&mut buf, field.key());
        push_value(&mut buf, field.value());
    }
    buf
}

fn encode_remove(document_id: DocumentId) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.push(PAYLOAD_REMOVE);
    push_string(&mut buf, &document_id.to_string());
    buf
}

struct Reader<'a> {
    bytes: &'a [u8],
    position: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.position + n > self.bytes.len() {
            return Err(VulcanoError::corruption("truncated WAL payload"));
        }
        let slice = &self.bytes[self.position..self.position + n];
        self.position += n;
        Ok(slice)
    }

    fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn read_u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().expect("4 bytes")))
    }

    fn read_i32(&mut self) -> Result<i32> {
        Ok(i32::from_le_bytes(self.take(4)?.try_into().expect("4 bytes")))
    }

    fn read_string(&mut self) -> Result<String> {
        let len = self.read_u32()? as usize;
        String::from_utf8(self.take(len)?.to_vec())
            .map_err(|e| VulcanoError::corruption(format!("invalid UTF-8 in WAL payload: {e}")))
    }

    fn read_floats(&mut self, count: usize) -> Result<Vec<f32>> {
        let bytes = self.take(count * 4)?;
        Ok(bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes(c.try_into().expect("4 bytes")))
            .collect())
    }
}

fn decode_entry(payload: &[u8]) -> Result<WalEntry> {
    let mut reader = Reader {
        bytes: payload,
        position: 0,
    };
    match reader.read_u8()? {
        PAYLOAD_ADD => {
            let id = DocumentId::parse(&reader.read_string()?)?;
            let field_count = reader.read_u32()?;
            let mut builder = Document::builder_with_id(id);
            for _ in 0..field_count {
                let key = reader.read_string()?;
                let value = match reader.read_u8()? {
                    TAG_STRING => FieldValue::String(reader.read_string()?),
                    TAG_INTEGER => FieldValue::Integer(reader.read_i32()?),
                    TAG_FLOAT_ARRAY => {
                        let len = reader.read_u32()? as usize;
                        FieldValue::Vector(reader.read_floats(len)?)
                    }
                    TAG_FLOAT_MATRIX => {
                        let rows = reader.read_u32()? as usize;
                        let cols = reader.read_u32()? as usize;
                        let data = reader.read_floats(rows * cols)?;
                        FieldValue::Matrix(crate::document::Matrix::new(rows, cols, data)?)
                    }
                    TAG_BYTES => {
                        let len = reader.read_u32()? as usize;
                        FieldValue::Bytes(reader.take(len)?.to_vec())
                    }
                    other => {
                        return Err(VulcanoError::corruption(format!(
                            "unknown WAL field tag {other}"
                        )));
                    }
                };
                builder = builder.add_field(key, value);
            }
            Ok(WalEntry::Add(builder.build()))
        }
        PAYLOAD_REMOVE => {
            let id = DocumentId::parse(&reader.read_string()?)?;
            Ok(WalEntry::Remove(id))
        }
        other => {
            warn!("unknown WAL payload type {other}");
            Err(VulcanoError::corruption(format!(
                "unknown WAL payload type {other}"
            )))
        }
    }
}
