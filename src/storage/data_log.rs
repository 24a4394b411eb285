//! Append-only data log.
//!
//! Typed key/value records appended across mapped segments. Offsets are
//! reserved with a compare-and-swap on the shared cursor, payload bytes are
//! written, and finally the record length is published with release
//! ordering. A reader that observes a non-zero `entry_len` therefore
//! observes the fully written record; a zero length marks the unreserved
//! tail.
//!
//! ## Record layout
//!
//! ```text
//! [ entry_len:u32 ][ key_len:u32 ][ key:bytes ][ pad -> 8 ][ tag:u8 ][ payload ][ pad -> 8 ]
//! ```
//!
//! `entry_len` covers the whole record including its own four bytes. All
//! integers are little-endian. Records never straddle a segment boundary;
//! the remainder of a segment too small for the next record is covered by a
//! pad record (`key_len == 0`) so committed-offset scans never stall on a
//! mid-file zero.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{Result, VulcanoError};
use crate::storage::paged::PagedRegion;

/// Value type tags stored in data-log records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ValueKind {
    String = 0,
    Integer = 1,
    FloatArray = 2,
    FloatMatrix = 3,
    Bytes = 4,
}

impl ValueKind {
    pub fn from_tag(tag: u8) -> Result<Self> {
        match tag {
            0 => Ok(ValueKind::String),
            1 => Ok(ValueKind::Integer),
            2 => Ok(ValueKind::FloatArray),
            3 => Ok(ValueKind::FloatMatrix),
            4 => Ok(ValueKind::Bytes),
            other => Err(VulcanoError::corruption(format!(
                "unknown value type tag {other}"
            ))),
        }
    }
}

pub(crate) fn align8(n: u64) -> u64 {
    (n + 7) & !7
}

/// Append-only typed record log over a paged region.
#[derive(Debug)]
pub struct DataLog {
    region: PagedRegion,
    reserved: AtomicU64,
    committed: AtomicU64,
}

impl DataLog {
    /// Open the log, trusting `committed` from the store metadata. Stale
    /// bytes past the committed offset (partial pre-crash writes) are
    /// zeroed and later segment files removed.
    pub fn open(region: PagedRegion, committed: u64) -> Result<Self> {
        let segment_size = region.segment_size();
        let tail_segment = committed / segment_size;
        let within = (committed % segment_size) as usize;

        for index in region.existing_segments()? {
            if index > tail_segment || (index == tail_segment && within == 0) {
                region.remove_segment(index)?;
            } else if index == tail_segment {
                let segment = region.segment(tail_segment)?;
                segment.zero(within, segment.len() - within);
            }
        }

        Ok(Self {
            region,
            reserved: AtomicU64::new(committed),
            committed: AtomicU64::new(committed),
        })
    }

    /// Highest offset below which every record is fully published.
    pub fn committed_offset(&self) -> u64 {
        self.advance_committed();
        self.committed.load(Ordering::Acquire)
    }

    pub fn write_string(&self, key: &str, value: &str) -> Result<u64> {
        let mut payload = Vec::with_capacity(4 + value.len());
        payload.extend_from_slice(&(value.len() as u32).to_le_bytes());
        payload.extend_from_slice(value.as_bytes());
        self.write_record(key, ValueKind::String, &payload)
    }

    pub fn write_int(&self, key: &str, value: i32) -> Result<u64> {
        self.write_record(key, ValueKind::Integer, &value.to_le_bytes())
    }

    pub fn write_float_array(&self, key: &str, value: &[f32]) -> Result<u64> {
        let mut payload = Vec::with_capacity(4 + value.len() * 4);
        payload.extend_from_slice(&(value.len() as u32).to_le_bytes());
        for v in value {
            payload.extend_from_slice(&v.to_le_bytes());
        }
        self.write_record(key, ValueKind::FloatArray, &payload)
    }

    pub fn write_float_matrix(&self, key: &str, rows: u32, cols: u32, data: &[f32]) -> Result<u64> {
        if data.len() != (rows as usize) * (cols as usize) {
            return Err(VulcanoError::validation(format!(
                "matrix payload length {} does not match {rows}x{cols}",
                data.len()
            )));
        }
        let mut payload = Vec::with_capacity(8 + data.len() * 4);
        payload.extend_from_slice(&rows.to_le_bytes());
        payload.extend_from_slice(&cols.to_le_bytes());
        for v in data {
            payload.extend_from_slice(&v.to_le_bytes());
        }
        self.write_record(key, ValueKind::FloatMatrix, &payload)
    }

    pub fn write_bytes(&self, key: &str, value: &[u8]) -> Result<u64> {
        let mut payload = Vec::with_capacity(4 + value.len());
        payload.extend_from_slice(&(value.len() as u32).to_le_bytes());
        payload.extend_from_slice(value);
        self.write_record(key, ValueKind::Bytes, &payload)
    }

    pub fn read_string(&self, offset: u64) -> Result<String> {
        let payload = self.read_payload(offset, ValueKind::String)?;
        decode_string(&payload)
    }

    pub fn read_int(&self, offset: u64) -> Result<i32> {
        let payload = self.read_payload(offset, ValueKind::Integer)?;
        if payload.len() < 4 {
            return Err(VulcanoError::corruption("integer payload too short"));
        }
        Ok(i32::from_le_bytes(payload[0..4].try_into().expect("4 bytes")))
    }

    pub fn read_float_array(&self, offset: u64) -> Result<Vec<f32>> {
        let payload = self.read_payload(offset, ValueKind::FloatArray)?;
        if payload.len() < 4 {
            return Err(VulcanoError::corruption("float array payload too short"));
        }
        let len = u32::from_le_bytes(payload[0..4].try_into().expect("4 bytes")) as usize;
        decode_floats(&payload[4..], len)
    }

    pub fn read_float_matrix(&self, offset: u64) -> Result<(u32, u32, Vec<f32>)> {
        let payload = self.read_payload(offset, ValueKind::FloatMatrix)?;
        if payload.len() < 8 {
            return Err(VulcanoError::corruption("float matrix payload too short"));
        }
        let rows = u32::from_le_bytes(payload[0..4].try_into().expect("4 bytes"));
        let cols = u32::from_le_bytes(payload[4..8].try_into().expect("4 bytes"));
        let data = decode_floats(&payload[8..], (rows as usize) * (cols as usize))?;
        Ok((rows, cols, data))
    }

    pub fn read_bytes_value(&self, offset: u64) -> Result<Vec<u8>> {
        let payload = self.read_payload(offset, ValueKind::Bytes)?;
        if payload.len() < 4 {
            return Err(VulcanoError::corruption("bytes payload too short"));
        }
        let len = u32::from_le_bytes(payload[0..4].try_into().expect("4 bytes")) as usize;
        if payload.len() < 4 + len {
            return Err(VulcanoError::corruption("bytes payload truncated"));
        }
        Ok(payload[4..4 + len].to_vec())
    }

    /// Flush all mapped segments.
    pub fn flush(&self) -> Result<()> {
        self.region.flush_all()
    }

    /// Release mappings.
    pub fn close(&self) {
        self.region.close();
    }

    pub fn mapped_bytes(&self) -> u64 {
        self.region.mapped_bytes()
    }

    fn write_record(&self, key: &str, kind: ValueKind, payload: &[u8]) -> Result<u64> {
        debug_assert!(!key.is_empty(), "empty keys are reserved for pad records");
        let key_len = key.len() as u64;
        let value_offset = align8(8 + key_len);
        let entry_len = align8(value_offset + 1 + payload.len() as u64);
        if entry_len > self.region.segment_size() {
            return Err(VulcanoError::validation(format!(
                "record of {entry_len} bytes exceeds segment size {}",
                self.region.segment_size()
            )));
        }

        let offset = self.reserve(entry_len)?;
        let (segment, within) = self.region.segment_for(offset)?;
        segment.write_bytes(within + 4, &(key_len as u32).to_le_bytes());
        segment.write_bytes(within + 8, key.as_bytes());
        segment.write_bytes(within + value_offset as usize, &[kind as u8]);
        segment.write_bytes(within + value_offset as usize + 1, payload);
        segment.store_u32_release(within, entry_len as u32);

        self.advance_committed();
        Ok(offset)
    }

    /// Atomically reserve `len` bytes, pushing the record to the next
    /// segment (behind a pad record) when it would straddle a boundary.
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
                    self.write_pad(current, segment_end - current)?;
                }
                return Ok(start);
            }
        }
    }

    /// Publish a pad record covering `[offset, offset + gap)`.
    fn write_pad(&self, offset: u64, gap: u64) -> Result<()> {
        debug_assert!(gap >= 8 && gap % 8 == 0);
        let (segment, within) = self.region.segment_for(offset)?;
        segment.write_bytes(within + 4, &0u32.to_le_bytes());
        segment.store_u32_release(within, gap as u32);
        Ok(())
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

    fn read_payload(&self, offset: u64, expected: ValueKind) -> Result<Vec<u8>> {
        let (kind, payload) = self.record(offset)?;
        if kind != expected {
            return Err(VulcanoError::corruption(format!(
                "value type mismatch at offset {offset}: expected {expected:?}, found {kind:?}"
            )));
        }
        Ok(payload)
    }

    fn record(&self, offset: u64) -> Result<(ValueKind, Vec<u8>)> {
        let (segment, within) = self.region.segment_for(offset)?;
        let entry_len = segment.load_u32_acquire(within) as u64;
        if entry_len == 0 {
            return Err(VulcanoError::corruption(format!(
                "unpublished record at offset {offset}"
            )));
        }
        if entry_len < 16 || within as u64 + entry_len > segment.len() as u64 {
            return Err(VulcanoError::corruption(format!(
                "entry length {entry_len} out of bounds at offset {offset}"
            )));
        }
        let key_len = segment.read_u32(within + 4) as u64;
        if key_len == 0 {
            return Err(VulcanoError::corruption(format!(
                "pad record dereferenced at offset {offset}"
            )));
        }
        let value_offset = align8(8 + key_len);
        if value_offset + 1 > entry_len {
            return Err(VulcanoError::corruption(format!(
                "key length {key_len} inconsistent with entry length {entry_len}"
            )));
        }
        let tag = segment.read_bytes(within + value_offset as usize, 1)[0];
        let kind = ValueKind::from_tag(tag)?;
        let payload_len = (entry_len - value_offset - 1) as usize;
        let payload = segment
            .read_bytes(within + value_offset as usize + 1, payload_len)
            .to_vec();
        Ok((kind, payload))
    }
}

fn decode_string(payload: &[u8]) -> Result<String> {
    if payload.len() < 4 {
        return Err(VulcanoError::corruption("string payload too short"));
    }
    let len = u32::from_le_bytes(payload[0..4].try_into().expect("4 bytes")) as usize;
    if payload.len() < 4 + len {
        return Err(VulcanoError::corruption("string payload truncated"));
    }
    String::from_utf8(payload[4..4 + len].to_vec())
        .map_err(|e| VulcanoError::corruption(format!("invalid UTF-8 in string record: {e}")))
}

fn decode_floats(bytes: &[u8], count: usize) -> Result<Vec<f32>> {
    if bytes.len() < count * 4 {
        return Err(VulcanoError::corruption("float payload truncated"));
    }
    let mut values = Vec::with_capacity(count);
    for chunk in bytes[..count * 4].chunks_exact(4) {
        values.push(f32::from_le_bytes(chunk.try_into().expect("4 bytes")));
    }
    Ok(values)
}
