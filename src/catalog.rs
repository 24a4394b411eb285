//! Document persister.
//!
//! Serializes documents into the field KV store, maintains the
//! bidirectional id maps, and brackets every mutation with WAL records so
//! that a crash never leaves a half-visible document.
//!
//! ## Write pipeline
//!
//! `stage_add` records the WAL entry, allocates a fresh internal id, and
//! writes the field records, the shape manifest, and the `int2id` mapping.
//! The document stays invisible until `finish_add` appends the WAL commit
//! marker and flips `id2int` to the new internal id. Recovery rolls back
//! staged state whose transaction never committed, so re-adding a document
//! id can never tear the previously committed version.
//!
//! Internal ids are never reused; the allocation high-water mark is
//! persisted alongside the id maps.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use log::{debug, warn};
use parking_lot::Mutex;

use crate::document::{Document, DocumentId, FieldValue, Matrix};
use crate::error::Result;
use crate::storage::kv::{KvConfig, KvStore};
use crate::storage::wal::{WalEntry, WalLog};

const NEXT_INTERNAL_KEY: &str = "meta:next_internal";

fn id2int_key(document_id: &DocumentId) -> String {
    format!("id2int:{document_id}")
}

fn int2id_key(internal_id: u64) -> String {
    format!("int2id:{internal_id}")
}

fn shape_key(internal_id: u64) -> String {
    format!("shape:{internal_id}")
}

fn field_key(internal_id: u64, key: &str) -> String {
    format!("{internal_id}:{key}")
}

fn shape_tag(value: &FieldValue) -> char {
    match value {
        FieldValue::String(_) => 's',
        FieldValue::Integer(_) => 'i',
        FieldValue::Vector(_) => 'v',
        FieldValue::Matrix(_) => 'm',
        FieldValue::Bytes(_) => 'b',
    }
}

/// Outcome of one field write.
#[derive(Debug, Clone)]
pub struct FieldWriteResult {
    pub key: String,
    pub success: bool,
    pub error: Option<String>,
}

/// Outcome of one document write.
#[derive(Debug, Clone)]
pub struct DocumentWriteResult {
    pub internal_id: u64,
    pub success: bool,
    pub field_results: Vec<FieldWriteResult>,
}

/// A staged (uncommitted) document addition.
#[derive(Debug)]
pub struct StagedAdd {
    pub tx_id: i64,
    pub internal_id: u64,
    pub result: DocumentWriteResult,
}

/// The document catalog: field records, id maps, WAL.
#[derive(Debug)]
pub struct Catalog {
    fields: KvStore,
    maps: KvStore,
    wal: WalLog,
    next_internal: AtomicU64,
    write_lock: Mutex<()>,
}

impl Catalog {
    /// Open the catalog under the engine's data folder. The field KV lives
    /// at the root, the id maps under `catalog/`, the WAL under `wal/`.
    pub fn open(root: &Path, kv: KvConfig, wal_segment_bytes: u64) -> Result<Self> {
        let fields = KvStore::open(root, kv)?;
        let maps = KvStore::open(root.join("catalog"), kv)?;
        let wal = WalLog::open(root.join("wal"), wal_segment_bytes)?;

        let mut next_internal = maps
            .get_string(NEXT_INTERNAL_KEY)?
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(0);
        // Ids are never reused even if the counter record lagged behind.
        for (key, _) in maps.scan()? {
            if let Some(id) = key.strip_prefix("int2id:").and_then(|s| s.parse::<u64>().ok()) {
                next_internal = next_internal.max(id + 1);
            }
        }

        Ok(Self {
            fields,
            maps,
            wal,
            next_internal: AtomicU64::new(next_internal),
            write_lock: Mutex::new(()),
        })
    }

    /// Replay the WAL: uncommitted additions are rolled back, uncommitted
    /// removals re-applied. Running the replay twice is a no-op.
    pub fn recover(&self) -> Result<()> {
        let pending = self.wal.read_uncommitted()?;
        if pending.is_empty() {
            return Ok(());
        }
        debug!("catalog recovery: {} uncommitted transactions", pending.len());
        for (tx_id, entry) in pending {
            match entry {
                WalEntry::Add(document) => self.rollback_add(&document)?,
                WalEntry::Remove(document_id) => {
                    self.apply_remove(&document_id)?;
                }
            }
            self.wal.commit(tx_id)?;
        }
        self.wal.checkpoint()?;
        Ok(())
    }

    /// Record the WAL entry and write the document's records. The write is
    /// invisible until [`Catalog::finish_add`].
    pub fn stage_add(&self, document: &Document) -> Result<StagedAdd> {
        let _guard = self.write_lock.lock();
        let tx_id = self.wal.record_add(document)?;

        let internal_id = self.next_internal.fetch_add(1, Ordering::AcqRel);
        self.maps
            .put_string(NEXT_INTERNAL_KEY, &(internal_id + 1).to_string())?;

        let mut field_results = Vec::with_capacity(document.fields().len());
        let mut all_ok = true;
        for field in document.fields() {
            let key = field_key(internal_id, field.key());
            let outcome = match field.value() {
                FieldValue::String(s) => self.fields.put_string(&key, s),
                FieldValue::Integer(i) => self.fields.put_int(&key, *i),
                FieldValue::Vector(v) => self.fields.put_float_array(&key, v),
                FieldValue::Matrix(m) => self.fields.put_float_matrix(
                    &key,
                    m.rows() as u32,
                    m.cols() as u32,
                    m.data(),
                ),
                FieldValue::Bytes(b) => self.fields.put_bytes(&key, b),
            };
            match outcome {
                Ok(()) => field_results.push(FieldWriteResult {
                    key: field.key().to_string(),
                    success: true,
                    error: None,
                }),
                Err(e) => {
                    all_ok = false;
                    field_results.push(FieldWriteResult {
                        key: field.key().to_string(),
                        success: false,
                        error: Some(e.to_string()),
                    });
                }
            }
        }

        if all_ok {
            let manifest: String = document
                .fields()
                .iter()
                .map(|f| format!("{}\t{}", shape_tag(f.value()), f.key()))
                .collect::<Vec<_>>()
                .join("\n");
            self.maps.put_string(&shape_key(internal_id), &manifest)?;
            self.maps
                .put_string(&int2id_key(internal_id), &document.id().to_string())?;
        }

        Ok(StagedAdd {
            tx_id,
            internal_id,
            result: DocumentWriteResult {
                internal_id,
                success: all_ok,
                field_results,
            },
        })
    }

    /// Commit a staged addition: append the WAL marker, flip `id2int`, and
    /// retire the previously committed version, if any.
    pub fn finish_add(&self, document: &Document, staged: &StagedAdd) -> Result<()> {
        let _guard = self.write_lock.lock();
        let previous = self.lookup_internal(&document.id())?;

        self.wal.commit(staged.tx_id)?;
        self.maps.put_string(
            &id2int_key(&document.id()),
            &staged.internal_id.to_string(),
        )?;

        if let Some(previous) = previous {
            if previous != staged.internal_id {
                self.drop_version(previous)?;
            }
        }
        Ok(())
    }

    /// Stage and commit in one step (no external index updates).
    pub fn add(&self, document: &Document) -> Result<DocumentWriteResult> {
        let staged = self.stage_add(document)?;
        if staged.result.success {
            self.finish_add(document, &staged)?;
        }
        Ok(staged.result)
    }

    /// Remove a document. Returns whether a committed version existed.
    pub fn remove(&self, document_id: &DocumentId) -> Result<bool> {
        let _guard = self.write_lock.lock();
        let tx_id = self.wal.record_remove(*document_id)?;
        let removed = self.apply_remove(document_id)?;
        self.wal.commit(tx_id)?;
        Ok(removed)
    }

    /// Look up a document by its external id.
    pub fn get(&self, document_id: &DocumentId) -> Result<Option<Document>> {
        match self.lookup_internal(document_id)? {
            Some(internal_id) => self.load_by_internal(internal_id),
            None => Ok(None),
        }
    }

    /// The committed internal id for `document_id`.
    pub fn lookup_internal(&self, document_id: &DocumentId) -> Result<Option<u64>> {
        Ok(self
            .maps
            .get_string(&id2int_key(document_id))?
            .and_then(|s| s.parse::<u64>().ok()))
    }

    /// Load the committed document stored under `internal_id`.
    ///
    /// Returns `None` for ids whose version was rolled back, replaced, or
    /// removed: an id is live only while `id2int` still points at it.
    pub fn load_by_internal(&self, internal_id: u64) -> Result<Option<Document>> {
        let Some(doc_id_str) = self.maps.get_string(&int2id_key(internal_id))? else {
            return Ok(None);
        };
        let document_id = DocumentId::parse(&doc_id_str)?;
        if self.lookup_internal(&document_id)? != Some(internal_id) {
            return Ok(None);
        }
        let Some(manifest) = self.maps.get_string(&shape_key(internal_id))? else {
            return Ok(None);
        };

        let mut builder = Document::builder_with_id(document_id);
        for line in manifest.lines() {
            let Some((tag, key)) = line.split_once('\t') else {
                continue;
            };
            let record_key = field_key(internal_id, key);
            let value = match tag {
                "s" => self.fields.get_string(&record_key)?.map(FieldValue::String),
                "i" => self.fields.get_int(&record_key)?.map(FieldValue::Integer),
                "v" => self
                    .fields
                    .get_float_array(&record_key)?
                    .map(FieldValue::Vector),
                "m" => match self.fields.get_float_matrix(&record_key)? {
                    Some((rows, cols, data)) => {
                        Some(FieldValue::Matrix(Matrix::new(rows as usize, cols as usize, data)?))
                    }
                    None => None,
                },
                "b" => self.fields.get_bytes(&record_key)?.map(FieldValue::Bytes),
                other => {
                    warn!("unknown shape tag '{other}' for internal id {internal_id}");
                    None
                }
            };
            if let Some(value) = value {
                builder = builder.add_field(key, value);
            }
        }
        Ok(Some(builder.build()))
    }

    /// Every live internal id (committed, not replaced, not removed).
    pub fn internal_ids(&self) -> Result<Vec<u64>> {
        let mut id2int: HashMap<String, u64> = HashMap::new();
        let mut int2id: Vec<(u64, String)> = Vec::new();
        for (key, offset) in self.maps.scan()? {
            if let Some(doc_id) = key.strip_prefix("id2int:") {
                if let Ok(internal) = self.maps.read_string_at(offset)?.parse::<u64>() {
                    id2int.insert(doc_id.to_string(), internal);
                }
            } else if let Some(internal) = key.strip_prefix("int2id:") {
                if let Ok(internal) = internal.parse::<u64>() {
                    int2id.push((internal, self.maps.read_string_at(offset)?));
                }
            }
        }
        Ok(int2id
            .into_iter()
            .filter(|(internal, doc_id)| id2int.get(doc_id) == Some(internal))
            .map(|(internal, _)| internal)
            .collect())
    }

    /// Count of live documents.
    pub fn document_count(&self) -> Result<u64> {
        Ok(self.internal_ids()?.len() as u64)
    }

    /// Entries whose transaction never committed, in append order.
    pub fn pending_transactions(&self) -> Result<Vec<(i64, WalEntry)>> {
        self.wal.read_uncommitted()
    }

    /// Truncate fully committed WAL prefixes.
    pub fn checkpoint(&self) -> Result<()> {
        self.wal.checkpoint()
    }

    pub fn sync(&self) -> Result<()> {
        self.fields.sync()?;
        self.maps.sync()
    }

    pub fn close(&self) -> Result<()> {
        self.fields.close()?;
        self.maps.close()?;
        self.wal.close()
    }

    pub fn mapped_bytes(&self) -> u64 {
        self.fields.mapped_bytes() + self.maps.mapped_bytes() + self.wal.mapped_bytes()
    }

    fn apply_remove(&self, document_id: &DocumentId) -> Result<bool> {
        let Some(internal_id) = self.lookup_internal(document_id)? else {
            return Ok(false);
        };
        self.maps.remove(&id2int_key(document_id))?;
        self.drop_version(internal_id)?;
        Ok(true)
    }

    /// Tombstone the records of one stored version.
    fn drop_version(&self, internal_id: u64) -> Result<()> {
        if let Some(manifest) = self.maps.get_string(&shape_key(internal_id))? {
            for line in manifest.lines() {
                if let Some((_tag, key)) = line.split_once('\t') {
                    self.fields.remove(&field_key(internal_id, key))?;
                }
            }
        }
        self.maps.remove(&shape_key(internal_id))?;
        self.maps.remove(&int2id_key(internal_id))?;
        Ok(())
    }

    /// Roll back the staged state of an uncommitted addition: every
    /// `int2id` entry for this document id that `id2int` does not point at
    /// is an orphaned version.
    fn rollback_add(&self, document: &Document) -> Result<()> {
        let doc_id_str = document.id().to_string();
        let committed = self.lookup_internal(&document.id())?;
        for (key, offset) in self.maps.scan()? {
            let Some(internal) = key.strip_prefix("int2id:").and_then(|s| s.parse::<u64>().ok())
            else {
                continue;
            };
            if Some(internal) == committed {
                continue;
            }
            if self.maps.read_string_at(offset)? == doc_id_str {
                debug!("rolling back orphaned version {internal} of document {doc_id_str}");
                // The shape may not have been written; the WAL entry lists
                // the staged fields.
                for field in document.fields() {
                    self.fields.remove(&field_key(internal, field.key()))?;
                }
                self.drop_version(internal)?;
            }
        }
        Ok(())
    }
}
