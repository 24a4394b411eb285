//! The embeddable database facade.
//!
//! [`Db::open`] wires the catalog, the per-field indexes, and the ingestion
//! pool under one data folder, replays the WAL, and exposes the public
//! surface: add/get/remove/search plus async variants scheduled on the
//! worker pool. All state is engine-owned; nothing global.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use log::info;
use parking_lot::{Mutex, RwLock};

use crate::catalog::{Catalog, DocumentWriteResult};
use crate::config::Config;
use crate::document::{Document, DocumentId, FieldValue};
use crate::error::{Result, VulcanoError};
use crate::index::hnsw::HnswIndex;
use crate::index::inverted::InvertedIndex;
use crate::ingest::{Completion, IngestScheduler, IngestionResult, completion};
use crate::query::Query;
use crate::query::bitmap::DocIdSet;
use crate::query::executor::{self, DocumentSource, ExecutorContext, QueryResult};
use crate::query::planner::IndexedFields;
use crate::storage::kv::KvConfig;
use crate::telemetry::{
    COUNTER_DOCUMENT_INSERTS, COUNTER_DOCUMENT_REMOVALS, COUNTER_SEARCH_COUNT,
    GAUGE_OFF_HEAP_MEMORY, GAUGE_STORED_DOCUMENTS, Telemetry, TelemetrySink,
    TIMER_DOCUMENT_INSERT_LATENCY, TIMER_DOCUMENT_REMOVE_LATENCY, TIMER_SEARCH_LATENCY,
};

struct EngineInner {
    catalog: Catalog,
    hnsw: HashMap<String, HnswIndex>,
    inverted: HashMap<String, InvertedIndex>,
    indexed: IndexedFields,
    live: RwLock<DocIdSet>,
    telemetry: Telemetry,
    closed: AtomicBool,
}

impl DocumentSource for Catalog {
    fn load(&self, internal_id: u64) -> Result<Option<Document>> {
        self.load_by_internal(internal_id)
    }
}

impl EngineInner {
    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(VulcanoError::Closed);
        }
        Ok(())
    }

    fn apply_add(&self, document: &Document) -> Result<DocumentWriteResult> {
        self.check_open()?;
        let started = Instant::now();

        let previous = self.catalog.lookup_internal(&document.id())?;
        let mut staged = self.catalog.stage_add(document)?;

        if staged.result.success {
            if let Err(e) = self.update_indexes(staged.internal_id, document) {
                // The WAL commit is withheld; recovery rolls the write back.
                staged.result.success = false;
                staged.result.field_results.push(crate::catalog::FieldWriteResult {
                    key: String::new(),
                    success: false,
                    error: Some(e.to_string()),
                });
                return Ok(staged.result);
            }
            self.catalog.finish_add(document, &staged)?;
            let mut live = self.live.write();
            if let Some(previous) = previous {
                live.and_not(&[previous].into_iter().collect());
            }
            live.insert(staged.internal_id);
        }

        self.telemetry.counter(COUNTER_DOCUMENT_INSERTS, 1);
        self.telemetry
            .timer(TIMER_DOCUMENT_INSERT_LATENCY, started.elapsed());
        self.publish_gauges();
        Ok(staged.result)
    }

    fn update_indexes(&self, internal_id: u64, document: &Document) -> Result<()> {
        for field in document.fields() {
            if let Some(index) = self.hnsw.get(field.key()) {
                match field.value() {
                    FieldValue::Vector(v) => index.insert(internal_id, v)?,
                    FieldValue::Matrix(_) => {
                        // Matrix similarity is residual-only; nothing to
                        // insert into the graph.
                    }
                    _ => {
                        return Err(VulcanoError::validation(format!(
                            "field '{}' is configured as a vector index but holds a non-vector value",
                            field.key()
                        )));
                    }
                }
            }
            if let Some(index) = self.inverted.get(field.key()) {
                if let FieldValue::String(s) = field.value() {
                    index.insert(internal_id, s)?;
                }
            }
        }
        Ok(())
    }

    fn apply_remove(&self, document_id: &DocumentId) -> Result<bool> {
        self.check_open()?;
        let started = Instant::now();
        let previous = self.catalog.lookup_internal(document_id)?;
        let removed = self.catalog.remove(document_id)?;
        if let Some(previous) = previous {
            self.live.write().and_not(&[previous].into_iter().collect());
        }
        self.telemetry.counter(COUNTER_DOCUMENT_REMOVALS, 1);
        self.telemetry
            .timer(TIMER_DOCUMENT_REMOVE_LATENCY, started.elapsed());
        self.publish_gauges();
        Ok(removed)
    }

    fn run_search(
        &self,
        query: &Query,
        max_results: Option<usize>,
        deadline: Option<Instant>,
    ) -> Result<QueryResult> {
        self.check_open()?;
        let started = Instant::now();
        let universe = self.live.read().clone();
        let ctx = ExecutorContext {
            source: &self.catalog,
            inverted: &self.inverted,
            hnsw: &self.hnsw,
            indexed: &self.indexed,
            universe: &universe,
        };
        let result = executor::execute(&ctx, query, max_results, deadline)?;
        self.telemetry.counter(COUNTER_SEARCH_COUNT, 1);
        self.telemetry.timer(TIMER_SEARCH_LATENCY, started.elapsed());
        Ok(result)
    }

    fn publish_gauges(&self) {
        self.telemetry
            .gauge(GAUGE_STORED_DOCUMENTS, self.live.read().len() as f64);
        let mapped = self.catalog.mapped_bytes()
            + self.hnsw.values().map(|i| i.mapped_bytes()).sum::<u64>()
            + self.inverted.values().map(|i| i.mapped_bytes()).sum::<u64>();
        self.telemetry.gauge(GAUGE_OFF_HEAP_MEMORY, mapped as f64);
    }

    fn close_components(&self) -> Result<()> {
        self.catalog.checkpoint()?;
        self.catalog.close()?;
        for index in self.hnsw.values() {
            index.close()?;
        }
        for index in self.inverted.values() {
            index.close()?;
        }
        Ok(())
    }
}

/// An open VulcanoDb instance.
pub struct Db {
    data_folder: PathBuf,
    inner: Arc<EngineInner>,
    scheduler: Mutex<IngestScheduler>,
    closed: AtomicBool,
}

impl Db {
    /// Open or create a database under `data_folder`.
    pub fn open(data_folder: impl Into<PathBuf>, config: Config) -> Result<Db> {
        Self::open_with_telemetry(data_folder, config, Telemetry::noop())
    }

    /// Open with embedder-supplied telemetry callbacks.
    pub fn open_with_sink(
        data_folder: impl Into<PathBuf>,
        config: Config,
        sink: Arc<dyn TelemetrySink>,
    ) -> Result<Db> {
        let telemetry = Telemetry::new(sink, config.telemetry_level, config.telemetry_sampling);
        Self::open_with_telemetry(data_folder, config, telemetry)
    }

    fn open_with_telemetry(
        data_folder: impl Into<PathBuf>,
        config: Config,
        telemetry: Telemetry,
    ) -> Result<Db> {
        config.validate()?;
        let data_folder = data_folder.into();
        std::fs::create_dir_all(&data_folder)?;

        let kv = KvConfig {
            data_segment_bytes: config.data_segment_bytes,
            index_segment_bytes: config.index_segment_bytes,
            buckets: config.index_buckets,
        };

        let catalog = Catalog::open(&data_folder, kv, config.wal_segment_bytes)?;
        catalog.recover()?;

        let mut hnsw = HashMap::new();
        for (field, params) in &config.hnsw {
            let dir = index_dir(&data_folder, field).join("hnsw");
            hnsw.insert(
                field.clone(),
                HnswIndex::open(dir, params.clone(), telemetry.clone())?,
            );
        }
        let mut inverted = HashMap::new();
        for field in &config.inverted {
            let dir = index_dir(&data_folder, field).join("inverted");
            inverted.insert(field.clone(), InvertedIndex::open(dir, field.clone(), kv)?);
        }

        let indexed = IndexedFields {
            inverted: config.inverted.iter().cloned().collect(),
            hnsw: config.hnsw.keys().cloned().collect(),
        };

        let live: DocIdSet = catalog.internal_ids()?.into_iter().collect();
        info!(
            "opened database at {} with {} documents",
            data_folder.display(),
            live.len()
        );

        let inner = Arc::new(EngineInner {
            catalog,
            hnsw,
            inverted,
            indexed,
            live: RwLock::new(live),
            telemetry: telemetry.clone(),
            closed: AtomicBool::new(false),
        });
        inner.publish_gauges();

        let scheduler = IngestScheduler::new(
            config.effective_ingest_workers(),
            config.ingest_queue_capacity,
            telemetry,
        )?;

        Ok(Db {
            data_folder,
            inner,
            scheduler: Mutex::new(scheduler),
            closed: AtomicBool::new(false),
        })
    }

    pub fn data_folder(&self) -> &Path {
        &self.data_folder
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(VulcanoError::Closed);
        }
        Ok(())
    }

    /// Add a document, blocking until it is durable.
    pub fn add(&self, document: &Document) -> Result<DocumentWriteResult> {
        self.check_open()?;
        self.inner.apply_add(document)
    }

    /// Schedule a document addition on the worker pool.
    pub fn add_async(&self, document: Document) -> Result<Completion<Result<DocumentWriteResult>>> {
        self.check_open()?;
        let inner = self.inner.clone();
        let (sender, handle) = completion();
        self.scheduler.lock().submit(move || {
            let _ = sender.send(inner.apply_add(&document));
        })?;
        Ok(handle)
    }

    /// Fetch a document by id; absent ids are not an error.
    pub fn get(&self, document_id: &DocumentId) -> Result<Option<Document>> {
        self.check_open()?;
        self.inner.catalog.get(document_id)
    }

    /// Fetch a document on the worker pool.
    pub fn get_async(&self, document_id: DocumentId) -> Result<Completion<Result<Option<Document>>>> {
        self.check_open()?;
        let inner = self.inner.clone();
        let (sender, handle) = completion();
        self.scheduler.lock().submit(move || {
            let result = inner
                .check_open()
                .and_then(|_| inner.catalog.get(&document_id));
            let _ = sender.send(result);
        })?;
        Ok(handle)
    }

    /// Remove a document (tombstoning; no compaction).
    pub fn remove(&self, document_id: &DocumentId) -> Result<bool> {
        self.check_open()?;
        self.inner.apply_remove(document_id)
    }

    /// Execute a query. `max_results` of `None` means unbounded;
    /// `deadline` elapsed mid-query yields a partial result flagged
    /// `timed_out`.
    pub fn search(
        &self,
        query: &Query,
        max_results: Option<usize>,
        deadline: Option<Instant>,
    ) -> Result<QueryResult> {
        self.check_open()?;
        self.inner.run_search(query, max_results, deadline)
    }

    /// Execute a query on the worker pool.
    pub fn search_async(
        &self,
        query: Query,
        max_results: Option<usize>,
        deadline: Option<Instant>,
    ) -> Result<Completion<Result<QueryResult>>> {
        self.check_open()?;
        let inner = self.inner.clone();
        let (sender, handle) = completion();
        self.scheduler.lock().submit(move || {
            let _ = sender.send(inner.run_search(&query, max_results, deadline));
        })?;
        Ok(handle)
    }

    /// Ingest a batch through the bounded queue. Failures are aggregated,
    /// never thrown; peer documents keep flowing.
    pub fn ingest(&self, documents: impl IntoIterator<Item = Document>) -> Result<IngestionResult> {
        self.check_open()?;
        let errors: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let ingested = Arc::new(std::sync::atomic::AtomicU64::new(0));
        let mut handles = Vec::new();

        let mut total = 0u64;
        for document in documents {
            total += 1;
            let inner = self.inner.clone();
            let errors = errors.clone();
            let ingested = ingested.clone();
            let (sender, handle) = completion();
            self.scheduler.lock().submit(move || {
                match inner.apply_add(&document) {
                    Ok(result) if result.success => {
                        ingested.fetch_add(1, Ordering::AcqRel);
                    }
                    Ok(result) => {
                        let detail = result
                            .field_results
                            .iter()
                            .filter_map(|f| f.error.as_deref())
                            .collect::<Vec<_>>()
                            .join("; ");
                        errors.lock().push(format!(
                            "document {} failed: {detail}",
                            document.id()
                        ));
                    }
                    Err(e) => {
                        errors.lock().push(format!("document {}: {e}", document.id()));
                    }
                }
                let _ = sender.send(());
            })?;
            handles.push(handle);
        }

        for handle in handles {
            handle.wait()?;
        }

        Ok(IngestionResult {
            ingested: ingested.load(Ordering::Acquire),
            total,
            errors: Arc::try_unwrap(errors)
                .map(|m| m.into_inner())
                .unwrap_or_default(),
        })
    }

    /// Number of live documents.
    pub fn document_count(&self) -> u64 {
        self.inner.live.read().len()
    }

    /// Depth of the ingestion queue (the `insert_queue` gauge).
    pub fn queue_depth(&self) -> usize {
        self.scheduler.lock().queue_depth()
    }

    /// Durable flush and shutdown. Queued work is drained first; any
    /// operation after close fails with [`VulcanoError::Closed`].
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.scheduler.lock().close();
        self.inner.closed.store(true, Ordering::Release);
        self.inner.close_components()?;
        info!("closed database at {}", self.data_folder.display());
        Ok(())
    }
}

impl Drop for Db {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

impl std::fmt::Debug for Db {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Db")
            .field("data_folder", &self.data_folder)
            .field("documents", &self.document_count())
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

fn index_dir(root: &Path, field: &str) -> PathBuf {
    root.join("indexes").join(field)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HnswParams;
    use tempfile::TempDir;

    fn test_config() -> Config {
        Config::new()
            .data_segment_bytes(256 * 1024)
            .index_segment_bytes(16 * 1024)
            .wal_segment_bytes(64 * 1024)
            .index_buckets(16)
            .ingest_workers(2)
            .hnsw_field(
                "embedding",
                HnswParams::with_dimensions(2).block_size(4096),
            )
            .inverted_field("name")
    }

    #[test]
    fn test_add_get_remove() {
        let dir = TempDir::new().unwrap();
        let db = Db::open(dir.path(), test_config()).unwrap();
        let doc = Document::builder()
            .add_string("name", "John")
            .add_vector("embedding", vec![1.0, 0.0])
            .build();

        let result = db.add(&doc).unwrap();
        assert!(result.success);
        assert_eq!(db.document_count(), 1);
        assert_eq!(db.get(&doc.id()).unwrap().unwrap(), doc);

        assert!(db.remove(&doc.id()).unwrap());
        assert_eq!(db.document_count(), 0);
        assert!(db.get(&doc.id()).unwrap().is_none());
        db.close().unwrap();
    }

    #[test]
    fn test_wrong_dimensions_fail_validation() {
        let dir = TempDir::new().unwrap();
        let db = Db::open(dir.path(), test_config()).unwrap();
        let doc = Document::builder()
            .add_vector("embedding", vec![1.0, 0.0, 0.5])
            .build();
        let result = db.add(&doc).unwrap();
        assert!(!result.success);
        assert_eq!(db.document_count(), 0);
        db.close().unwrap();
    }

    #[test]
    fn test_operations_after_close_fail() {
        let dir = TempDir::new().unwrap();
        let db = Db::open(dir.path(), test_config()).unwrap();
        db.close().unwrap();
        let doc = Document::builder().add_string("name", "x").build();
        assert!(matches!(db.add(&doc), Err(VulcanoError::Closed)));
        assert!(matches!(
            db.search(&Query::match_all(), None, None),
            Err(VulcanoError::Closed)
        ));
    }

    #[test]
    fn test_async_add_completes() {
        let dir = TempDir::new().unwrap();
        let db = Db::open(dir.path(), test_config()).unwrap();
        let doc = Document::builder()
            .add_string("name", "Async")
            .add_vector("embedding", vec![0.0, 1.0])
            .build();
        let handle = db.add_async(doc.clone()).unwrap();
        let result = handle.wait().unwrap().unwrap();
        assert!(result.success);
        assert_eq!(db.get(&doc.id()).unwrap().unwrap(), doc);
        db.close().unwrap();
    }
}
