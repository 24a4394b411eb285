//! # VulcanoDb
//!
//! An embeddable vector database: an in-process engine that stores
//! documents (typed fields including dense float vectors) and answers
//! hybrid queries combining approximate nearest-neighbor search with
//! predicate filters on scalar fields.
//!
//! ## Features
//!
//! - Durable append-only key-value store over memory-mapped segments
//! - Write-ahead log with per-transaction commit markers
//! - Paged, persistable HNSW vector index
//! - Persistent inverted string index
//! - Query planner splitting boolean trees into bitmap and residual halves
//! - Bounded ingestion pool with backpressure

pub mod catalog;
pub mod config;
pub mod document;
mod db;
mod error;
pub mod index;
pub mod ingest;
pub mod query;
pub mod storage;
pub mod telemetry;

pub use catalog::{DocumentWriteResult, FieldWriteResult};
pub use config::{Config, HnswParams, TelemetryLevel, TelemetrySampling};
pub use db::Db;
pub use document::{Document, DocumentBuilder, DocumentId, FieldValue, Matrix};
pub use error::{Result, VulcanoError};
pub use ingest::{Completion, IngestionResult};
pub use query::executor::{Hit, QueryResult};
pub use query::{Query, QueryNode};
pub use telemetry::{Telemetry, TelemetrySink};

/// Version information.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
