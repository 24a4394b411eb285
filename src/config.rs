//! Engine configuration.
//!
//! [`Config`] carries every recognized tuning knob: KV segment sizing,
//! per-field HNSW parameters, inverted-index field declarations, ingestion
//! pool sizing, and telemetry levels. Values not set explicitly fall back to
//! the documented defaults.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, VulcanoError};

/// Default data-log segment size (256 MiB).
pub const DEFAULT_DATA_SEGMENT_BYTES: u64 = 256 * 1024 * 1024;

/// Default hash-index segment size (16 MiB).
pub const DEFAULT_INDEX_SEGMENT_BYTES: u64 = 16 * 1024 * 1024;

/// Default WAL segment size (16 MiB).
pub const DEFAULT_WAL_SEGMENT_BYTES: u64 = 16 * 1024 * 1024;

/// Default number of hash-index buckets. Must be a power of two.
pub const DEFAULT_INDEX_BUCKETS: u32 = 65_536;

/// Default ingestion queue capacity.
pub const DEFAULT_INGEST_QUEUE_CAPACITY: usize = 1024;

/// Parameters for one HNSW vector index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HnswParams {
    /// Vector dimensionality. Inserts with a different length fail.
    pub dimensions: usize,
    /// Target neighbor count per node.
    #[serde(default = "default_m")]
    pub m: usize,
    /// Neighbor cap on upper layers. Defaults to `m`.
    #[serde(default)]
    pub m_max: Option<usize>,
    /// Neighbor cap on layer 0. Defaults to `2 * m`.
    #[serde(default)]
    pub m_max0: Option<usize>,
    /// Beam width during construction.
    #[serde(default = "default_ef_construction")]
    pub ef_construction: usize,
    /// Beam width during search.
    #[serde(default = "default_ef_search")]
    pub ef_search: usize,
    /// Level assignment scale. Defaults to `1 / ln(m)`.
    #[serde(default)]
    pub ml: Option<f64>,
    /// Page size for the vector and graph stores.
    #[serde(default = "default_block_size")]
    pub block_size: u64,
}

fn default_m() -> usize {
    16
}

fn default_ef_construction() -> usize {
    100
}

fn default_ef_search() -> usize {
    50
}

fn default_block_size() -> u64 {
    1024 * 1024
}

impl HnswParams {
    /// Create parameters for the given dimensionality with all defaults.
    pub fn with_dimensions(dimensions: usize) -> Self {
        Self {
            dimensions,
            m: default_m(),
            m_max: None,
            m_max0: None,
            ef_construction: default_ef_construction(),
            ef_search: default_ef_search(),
            ml: None,
            block_size: default_block_size(),
        }
    }

    /// Effective upper-layer neighbor cap.
    pub fn m_max(&self) -> usize {
        self.m_max.unwrap_or(self.m)
    }

    /// Effective layer-0 neighbor cap.
    pub fn m_max0(&self) -> usize {
        self.m_max0.unwrap_or(2 * self.m)
    }

    /// Effective level assignment scale.
    pub fn ml(&self) -> f64 {
        self.ml.unwrap_or(1.0 / (self.m as f64).ln())
    }

    /// Validate parameter consistency.
    pub fn validate(&self) -> Result<()> {
        if self.dimensions == 0 {
            return Err(VulcanoError::validation("hnsw dimensions must be >= 1"));
        }
        if self.m < 2 {
            return Err(VulcanoError::validation("hnsw m must be >= 2"));
        }
        if self.block_size < (self.dimensions as u64) * 4 {
            return Err(VulcanoError::validation(format!(
                "hnsw block size {} cannot hold a single {}-dimension vector",
                self.block_size, self.dimensions
            )));
        }
        Ok(())
    }

    pub fn m(mut self, m: usize) -> Self {
        self.m = m;
        self
    }

    pub fn ef_construction(mut self, ef: usize) -> Self {
        self.ef_construction = ef;
        self
    }

    pub fn ef_search(mut self, ef: usize) -> Self {
        self.ef_search = ef;
        self
    }

    pub fn ml_override(mut self, ml: f64) -> Self {
        self.ml = Some(ml);
        self
    }

    pub fn block_size(mut self, bytes: u64) -> Self {
        self.block_size = bytes;
        self
    }
}

/// Telemetry verbosity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TelemetryLevel {
    Off,
    #[default]
    Basic,
    Diagnostic,
}

/// Sampling rate for high-frequency counters such as distance calculations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TelemetrySampling {
    #[default]
    Off,
    Low,
    Medium,
    High,
    Extreme,
}

/// Engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Data-log segment size in bytes (`kv.segment.data.bytes`).
    pub data_segment_bytes: u64,
    /// Hash-index segment size in bytes (`kv.segment.index.bytes`).
    pub index_segment_bytes: u64,
    /// WAL segment size in bytes.
    pub wal_segment_bytes: u64,
    /// Hash-index bucket count (`kv.index.buckets`). Power of two.
    pub index_buckets: u32,
    /// HNSW index declarations, keyed by field name (`hnsw.<field>.*`).
    pub hnsw: HashMap<String, HnswParams>,
    /// String fields backed by an inverted index.
    pub inverted: Vec<String>,
    /// Ingestion queue capacity (`ingest.queue.capacity`).
    pub ingest_queue_capacity: usize,
    /// Ingestion worker count (`ingest.workers`). Defaults to `max(cores/4, 2)`.
    pub ingest_workers: Option<usize>,
    /// Telemetry verbosity (`telemetry.level`).
    pub telemetry_level: TelemetryLevel,
    /// Telemetry sampling (`telemetry.sampling`).
    pub telemetry_sampling: TelemetrySampling,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_segment_bytes: DEFAULT_DATA_SEGMENT_BYTES,
            index_segment_bytes: DEFAULT_INDEX_SEGMENT_BYTES,
            wal_segment_bytes: DEFAULT_WAL_SEGMENT_BYTES,
            index_buckets: DEFAULT_INDEX_BUCKETS,
            hnsw: HashMap::new(),
            inverted: Vec::new(),
            ingest_queue_capacity: DEFAULT_INGEST_QUEUE_CAPACITY,
            ingest_workers: None,
            telemetry_level: TelemetryLevel::default(),
            telemetry_sampling: TelemetrySampling::default(),
        }
    }
}

impl Config {
    /// Create a configuration with all defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a configuration from a JSON file.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        let config: Config = serde_json::from_slice(&bytes)
            .map_err(|e| VulcanoError::validation(format!("invalid config file: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Declare an HNSW vector index over `field`.
    pub fn hnsw_field(mut self, field: impl Into<String>, params: HnswParams) -> Self {
        self.hnsw.insert(field.into(), params);
        self
    }

    /// Declare an inverted string index over `field`.
    pub fn inverted_field(mut self, field: impl Into<String>) -> Self {
        let field = field.into();
        if !self.inverted.contains(&field) {
            self.inverted.push(field);
        }
        self
    }

    pub fn data_segment_bytes(mut self, bytes: u64) -> Self {
        self.data_segment_bytes = bytes;
        self
    }

    pub fn index_segment_bytes(mut self, bytes: u64) -> Self {
        self.index_segment_bytes = bytes;
        self
    }

    pub fn wal_segment_bytes(mut self, bytes: u64) -> Self {
        self.wal_segment_bytes = bytes;
        self
    }

    pub fn index_buckets(mut self, buckets: u32) -> Self {
        self.index_buckets = buckets;
        self
    }

    pub fn ingest_queue_capacity(mut self, capacity: usize) -> Self {
        self.ingest_queue_capacity = capacity;
        self
    }

    pub fn ingest_workers(mut self, workers: usize) -> Self {
        self.ingest_workers = Some(workers);
        self
    }

    pub fn telemetry_level(mut self, level: TelemetryLevel) -> Self {
        self.telemetry_level = level;
        self
    }

    pub fn telemetry_sampling(mut self, sampling: TelemetrySampling) -> Self {
        self.telemetry_sampling = sampling;
        self
    }

    /// Effective ingestion worker count.
    pub fn effective_ingest_workers(&self) -> usize {
        self.ingest_workers
            .unwrap_or_else(|| (num_cpus::get() / 4).max(2))
    }

    /// Validate global consistency.
    pub fn validate(&self) -> Result<()> {
        if !self.index_buckets.is_power_of_two() {
            return Err(VulcanoError::validation(format!(
                "kv.index.buckets must be a power of two, got {}",
                self.index_buckets
            )));
        }
        if self.data_segment_bytes % 8 != 0 || self.index_segment_bytes % 8 != 0 {
            return Err(VulcanoError::validation(
                "segment sizes must be multiples of 8 bytes",
            ));
        }
        if self.ingest_queue_capacity == 0 {
            return Err(VulcanoError::validation(
                "ingest.queue.capacity must be >= 1",
            ));
        }
        for (field, params) in &self.hnsw {
            params
                .validate()
                .map_err(|e| VulcanoError::validation(format!("hnsw.{field}: {e}")))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.data_segment_bytes, 256 * 1024 * 1024);
        assert_eq!(config.index_segment_bytes, 16 * 1024 * 1024);
        assert_eq!(config.index_buckets, 65_536);
        assert_eq!(config.ingest_queue_capacity, 1024);
        assert!(config.effective_ingest_workers() >= 2);
    }

    #[test]
    fn test_hnsw_param_defaults() {
        let params = HnswParams::with_dimensions(128);
        assert_eq!(params.m, 16);
        assert_eq!(params.m_max(), 16);
        assert_eq!(params.m_max0(), 32);
        assert_eq!(params.ef_construction, 100);
        assert_eq!(params.ef_search, 50);
        assert!((params.ml() - 1.0 / 16.0f64.ln()).abs() < 1e-12);
    }

    #[test]
    fn test_validate_rejects_bad_buckets() {
        let config = Config::new().index_buckets(1000);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_dimensions() {
        let config = Config::new().hnsw_field("v", HnswParams::with_dimensions(0));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_json_round_trip() {
        let config = Config::new()
            .hnsw_field("embedding", HnswParams::with_dimensions(2).m(8))
            .inverted_field("name");
        let json = serde_json::to_string(&config).unwrap();
        let parsed: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.hnsw["embedding"].dimensions, 2);
        assert_eq!(parsed.inverted, vec!["name".to_string()]);
    }
}
