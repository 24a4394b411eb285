//! Durable storage substrate.
//!
//! Layered bottom-up: memory-mapped paged regions, the committed-offset
//! metadata file, the append-only data log, the hash-partitioned index,
//! the composed key-value store, and the write-ahead log.

pub mod data_log;
pub mod hash_index;
pub mod kv;
pub mod metadata;
pub mod paged;
pub mod wal;
