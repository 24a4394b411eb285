//! Telemetry hooks.
//!
//! The embedder supplies counter/timer/gauge callbacks; the engine invokes
//! them at well-known points using the metric names defined here. The
//! default sink discards everything.

use std::sync::Arc;
use std::time::Duration;

use crate::config::{TelemetryLevel, TelemetrySampling};

pub const COUNTER_DOCUMENT_INSERTS: &str = "document_inserts";
pub const COUNTER_DOCUMENT_REMOVALS: &str = "document_removals";
pub const COUNTER_SEARCH_COUNT: &str = "search_count";
pub const COUNTER_HNSW_DISTANCE_CALCS: &str = "hnsw_distance_calcs";

pub const TIMER_DOCUMENT_INSERT_LATENCY: &str = "document_insert_latency";
pub const TIMER_DOCUMENT_REMOVE_LATENCY: &str = "document_remove_latency";
pub const TIMER_SEARCH_LATENCY: &str = "search_latency";

pub const GAUGE_OFF_HEAP_MEMORY: &str = "off_heap_memory";
pub const GAUGE_STORED_DOCUMENTS: &str = "stored_documents";
pub const GAUGE_INSERT_QUEUE: &str = "insert_queue";
pub const GAUGE_INDEX_RECALL_ESTIMATE: &str = "index_recall_estimate";

/// Callback sink for engine metrics.
pub trait TelemetrySink: Send + Sync {
    fn counter(&self, name: &str, delta: u64);
    fn timer(&self, name: &str, elapsed: Duration);
    fn gauge(&self, name: &str, value: f64);
}

struct NoopSink;

impl TelemetrySink for NoopSink {
    fn counter(&self, _name: &str, _delta: u64) {}
    fn timer(&self, _name: &str, _elapsed: Duration) {}
    fn gauge(&self, _name: &str, _value: f64) {}
}

/// Engine-owned telemetry handle.
///
/// Cheap to clone; passed into every component at construction so that no
/// process-wide state exists.
#[derive(Clone)]
pub struct Telemetry {
    sink: Arc<dyn TelemetrySink>,
    level: TelemetryLevel,
    sampling: TelemetrySampling,
}

impl Telemetry {
    /// Create a telemetry handle over the given sink.
    pub fn new(sink: Arc<dyn TelemetrySink>, level: TelemetryLevel, sampling: TelemetrySampling) -> Self {
        Self { sink, level, sampling }
    }

    /// A handle that discards all metrics.
    pub fn noop() -> Self {
        Self {
            sink: Arc::new(NoopSink),
            level: TelemetryLevel::Off,
            sampling: TelemetrySampling::Off,
        }
    }

    pub fn counter(&self, name: &str, delta: u64) {
        if self.level != TelemetryLevel::Off {
            self.sink.counter(name, delta);
        }
    }

    /// Record a distance-calculation batch, subject to the sampling level.
    pub fn distance_calcs(&self, count: u64) {
        if self.level == TelemetryLevel::Off {
            return;
        }
        let divisor = match self.sampling {
            TelemetrySampling::Off => return,
            TelemetrySampling::Low => 64,
            TelemetrySampling::Medium => 16,
            TelemetrySampling::High => 4,
            TelemetrySampling::Extreme => 1,
        };
        self.sink.counter(COUNTER_HNSW_DISTANCE_CALCS, count / divisor);
    }

    pub fn timer(&self, name: &str, elapsed: Duration) {
        if self.level == TelemetryLevel::Diagnostic || self.level == TelemetryLevel::Basic {
            self.sink.timer(name, elapsed);
        }
    }

    pub fn gauge(&self, name: &str, value: f64) {
        if self.level != TelemetryLevel::Off {
            self.sink.gauge(name, value);
        }
    }
}

impl std::fmt::Debug for Telemetry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Telemetry")
            .field("level", &self.level)
            .field("sampling", &self.sampling)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        counters: Mutex<Vec<(String, u64)>>,
        gauges: Mutex<Vec<(String, f64)>>,
    }

    impl TelemetrySink for RecordingSink {
        fn counter(&self, name: &str, delta: u64) {
            self.counters.lock().unwrap().push((name.to_string(), delta));
        }
        fn timer(&self, _name: &str, _elapsed: Duration) {}
        fn gauge(&self, name: &str, value: f64) {
            self.gauges.lock().unwrap().push((name.to_string(), value));
        }
    }

    #[test]
    fn test_level_off_suppresses_everything() {
        let sink = Arc::new(RecordingSink::default());
        let telemetry = Telemetry::new(sink.clone(), TelemetryLevel::Off, TelemetrySampling::Extreme);
        telemetry.counter(COUNTER_SEARCH_COUNT, 1);
        telemetry.distance_calcs(100);
        telemetry.gauge(GAUGE_INSERT_QUEUE, 3.0);
        assert!(sink.counters.lock().unwrap().is_empty());
        assert!(sink.gauges.lock().unwrap().is_empty());
    }

    #[test]
    fn test_sampling_divides_distance_calcs() {
        let sink = Arc::new(RecordingSink::default());
        let telemetry = Telemetry::new(
            sink.clone(),
            TelemetryLevel::Diagnostic,
            TelemetrySampling::Medium,
        );
        telemetry.distance_calcs(160);
        let counters = sink.counters.lock().unwrap();
        assert_eq!(counters.len(), 1);
        assert_eq!(counters[0], (COUNTER_HNSW_DISTANCE_CALCS.to_string(), 10));
    }
}
