//! Thread-safe per-group metric storage

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use hdrhistogram::Histogram;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Point-in-time copy of a group's counters
pub type MetricSnapshot = BTreeMap<String, u64>;

/// Named monotonically increasing counters, one store per agent group.
///
/// Agents of the owning group increment; reporters only ever see
/// [`MetricStore::snapshot`] copies.
#[derive(Debug, Default)]
pub struct MetricStore {
    counters: DashMap<String, AtomicU64>,
}

impl MetricStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `delta` to `name`, creating the counter if needed
    pub fn increment(&self, name: &str, delta: u64) {
        // Fast path: the counter usually exists and only needs a shared shard lock
        if let Some(counter) = self.counters.get(name) {
            counter.fetch_add(delta, Ordering::Relaxed);
            return;
        }
        self.counters
            .entry(name.to_string())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(delta, Ordering::Relaxed);
    }

    /// Current value of one counter; unknown names read as zero
    pub fn get(&self, name: &str) -> u64 {
        self.counters
            .get(name)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Copy of every counter
    pub fn snapshot(&self) -> MetricSnapshot {
        self.counters
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().load(Ordering::Relaxed)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.counters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }
}

/// Latency histogram shared by the agents of one group
pub struct LatencyRecorder {
    histogram: Mutex<Histogram<u64>>,
}

impl LatencyRecorder {
    pub fn new() -> Self {
        // 1 microsecond to 60 seconds, 3 significant figures
        let histogram = Histogram::new_with_bounds(1, 60_000_000, 3)
            .expect("constant histogram bounds are valid");
        Self {
            histogram: Mutex::new(histogram),
        }
    }

    pub fn record(&self, latency: Duration) {
        let micros = (latency.as_micros() as u64).max(1);
        // Out-of-range samples are clamped to the histogram's highest trackable value
        self.histogram.lock().saturating_record(micros);
    }

    pub fn percentiles(&self) -> LatencyPercentiles {
        let hist = self.histogram.lock();
        if hist.is_empty() {
            return LatencyPercentiles::default();
        }
        LatencyPercentiles {
            samples: hist.len(),
            p50_us: hist.value_at_percentile(50.0),
            p95_us: hist.value_at_percentile(95.0),
            p99_us: hist.value_at_percentile(99.0),
            max_us: hist.max(),
        }
    }
}

impl Default for LatencyRecorder {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for LatencyRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LatencyRecorder")
            .field("samples", &self.histogram.lock().len())
            .finish()
    }
}

/// Latency percentiles in microseconds
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LatencyPercentiles {
    pub samples: u64,
    pub p50_us: u64,
    pub p95_us: u64,
    pub p99_us: u64,
    pub max_us: u64,
}

impl LatencyPercentiles {
    pub fn p50_ms(&self) -> f64 {
        self.p50_us as f64 / 1000.0
    }

    pub fn p95_ms(&self) -> f64 {
        self.p95_us as f64 / 1000.0
    }

    pub fn p99_ms(&self) -> f64 {
        self.p99_us as f64 / 1000.0
    }

    pub fn max_ms(&self) -> f64 {
        self.max_us as f64 / 1000.0
    }
}
