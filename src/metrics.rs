//! # In-process metrics for the run loop.
//!
//! Lock-free atomic instruments, readable at any time by embedders and
//! tests. [`ContainerMetrics`] covers the whole loop; [`TaskMetrics`] covers
//! one task.
//!
//! Histograms here are lightweight summaries (count, sum, last) rather than
//! bucketed distributions; export to a real metrics backend is the
//! embedder's concern.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Monotonically increasing counter.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    /// Increments the counter by one.
    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns the current count.
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Last-write-wins integer gauge.
#[derive(Debug, Default)]
pub struct Gauge(AtomicU64);

impl Gauge {
    /// Sets the gauge.
    pub fn set(&self, value: u64) {
        self.0.store(value, Ordering::Relaxed);
    }

    /// Returns the current value.
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Last-write-wins floating point gauge (stored as bits).
#[derive(Debug)]
pub struct Ratio(AtomicU64);

impl Ratio {
    /// Sets the gauge.
    pub fn set(&self, value: f64) {
        self.0.store(value.to_bits(), Ordering::Relaxed);
    }

    /// Returns the current value.
    pub fn get(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Relaxed))
    }
}

impl Default for Ratio {
    fn default() -> Self {
        Self(AtomicU64::new(0.0f64.to_bits()))
    }
}

/// Duration summary: observation count, running sum, and last value.
#[derive(Debug, Default)]
pub struct Histogram {
    count: AtomicU64,
    sum_ns: AtomicU64,
    last_ns: AtomicU64,
}

impl Histogram {
    /// Records one observation.
    pub fn record(&self, d: Duration) {
        let ns = d.as_nanos().min(u64::MAX as u128) as u64;
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_ns.fetch_add(ns, Ordering::Relaxed);
        self.last_ns.store(ns, Ordering::Relaxed);
    }

    /// Number of observations.
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Sum of all observations.
    pub fn sum(&self) -> Duration {
        Duration::from_nanos(self.sum_ns.load(Ordering::Relaxed))
    }

    /// Most recent observation.
    pub fn last(&self) -> Duration {
        Duration::from_nanos(self.last_ns.load(Ordering::Relaxed))
    }

    /// Mean observation, or zero before the first record.
    pub fn mean(&self) -> Duration {
        let count = self.count();
        if count == 0 {
            Duration::ZERO
        } else {
            Duration::from_nanos(self.sum_ns.load(Ordering::Relaxed) / count)
        }
    }
}

/// Metrics for one run loop instance.
#[derive(Debug, Default)]
pub struct ContainerMetrics {
    /// Envelopes returned by the consumer.
    pub envelopes: Counter,
    /// Choose calls that came back empty.
    pub null_envelopes: Counter,
    /// Process dispatches (callback creations).
    pub processes: Counter,
    /// Window invocations.
    pub windows: Counter,
    /// Commit invocations.
    pub commits: Counter,

    /// Time spent choosing an envelope per tick.
    pub choose_ns: Histogram,
    /// Time spent parked in `block_if_busy` per tick.
    pub block_ns: Histogram,
    /// Dispatch-to-completion latency per processed envelope.
    pub process_ns: Histogram,
    /// Window body duration.
    pub window_ns: Histogram,
    /// Commit body duration.
    pub commit_ns: Histogram,

    /// Fraction of the last tick spent doing work rather than waiting.
    pub utilization: Ratio,
}

impl ContainerMetrics {
    /// Creates a zeroed metrics registry.
    pub fn new() -> Self {
        Self::default()
    }
}

/// Metrics for one task worker.
#[derive(Debug, Default)]
pub struct TaskMetrics {
    /// Envelopes queued for the task and not yet fetched.
    pub pending_messages: Gauge,
    /// Completions that arrived on an already-terminal callback.
    pub duplicate_callbacks: Counter,
}

impl TaskMetrics {
    /// Creates a zeroed metrics registry.
    pub fn new() -> Self {
        Self::default()
    }
}
