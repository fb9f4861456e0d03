//! Picker Metrics
//!
//! Lock-free counters and a decision-time histogram. Recording never blocks
//! the routing path.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;

// ============================================================================
// Histogram
// ============================================================================

/// Bucketed distribution of recorded values
#[derive(Debug)]
pub struct Histogram {
    /// Upper bucket bounds, ascending
    buckets: Vec<f64>,
    counts: Vec<AtomicU64>,
    total_count: AtomicU64,
    sum: AtomicU64,
    max: AtomicU64,
}

impl Histogram {
    pub fn new(buckets: Vec<f64>) -> Self {
        let counts = buckets.iter().map(|_| AtomicU64::new(0)).collect();
        Self {
            buckets,
            counts,
            total_count: AtomicU64::new(0),
            sum: AtomicU64::new(0),
            max: AtomicU64::new(0),
        }
    }

    /// Buckets for routing decisions, in microseconds
    pub fn decision_time_default() -> Self {
        Self::new(vec![
            5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 5000.0, 25000.0,
        ])
    }

    pub fn record(&self, value: f64) {
        if self.buckets.is_empty() {
            return;
        }
        let bucket_idx = self
            .buckets
            .iter()
            .position(|&b| value <= b)
            .unwrap_or(self.buckets.len() - 1);

        self.counts[bucket_idx].fetch_add(1, Ordering::Relaxed);
        self.total_count.fetch_add(1, Ordering::Relaxed);
        self.sum.fetch_add(value as u64, Ordering::Relaxed);
        self.max.fetch_max(value as u64, Ordering::Relaxed);
    }

    pub fn record_duration(&self, elapsed: Duration) {
        self.record(elapsed.as_micros() as f64);
    }

    pub fn snapshot(&self) -> HistogramSnapshot {
        let total = self.total_count.load(Ordering::Relaxed);
        let sum = self.sum.load(Ordering::Relaxed);
        HistogramSnapshot {
            buckets: self.buckets.clone(),
            counts: self
                .counts
                .iter()
                .map(|c| c.load(Ordering::Relaxed))
                .collect(),
            total,
            sum,
            max: self.max.load(Ordering::Relaxed),
            mean: if total > 0 {
                sum as f64 / total as f64
            } else {
                0.0
            },
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct HistogramSnapshot {
    pub buckets: Vec<f64>,
    pub counts: Vec<u64>,
    pub total: u64,
    pub sum: u64,
    pub max: u64,
    pub mean: f64,
}

impl HistogramSnapshot {
    /// Upper bound of the bucket holding the `p` quantile
    pub fn percentile(&self, p: f64) -> f64 {
        if self.total == 0 {
            return 0.0;
        }

        let target = (self.total as f64 * p).ceil() as u64;
        let mut cumulative = 0u64;
        for (i, &count) in self.counts.iter().enumerate() {
            cumulative += count;
            if cumulative >= target {
                return self.buckets[i];
            }
        }
        self.buckets.last().copied().unwrap_or(0.0)
    }

    pub fn p50(&self) -> f64 {
        self.percentile(0.5)
    }

    pub fn p99(&self) -> f64 {
        self.percentile(0.99)
    }
}

// ============================================================================
// Counter
// ============================================================================

#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

// ============================================================================
// Routing Metrics
// ============================================================================

/// Outcomes of routing queries
#[derive(Debug)]
pub struct RouterMetrics {
    pub routed: Counter,
    pub not_ready: Counter,
    pub unknown_model: Counter,
    pub no_routable_variant: Counter,
    pub no_available_backend: Counter,
    pub decision_time: Histogram,
    /// Routed requests per selected variant
    variants: DashMap<String, Counter>,
}

impl Default for RouterMetrics {
    fn default() -> Self {
        Self {
            routed: Counter::new(),
            not_ready: Counter::new(),
            unknown_model: Counter::new(),
            no_routable_variant: Counter::new(),
            no_available_backend: Counter::new(),
            decision_time: Histogram::decision_time_default(),
            variants: DashMap::new(),
        }
    }
}

impl RouterMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_variant(&self, variant: &str) {
        if let Some(counter) = self.variants.get(variant) {
            counter.inc();
            return;
        }
        self.variants.entry(variant.to_string()).or_default().inc();
    }

    pub fn variant_count(&self, variant: &str) -> u64 {
        self.variants.get(variant).map(|c| c.get()).unwrap_or(0)
    }

    pub fn failures(&self) -> u64 {
        self.not_ready.get()
            + self.unknown_model.get()
            + self.no_routable_variant.get()
            + self.no_available_backend.get()
    }

    pub fn snapshot(&self) -> RouterMetricsSnapshot {
        RouterMetricsSnapshot {
            routed: self.routed.get(),
            failures: self.failures(),
            decision_time: self.decision_time.snapshot(),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct RouterMetricsSnapshot {
    pub routed: u64,
    pub failures: u64,
    pub decision_time: HistogramSnapshot,
}
