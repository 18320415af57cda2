//! Latency and throughput recording.
//!
//! Two histograms, both recorded in microseconds (1 µs to one hour):
//! - `requests`: one sample per batch, dispatch to aggregate completion
//! - `calls`: one sample per remote call, submit to completion
//!
//! Snapshots report every latency in milliseconds.
//!
//! `spawn_reporter` logs a snapshot on a fixed interval.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use hdrhistogram::Histogram;
use serde::Serialize;

/// Where the dispatch pipeline reports what it observed.
pub trait MetricsSink: Send + Sync {
    /// One remote call finished (successfully or not).
    fn record_call(&self, latency: Duration, ok: bool);

    /// One batch's aggregate completion fired.
    fn record_batch(&self, latency: Duration, queries: usize, failed: usize);
}

/// Distribution summary of one histogram, in milliseconds.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LatencySummary {
    pub count: u64,
    pub min_ms: f64,
    pub mean_ms: f64,
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    pub max_ms: f64,
}

impl LatencySummary {
    fn from_histogram(histogram: &Histogram<u64>) -> Self {
        if histogram.is_empty() {
            return Self::default();
        }
        let ms = |us: u64| us as f64 / 1000.0;
        Self {
            count: histogram.len(),
            min_ms: ms(histogram.min()),
            mean_ms: histogram.mean() / 1000.0,
            p50_ms: ms(histogram.value_at_quantile(0.50)),
            p95_ms: ms(histogram.value_at_quantile(0.95)),
            p99_ms: ms(histogram.value_at_quantile(0.99)),
            max_ms: ms(histogram.max()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    /// Wall-clock time of the snapshot (RFC 3339).
    pub taken_at: String,
    pub elapsed_secs: f64,
    pub requests: LatencySummary,
    pub calls: LatencySummary,
    pub batches_completed: u64,
    pub calls_completed: u64,
    pub calls_failed: u64,
    pub batches_per_sec: f64,
    pub calls_per_sec: f64,
}

/// HDR-histogram backed `MetricsSink`.
pub struct Metrics {
    started: Instant,
    requests: Mutex<Histogram<u64>>,
    calls: Mutex<Histogram<u64>>,
    batches_completed: AtomicU64,
    calls_completed: AtomicU64,
    calls_failed: AtomicU64,
}

impl Metrics {
    const SIGNIFICANT_FIGURES: u8 = 3;
    /// One hour in microseconds. Longer samples are clamped to it.
    const HIGHEST_TRACKABLE_US: u64 = 3_600_000_000;

    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            requests: Mutex::new(Self::histogram()),
            calls: Mutex::new(Self::histogram()),
            batches_completed: AtomicU64::new(0),
            calls_completed: AtomicU64::new(0),
            calls_failed: AtomicU64::new(0),
        }
    }

    fn histogram() -> Histogram<u64> {
        // Constant bounds and precision, always accepted by hdrhistogram.
        Histogram::new_with_bounds(1, Self::HIGHEST_TRACKABLE_US, Self::SIGNIFICANT_FIGURES)
            .expect("valid histogram bounds")
    }

    fn record(histogram: &Mutex<Histogram<u64>>, latency: Duration) {
        let micros = u64::try_from(latency.as_micros()).unwrap_or(u64::MAX);
        histogram
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .saturating_record(micros.max(1));
    }

    /// Current totals, rates over the process lifetime and latency summaries.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let elapsed = self.started.elapsed().as_secs_f64();
        let batches = self.batches_completed.load(Ordering::Relaxed);
        let calls = self.calls_completed.load(Ordering::Relaxed);
        let rate = |n: u64| if elapsed > 0.0 { n as f64 / elapsed } else { 0.0 };

        MetricsSnapshot {
            taken_at: chrono::Utc::now().to_rfc3339(),
            elapsed_secs: elapsed,
            requests: LatencySummary::from_histogram(
                &self.requests.lock().unwrap_or_else(PoisonError::into_inner),
            ),
            calls: LatencySummary::from_histogram(
                &self.calls.lock().unwrap_or_else(PoisonError::into_inner),
            ),
            batches_completed: batches,
            calls_completed: calls,
            calls_failed: self.calls_failed.load(Ordering::Relaxed),
            batches_per_sec: rate(batches),
            calls_per_sec: rate(calls),
        }
    }

    /// Log a snapshot every `interval` until the runtime shuts down.
    pub fn spawn_reporter(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let metrics = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick fires immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                metrics.snapshot().log();
            }
        })
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsSink for Metrics {
    fn record_call(&self, latency: Duration, ok: bool) {
        Self::record(&self.calls, latency);
        self.calls_completed.fetch_add(1, Ordering::Relaxed);
        if !ok {
            self.calls_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn record_batch(&self, latency: Duration, _queries: usize, _failed: usize) {
        Self::record(&self.requests, latency);
        self.batches_completed.fetch_add(1, Ordering::Relaxed);
    }
}

impl MetricsSnapshot {
    /// Emit the snapshot as one structured `info` event.
    pub fn log(&self) {
        tracing::info!(
            target: "querybench::metrics",
            batches = self.batches_completed,
            batches_per_sec = self.batches_per_sec,
            calls = self.calls_completed,
            calls_failed = self.calls_failed,
            calls_per_sec = self.calls_per_sec,
            requests_p50_ms = self.requests.p50_ms,
            requests_p99_ms = self.requests.p99_ms,
            requests_max_ms = self.requests.max_ms,
            calls_p50_ms = self.calls.p50_ms,
            calls_p99_ms = self.calls.p99_ms,
            "Throughput report"
        );
    }
}
