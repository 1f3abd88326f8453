//! Counters and host-side latency for runtime operations.

use hdrhistogram::Histogram;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Largest latency tracked: one hour in nanoseconds.
const MAX_LATENCY_NS: u64 = 3_600_000_000_000;

/// Runtime metrics collector
#[derive(Debug)]
pub struct Metrics {
    programs_built: AtomicU64,
    build_failures: AtomicU64,
    kernels_dispatched: AtomicU64,
    enqueue_failures: AtomicU64,
    bytes_written: AtomicU64,
    bytes_read: AtomicU64,

    // Host-side time spent in builds, dispatches and transfers
    latency_histogram: RwLock<Option<Histogram<u64>>>,

    start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            programs_built: AtomicU64::new(0),
            build_failures: AtomicU64::new(0),
            kernels_dispatched: AtomicU64::new(0),
            enqueue_failures: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
            bytes_read: AtomicU64::new(0),
            latency_histogram: RwLock::new(Histogram::new_with_max(MAX_LATENCY_NS, 3).ok()),
            start_time: Instant::now(),
        }
    }

    fn record_latency(&self, duration_ns: u64) {
        if let Some(mut hist) = self.latency_histogram.try_write() {
            if let Some(hist) = hist.as_mut() {
                let _ = hist.record(duration_ns.min(MAX_LATENCY_NS));
            }
        }
    }

    pub fn record_build(&self, duration_ns: u64, success: bool) {
        if success {
            self.programs_built.fetch_add(1, Ordering::Relaxed);
        } else {
            self.build_failures.fetch_add(1, Ordering::Relaxed);
        }
        self.record_latency(duration_ns);
    }

    pub fn record_dispatch(&self, duration_ns: u64) {
        self.kernels_dispatched.fetch_add(1, Ordering::Relaxed);
        self.record_latency(duration_ns);
    }

    pub fn record_enqueue_failure(&self) {
        self.enqueue_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_write(&self, bytes: usize, duration_ns: u64) {
        self.bytes_written.fetch_add(bytes as u64, Ordering::Relaxed);
        self.record_latency(duration_ns);
    }

    pub fn record_read(&self, bytes: usize, duration_ns: u64) {
        self.bytes_read.fetch_add(bytes as u64, Ordering::Relaxed);
        self.record_latency(duration_ns);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let histogram = self.latency_histogram.read();
        let quantile = |q: f64| histogram.as_ref().map_or(0, |h| h.value_at_quantile(q));

        MetricsSnapshot {
            timestamp: Instant::now(),
            uptime: self.start_time.elapsed(),
            programs_built: self.programs_built.load(Ordering::Relaxed),
            build_failures: self.build_failures.load(Ordering::Relaxed),
            kernels_dispatched: self.kernels_dispatched.load(Ordering::Relaxed),
            enqueue_failures: self.enqueue_failures.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            avg_latency_ns: match histogram.as_ref() {
                Some(h) if h.len() > 0 => h.mean() as u64,
                _ => 0,
            },
            p50_latency_ns: quantile(0.50),
            p95_latency_ns: quantile(0.95),
            p99_latency_ns: quantile(0.99),
            max_latency_ns: histogram.as_ref().map_or(0, |h| h.max()),
        }
    }

    pub fn reset(&self) {
        self.programs_built.store(0, Ordering::Relaxed);
        self.build_failures.store(0, Ordering::Relaxed);
        self.kernels_dispatched.store(0, Ordering::Relaxed);
        self.enqueue_failures.store(0, Ordering::Relaxed);
        self.bytes_written.store(0, Ordering::Relaxed);
        self.bytes_read.store(0, Ordering::Relaxed);

        if let Some(mut hist) = self.latency_histogram.try_write() {
            if let Some(hist) = hist.as_mut() {
                hist.reset();
            }
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub timestamp: Instant,
    pub uptime: Duration,
    pub programs_built: u64,
    pub build_failures: u64,
    pub kernels_dispatched: u64,
    pub enqueue_failures: u64,
    pub bytes_written: u64,
    pub bytes_read: u64,
    pub avg_latency_ns: u64,
    pub p50_latency_ns: u64,
    pub p95_latency_ns: u64,
    pub p99_latency_ns: u64,
    pub max_latency_ns: u64,
}

impl MetricsSnapshot {
    /// Fraction of builds that succeeded (0.0 to 1.0)
    pub fn build_success_rate(&self) -> f64 {
        let total = self.programs_built + self.build_failures;
        if total == 0 {
            return 0.0;
        }
        self.programs_built as f64 / total as f64
    }

    pub fn dispatches_per_second(&self) -> f64 {
        let seconds = self.uptime.as_secs_f64();
        if seconds == 0.0 {
            return 0.0;
        }
        self.kernels_dispatched as f64 / seconds
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_basic() {
        let metrics = Metrics::new();

        metrics.record_build(1000, true);
        metrics.record_build(2000, false);
        metrics.record_dispatch(500);
        metrics.record_write(64, 100);
        metrics.record_read(32, 100);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.programs_built, 1);
        assert_eq!(snapshot.build_failures, 1);
        assert_eq!(snapshot.kernels_dispatched, 1);
        assert_eq!(snapshot.bytes_written, 64);
        assert_eq!(snapshot.bytes_read, 32);
        assert!(snapshot.avg_latency_ns > 0);
        assert!(snapshot.max_latency_ns >= 2000);
    }

    #[test]
    fn test_metrics_reset() {
        let metrics = Metrics::new();

        metrics.record_dispatch(1000);
        assert_eq!(metrics.snapshot().kernels_dispatched, 1);

        metrics.reset();
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.kernels_dispatched, 0);
        assert_eq!(snapshot.avg_latency_ns, 0);
    }

    #[test]
    fn test_build_success_rate() {
        let metrics = Metrics::new();
        assert_eq!(metrics.snapshot().build_success_rate(), 0.0);

        metrics.record_build(10, true);
        metrics.record_build(10, true);
        metrics.record_build(10, true);
        metrics.record_build(10, false);
        assert_eq!(metrics.snapshot().build_success_rate(), 0.75);
    }
}
