//! Runtime metrics and their export.
//!
//! With the `telemetry` feature off, [`Metrics`] is a no-op with the same
//! surface so the runtime records unconditionally.

#[cfg(feature = "telemetry")]
pub mod metrics;

#[cfg(feature = "telemetry")]
pub mod export;

#[cfg(feature = "telemetry")]
pub use metrics::{Metrics, MetricsSnapshot};

#[cfg(feature = "telemetry")]
pub use export::{ConsoleExporter, JsonExporter, MetricsExporter};

// Stub implementations when telemetry is disabled
#[cfg(not(feature = "telemetry"))]
pub mod metrics {
    use std::time::Duration;

    #[derive(Debug, Clone, Default)]
    pub struct Metrics;

    impl Metrics {
        pub fn new() -> Self {
            Self
        }
        pub fn record_build(&self, _: u64, _: bool) {}
        pub fn record_dispatch(&self, _: u64) {}
        pub fn record_enqueue_failure(&self) {}
        pub fn record_write(&self, _: usize, _: u64) {}
        pub fn record_read(&self, _: usize, _: u64) {}
        pub fn reset(&self) {}
        pub fn snapshot(&self) -> MetricsSnapshot {
            MetricsSnapshot::default()
        }
    }

    #[derive(Debug, Clone, Default)]
    pub struct MetricsSnapshot {
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
}

#[cfg(not(feature = "telemetry"))]
pub use metrics::{Metrics, MetricsSnapshot};
