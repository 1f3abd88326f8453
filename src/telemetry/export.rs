//! Metrics export to JSON files and the console.

use super::metrics::MetricsSnapshot;
use crate::error::{Error, Result};
use serde::Serialize;
use std::path::PathBuf;

/// Trait for exporting metrics to different formats
pub trait MetricsExporter: Send + Sync {
    fn export(&self, snapshot: &MetricsSnapshot) -> Result<()>;
}

/// Writes each snapshot to a JSON file, replacing the previous one.
#[derive(Debug)]
pub struct JsonExporter {
    output_path: PathBuf,
}

impl JsonExporter {
    pub fn new(output_path: impl Into<PathBuf>) -> Self {
        Self {
            output_path: output_path.into(),
        }
    }
}

impl MetricsExporter for JsonExporter {
    fn export(&self, snapshot: &MetricsSnapshot) -> Result<()> {
        let serializable = SerializableSnapshot::from(snapshot);
        let json = serde_json::to_string_pretty(&serializable)
            .map_err(|e| Error::telemetry(format!("JSON serialization failed: {}", e)))?;

        std::fs::write(&self.output_path, json)?;
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize)]
struct SerializableSnapshot {
    uptime_secs: f64,
    programs_built: u64,
    build_failures: u64,
    build_success_rate: f64,
    kernels_dispatched: u64,
    dispatches_per_second: f64,
    enqueue_failures: u64,
    bytes_written: u64,
    bytes_read: u64,
    avg_latency_us: f64,
    p50_latency_us: f64,
    p95_latency_us: f64,
    p99_latency_us: f64,
    max_latency_us: f64,
}

impl From<&MetricsSnapshot> for SerializableSnapshot {
    fn from(snapshot: &MetricsSnapshot) -> Self {
        Self {
            uptime_secs: snapshot.uptime.as_secs_f64(),
            programs_built: snapshot.programs_built,
            build_failures: snapshot.build_failures,
            build_success_rate: snapshot.build_success_rate(),
            kernels_dispatched: snapshot.kernels_dispatched,
            dispatches_per_second: snapshot.dispatches_per_second(),
            enqueue_failures: snapshot.enqueue_failures,
            bytes_written: snapshot.bytes_written,
            bytes_read: snapshot.bytes_read,
            avg_latency_us: snapshot.avg_latency_ns as f64 / 1_000.0,
            p50_latency_us: snapshot.p50_latency_ns as f64 / 1_000.0,
            p95_latency_us: snapshot.p95_latency_ns as f64 / 1_000.0,
            p99_latency_us: snapshot.p99_latency_ns as f64 / 1_000.0,
            max_latency_us: snapshot.max_latency_ns as f64 / 1_000.0,
        }
    }
}

/// Export metrics to console (stdout)
#[derive(Debug)]
pub struct ConsoleExporter {
    verbose: bool,
}

impl ConsoleExporter {
    pub fn new(verbose: bool) -> Self {
        Self { verbose }
    }
}

impl MetricsExporter for ConsoleExporter {
    fn export(&self, snapshot: &MetricsSnapshot) -> Result<()> {
        println!("=== kiln runtime metrics ===");
        println!("Uptime: {:.2}s", snapshot.uptime.as_secs_f64());
        println!(
            "Programs built: {} ({} failed)",
            snapshot.programs_built, snapshot.build_failures
        );
        println!("Kernels dispatched: {}", snapshot.kernels_dispatched);
        println!("Bytes written: {}", snapshot.bytes_written);
        println!("Bytes read: {}", snapshot.bytes_read);

        if self.verbose {
            println!("\nHost latency:");
            println!("  Average: {:.2}μs", snapshot.avg_latency_ns as f64 / 1_000.0);
            println!("  P50: {:.2}μs", snapshot.p50_latency_ns as f64 / 1_000.0);
            println!("  P95: {:.2}μs", snapshot.p95_latency_ns as f64 / 1_000.0);
            println!("  P99: {:.2}μs", snapshot.p99_latency_ns as f64 / 1_000.0);
            println!("  Max: {:.2}μs", snapshot.max_latency_ns as f64 / 1_000.0);
            println!("Enqueue failures: {}", snapshot.enqueue_failures);
        }

        println!("============================");

        Ok(())
    }
}

impl Default for ConsoleExporter {
    fn default() -> Self {
        Self::new(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    fn dummy_snapshot() -> MetricsSnapshot {
        MetricsSnapshot {
            timestamp: Instant::now(),
            uptime: Duration::from_secs(10),
            programs_built: 4,
            build_failures: 1,
            kernels_dispatched: 1000,
            enqueue_failures: 0,
            bytes_written: 1 << 20,
            bytes_read: 1 << 20,
            avg_latency_ns: 1000,
            p50_latency_ns: 900,
            p95_latency_ns: 1500,
            p99_latency_ns: 2000,
            max_latency_ns: 5000,
        }
    }

    #[test]
    fn test_console_exporter() {
        let exporter = ConsoleExporter::new(true);
        assert!(exporter.export(&dummy_snapshot()).is_ok());
    }

    #[test]
    fn test_json_exporter() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.json");
        let exporter = JsonExporter::new(&path);

        exporter.export(&dummy_snapshot()).unwrap();

        let value: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(value["kernels_dispatched"], 1000);
        assert_eq!(value["build_success_rate"], 0.8);
    }

    #[test]
    fn test_json_exporter_unwritable_path() {
        let dir = tempfile::tempdir().unwrap();
        let exporter = JsonExporter::new(dir.path().join("missing").join("metrics.json"));

        let err = exporter.export(&dummy_snapshot()).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Io);
    }
}
