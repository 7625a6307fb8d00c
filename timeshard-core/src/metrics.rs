//! Prometheus metrics for the reconciler and agents
//!
//! Counts of conflicts, transient errors, render failures and reload
//! timeouts are the only user-visible failure surface besides logs.

use axum::{routing::get, Router};
use std::fmt::Write as _;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Instant;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::runtime::ShutdownSignal;

fn header(out: &mut String, name: &str, help: &str, kind: &str) {
    let _ = write!(out, "# HELP {name} {help}\n# TYPE {name} {kind}\n");
}

/// Monotonic counter
pub struct Counter {
    value: AtomicU64,
    name: &'static str,
    help: &'static str,
}

impl Counter {
    pub const fn new(name: &'static str, help: &'static str) -> Self {
        Self {
            value: AtomicU64::new(0),
            name,
            help,
        }
    }

    pub fn inc(&self) {
        self.inc_by(1);
    }

    pub fn inc_by(&self, delta: u64) {
        self.value.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }

    /// Prometheus text exposition
    pub fn to_prometheus(&self) -> String {
        let mut out = String::new();
        header(&mut out, self.name, self.help, "counter");
        let _ = writeln!(out, "{} {}", self.name, self.get());
        out
    }
}

/// Settable gauge
pub struct Gauge {
    value: AtomicI64,
    name: &'static str,
    help: &'static str,
}

impl Gauge {
    pub const fn new(name: &'static str, help: &'static str) -> Self {
        Self {
            value: AtomicI64::new(0),
            name,
            help,
        }
    }

    pub fn set(&self, val: i64) {
        self.value.store(val, Ordering::Relaxed);
    }

    pub fn get(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }

    /// Prometheus text exposition
    pub fn to_prometheus(&self) -> String {
        let mut out = String::new();
        header(&mut out, self.name, self.help, "gauge");
        let _ = writeln!(out, "{} {}", self.name, self.get());
        out
    }
}

/// Latency histogram with cumulative buckets
pub struct Histogram {
    bounds: &'static [f64],
    buckets: Vec<AtomicU64>,
    /// Sum in microseconds
    sum_micros: AtomicU64,
    count: AtomicU64,
    name: &'static str,
    help: &'static str,
}

/// Buckets sized for reload round trips
const RELOAD_BUCKETS: &[f64] = &[0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0];

impl Histogram {
    pub fn new(name: &'static str, help: &'static str) -> Self {
        Self::with_buckets(name, help, RELOAD_BUCKETS)
    }

    pub fn with_buckets(name: &'static str, help: &'static str, bounds: &'static [f64]) -> Self {
        Self {
            bounds,
            buckets: bounds.iter().map(|_| AtomicU64::new(0)).collect(),
            sum_micros: AtomicU64::new(0),
            count: AtomicU64::new(0),
            name,
            help,
        }
    }

    /// Record one observation in seconds
    pub fn observe(&self, seconds: f64) {
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_micros
            .fetch_add((seconds * 1_000_000.0) as u64, Ordering::Relaxed);
        for (bound, bucket) in self.bounds.iter().zip(&self.buckets) {
            if seconds <= *bound {
                bucket.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Record the time elapsed since `start`
    pub fn observe_since(&self, start: Instant) {
        self.observe(start.elapsed().as_secs_f64());
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Prometheus text exposition
    pub fn to_prometheus(&self) -> String {
        let mut out = String::new();
        header(&mut out, self.name, self.help, "histogram");
        for (bound, bucket) in self.bounds.iter().zip(&self.buckets) {
            let _ = writeln!(
                out,
                "{}_bucket{{le=\"{}\"}} {}",
                self.name,
                bound,
                bucket.load(Ordering::Relaxed)
            );
        }
        let _ = writeln!(out, "{}_bucket{{le=\"+Inf\"}} {}", self.name, self.count());
        let sum = self.sum_micros.load(Ordering::Relaxed) as f64 / 1_000_000.0;
        let _ = writeln!(out, "{}_sum {}", self.name, sum);
        let _ = writeln!(out, "{}_count {}", self.name, self.count());
        out
    }
}

/// Standard timeshard metrics
pub mod standard {
    use super::*;
    use std::sync::LazyLock;

    pub static RECONCILE_TICKS: LazyLock<Counter> = LazyLock::new(|| {
        Counter::new("timeshard_reconcile_ticks_total", "Reconciliation ticks executed")
    });

    pub static DOCUMENT_WRITES: LazyLock<Counter> = LazyLock::new(|| {
        Counter::new("timeshard_document_writes_total", "Documents written to the shared record")
    });

    pub static WRITE_CONFLICTS: LazyLock<Counter> = LazyLock::new(|| {
        Counter::new("timeshard_write_conflicts_total", "Conditional writes lost to a concurrent writer")
    });

    pub static TRANSIENT_ERRORS: LazyLock<Counter> = LazyLock::new(|| {
        Counter::new("timeshard_transient_errors_total", "Store operations that failed transiently")
    });

    pub static RENDER_FAILURES: LazyLock<Counter> = LazyLock::new(|| {
        Counter::new("timeshard_render_failures_total", "Worker config renders that failed")
    });

    pub static RELOAD_TIMEOUTS: LazyLock<Counter> = LazyLock::new(|| {
        Counter::new("timeshard_reload_timeouts_total", "Reloads the worker did not acknowledge in time")
    });

    pub static RELOADS_APPLIED: LazyLock<Counter> = LazyLock::new(|| {
        Counter::new("timeshard_reloads_applied_total", "Windows applied and acknowledged by the worker")
    });

    pub static DOCUMENT_GENERATION: LazyLock<Gauge> = LazyLock::new(|| {
        Gauge::new("timeshard_document_generation", "Generation of the last document seen")
    });

    pub static RELOAD_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
        Histogram::new("timeshard_reload_duration_seconds", "Time for the worker to acknowledge a reload")
    });
}

/// Helper to gather all standard metrics
pub fn gather_system_metrics() -> String {
    let mut output = String::new();

    // Counters
    output.push_str(&standard::RECONCILE_TICKS.to_prometheus());
    output.push_str(&standard::DOCUMENT_WRITES.to_prometheus());
    output.push_str(&standard::WRITE_CONFLICTS.to_prometheus());
    output.push_str(&standard::TRANSIENT_ERRORS.to_prometheus());
    output.push_str(&standard::RENDER_FAILURES.to_prometheus());
    output.push_str(&standard::RELOAD_TIMEOUTS.to_prometheus());
    output.push_str(&standard::RELOADS_APPLIED.to_prometheus());

    // Gauges
    output.push_str(&standard::DOCUMENT_GENERATION.to_prometheus());

    // Histograms
    output.push_str(&standard::RELOAD_DURATION.to_prometheus());

    output
}

/// Serve `/metrics` until `shutdown` fires
pub async fn serve(addr: SocketAddr, shutdown: ShutdownSignal) -> std::io::Result<()> {
    let app = Router::new()
        .route("/metrics", get(|| async { gather_system_metrics() }))
        .layer(CorsLayer::permissive());

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Metrics API listening on {}", addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.wait().await })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_exposition() {
        let counter = Counter::new("test_conflicts_total", "Test counter");
        counter.inc();
        counter.inc_by(4);
        assert_eq!(counter.get(), 5);
        assert!(counter
            .to_prometheus()
            .ends_with("# TYPE test_conflicts_total counter\ntest_conflicts_total 5\n"));
    }

    #[test]
    fn test_gauge() {
        let gauge = Gauge::new("test_generation", "Test gauge");
        gauge.set(7);
        assert_eq!(gauge.get(), 7);
        assert!(gauge.to_prometheus().contains("test_generation 7"));
    }

    #[test]
    fn test_histogram_buckets_are_cumulative() {
        let histogram = Histogram::new("test_reload_seconds", "Test histogram");
        histogram.observe(0.07);
        histogram.observe(3.0);
        histogram.observe(120.0);

        let text = histogram.to_prometheus();
        assert!(text.contains("test_reload_seconds_bucket{le=\"0.1\"} 1"));
        assert!(text.contains("test_reload_seconds_bucket{le=\"5\"} 2"));
        assert!(text.contains("test_reload_seconds_bucket{le=\"+Inf\"} 3"));
        assert!(text.contains("test_reload_seconds_count 3"));
    }

    #[test]
    fn test_gather_lists_failure_counters() {
        let text = gather_system_metrics();
        for name in [
            "timeshard_write_conflicts_total",
            "timeshard_render_failures_total",
            "timeshard_reload_timeouts_total",
        ] {
            assert!(text.contains(name), "missing {}", name);
        }
    }
}
