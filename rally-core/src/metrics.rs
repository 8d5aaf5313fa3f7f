//! Prometheus-style metrics for monitoring
//!
//! Lock-free counters, gauges, and histograms exported in the Prometheus
//! text format.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Instant;

/// Counter metric (monotonically increasing)
pub struct Counter {
    value: AtomicU64,
    name: String,
    help: String,
}

impl Counter {
    pub fn new(name: &str, help: &str) -> Self {
        Self {
            value: AtomicU64::new(0),
            name: name.into(),
            help: help.into(),
        }
    }

    /// Increment by 1
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment by delta
    pub fn inc_by(&self, delta: u64) {
        self.value.fetch_add(delta, Ordering::Relaxed);
    }

    /// Get current value
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }

    /// Format as Prometheus metric
    pub fn to_prometheus(&self) -> String {
        format!(
            "# HELP {} {}\n# TYPE {} counter\n{} {}\n",
            self.name, self.help, self.name, self.name, self.get()
        )
    }
}

/// Gauge metric (can go up or down)
pub struct Gauge {
    value: AtomicI64,
    name: String,
    help: String,
}

impl Gauge {
    pub fn new(name: &str, help: &str) -> Self {
        Self {
            value: AtomicI64::new(0),
            name: name.into(),
            help: help.into(),
        }
    }

    /// Set value
    pub fn set(&self, val: i64) {
        self.value.store(val, Ordering::Relaxed);
    }

    /// Increment by 1
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Decrement by 1
    pub fn dec(&self) {
        self.value.fetch_sub(1, Ordering::Relaxed);
    }

    /// Get current value
    pub fn get(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }

    /// Format as Prometheus metric
    pub fn to_prometheus(&self) -> String {
        format!(
            "# HELP {} {}\n# TYPE {} gauge\n{} {}\n",
            self.name, self.help, self.name, self.name, self.get()
        )
    }
}

/// Histogram for latency measurements
pub struct Histogram {
    buckets: Vec<(f64, AtomicU64)>,
    sum: AtomicU64,
    count: AtomicU64,
    name: String,
    help: String,
}

impl Histogram {
    /// Create with default buckets
    pub fn new(name: &str, help: &str) -> Self {
        Self::with_buckets(
            name,
            help,
            vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0],
        )
    }

    /// Create with custom buckets
    pub fn with_buckets(name: &str, help: &str, bounds: Vec<f64>) -> Self {
        let buckets = bounds.into_iter().map(|b| (b, AtomicU64::new(0))).collect();

        Self {
            buckets,
            sum: AtomicU64::new(0),
            count: AtomicU64::new(0),
            name: name.into(),
            help: help.into(),
        }
    }

    /// Observe a value in seconds
    pub fn observe(&self, value: f64) {
        self.count.fetch_add(1, Ordering::Relaxed);

        // Sum is stored as integer micros
        let micros = (value * 1_000_000.0) as u64;
        self.sum.fetch_add(micros, Ordering::Relaxed);

        for (bound, count) in &self.buckets {
            if value <= *bound {
                count.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Time a closure and record the duration
    pub fn time<F, R>(&self, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        let start = Instant::now();
        let result = f();
        self.observe(start.elapsed().as_secs_f64());
        result
    }

    /// Format as Prometheus metric
    pub fn to_prometheus(&self) -> String {
        let mut output = format!(
            "# HELP {} {}\n# TYPE {} histogram\n",
            self.name, self.help, self.name
        );

        for (bound, count) in &self.buckets {
            output.push_str(&format!(
                "{}_bucket{{le=\"{}\"}} {}\n",
                self.name,
                bound,
                count.load(Ordering::Relaxed)
            ));
        }

        let sum_secs = self.sum.load(Ordering::Relaxed) as f64 / 1_000_000.0;
        output.push_str(&format!("{}_sum {}\n", self.name, sum_secs));
        output.push_str(&format!(
            "{}_count {}\n",
            self.name,
            self.count.load(Ordering::Relaxed)
        ));

        output
    }
}

/// Standard coordination metrics
pub mod standard {
    use super::*;
    use std::sync::LazyLock;

    pub static CONNECTED_TASKS: LazyLock<Gauge> = LazyLock::new(|| {
        Gauge::new("rally_connected_tasks", "Number of connected tasks")
    });

    pub static HEARTBEATS_RECORDED: LazyLock<Counter> = LazyLock::new(|| {
        Counter::new("rally_heartbeats_total", "Total heartbeats recorded")
    });

    pub static BARRIERS_PASSED: LazyLock<Counter> = LazyLock::new(|| {
        Counter::new("rally_barriers_passed_total", "Barriers passed with OK")
    });

    pub static BARRIERS_FAILED: LazyLock<Counter> = LazyLock::new(|| {
        Counter::new(
            "rally_barriers_failed_total",
            "Barriers failed by timeout, cancellation, or task error",
        )
    });

    pub static ERRORS_PROPAGATED: LazyLock<Counter> = LazyLock::new(|| {
        Counter::new(
            "rally_errors_propagated_total",
            "Task errors propagated to peers",
        )
    });

    pub static BARRIER_WAIT_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
        Histogram::new("rally_barrier_wait_seconds", "Barrier wait latency")
    });
}

/// Gather all standard metrics in Prometheus text format
pub fn gather_system_metrics() -> String {
    let mut output = String::new();

    output.push_str(&standard::CONNECTED_TASKS.to_prometheus());
    output.push_str(&standard::HEARTBEATS_RECORDED.to_prometheus());
    output.push_str(&standard::BARRIERS_PASSED.to_prometheus());
    output.push_str(&standard::BARRIERS_FAILED.to_prometheus());
    output.push_str(&standard::ERRORS_PROPAGATED.to_prometheus());
    output.push_str(&standard::BARRIER_WAIT_DURATION.to_prometheus());

    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter() {
        let counter = Counter::new("test_counter", "Test counter");
        assert_eq!(counter.get(), 0);

        counter.inc();
        assert_eq!(counter.get(), 1);

        counter.inc_by(5);
        assert_eq!(counter.get(), 6);
    }

    #[test]
    fn test_gauge() {
        let gauge = Gauge::new("test_gauge", "Test gauge");
        gauge.set(4);
        gauge.inc();
        gauge.dec();
        gauge.dec();
        assert_eq!(gauge.get(), 3);
    }

    #[test]
    fn test_histogram() {
        let histogram = Histogram::new("test_histogram", "Test histogram");

        histogram.observe(0.002);
        histogram.observe(0.2);

        let prometheus = histogram.to_prometheus();
        assert!(prometheus.contains("test_histogram_count 2"));
    }
}
