//! Metrics collection and export for connection pools

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Point-in-time metrics of a pool
///
/// # Examples
///
/// ```
/// use esox_connectionpool::PoolMetrics;
///
/// let metrics = PoolMetrics { active: 3, maximum_pool_size: 4, ..Default::default() };
/// let exported = metrics.export();
/// assert_eq!(exported["active"], "3");
/// assert_eq!(exported["utilization"], "0.75");
/// ```
#[derive(Debug, Clone, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct PoolMetrics {
    /// Resources currently checked out
    pub active: usize,

    /// Resources idle in the pool
    pub idle: usize,

    /// All resources, idle, in use or reserved
    pub total: usize,

    /// Threads waiting in `acquire`
    pub waiting: usize,

    /// Configured maximum pool size
    pub maximum_pool_size: usize,

    /// Configured minimum idle count
    pub minimum_idle: usize,

    /// Successful acquisitions
    pub total_acquired: u64,

    /// Handles returned to the pool
    pub total_returned: u64,

    /// Resources created
    pub total_created: u64,

    /// Resources closed
    pub total_destroyed: u64,

    /// Failed attempts to create a resource
    pub creation_failures: u64,

    /// Acquisitions that timed out
    pub acquire_timeouts: u64,

    /// Leak reports raised
    pub leaks_detected: u64,

    /// Mean time spent in a successful `acquire`, in microseconds
    pub mean_acquire_micros: u64,

    /// Longest successful `acquire`, in microseconds
    pub max_acquire_micros: u64,
}

impl PoolMetrics {
    /// Fraction of the maximum pool size currently checked out
    pub fn utilization(&self) -> f64 {
        if self.maximum_pool_size > 0 {
            self.active as f64 / self.maximum_pool_size as f64
        } else {
            0.0
        }
    }

    /// Export metrics as a HashMap
    pub fn export(&self) -> HashMap<String, String> {
        let mut metrics = HashMap::new();
        metrics.insert("active".to_string(), self.active.to_string());
        metrics.insert("idle".to_string(), self.idle.to_string());
        metrics.insert("total".to_string(), self.total.to_string());
        metrics.insert("waiting".to_string(), self.waiting.to_string());
        metrics.insert("maximum_pool_size".to_string(), self.maximum_pool_size.to_string());
        metrics.insert("minimum_idle".to_string(), self.minimum_idle.to_string());
        metrics.insert("total_acquired".to_string(), self.total_acquired.to_string());
        metrics.insert("total_returned".to_string(), self.total_returned.to_string());
        metrics.insert("total_created".to_string(), self.total_created.to_string());
        metrics.insert("total_destroyed".to_string(), self.total_destroyed.to_string());
        metrics.insert("creation_failures".to_string(), self.creation_failures.to_string());
        metrics.insert("acquire_timeouts".to_string(), self.acquire_timeouts.to_string());
        metrics.insert("leaks_detected".to_string(), self.leaks_detected.to_string());
        metrics.insert("mean_acquire_micros".to_string(), self.mean_acquire_micros.to_string());
        metrics.insert("max_acquire_micros".to_string(), self.max_acquire_micros.to_string());
        metrics.insert("utilization".to_string(), format!("{:.2}", self.utilization()));
        metrics
    }
}

/// Metrics exporter for Prometheus format
pub struct MetricsExporter;

impl MetricsExporter {
    /// Export metrics in Prometheus exposition format
    ///
    /// # Examples
    ///
    /// ```
    /// use esox_connectionpool::{MetricsExporter, PoolMetrics};
    /// use std::collections::HashMap;
    ///
    /// let mut tags = HashMap::new();
    /// tags.insert("service".to_string(), "api".to_string());
    ///
    /// let output = MetricsExporter::export_prometheus(&PoolMetrics::default(), "orders", Some(&tags));
    /// assert!(output.contains("connpool_connections_active"));
    /// assert!(output.contains("service=\"api\""));
    /// ```
    pub fn export_prometheus(
        metrics: &PoolMetrics,
        pool_name: &str,
        tags: Option<&HashMap<String, String>>,
    ) -> String {
        let mut output = String::new();
        let labels = Self::format_labels(pool_name, tags);

        let gauges: [(&str, &str, String); 5] = [
            ("connpool_connections_active", "Resources currently checked out", metrics.active.to_string()),
            ("connpool_connections_idle", "Resources idle in the pool", metrics.idle.to_string()),
            ("connpool_connections_total", "All resources held by the pool", metrics.total.to_string()),
            ("connpool_connections_pending", "Threads waiting for a resource", metrics.waiting.to_string()),
            ("connpool_utilization", "Pool utilization ratio", format!("{:.2}", metrics.utilization())),
        ];
        for (name, help, value) in gauges {
            output.push_str(&format!("# HELP {name} {help}\n"));
            output.push_str(&format!("# TYPE {name} gauge\n"));
            output.push_str(&format!("{name}{{{labels}}} {value}\n"));
        }

        let counters: [(&str, &str, u64); 7] = [
            ("connpool_acquired_total", "Successful acquisitions", metrics.total_acquired),
            ("connpool_returned_total", "Handles returned to the pool", metrics.total_returned),
            ("connpool_created_total", "Resources created", metrics.total_created),
            ("connpool_destroyed_total", "Resources closed", metrics.total_destroyed),
            ("connpool_creation_failures_total", "Failed resource creations", metrics.creation_failures),
            ("connpool_timeouts_total", "Acquisitions that timed out", metrics.acquire_timeouts),
            ("connpool_leaks_total", "Leak reports raised", metrics.leaks_detected),
        ];
        for (name, help, value) in counters {
            output.push_str(&format!("# HELP {name} {help}\n"));
            output.push_str(&format!("# TYPE {name} counter\n"));
            output.push_str(&format!("{name}{{{labels}}} {value}\n"));
        }

        output
    }

    fn format_labels(pool_name: &str, tags: Option<&HashMap<String, String>>) -> String {
        let mut labels = vec![format!("pool=\"{}\"", pool_name)];

        if let Some(tags) = tags {
            let mut sorted: Vec<_> = tags.iter().collect();
            sorted.sort();
            for (key, value) in sorted {
                labels.push(format!("{}=\"{}\"", key, value));
            }
        }

        labels.join(",")
    }
}

/// Internal metrics tracker
#[derive(Default)]
pub(crate) struct MetricsTracker {
    acquired: AtomicU64,
    returned: AtomicU64,
    created: AtomicU64,
    destroyed: AtomicU64,
    creation_failures: AtomicU64,
    timeouts: AtomicU64,
    leaks: AtomicU64,
    acquire_nanos_total: AtomicU64,
    acquire_nanos_max: AtomicU64,
}

impl MetricsTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_acquire(&self, elapsed: Duration) {
        let nanos = u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX);
        self.acquired.fetch_add(1, Ordering::Relaxed);
        self.acquire_nanos_total.fetch_add(nanos, Ordering::Relaxed);
        self.acquire_nanos_max.fetch_max(nanos, Ordering::Relaxed);
    }

    pub fn record_return(&self) {
        self.returned.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_created(&self) {
        self.created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_destroyed(&self) {
        self.destroyed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_creation_failure(&self) {
        self.creation_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_leak(&self) {
        self.leaks.fetch_add(1, Ordering::Relaxed);
    }

    #[cfg(test)]
    pub fn leaks(&self) -> u64 {
        self.leaks.load(Ordering::Relaxed)
    }

    /// Fill the counter half of a snapshot; gauges come from the bag.
    pub fn snapshot(&self, mut metrics: PoolMetrics) -> PoolMetrics {
        let acquired = self.acquired.load(Ordering::Relaxed);
        metrics.total_acquired = acquired;
        metrics.total_returned = self.returned.load(Ordering::Relaxed);
        metrics.total_created = self.created.load(Ordering::Relaxed);
        metrics.total_destroyed = self.destroyed.load(Ordering::Relaxed);
        metrics.creation_failures = self.creation_failures.load(Ordering::Relaxed);
        metrics.acquire_timeouts = self.timeouts.load(Ordering::Relaxed);
        metrics.leaks_detected = self.leaks.load(Ordering::Relaxed);
        metrics.mean_acquire_micros = if acquired > 0 {
            self.acquire_nanos_total.load(Ordering::Relaxed) / acquired / 1_000
        } else {
            0
        };
        metrics.max_acquire_micros = self.acquire_nanos_max.load(Ordering::Relaxed) / 1_000;
        metrics
    }
}

#[cfg(feature = "prometheus")]
pub use collector::PoolCollector;

#[cfg(feature = "prometheus")]
mod collector {
    use prometheus::core::{Collector, Desc};
    use prometheus::proto::MetricFamily;
    use prometheus::{IntCounter, IntGauge, Opts};

    use super::PoolMetrics;

    type Source = Box<dyn Fn() -> Option<PoolMetrics> + Send + Sync>;

    /// Registers a pool's metrics with a Prometheus registry.
    ///
    /// Values are read from the pool at scrape time. Once the pool is
    /// dropped the collector reports the last values it saw.
    pub struct PoolCollector {
        source: Source,
        gauges: Vec<IntGauge>,
        counters: Vec<IntCounter>,
    }

    const GAUGES: [(&str, &str); 4] = [
        ("connpool_connections_active", "Resources currently checked out"),
        ("connpool_connections_idle", "Resources idle in the pool"),
        ("connpool_connections_total", "All resources held by the pool"),
        ("connpool_connections_pending", "Threads waiting for a resource"),
    ];

    const COUNTERS: [(&str, &str); 7] = [
        ("connpool_acquired_total", "Successful acquisitions"),
        ("connpool_returned_total", "Handles returned to the pool"),
        ("connpool_created_total", "Resources created"),
        ("connpool_destroyed_total", "Resources closed"),
        ("connpool_creation_failures_total", "Failed resource creations"),
        ("connpool_timeouts_total", "Acquisitions that timed out"),
        ("connpool_leaks_total", "Leak reports raised"),
    ];

    impl PoolCollector {
        pub(crate) fn new(pool_name: &str, source: Source) -> prometheus::Result<Self> {
            let gauges = GAUGES
                .iter()
                .map(|(name, help)| IntGauge::with_opts(Opts::new(*name, *help).const_label("pool", pool_name)))
                .collect::<prometheus::Result<Vec<_>>>()?;
            let counters = COUNTERS
                .iter()
                .map(|(name, help)| IntCounter::with_opts(Opts::new(*name, *help).const_label("pool", pool_name)))
                .collect::<prometheus::Result<Vec<_>>>()?;
            Ok(Self { source, gauges, counters })
        }

        fn refresh(&self) {
            let Some(metrics) = (self.source)() else {
                return;
            };
            let gauge_values = [metrics.active, metrics.idle, metrics.total, metrics.waiting];
            for (gauge, value) in self.gauges.iter().zip(gauge_values) {
                gauge.set(i64::try_from(value).unwrap_or(i64::MAX));
            }
            let counter_values = [
                metrics.total_acquired,
                metrics.total_returned,
                metrics.total_created,
                metrics.total_destroyed,
                metrics.creation_failures,
                metrics.acquire_timeouts,
                metrics.leaks_detected,
            ];
            for (counter, value) in self.counters.iter().zip(counter_values) {
                counter.inc_by(value.saturating_sub(counter.get()));
            }
        }
    }

    impl Collector for PoolCollector {
        fn desc(&self) -> Vec<&Desc> {
            self.gauges
                .iter()
                .flat_map(|gauge| gauge.desc())
                .chain(self.counters.iter().flat_map(|counter| counter.desc()))
                .collect()
        }

        fn collect(&self) -> Vec<MetricFamily> {
            self.refresh();
            self.gauges
                .iter()
                .flat_map(|gauge| gauge.collect())
                .chain(self.counters.iter().flat_map(|counter| counter.collect()))
                .collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_computes_acquire_latency() {
        let tracker = MetricsTracker::new();
        tracker.record_acquire(Duration::from_micros(100));
        tracker.record_acquire(Duration::from_micros(300));
        tracker.record_timeout();

        let metrics = tracker.snapshot(PoolMetrics::default());
        assert_eq!(metrics.total_acquired, 2);
        assert_eq!(metrics.mean_acquire_micros, 200);
        assert_eq!(metrics.max_acquire_micros, 300);
        assert_eq!(metrics.acquire_timeouts, 1);
    }

    #[test]
    fn prometheus_labels_are_sorted() {
        let mut tags = HashMap::new();
        tags.insert("zone".to_string(), "b".to_string());
        tags.insert("app".to_string(), "a".to_string());
        let output = MetricsExporter::export_prometheus(&PoolMetrics::default(), "p", Some(&tags));
        assert!(output.contains("connpool_connections_idle{pool=\"p\",app=\"a\",zone=\"b\"} 0"));
    }
}
