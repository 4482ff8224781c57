//! In-process metrics for the coordinator
//!
//! Counters, gauges and histograms keyed by dotted names, exported as JSON
//! or Prometheus text at `/metrics`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;

/// Metrics shared by the coordinator components and the HTTP layer
pub struct MetricsRegistry {
    counters: RwLock<HashMap<String, Arc<AtomicU64>>>,
    gauges: RwLock<HashMap<String, Arc<AtomicU64>>>,
    histograms: RwLock<HashMap<String, Arc<Histogram>>>,
    start_time: Instant,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            counters: RwLock::new(HashMap::new()),
            gauges: RwLock::new(HashMap::new()),
            histograms: RwLock::new(HashMap::new()),
            start_time: Instant::now(),
        }
    }

    /// Increment a counter
    pub async fn inc_counter(&self, name: &str) {
        self.add_counter(name, 1).await;
    }

    /// Add to a counter
    pub async fn add_counter(&self, name: &str, value: u64) {
        let counters = self.counters.read().await;
        if let Some(counter) = counters.get(name) {
            counter.fetch_add(value, Ordering::Relaxed);
            return;
        }
        drop(counters);

        let mut counters = self.counters.write().await;
        let counter = counters
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(AtomicU64::new(0)));
        counter.fetch_add(value, Ordering::Relaxed);
    }

    /// Set a gauge value
    pub async fn set_gauge(&self, name: &str, value: u64) {
        let gauges = self.gauges.read().await;
        if let Some(gauge) = gauges.get(name) {
            gauge.store(value, Ordering::Relaxed);
            return;
        }
        drop(gauges);

        let mut gauges = self.gauges.write().await;
        gauges.insert(name.to_string(), Arc::new(AtomicU64::new(value)));
    }

    /// Get a counter value
    pub async fn get_counter(&self, name: &str) -> u64 {
        let counters = self.counters.read().await;
        counters
            .get(name)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Get a gauge value
    pub async fn get_gauge(&self, name: &str) -> u64 {
        let gauges = self.gauges.read().await;
        gauges
            .get(name)
            .map(|g| g.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Record a histogram observation
    pub async fn observe_histogram(&self, name: &str, value: f64) {
        let histograms = self.histograms.read().await;
        if let Some(histogram) = histograms.get(name) {
            histogram.observe(value);
            return;
        }
        drop(histograms);

        let mut histograms = self.histograms.write().await;
        let histogram = histograms
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Histogram::default()));
        histogram.observe(value);
    }

    /// Get uptime in seconds
    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Get all metrics as JSON
    pub async fn to_json(&self) -> serde_json::Value {
        let counters = self.counters.read().await;
        let gauges = self.gauges.read().await;
        let histograms = self.histograms.read().await;

        let counter_values: HashMap<String, u64> = counters
            .iter()
            .map(|(k, v)| (k.clone(), v.load(Ordering::Relaxed)))
            .collect();

        let gauge_values: HashMap<String, u64> = gauges
            .iter()
            .map(|(k, v)| (k.clone(), v.load(Ordering::Relaxed)))
            .collect();

        let mut histogram_values: HashMap<String, serde_json::Value> = HashMap::new();
        for (name, histogram) in histograms.iter() {
            histogram_values.insert(name.clone(), histogram.to_json());
        }

        serde_json::json!({
            "uptime_seconds": self.uptime_seconds(),
            "counters": counter_values,
            "gauges": gauge_values,
            "histograms": histogram_values,
        })
    }

    /// Export metrics in Prometheus format
    pub async fn to_prometheus(&self) -> String {
        let counters = self.counters.read().await;
        let gauges = self.gauges.read().await;
        let histograms = self.histograms.read().await;

        let mut output = String::new();

        output.push_str("# HELP tracerx_uptime_seconds Time since service start\n");
        output.push_str("# TYPE tracerx_uptime_seconds gauge\n");
        output.push_str(&format!(
            "tracerx_uptime_seconds {}\n\n",
            self.uptime_seconds()
        ));

        let mut counters: Vec<_> = counters.iter().collect();
        counters.sort_by(|a, b| a.0.cmp(b.0));
        for (name, counter) in counters {
            let prometheus_name = name.replace(['.', '-'], "_");
            output.push_str(&format!("# TYPE {} counter\n", prometheus_name));
            output.push_str(&format!(
                "{} {}\n",
                prometheus_name,
                counter.load(Ordering::Relaxed)
            ));
        }

        let mut gauges: Vec<_> = gauges.iter().collect();
        gauges.sort_by(|a, b| a.0.cmp(b.0));
        for (name, gauge) in gauges {
            let prometheus_name = name.replace(['.', '-'], "_");
            output.push_str(&format!("# TYPE {} gauge\n", prometheus_name));
            output.push_str(&format!(
                "{} {}\n",
                prometheus_name,
                gauge.load(Ordering::Relaxed)
            ));
        }

        for (name, histogram) in histograms.iter() {
            output.push_str(&histogram.to_prometheus(name));
        }

        output
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Fixed-bucket histogram. The sum is kept in milliseconds.
pub struct Histogram {
    buckets: Vec<f64>,
    counts: Vec<AtomicU64>,
    sum: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    pub fn new(buckets: Vec<f64>) -> Self {
        let counts = buckets.iter().map(|_| AtomicU64::new(0)).collect();
        Self {
            buckets,
            counts,
            sum: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    pub fn observe(&self, value: f64) {
        self.sum
            .fetch_add((value * 1000.0) as u64, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);

        if let Some(i) = self.buckets.iter().position(|bucket| value <= *bucket) {
            self.counts[i].fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        let bucket_counts: Vec<u64> = self
            .counts
            .iter()
            .map(|c| c.load(Ordering::Relaxed))
            .collect();

        serde_json::json!({
            "buckets": self.buckets,
            "counts": bucket_counts,
            "sum": self.sum.load(Ordering::Relaxed) as f64 / 1000.0,
            "count": self.count.load(Ordering::Relaxed),
        })
    }

    pub fn to_prometheus(&self, name: &str) -> String {
        let prometheus_name = name.replace(['.', '-'], "_");
        let mut output = String::new();

        output.push_str(&format!("# TYPE {} histogram\n", prometheus_name));

        let mut cumulative = 0u64;
        for (bucket, count) in self.buckets.iter().zip(&self.counts) {
            cumulative += count.load(Ordering::Relaxed);
            output.push_str(&format!(
                "{}_bucket{{le=\"{}\"}} {}\n",
                prometheus_name, bucket, cumulative
            ));
        }

        output.push_str(&format!(
            "{}_bucket{{le=\"+Inf\"}} {}\n",
            prometheus_name,
            self.count.load(Ordering::Relaxed)
        ));
        output.push_str(&format!(
            "{}_sum {}\n",
            prometheus_name,
            self.sum.load(Ordering::Relaxed) as f64 / 1000.0
        ));
        output.push_str(&format!(
            "{}_count {}\n",
            prometheus_name,
            self.count.load(Ordering::Relaxed)
        ));

        output
    }
}

impl Default for Histogram {
    fn default() -> Self {
        // Default buckets for latency in seconds
        Self::new(vec![
            0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
        ])
    }
}

/// Metric names
pub mod metric_names {
    // Uploads
    pub const UPLOADS_ACCEPTED: &str = "tracerx.uploads.accepted";
    pub const UPLOADS_REPLAYED: &str = "tracerx.uploads.replayed";
    pub const UPLOADS_UNAUTHORIZED: &str = "tracerx.uploads.unauthorized";
    pub const UPLOADS_AUDIT_PENDING: &str = "tracerx.uploads.audit_pending";
    pub const UPLOAD_LATENCY: &str = "tracerx.uploads.latency_seconds";

    // Registry
    pub const REGISTRY_MUTATIONS: &str = "tracerx.registry.mutations";
    pub const REGISTRY_READ_FAILURES: &str = "tracerx.registry.read_failures";
    pub const MANUFACTURER_EVENTS_RESTORED: &str = "tracerx.registry.events_restored";

    // Tokens
    pub const TOKENS_MINTED: &str = "tracerx.tokens.minted";
    pub const TOKENS_REUSED: &str = "tracerx.tokens.reused";

    // Audit log
    pub const AUDIT_ATTEMPTS: &str = "tracerx.audit.attempts";
    pub const AUDIT_ACKNOWLEDGED: &str = "tracerx.audit.acknowledged";
    pub const AUDIT_DEDUPLICATED: &str = "tracerx.audit.deduplicated";
    pub const AUDIT_FAILURES: &str = "tracerx.audit.failures";
    pub const AUDIT_EXHAUSTED: &str = "tracerx.audit.exhausted";
    pub const AUDIT_SUBMIT_LATENCY: &str = "tracerx.audit.submit_latency_seconds";

    // Reconciliation
    pub const RECONCILE_PASSES: &str = "tracerx.reconcile.passes";
    pub const RECONCILE_RESOLVED: &str = "tracerx.reconcile.resolved";
    pub const RECONCILE_PROMOTED: &str = "tracerx.reconcile.promoted";
    pub const RECONCILE_UNRESOLVED: &str = "tracerx.reconcile.unresolved";

    // Errors
    pub const VALIDATION_ERRORS: &str = "tracerx.errors.validation";
    pub const STORE_ERRORS: &str = "tracerx.errors.store";
}

/// Time an async operation into a histogram.
pub async fn timed<F, T>(metrics: &MetricsRegistry, metric_name: &str, f: F) -> T
where
    F: std::future::Future<Output = T>,
{
    let start = Instant::now();
    let result = f.await;
    let duration = start.elapsed().as_secs_f64();
    metrics.observe_histogram(metric_name, duration).await;
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_counter() {
        let registry = MetricsRegistry::new();

        registry.inc_counter("test.counter").await;
        registry.inc_counter("test.counter").await;
        registry.add_counter("test.counter", 5).await;

        assert_eq!(registry.get_counter("test.counter").await, 7);
    }

    #[tokio::test]
    async fn test_gauge() {
        let registry = MetricsRegistry::new();

        registry.set_gauge("test.gauge", 100).await;
        assert_eq!(registry.get_gauge("test.gauge").await, 100);

        registry.set_gauge("test.gauge", 50).await;
        assert_eq!(registry.get_gauge("test.gauge").await, 50);
    }

    #[tokio::test]
    async fn test_histogram() {
        let registry = MetricsRegistry::new();

        registry.observe_histogram("test.latency", 0.005).await;
        registry.observe_histogram("test.latency", 0.05).await;
        registry.observe_histogram("test.latency", 0.5).await;

        let json = registry.to_json().await;
        let histograms = json.get("histograms").unwrap();
        let latency = histograms.get("test.latency").unwrap();

        assert_eq!(latency.get("count").unwrap().as_u64().unwrap(), 3);
    }

    #[tokio::test]
    async fn test_prometheus_format() {
        let registry = MetricsRegistry::new();

        registry.inc_counter("test_counter").await;
        registry.set_gauge("test_gauge", 42).await;

        let prometheus = registry.to_prometheus().await;
        assert!(prometheus.contains("test_counter 1"));
        assert!(prometheus.contains("test_gauge 42"));
        assert!(prometheus.contains("tracerx_uptime_seconds"));
    }

    #[tokio::test]
    async fn test_dotted_names_exported() {
        let registry = MetricsRegistry::new();
        registry
            .inc_counter(metric_names::AUDIT_ACKNOWLEDGED)
            .await;
        let value = timed(&registry, metric_names::AUDIT_SUBMIT_LATENCY, async { 7 }).await;
        assert_eq!(value, 7);

        let prometheus = registry.to_prometheus().await;
        assert!(prometheus.contains("tracerx_audit_acknowledged 1"));
        assert!(prometheus.contains("tracerx_audit_submit_latency_seconds_count 1"));
    }
}
