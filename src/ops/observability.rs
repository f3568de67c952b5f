//! Metrics.
//!
//! Metric namespaces:
//! - tessera.xds.*
//! - tessera.reconcile.*
//! - tessera.revision.*
//! - tessera.snapshot.*
//! - tessera.cache_state.*

use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Metric names.
pub mod metrics {
    /// Open discovery streams.
    pub const XDS_STREAMS_ACTIVE: &str = "tessera.xds.streams_active";
    /// Discovery responses sent.
    pub const XDS_RESPONSES_TOTAL: &str = "tessera.xds.responses_total";
    /// Client rejections received.
    pub const XDS_NACKS_TOTAL: &str = "tessera.xds.nacks_total";
    /// Client acknowledgements received.
    pub const XDS_ACKS_TOTAL: &str = "tessera.xds.acks_total";
    /// Reconcile passes.
    pub const RECONCILE_TOTAL: &str = "tessera.reconcile.total";
    /// Reconcile passes ending in an error.
    pub const RECONCILE_ERRORS_TOTAL: &str = "tessera.reconcile.errors_total";
    /// Reconcile duration.
    pub const RECONCILE_DURATION_MS: &str = "tessera.reconcile.duration_ms";
    /// Revisions created.
    pub const REVISION_CREATED_TOTAL: &str = "tessera.revision.created_total";
    /// Revisions deleted by retention or owner removal.
    pub const REVISION_DELETED_TOTAL: &str = "tessera.revision.deleted_total";
    /// Revisions tainted.
    pub const REVISION_TAINTED_TOTAL: &str = "tessera.revision.tainted_total";
    /// Snapshot cache writes.
    pub const SNAPSHOT_WRITES_TOTAL: &str = "tessera.snapshot.writes_total";
    /// Requests served from a rollback revision.
    pub const CACHE_STATE_ROLLBACK: &str = "tessera.cache_state.rollback";
    /// Requests with no publishable revision.
    pub const CACHE_STATE_ROLLBACK_FAILED: &str = "tessera.cache_state.rollback_failed";
}

/// Metrics registry.
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    counters: RwLock<HashMap<String, AtomicU64>>,
    gauges: RwLock<HashMap<String, AtomicU64>>,
    /// Histogram observations (count, sum, min, max).
    histograms: RwLock<HashMap<String, Arc<HistogramData>>>,
}

impl MetricsRegistry {
    /// Create a new metrics registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment a counter.
    pub fn counter_inc(&self, name: &str) {
        self.counter_add(name, 1);
    }

    /// Add to a counter.
    pub fn counter_add(&self, name: &str, value: u64) {
        if let Some(counter) = self.counters.read().get(name) {
            counter.fetch_add(value, Ordering::Relaxed);
            return;
        }
        self.counters
            .write()
            .entry(name.to_string())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(value, Ordering::Relaxed);
    }

    /// Get counter value.
    pub fn counter_get(&self, name: &str) -> u64 {
        self.counters
            .read()
            .get(name)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Set a gauge value.
    pub fn gauge_set(&self, name: &str, value: u64) {
        if let Some(gauge) = self.gauges.read().get(name) {
            gauge.store(value, Ordering::Relaxed);
            return;
        }
        self.gauges
            .write()
            .entry(name.to_string())
            .or_insert_with(|| AtomicU64::new(0))
            .store(value, Ordering::Relaxed);
    }

    /// Get gauge value.
    pub fn gauge_get(&self, name: &str) -> u64 {
        self.gauges
            .read()
            .get(name)
            .map(|g| g.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Increment a gauge.
    pub fn gauge_inc(&self, name: &str) {
        if let Some(gauge) = self.gauges.read().get(name) {
            gauge.fetch_add(1, Ordering::Relaxed);
            return;
        }
        self.gauges
            .write()
            .entry(name.to_string())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Decrement a gauge, saturating at zero.
    pub fn gauge_dec(&self, name: &str) {
        if let Some(gauge) = self.gauges.read().get(name) {
            let _ = gauge.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                Some(v.saturating_sub(1))
            });
        }
    }

    /// Record a histogram observation.
    pub fn histogram_observe(&self, name: &str, value: f64) {
        let existing = self.histograms.read().get(name).cloned();
        let data = match existing {
            Some(data) => data,
            None => self
                .histograms
                .write()
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(HistogramData::new()))
                .clone(),
        };
        data.observe(value);
    }

    /// Get histogram data.
    pub fn histogram_get(&self, name: &str) -> Option<HistogramSnapshot> {
        self.histograms.read().get(name).map(|h| h.snapshot())
    }

    /// Export metrics in Prometheus text format, sorted by name.
    pub fn export_prometheus(&self) -> String {
        let mut output = String::new();

        let counters: BTreeMap<String, u64> = self
            .counters
            .read()
            .iter()
            .map(|(name, value)| (prometheus_name(name), value.load(Ordering::Relaxed)))
            .collect();
        for (name, value) in counters {
            output.push_str(&format!("# TYPE {} counter\n{} {}\n", name, name, value));
        }

        let gauges: BTreeMap<String, u64> = self
            .gauges
            .read()
            .iter()
            .map(|(name, value)| (prometheus_name(name), value.load(Ordering::Relaxed)))
            .collect();
        for (name, value) in gauges {
            output.push_str(&format!("# TYPE {} gauge\n{} {}\n", name, name, value));
        }

        let histograms: BTreeMap<String, HistogramSnapshot> = self
            .histograms
            .read()
            .iter()
            .map(|(name, data)| (prometheus_name(name), data.snapshot()))
            .collect();
        for (name, snapshot) in histograms {
            output.push_str(&format!(
                "# TYPE {} histogram\n{}_count {}\n{}_sum {}\n",
                name, name, snapshot.count, name, snapshot.sum
            ));
        }

        output
    }
}

fn prometheus_name(name: &str) -> String {
    name.replace('.', "_")
}

#[derive(Debug)]
struct HistogramData {
    count: AtomicU64,
    stats: Mutex<(f64, f64, f64)>,
}

impl HistogramData {
    fn new() -> Self {
        Self {
            count: AtomicU64::new(0),
            stats: Mutex::new((0.0, f64::MAX, f64::MIN)),
        }
    }

    fn observe(&self, value: f64) {
        self.count.fetch_add(1, Ordering::Relaxed);
        let mut stats = self.stats.lock();
        stats.0 += value;
        stats.1 = stats.1.min(value);
        stats.2 = stats.2.max(value);
    }

    fn snapshot(&self) -> HistogramSnapshot {
        let (sum, min, max) = *self.stats.lock();
        HistogramSnapshot {
            count: self.count.load(Ordering::Relaxed),
            sum,
            min,
            max,
        }
    }
}

/// Histogram snapshot.
#[derive(Debug, Clone)]
pub struct HistogramSnapshot {
    /// Number of observations.
    pub count: u64,
    /// Sum of all observations.
    pub sum: f64,
    /// Minimum value observed.
    pub min: f64,
    /// Maximum value observed.
    pub max: f64,
}

impl HistogramSnapshot {
    /// Calculate mean.
    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }
}

/// Control-plane metrics collector.
#[derive(Debug, Default)]
pub struct TesseraMetrics {
    registry: MetricsRegistry,
}

/// Shared metrics handle.
pub type SharedMetrics = Arc<TesseraMetrics>;

impl TesseraMetrics {
    /// Create a new metrics collector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a shared collector.
    pub fn shared() -> SharedMetrics {
        Arc::new(Self::new())
    }

    /// Get the underlying registry.
    pub fn registry(&self) -> &MetricsRegistry {
        &self.registry
    }

    // === Discovery ===

    pub fn stream_opened(&self) {
        self.registry.gauge_inc(metrics::XDS_STREAMS_ACTIVE);
    }

    pub fn stream_closed(&self) {
        self.registry.gauge_dec(metrics::XDS_STREAMS_ACTIVE);
    }

    /// Record a response for one type URL.
    pub fn record_response(&self, type_url: &str) {
        self.registry.counter_inc(metrics::XDS_RESPONSES_TOTAL);
        self.registry.counter_inc(&format!(
            "{}.{}",
            metrics::XDS_RESPONSES_TOTAL,
            short_type(type_url)
        ));
    }

    pub fn record_ack(&self) {
        self.registry.counter_inc(metrics::XDS_ACKS_TOTAL);
    }

    pub fn record_nack(&self) {
        self.registry.counter_inc(metrics::XDS_NACKS_TOTAL);
    }

    // === Reconcile ===

    /// Record a finished reconcile pass for a controller.
    pub fn record_reconcile(&self, controller: &str, duration_ms: f64, failed: bool) {
        self.registry.counter_inc(metrics::RECONCILE_TOTAL);
        self.registry
            .counter_inc(&format!("{}.{}", metrics::RECONCILE_TOTAL, controller));
        if failed {
            self.registry.counter_inc(metrics::RECONCILE_ERRORS_TOTAL);
            self.registry
                .counter_inc(&format!("{}.{}", metrics::RECONCILE_ERRORS_TOTAL, controller));
        }
        self.registry
            .histogram_observe(metrics::RECONCILE_DURATION_MS, duration_ms);
    }

    // === Revisions ===

    pub fn record_revision_created(&self) {
        self.registry.counter_inc(metrics::REVISION_CREATED_TOTAL);
    }

    pub fn record_revisions_deleted(&self, count: u64) {
        self.registry
            .counter_add(metrics::REVISION_DELETED_TOTAL, count);
    }

    /// Record a taint, keyed by reason.
    pub fn record_taint(&self, reason: &str) {
        self.registry.counter_inc(metrics::REVISION_TAINTED_TOTAL);
        self.registry
            .counter_inc(&format!("{}.{}", metrics::REVISION_TAINTED_TOTAL, reason));
    }

    // === Snapshot cache ===

    pub fn record_snapshot_write(&self) {
        self.registry.counter_inc(metrics::SNAPSHOT_WRITES_TOTAL);
    }

    /// Set the number of requests currently in each degraded cache state.
    pub fn set_cache_states(&self, rollback: u64, rollback_failed: u64) {
        self.registry
            .gauge_set(metrics::CACHE_STATE_ROLLBACK, rollback);
        self.registry
            .gauge_set(metrics::CACHE_STATE_ROLLBACK_FAILED, rollback_failed);
    }

    /// Export all metrics.
    pub fn export(&self) -> String {
        self.registry.export_prometheus()
    }

    /// Write the Prometheus export to `path`, replacing it atomically.
    pub async fn write_to(&self, path: &Path) -> std::io::Result<()> {
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, self.export()).await?;
        tokio::fs::rename(&tmp, path).await
    }
}

/// Last path segment of a type URL (`Cluster`, `Listener`, ...).
fn short_type(type_url: &str) -> &str {
    type_url.rsplit('.').next().unwrap_or(type_url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_and_gauges_by_name() {
        let registry = MetricsRegistry::new();

        registry.counter_inc(metrics::REVISION_CREATED_TOTAL);
        registry.counter_add(metrics::REVISION_CREATED_TOTAL, 2);
        assert_eq!(registry.counter_get(metrics::REVISION_CREATED_TOTAL), 3);
        assert_eq!(registry.counter_get(metrics::REVISION_DELETED_TOTAL), 0);

        // Gauges saturate at zero.
        registry.gauge_inc(metrics::CACHE_STATE_ROLLBACK);
        registry.gauge_dec(metrics::CACHE_STATE_ROLLBACK);
        registry.gauge_dec(metrics::CACHE_STATE_ROLLBACK);
        assert_eq!(registry.gauge_get(metrics::CACHE_STATE_ROLLBACK), 0);
    }

    #[test]
    fn reconcile_durations_are_summarized() {
        let registry = MetricsRegistry::new();
        for ms in [5.0, 1.0, 9.0] {
            registry.histogram_observe(metrics::RECONCILE_DURATION_MS, ms);
        }

        let summary = registry
            .histogram_get(metrics::RECONCILE_DURATION_MS)
            .unwrap();
        assert_eq!(summary.count, 3);
        assert_eq!((summary.min, summary.max), (1.0, 9.0));
        assert_eq!(summary.mean(), 5.0);
        assert!(registry.histogram_get("tessera.unknown").is_none());
    }

    #[test]
    fn test_tessera_metrics_xds() {
        let metrics = TesseraMetrics::new();

        metrics.stream_opened();
        metrics.stream_opened();
        metrics.stream_closed();
        metrics.record_response("type.googleapis.com/envoy.config.cluster.v3.Cluster");
        metrics.record_nack();

        let registry = metrics.registry();
        assert_eq!(registry.gauge_get(metrics::XDS_STREAMS_ACTIVE), 1);
        assert_eq!(registry.counter_get(metrics::XDS_RESPONSES_TOTAL), 1);
        assert_eq!(
            registry.counter_get("tessera.xds.responses_total.Cluster"),
            1
        );
        assert_eq!(registry.counter_get(metrics::XDS_NACKS_TOTAL), 1);
    }

    #[test]
    fn test_tessera_metrics_reconcile() {
        let metrics = TesseraMetrics::new();

        metrics.record_reconcile("request", 2.0, false);
        metrics.record_reconcile("request", 4.0, true);

        let registry = metrics.registry();
        assert_eq!(registry.counter_get(metrics::RECONCILE_TOTAL), 2);
        assert_eq!(registry.counter_get("tessera.reconcile.errors_total.request"), 1);
        assert_eq!(
            registry
                .histogram_get(metrics::RECONCILE_DURATION_MS)
                .unwrap()
                .mean(),
            3.0
        );
    }

    #[test]
    fn export_uses_prometheus_names() {
        let metrics = TesseraMetrics::new();
        metrics.record_nack();
        metrics.registry().gauge_set(metrics::XDS_STREAMS_ACTIVE, 3);

        let output = metrics.export();
        assert!(output.contains("tessera_xds_nacks_total 1"));
        assert!(output.contains("tessera_xds_streams_active 3"));
    }

    #[tokio::test]
    async fn test_write_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.prom");
        let metrics = TesseraMetrics::new();
        metrics.record_snapshot_write();

        metrics.write_to(&path).await.unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("tessera_snapshot_writes_total 1"));
    }
}
