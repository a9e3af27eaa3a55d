//! Process-wide metrics handle.
//!
//! Every counter and gauge the service emits lives here, registered against
//! one prometheus `Registry`. The struct is created once at the process root
//! and passed down as an `Arc` handle; the exposition endpoint is provided by
//! an external exporter reading `registry`.

use prometheus::{CounterVec, Gauge, IntCounter, IntCounterVec, IntGauge, Opts, Registry};
use std::sync::Arc;

pub struct MediaMetrics {
    /// Number of registered ingestion pipelines.
    pub pipelines_active: IntGauge,

    /// Pipeline stalls detected by the monitor loop.
    pub stalls_total: IntCounter,

    /// Reconnections triggered by the monitor loop.
    pub reconnects_total: IntCounter,

    /// Sum of fps across pipelines currently RUNNING.
    pub ingest_fps_aggregate: Gauge,

    /// Active unicast egress branches.
    pub egress_active: IntGauge,

    /// Errors by type (`gst`, `rate_limit`, `cap`).
    pub errors_total: IntCounterVec,

    /// Active live-playlist recording sessions.
    pub hls_sessions_active: IntGauge,

    /// Bytes reclaimed by the retention enforcer.
    pub cleanup_bytes_reclaimed_total: CounterVec,

    /// Individual deletions that failed during a retention pass.
    pub cleanup_failures_total: IntCounter,

    pub registry: Arc<Registry>,
}

impl MediaMetrics {
    pub fn new(registry: Registry) -> Result<Self, prometheus::Error> {
        let pipelines_active = IntGauge::new(
            "media_pipelines_active",
            "Number of active ingestion pipelines",
        )?;

        let stalls_total = IntCounter::new(
            "media_pipeline_stalls_total",
            "Total number of pipeline stalls detected",
        )?;

        let reconnects_total = IntCounter::new(
            "media_pipeline_reconnects_total",
            "Total number of pipeline reconnections triggered",
        )?;

        let ingest_fps_aggregate = Gauge::new(
            "media_ingest_fps_aggregate",
            "Aggregate FPS across all RUNNING pipelines",
        )?;

        let egress_active = IntGauge::new(
            "media_egress_active",
            "Number of active RTP egress branches",
        )?;

        let errors_total = IntCounterVec::new(
            Opts::new("media_errors_total", "Total number of errors by type"),
            &["type"],
        )?;

        let hls_sessions_active = IntGauge::new(
            "hls_sessions_active",
            "Number of active HLS recording sessions",
        )?;

        let cleanup_bytes_reclaimed_total = CounterVec::new(
            Opts::new(
                "hls_disk_cleanup_bytes_reclaimed_total",
                "Total bytes reclaimed by disk cleanup",
            ),
            &["reason"],
        )?;

        let cleanup_failures_total = IntCounter::new(
            "hls_disk_cleanup_failures_total",
            "Total number of disk cleanup failures",
        )?;

        registry.register(Box::new(pipelines_active.clone()))?;
        registry.register(Box::new(stalls_total.clone()))?;
        registry.register(Box::new(reconnects_total.clone()))?;
        registry.register(Box::new(ingest_fps_aggregate.clone()))?;
        registry.register(Box::new(egress_active.clone()))?;
        registry.register(Box::new(errors_total.clone()))?;
        registry.register(Box::new(hls_sessions_active.clone()))?;
        registry.register(Box::new(cleanup_bytes_reclaimed_total.clone()))?;
        registry.register(Box::new(cleanup_failures_total.clone()))?;

        Ok(Self {
            pipelines_active,
            stalls_total,
            reconnects_total,
            ingest_fps_aggregate,
            egress_active,
            errors_total,
            hls_sessions_active,
            cleanup_bytes_reclaimed_total,
            cleanup_failures_total,
            registry: Arc::new(registry),
        })
    }

    pub fn with_default_registry() -> Result<Self, prometheus::Error> {
        Self::new(Registry::new())
    }

    pub fn record_error(&self, error_type: &str) {
        self.errors_total.with_label_values(&[error_type]).inc();
    }

    pub fn record_bytes_reclaimed(&self, reason: &str, bytes: u64) {
        self.cleanup_bytes_reclaimed_total
            .with_label_values(&[reason])
            .inc_by(bytes as f64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = MediaMetrics::with_default_registry();
        assert!(metrics.is_ok());
    }

    #[test]
    fn test_error_counter_by_type() {
        let metrics = MediaMetrics::with_default_registry().unwrap();

        metrics.record_error("rate_limit");
        metrics.record_error("rate_limit");
        metrics.record_error("cap");

        let rate = metrics.errors_total.with_label_values(&["rate_limit"]);
        assert_eq!(rate.get(), 2);
        let cap = metrics.errors_total.with_label_values(&["cap"]);
        assert_eq!(cap.get(), 1);
    }

    #[test]
    fn test_bytes_reclaimed_accumulates() {
        let metrics = MediaMetrics::with_default_registry().unwrap();

        metrics.record_bytes_reclaimed("age", 1024);
        metrics.record_bytes_reclaimed("quota", 2048);

        let age = metrics
            .cleanup_bytes_reclaimed_total
            .with_label_values(&["age"]);
        assert_eq!(age.get() as u64, 1024);
    }

    #[test]
    fn test_gauge_movement() {
        let metrics = MediaMetrics::with_default_registry().unwrap();

        metrics.pipelines_active.inc();
        metrics.pipelines_active.inc();
        assert_eq!(metrics.pipelines_active.get(), 2);

        metrics.pipelines_active.dec();
        assert_eq!(metrics.pipelines_active.get(), 1);
    }
}
