//! Per-pipeline counters.
//!
//! All fields are atomics so the graph callback threads update them without
//! taking the locks the observers take. Fps is stored in millihertz to stay
//! in integer atomics.

use serde::Serialize;
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

pub struct PipelineStats {
    /// Frames delivered to the probe branch.
    pub frames_processed: AtomicU64,

    /// Monotonic ingested byte count. Consumers derive bitrate from this
    /// with a rate() over scrapes; no instantaneous rate is kept here.
    pub bytes_in_total: AtomicU64,

    /// Approximate ingest latency: graph running time minus the newest
    /// unit's presentation timestamp, clamped to zero.
    pub ingest_latency_ms: AtomicI64,

    /// Times the supervisor replaced this camera's graph.
    pub restarts_total: AtomicU32,

    /// Wall clock of the newest frame, unix milliseconds.
    pub last_frame_unix_ms: AtomicU64,

    /// Current frames per second, millihertz.
    fps_millihz: AtomicU64,
}

impl PipelineStats {
    pub fn new() -> Self {
        Self {
            frames_processed: AtomicU64::new(0),
            bytes_in_total: AtomicU64::new(0),
            ingest_latency_ms: AtomicI64::new(0),
            restarts_total: AtomicU32::new(0),
            last_frame_unix_ms: AtomicU64::new(0),
            fps_millihz: AtomicU64::new(0),
        }
    }

    /// Record one unit delivered by the probe branch.
    pub fn record_frame(&self, size: usize) {
        let unix_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        self.frames_processed.fetch_add(1, Ordering::Relaxed);
        self.bytes_in_total
            .fetch_add(size as u64, Ordering::Relaxed);
        self.last_frame_unix_ms.store(unix_ms, Ordering::Relaxed);
    }

    pub fn set_latency_ms(&self, latency_ms: i64) {
        self.ingest_latency_ms
            .store(latency_ms.max(0), Ordering::Relaxed);
    }

    pub fn set_fps(&self, fps: f64) {
        self.fps_millihz
            .store((fps * 1000.0).max(0.0) as u64, Ordering::Relaxed);
    }

    pub fn fps(&self) -> f64 {
        self.fps_millihz.load(Ordering::Relaxed) as f64 / 1000.0
    }

    /// Read-only copy for the status record.
    pub fn snapshot(&self) -> PipelineMetrics {
        PipelineMetrics {
            ingest_latency_ms: self.ingest_latency_ms.load(Ordering::Relaxed),
            frames_processed: self.frames_processed.load(Ordering::Relaxed),
            bytes_in_total: self.bytes_in_total.load(Ordering::Relaxed),
            pipeline_restarts_total: self.restarts_total.load(Ordering::Relaxed),
            last_frame_ts_ms: self.last_frame_unix_ms.load(Ordering::Relaxed),
            fps: self.fps(),
        }
    }
}

impl Default for PipelineStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of one pipeline's counters.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PipelineMetrics {
    pub ingest_latency_ms: i64,
    pub frames_processed: u64,
    pub bytes_in_total: u64,
    pub pipeline_restarts_total: u32,
    pub last_frame_ts_ms: u64,
    pub fps: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_frame_accumulates() {
        let stats = PipelineStats::new();

        stats.record_frame(1000);
        stats.record_frame(2000);
        stats.record_frame(1500);

        let snap = stats.snapshot();
        assert_eq!(snap.frames_processed, 3);
        assert_eq!(snap.bytes_in_total, 4500);
        assert!(snap.last_frame_ts_ms > 0);
    }

    #[test]
    fn test_latency_clamped_to_zero() {
        let stats = PipelineStats::new();
        stats.set_latency_ms(-250);
        assert_eq!(stats.snapshot().ingest_latency_ms, 0);

        stats.set_latency_ms(120);
        assert_eq!(stats.snapshot().ingest_latency_ms, 120);
    }

    #[test]
    fn test_fps_round_trip() {
        let stats = PipelineStats::new();
        stats.set_fps(29.97);
        assert!((stats.fps() - 29.97).abs() < 0.001);
    }

    #[test]
    fn test_restarts_survive_snapshot() {
        let stats = PipelineStats::new();
        stats.restarts_total.store(3, Ordering::Relaxed);
        assert_eq!(stats.snapshot().pipeline_restarts_total, 3);
    }
}
