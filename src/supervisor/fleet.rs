//! Fleet supervisor: admission control, the camera registry and the monitor
//! loop that keeps pipelines alive.
//!
//! The supervisor exclusively owns every pipeline; callers hold only the
//! camera identifier. All registry access, including reconnect teardown and
//! rebuild, happens under `registry`. The start-rate window lives under its
//! own lock, always acquired first.

use log::{debug, info, warn};
use rand::Rng;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::pipeline::{
    hls::session_state_label, EgressConfig, HlsConfig, IngestPipeline, PipelineConfig,
    PipelineMetrics, PipelineState,
};
use crate::utils::logging::redact_source_url;
use crate::utils::metrics::MediaMetrics;
use crate::utils::sos::ShutdownSignal;

use super::retention::{RetentionConfig, RetentionEnforcer};

/// No frames for this long while RUNNING counts as a stall.
const STALL_THRESHOLD_MS: u64 = 5_000;
/// Connect window while STARTING; slow H.265 sources need most of it.
const CONNECT_TIMEOUT_MS: u64 = 90_000;
/// Stable RUNNING for this long resets the backoff ladder.
const BACKOFF_RESET_AFTER: Duration = Duration::from_secs(30);
const BACKOFF_CAP_SECS: f64 = 30.0;
const RATE_WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum AdmissionError {
    #[error("start rate limit exceeded")]
    RateLimited,

    #[error("pipeline cap reached")]
    CapExhausted,

    #[error("pipeline failed to start: {0}")]
    StartFailed(#[from] crate::pipeline::PipelineError),
}

/// Outcome of an egress start forwarded to a pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EgressStart {
    Success,
    AlreadyRunning,
    Failed,
    CameraNotFound,
}

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("camera not found")]
    NotFound,

    #[error("snapshot unavailable")]
    Unavailable,
}

#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    pub data: Vec<u8>,
    pub mime_type: String,
    pub timestamp_ms: u64,
}

/// Status record handed to the RPC layer.
#[derive(Debug, Clone, Serialize)]
pub struct CameraStatus {
    pub camera_id: String,
    pub running: bool,
    pub state: String,
    pub fps: i32,
    pub last_frame_age_ms: u64,
    pub reconnect_attempts: u32,
    pub session_id: String,
    pub hls_state: String,
    pub recent_error_code: String,
    pub metrics: PipelineMetrics,
}

struct Registered {
    pipeline: IngestPipeline,
    source_url: String,
    prefer_tcp: bool,
    reconnect_attempts: u32,
    last_attempt: Option<Instant>,
}

/// Sliding window over recent pipeline start instants. Entries older than
/// the window are evicted lazily on each admission check.
pub(crate) struct RateWindow {
    window: Duration,
    capacity: usize,
    starts: VecDeque<Instant>,
}

impl RateWindow {
    pub(crate) fn new(window: Duration, capacity: usize) -> Self {
        Self {
            window,
            capacity,
            starts: VecDeque::new(),
        }
    }

    pub(crate) fn evict(&mut self, now: Instant) {
        while let Some(front) = self.starts.front() {
            if now.duration_since(*front) >= self.window {
                self.starts.pop_front();
            } else {
                break;
            }
        }
    }

    pub(crate) fn at_capacity(&self) -> bool {
        self.starts.len() >= self.capacity
    }

    pub(crate) fn record(&mut self, now: Instant) {
        self.starts.push_back(now);
    }

    pub(crate) fn len(&self) -> usize {
        self.starts.len()
    }
}

/// Jittered exponential backoff: `min(2^attempts, 30)` seconds scaled by a
/// uniform factor in `[0.9, 1.1]`. Zero attempts gives roughly one second.
pub(crate) fn backoff_delay(attempts: u32, rng: &mut impl Rng) -> Duration {
    let base = 2f64.powi(attempts.min(10) as i32).min(BACKOFF_CAP_SECS);
    let jitter: f64 = rng.random_range(0.9..=1.1);
    Duration::from_secs_f64(base * jitter)
}

struct Inner {
    max_pipelines: usize,
    hls_config: HlsConfig,
    metrics: Arc<MediaMetrics>,
    registry: Mutex<HashMap<String, Registered>>,
    rate: Mutex<RateWindow>,
}

pub struct FleetSupervisor {
    inner: Arc<Inner>,
    retention_config: RetentionConfig,
    sos: ShutdownSignal,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl FleetSupervisor {
    pub fn new(config: &Config, metrics: Arc<MediaMetrics>) -> Self {
        let hls_config = HlsConfig {
            enabled: true,
            root_dir: config.hls_root_dir.clone(),
            segment_duration_sec: config.hls_segment_duration_sec,
            playlist_length: config.hls_playlist_length,
        };
        let retention_config = RetentionConfig {
            root_dir: config.hls_root_dir.clone(),
            max_size_bytes: config.max_size_bytes,
            retention_minutes: config.retention_minutes,
            cleanup_interval_ms: config.cleanup_interval_ms,
            max_delete_per_tick: config.max_delete_per_tick,
        };

        Self {
            inner: Arc::new(Inner {
                max_pipelines: config.max_pipelines,
                hls_config,
                metrics,
                registry: Mutex::new(HashMap::new()),
                rate: Mutex::new(RateWindow::new(RATE_WINDOW, config.max_starts_per_minute)),
            }),
            retention_config,
            sos: ShutdownSignal::new(),
            workers: Mutex::new(Vec::new()),
        }
    }

    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.sos.clone()
    }

    /// Spawn the monitor loop and the retention enforcer. Requires a tokio
    /// runtime.
    pub fn start_workers(&self) {
        let inner = self.inner.clone();
        let sos = self.sos.clone();
        let monitor = tokio::spawn(async move {
            monitor_loop(inner, sos).await;
        });

        let enforcer = RetentionEnforcer::new(
            self.retention_config.clone(),
            self.inner.metrics.clone(),
            self.sos.clone(),
        );
        let retention = tokio::spawn(async move {
            enforcer.run().await;
        });

        self.workers.lock().unwrap().extend([monitor, retention]);
    }

    /// Admit and start one camera. Repeated starts with a registered
    /// identifier succeed without side effects.
    pub fn start(
        &self,
        camera_id: &str,
        source_url: &str,
        prefer_tcp: bool,
    ) -> Result<(), AdmissionError> {
        // Rate window first; lock order rate -> registry is invariant.
        let mut rate = self.inner.rate.lock().unwrap();
        let now = Instant::now();
        rate.evict(now);
        if rate.at_capacity() {
            warn!(
                "[{}] start rate limit exceeded ({} starts in the last minute)",
                camera_id,
                rate.len()
            );
            self.inner.metrics.record_error("rate_limit");
            return Err(AdmissionError::RateLimited);
        }

        let mut registry = self.inner.registry.lock().unwrap();
        if registry.len() >= self.inner.max_pipelines {
            warn!(
                "[{}] global pipeline cap reached ({})",
                camera_id, self.inner.max_pipelines
            );
            self.inner.metrics.record_error("cap");
            return Err(AdmissionError::CapExhausted);
        }

        if registry.contains_key(camera_id) {
            return Ok(());
        }

        let pipeline = IngestPipeline::new(
            PipelineConfig {
                camera_id: camera_id.to_string(),
                source_url: source_url.to_string(),
                prefer_tcp,
            },
            self.inner.hls_config.clone(),
            self.inner.metrics.clone(),
        );
        pipeline.start()?;

        registry.insert(
            camera_id.to_string(),
            Registered {
                pipeline,
                source_url: source_url.to_string(),
                prefer_tcp,
                reconnect_attempts: 0,
                last_attempt: None,
            },
        );
        rate.record(now);
        self.inner.metrics.pipelines_active.inc();
        Ok(())
    }

    /// Stop and forget one camera. Returns whether it was registered.
    pub fn stop(&self, camera_id: &str) -> bool {
        let mut registry = self.inner.registry.lock().unwrap();
        match registry.remove(camera_id) {
            Some(entry) => {
                entry.pipeline.stop();
                self.inner.metrics.pipelines_active.dec();
                true
            }
            None => false,
        }
    }

    pub fn status(&self, camera_id: &str) -> Option<CameraStatus> {
        let registry = self.inner.registry.lock().unwrap();
        registry.get(camera_id).map(|e| status_of(camera_id, e))
    }

    pub fn list(&self) -> Vec<CameraStatus> {
        let registry = self.inner.registry.lock().unwrap();
        registry.iter().map(|(id, e)| status_of(id, e)).collect()
    }

    /// Declared in the RPC surface; needs a decoder-tap branch that is not
    /// built yet, so every registered camera reports unavailable.
    pub fn capture_snapshot(&self, camera_id: &str) -> Result<Snapshot, SnapshotError> {
        let registry = self.inner.registry.lock().unwrap();
        if !registry.contains_key(camera_id) {
            return Err(SnapshotError::NotFound);
        }
        Err(SnapshotError::Unavailable)
    }

    pub fn start_egress(&self, camera_id: &str, config: EgressConfig) -> EgressStart {
        let registry = self.inner.registry.lock().unwrap();
        let Some(entry) = registry.get(camera_id) else {
            warn!(
                "[{}] start_egress: camera not found ({} active pipelines)",
                camera_id,
                registry.len()
            );
            return EgressStart::CameraNotFound;
        };

        if entry.pipeline.egress_running() {
            return EgressStart::AlreadyRunning;
        }

        match entry.pipeline.start_egress(config) {
            Ok(()) => EgressStart::Success,
            Err(e) => {
                warn!("[{}] egress start failed: {}", camera_id, e);
                EgressStart::Failed
            }
        }
    }

    pub fn stop_egress(&self, camera_id: &str) -> bool {
        let registry = self.inner.registry.lock().unwrap();
        match registry.get(camera_id) {
            Some(entry) => {
                entry.pipeline.stop_egress();
                true
            }
            None => false,
        }
    }

    /// Cancel the workers, join them, then stop and drop every pipeline.
    pub async fn shutdown(&self) {
        info!("fleet supervisor shutting down");
        self.sos.cancel();

        let workers: Vec<_> = self.workers.lock().unwrap().drain(..).collect();
        for worker in workers {
            let _ = worker.await;
        }

        let mut registry = self.inner.registry.lock().unwrap();
        for (_, entry) in registry.drain() {
            entry.pipeline.stop();
            self.inner.metrics.pipelines_active.dec();
        }
    }
}

fn status_of(camera_id: &str, entry: &Registered) -> CameraStatus {
    let state = entry.pipeline.state();
    let session = entry.pipeline.hls_session();

    CameraStatus {
        camera_id: camera_id.to_string(),
        running: state == PipelineState::Running,
        state: state.as_str().to_string(),
        fps: entry.pipeline.fps() as i32,
        last_frame_age_ms: entry.pipeline.last_frame_age_ms(),
        reconnect_attempts: entry.reconnect_attempts,
        session_id: session
            .as_ref()
            .map(|s| s.session_id.clone())
            .unwrap_or_default(),
        hls_state: session_state_label(session.as_ref()).to_string(),
        recent_error_code: session.map(|s| s.last_error).unwrap_or_default(),
        metrics: entry.pipeline.metrics(),
    }
}

async fn monitor_loop(inner: Arc<Inner>, sos: ShutdownSignal) {
    let mut interval = tokio::time::interval(Duration::from_secs(1));
    interval.tick().await;

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = sos.wait() => break,
        }
        if sos.cancelled() {
            break;
        }
        monitor_tick(&inner);
    }
}

fn monitor_tick(inner: &Inner) {
    let mut to_reconnect = Vec::new();

    {
        let mut registry = inner.registry.lock().unwrap();
        let now = Instant::now();

        for (id, entry) in registry.iter_mut() {
            let state = entry.pipeline.state();
            let age_ms = entry.pipeline.last_frame_age_ms();

            // Backoff reset: a stretch of stable RUNNING means the next
            // fault starts the ladder from the bottom again.
            if state == PipelineState::Running
                && age_ms < STALL_THRESHOLD_MS
                && entry.reconnect_attempts > 0
            {
                if let Some(last) = entry.last_attempt {
                    if now.duration_since(last) >= BACKOFF_RESET_AFTER {
                        entry.reconnect_attempts = 0;
                        debug!("[{}] resetting backoff after stable RUNNING", id);
                    }
                }
            }

            match state {
                PipelineState::Running if age_ms > STALL_THRESHOLD_MS => {
                    warn!("[{}] stall detected ({} ms without frames)", id, age_ms);
                    inner.metrics.stalls_total.inc();
                    to_reconnect.push(id.clone());
                }
                PipelineState::Starting if age_ms > CONNECT_TIMEOUT_MS => {
                    warn!("[{}] connection timeout while STARTING", id);
                    inner.metrics.stalls_total.inc();
                    to_reconnect.push(id.clone());
                }
                PipelineState::Reconnecting => {
                    to_reconnect.push(id.clone());
                }
                // A registered pipeline can only sit in STOPPED when its
                // last reconnect attempt failed to build; keep retrying.
                PipelineState::Stopped => {
                    to_reconnect.push(id.clone());
                }
                _ => {}
            }
        }
    }

    for id in &to_reconnect {
        reconnect(inner, id);
    }

    let registry = inner.registry.lock().unwrap();
    let total_fps: f64 = registry
        .values()
        .filter(|e| e.pipeline.state() == PipelineState::Running)
        .map(|e| e.pipeline.fps())
        .sum();
    inner.metrics.ingest_fps_aggregate.set(total_fps);
}

/// Replace the camera's pipeline with a freshly built one, honoring the
/// jittered backoff. A fresh object is used instead of restarting the old
/// one so every media-graph handle is provably released.
fn reconnect(inner: &Inner, camera_id: &str) {
    let mut registry = inner.registry.lock().unwrap();
    let Some(entry) = registry.get_mut(camera_id) else {
        return;
    };

    let now = Instant::now();
    if let Some(last) = entry.last_attempt {
        let delay = backoff_delay(entry.reconnect_attempts, &mut rand::rng());
        if now.duration_since(last) < delay {
            return;
        }
    }

    info!(
        "[{}] attempting reconnection (attempt {}) to {}",
        camera_id,
        entry.reconnect_attempts + 1,
        redact_source_url(&entry.source_url)
    );
    inner.metrics.reconnects_total.inc();

    entry.pipeline.stop();
    let restarts = entry
        .pipeline
        .stats()
        .restarts_total
        .load(std::sync::atomic::Ordering::Relaxed)
        + 1;

    let pipeline = IngestPipeline::new(
        PipelineConfig {
            camera_id: camera_id.to_string(),
            source_url: entry.source_url.clone(),
            prefer_tcp: entry.prefer_tcp,
        },
        inner.hls_config.clone(),
        inner.metrics.clone(),
    );
    pipeline
        .stats()
        .restarts_total
        .store(restarts, std::sync::atomic::Ordering::Relaxed);

    if let Err(e) = pipeline.start() {
        warn!("[{}] reconnection attempt failed: {}", camera_id, e);
    }

    entry.pipeline = pipeline;
    entry.reconnect_attempts += 1;
    entry.last_attempt = Some(now);
}
