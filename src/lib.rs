//! Media ingest orchestration core of a camera-fleet video-management
//! system.
//!
//! The crate supervises per-camera ingestion sessions: it opens an RTSP (or
//! synthetic test) source, fans decoded elementary-stream units out to a
//! liveness tap, a live HLS recorder and an optional unicast RTP egress
//! branch, and keeps the fleet healthy unattended — stall detection,
//! jittered-backoff reconnection, rate-limited admission and bounded
//! on-disk retention.
//!
//! The RPC surface, metrics exposition and CLI parsing live outside this
//! crate; they talk to [`supervisor::FleetSupervisor`] and read
//! [`utils::metrics::MediaMetrics::registry`].

pub mod config;
pub mod pipeline;
pub mod supervisor;
pub mod utils;

pub use config::Config;
pub use pipeline::{EgressConfig, PipelineState};
pub use supervisor::{CameraStatus, EgressStart, FleetSupervisor};
