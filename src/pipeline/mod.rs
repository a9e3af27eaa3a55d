//! Per-camera ingest pipelines.
//!
//! One [`IngestPipeline`] owns one camera's media graph: source, fan-out,
//! liveness tap, optional live-playlist recording and an attachable RTP
//! egress branch. Lifecycle state and counters are exposed through atomics
//! so the supervisor and the RPC layer can observe a pipeline concurrently
//! with the graph's own callback threads.

pub mod egress;
pub mod fsm;
pub mod hls;
pub mod ingest;
pub mod stats;

pub use egress::EgressConfig;
pub use fsm::{PipelineFsm, PipelineState};
pub use hls::HlsConfig;
pub use ingest::{IngestPipeline, PipelineConfig};
pub use stats::{PipelineMetrics, PipelineStats};

use thiserror::Error;

/// Failures surfaced by graph construction and mutation. Runtime faults
/// never appear here; those become state transitions.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("failed to create element `{0}`")]
    ElementCreate(&'static str),

    #[error("failed to link {0}")]
    Link(String),

    #[error("no usable {0} found")]
    MissingCodec(&'static str),

    #[error("pipeline state change failed: {0}")]
    StateChange(String),

    #[error("pipeline is not running")]
    NotRunning,

    #[error("tee has no free source pad")]
    TeePad,
}

/// Elementary-stream codec discovered during source negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CodecTag {
    Unknown = 0,
    H264 = 1,
    H265 = 2,
}

impl CodecTag {
    pub(crate) fn from_u8(v: u8) -> CodecTag {
        match v {
            1 => CodecTag::H264,
            2 => CodecTag::H265,
            _ => CodecTag::Unknown,
        }
    }
}
