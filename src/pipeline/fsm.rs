//! Pipeline lifecycle state.
//!
//! One atomically readable value per pipeline. The state exists to
//! coordinate the supervisor with the graph callbacks, not to gate
//! transitions, so `transition_to` accepts anything.

use std::sync::atomic::{AtomicU8, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PipelineState {
    Stopped = 0,
    Starting = 1,
    Running = 2,
    /// Reserved for external observability; the supervisor promotes stalled
    /// pipelines straight to `Reconnecting`.
    Stalled = 3,
    Reconnecting = 4,
}

impl PipelineState {
    /// Canonical string form used in logs and status records.
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineState::Stopped => "STOPPED",
            PipelineState::Starting => "STARTING",
            PipelineState::Running => "RUNNING",
            PipelineState::Stalled => "STALLED",
            PipelineState::Reconnecting => "RECONNECTING",
        }
    }

    fn from_u8(v: u8) -> PipelineState {
        match v {
            1 => PipelineState::Starting,
            2 => PipelineState::Running,
            3 => PipelineState::Stalled,
            4 => PipelineState::Reconnecting,
            _ => PipelineState::Stopped,
        }
    }
}

impl std::fmt::Display for PipelineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Single-writer, many-reader state cell.
#[derive(Debug)]
pub struct PipelineFsm {
    current: AtomicU8,
}

impl PipelineFsm {
    pub fn new() -> Self {
        Self {
            current: AtomicU8::new(PipelineState::Stopped as u8),
        }
    }

    pub fn current(&self) -> PipelineState {
        PipelineState::from_u8(self.current.load(Ordering::Relaxed))
    }

    pub fn transition_to(&self, next: PipelineState) {
        self.current.store(next as u8, Ordering::Relaxed);
    }
}

impl Default for PipelineFsm {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state_is_stopped() {
        let fsm = PipelineFsm::new();
        assert_eq!(fsm.current(), PipelineState::Stopped);
    }

    #[test]
    fn test_transition_works() {
        let fsm = PipelineFsm::new();
        fsm.transition_to(PipelineState::Starting);
        assert_eq!(fsm.current(), PipelineState::Starting);
        fsm.transition_to(PipelineState::Running);
        assert_eq!(fsm.current(), PipelineState::Running);
    }

    #[test]
    fn test_state_strings() {
        assert_eq!(PipelineState::Stopped.as_str(), "STOPPED");
        assert_eq!(PipelineState::Running.as_str(), "RUNNING");
        assert_eq!(PipelineState::Stalled.as_str(), "STALLED");
        assert_eq!(PipelineState::Reconnecting.as_str(), "RECONNECTING");
    }

    #[test]
    fn test_readable_across_threads() {
        let fsm = std::sync::Arc::new(PipelineFsm::new());
        let reader = fsm.clone();

        fsm.transition_to(PipelineState::Running);
        let handle = std::thread::spawn(move || reader.current());
        assert_eq!(handle.join().unwrap(), PipelineState::Running);
    }
}
