//! Fleet-wide supervision: admission, liveness monitoring, reconnection and
//! on-disk retention.

pub mod fleet;
pub mod retention;

pub use fleet::{
    AdmissionError, CameraStatus, EgressStart, FleetSupervisor, Snapshot, SnapshotError,
};
pub use retention::{RetentionConfig, RetentionEnforcer};
