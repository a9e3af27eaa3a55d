//! Service configuration envelope.
//!
//! Plain struct with production defaults; `from_env` applies `MEDIAPLANE_*`
//! overrides. Full command-line parsing belongs to the launcher, not here.

use std::env;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct Config {
    /// RPC listen address, consumed by the external RPC layer.
    pub grpc_addr: String,
    /// Metrics listen address, consumed by the external exporter.
    pub metrics_addr: String,
    /// One of debug/info/warn/error.
    pub log_level: String,

    /// Fleet cap for admission.
    pub max_pipelines: usize,
    /// Sliding-window start-rate cap per minute.
    pub max_starts_per_minute: usize,

    /// Root of on-disk live sessions.
    pub hls_root_dir: PathBuf,
    /// Splitting-muxer split interval in seconds.
    pub hls_segment_duration_sec: u32,
    /// Manifest window size in segments.
    pub hls_playlist_length: u32,

    /// Age eviction threshold.
    pub retention_minutes: u64,
    /// Aggregate byte quota across all sessions.
    pub max_size_bytes: u64,
    /// Retention enforcer tick.
    pub cleanup_interval_ms: u64,
    /// Retention operations budget per tick.
    pub max_delete_per_tick: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            grpc_addr: "0.0.0.0:50051".to_string(),
            metrics_addr: "0.0.0.0:9091".to_string(),
            log_level: "info".to_string(),
            max_pipelines: 256,
            max_starts_per_minute: 60,
            hls_root_dir: PathBuf::from("/var/lib/mediaplane/hls"),
            hls_segment_duration_sec: 1,
            hls_playlist_length: 10,
            retention_minutes: 60,
            max_size_bytes: 20 * 1024 * 1024 * 1024,
            cleanup_interval_ms: 10_000,
            max_delete_per_tick: 50,
        }
    }
}

impl Config {
    /// Defaults overridden by any `MEDIAPLANE_*` variables present in the
    /// environment. Unparsable numeric values keep the default.
    pub fn from_env() -> Self {
        let mut cfg = Config::default();

        if let Ok(v) = env::var("MEDIAPLANE_GRPC_ADDR") {
            cfg.grpc_addr = v;
        }
        if let Ok(v) = env::var("MEDIAPLANE_METRICS_ADDR") {
            cfg.metrics_addr = v;
        }
        if let Ok(v) = env::var("MEDIAPLANE_LOG_LEVEL") {
            cfg.log_level = v;
        }
        if let Some(v) = parse_env("MEDIAPLANE_MAX_PIPELINES") {
            cfg.max_pipelines = v;
        }
        if let Some(v) = parse_env("MEDIAPLANE_MAX_STARTS_PER_MINUTE") {
            cfg.max_starts_per_minute = v;
        }
        if let Ok(v) = env::var("MEDIAPLANE_HLS_ROOT_DIR") {
            cfg.hls_root_dir = PathBuf::from(v);
        }
        if let Some(v) = parse_env("MEDIAPLANE_HLS_SEGMENT_DURATION_SEC") {
            cfg.hls_segment_duration_sec = v;
        }
        if let Some(v) = parse_env("MEDIAPLANE_HLS_PLAYLIST_LENGTH") {
            cfg.hls_playlist_length = v;
        }
        if let Some(v) = parse_env("MEDIAPLANE_RETENTION_MINUTES") {
            cfg.retention_minutes = v;
        }
        if let Some(v) = parse_env("MEDIAPLANE_MAX_SIZE_BYTES") {
            cfg.max_size_bytes = v;
        }
        if let Some(v) = parse_env("MEDIAPLANE_CLEANUP_INTERVAL_MS") {
            cfg.cleanup_interval_ms = v;
        }
        if let Some(v) = parse_env("MEDIAPLANE_MAX_DELETE_PER_TICK") {
            cfg.max_delete_per_tick = v;
        }

        cfg
    }
}

fn parse_env<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = Config::default();
        assert_eq!(cfg.max_pipelines, 256);
        assert_eq!(cfg.max_starts_per_minute, 60);
        assert_eq!(cfg.hls_playlist_length, 10);
        assert_eq!(cfg.max_size_bytes, 20 * 1024 * 1024 * 1024);
        assert_eq!(cfg.max_delete_per_tick, 50);
    }

    #[test]
    fn test_env_overrides() {
        env::set_var("MEDIAPLANE_MAX_PIPELINES", "8");
        env::set_var("MEDIAPLANE_LOG_LEVEL", "debug");
        env::set_var("MEDIAPLANE_RETENTION_MINUTES", "not-a-number");

        let cfg = Config::from_env();
        assert_eq!(cfg.max_pipelines, 8);
        assert_eq!(cfg.log_level, "debug");
        // Unparsable values keep the default.
        assert_eq!(cfg.retention_minutes, 60);

        env::remove_var("MEDIAPLANE_MAX_PIPELINES");
        env::remove_var("MEDIAPLANE_LOG_LEVEL");
        env::remove_var("MEDIAPLANE_RETENTION_MINUTES");
    }
}
