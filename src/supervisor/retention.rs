//! On-disk retention enforcer.
//!
//! Background worker that walks `<root>/live/<camera_id>/<session_id>/` on a
//! fixed tick and trims sessions by age and by aggregate size, spending at
//! most `max_delete_per_tick` deletions per pass. It looks only at paths,
//! sizes and modification times, never at file contents. A session touched
//! within the last minute is never deleted: that is the guard that keeps the
//! enforcer from racing a live writer.

use log::{info, warn};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::utils::metrics::MediaMetrics;
use crate::utils::sos::ShutdownSignal;

/// Sessions younger than this are treated as actively written.
const ACTIVE_SESSION_GUARD: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct RetentionConfig {
    pub root_dir: PathBuf,
    pub max_size_bytes: u64,
    pub retention_minutes: u64,
    pub cleanup_interval_ms: u64,
    pub max_delete_per_tick: u32,
}

#[derive(Debug)]
struct SessionEntry {
    path: PathBuf,
    size_bytes: u64,
    newest_mtime: SystemTime,
}

pub struct RetentionEnforcer {
    config: RetentionConfig,
    metrics: Arc<MediaMetrics>,
    sos: ShutdownSignal,
}

impl RetentionEnforcer {
    pub fn new(config: RetentionConfig, metrics: Arc<MediaMetrics>, sos: ShutdownSignal) -> Self {
        Self {
            config,
            metrics,
            sos,
        }
    }

    /// Tick until the shutdown signal fires. The first pass runs one full
    /// interval after startup.
    pub async fn run(&self) {
        info!(
            "retention enforcer started. root: {}, limit: {} bytes, ttl: {} min",
            self.config.root_dir.display(),
            self.config.max_size_bytes,
            self.config.retention_minutes
        );

        let mut interval =
            tokio::time::interval(Duration::from_millis(self.config.cleanup_interval_ms.max(1)));
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = self.sos.wait() => break,
            }
            if self.sos.cancelled() {
                break;
            }
            self.run_once();
        }
    }

    /// One enforcement pass: scan, evict by age, evict by quota.
    pub fn run_once(&self) {
        let now = SystemTime::now();
        let mut sessions = scan_sessions(&self.config.root_dir);
        let mut budget = self.config.max_delete_per_tick;
        let retention = Duration::from_secs(self.config.retention_minutes * 60);

        let mut survivors: Vec<SessionEntry> = Vec::with_capacity(sessions.len());
        for session in sessions.drain(..) {
            let age = now
                .duration_since(session.newest_mtime)
                .unwrap_or_default();
            if age > retention && budget > 0 {
                match fs::remove_dir_all(&session.path) {
                    Ok(()) => {
                        info!("deleted expired session: {}", session.path.display());
                        self.metrics
                            .record_bytes_reclaimed("age", session.size_bytes);
                        budget -= 1;
                        continue;
                    }
                    Err(e) => {
                        warn!("failed to delete {}: {}", session.path.display(), e);
                        self.metrics.cleanup_failures_total.inc();
                    }
                }
            }
            survivors.push(session);
        }

        let mut total: u64 = survivors.iter().map(|s| s.size_bytes).sum();
        if total <= self.config.max_size_bytes {
            return;
        }

        survivors.sort_by_key(|s| s.newest_mtime);
        for session in &survivors {
            if budget == 0 || total <= self.config.max_size_bytes {
                break;
            }

            let age = now
                .duration_since(session.newest_mtime)
                .unwrap_or_default();
            if age < ACTIVE_SESSION_GUARD {
                continue;
            }

            match fs::remove_dir_all(&session.path) {
                Ok(()) => {
                    info!("deleted session for quota: {}", session.path.display());
                    self.metrics
                        .record_bytes_reclaimed("quota", session.size_bytes);
                    total = total.saturating_sub(session.size_bytes);
                    budget -= 1;
                }
                Err(e) => {
                    warn!("failed to delete {}: {}", session.path.display(), e);
                    self.metrics.cleanup_failures_total.inc();
                }
            }
        }
    }
}

fn scan_sessions(root: &Path) -> Vec<SessionEntry> {
    let mut sessions = Vec::new();
    let Ok(cameras) = fs::read_dir(root.join("live")) else {
        return sessions;
    };

    for camera in cameras.flatten() {
        if !camera.file_type().map(|t| t.is_dir()).unwrap_or(false) {
            continue;
        }
        let Ok(entries) = fs::read_dir(camera.path()) else {
            continue;
        };
        for entry in entries.flatten() {
            if !entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                continue;
            }
            let path = entry.path();
            let (size_bytes, newest) = measure_session(&path);
            let newest_mtime = newest
                .or_else(|| entry.metadata().ok().and_then(|m| m.modified().ok()))
                .unwrap_or(UNIX_EPOCH);
            sessions.push(SessionEntry {
                path,
                size_bytes,
                newest_mtime,
            });
        }
    }

    sessions
}

/// Depth-first file size sum and newest file mtime for one session.
fn measure_session(path: &Path) -> (u64, Option<SystemTime>) {
    let mut size = 0u64;
    let mut newest: Option<SystemTime> = None;
    let mut stack = vec![path.to_path_buf()];

    while let Some(dir) = stack.pop() {
        let Ok(entries) = fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let Ok(meta) = entry.metadata() else {
                continue;
            };
            if meta.is_dir() {
                stack.push(entry.path());
            } else if meta.is_file() {
                size += meta.len();
                if let Ok(modified) = meta.modified() {
                    newest = Some(newest.map_or(modified, |n| n.max(modified)));
                }
            }
        }
    }

    (size, newest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn seed_session(root: &Path, camera: &str, session: &str, size_mb: usize, age_min: u64) {
        let dir = root.join("live").join(camera).join(session);
        fs::create_dir_all(&dir).unwrap();

        let file_path = dir.join("segment_00000.mp4");
        fs::write(&file_path, vec![0u8; size_mb * 1024 * 1024]).unwrap();

        let mtime = SystemTime::now() - Duration::from_secs(age_min * 60);
        let file = fs::File::options().write(true).open(&file_path).unwrap();
        file.set_modified(mtime).unwrap();
    }

    fn enforcer(root: &Path, max_size_bytes: u64, retention_minutes: u64) -> RetentionEnforcer {
        enforcer_with_budget(root, max_size_bytes, retention_minutes, 50)
    }

    fn enforcer_with_budget(
        root: &Path,
        max_size_bytes: u64,
        retention_minutes: u64,
        max_delete_per_tick: u32,
    ) -> RetentionEnforcer {
        RetentionEnforcer::new(
            RetentionConfig {
                root_dir: root.to_path_buf(),
                max_size_bytes,
                retention_minutes,
                cleanup_interval_ms: 100,
                max_delete_per_tick,
            },
            Arc::new(MediaMetrics::with_default_registry().unwrap()),
            ShutdownSignal::new(),
        )
    }

    fn session_exists(root: &Path, camera: &str, session: &str) -> bool {
        root.join("live").join(camera).join(session).exists()
    }

    #[test]
    fn test_age_eviction() {
        let tmp = TempDir::new().unwrap();
        seed_session(tmp.path(), "cam1", "sess_old", 1, 20);
        seed_session(tmp.path(), "cam1", "sess_new", 1, 5);

        enforcer(tmp.path(), u64::MAX, 10).run_once();

        assert!(!session_exists(tmp.path(), "cam1", "sess_old"));
        assert!(session_exists(tmp.path(), "cam1", "sess_new"));
    }

    #[test]
    fn test_quota_evicts_oldest_first() {
        let tmp = TempDir::new().unwrap();
        // 6 MB total against a 5 MB cap: only the oldest has to go.
        seed_session(tmp.path(), "cam1", "sess1", 2, 30);
        seed_session(tmp.path(), "cam1", "sess2", 2, 20);
        seed_session(tmp.path(), "cam1", "sess3", 2, 10);

        enforcer(tmp.path(), 5 * 1024 * 1024, 60).run_once();

        assert!(!session_exists(tmp.path(), "cam1", "sess1"));
        assert!(session_exists(tmp.path(), "cam1", "sess2"));
        assert!(session_exists(tmp.path(), "cam1", "sess3"));
    }

    #[test]
    fn test_never_deletes_active_session() {
        let tmp = TempDir::new().unwrap();
        seed_session(tmp.path(), "cam1", "sess_active", 1, 0);

        enforcer(tmp.path(), 1, 60).run_once();

        assert!(session_exists(tmp.path(), "cam1", "sess_active"));
    }

    #[test]
    fn test_ops_budget_bounds_deletions() {
        let tmp = TempDir::new().unwrap();
        seed_session(tmp.path(), "cam1", "sess1", 1, 40);
        seed_session(tmp.path(), "cam1", "sess2", 1, 30);
        seed_session(tmp.path(), "cam2", "sess3", 1, 20);

        let enforcer = enforcer_with_budget(tmp.path(), u64::MAX, 10, 1);
        enforcer.run_once();

        let surviving = ["sess1", "sess2", "sess3"]
            .iter()
            .zip(["cam1", "cam1", "cam2"])
            .filter(|(s, c)| session_exists(tmp.path(), c, s))
            .count();
        assert_eq!(surviving, 2);

        // The next tick gets a fresh budget.
        enforcer.run_once();
        enforcer.run_once();
        assert!(!session_exists(tmp.path(), "cam1", "sess1"));
        assert!(!session_exists(tmp.path(), "cam1", "sess2"));
        assert!(!session_exists(tmp.path(), "cam2", "sess3"));
    }

    #[test]
    fn test_bytes_reclaimed_counter_advances() {
        let tmp = TempDir::new().unwrap();
        seed_session(tmp.path(), "cam1", "sess_old", 3, 120);
        seed_session(tmp.path(), "cam1", "sess_new", 2, 30);

        let metrics = Arc::new(MediaMetrics::with_default_registry().unwrap());
        let enforcer = RetentionEnforcer::new(
            RetentionConfig {
                root_dir: tmp.path().to_path_buf(),
                max_size_bytes: 4 * 1024 * 1024,
                retention_minutes: 60,
                cleanup_interval_ms: 100,
                max_delete_per_tick: 50,
            },
            metrics.clone(),
            ShutdownSignal::new(),
        );
        enforcer.run_once();

        // The 2 h session exceeds the TTL; the 30 min one then fits the cap.
        assert!(!session_exists(tmp.path(), "cam1", "sess_old"));
        assert!(session_exists(tmp.path(), "cam1", "sess_new"));

        let reclaimed = metrics
            .cleanup_bytes_reclaimed_total
            .with_label_values(&["age"])
            .get() as u64;
        assert_eq!(reclaimed, 3 * 1024 * 1024);
    }

    #[test]
    fn test_missing_root_is_harmless() {
        let tmp = TempDir::new().unwrap();
        let enforcer = enforcer(&tmp.path().join("does-not-exist"), 1, 1);
        enforcer.run_once();
    }

    #[test]
    fn test_stray_files_are_ignored() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir_all(tmp.path().join("live").join("cam1")).unwrap();
        fs::write(tmp.path().join("live").join("cam1").join("stray.txt"), b"x").unwrap();
        seed_session(tmp.path(), "cam1", "sess1", 1, 20);

        enforcer(tmp.path(), u64::MAX, 10).run_once();

        assert!(tmp
            .path()
            .join("live")
            .join("cam1")
            .join("stray.txt")
            .exists());
        assert!(!session_exists(tmp.path(), "cam1", "sess1"));
    }
}
