//! Live-playlist recording session: on-disk layout, manifest writing and the
//! `meta.json` sidecar.
//!
//! A session is one recording episode. Every pipeline (re)start that has
//! recording enabled opens a fresh session directory under
//! `<root>/live/<camera_id>/<session_id>/`; the retention enforcer owns the
//! deletion of old ones.

use rand::distr::{Alphanumeric, SampleString};
use serde::Serialize;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

pub const SESSION_ID_LEN: usize = 12;
pub const SEGMENT_EXT: &str = "mp4";
pub const PLAYLIST_NAME: &str = "playlist.m3u8";

#[derive(Debug, Clone)]
pub struct HlsConfig {
    pub enabled: bool,
    pub root_dir: PathBuf,
    pub segment_duration_sec: u32,
    pub playlist_length: u32,
}

impl Default for HlsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            root_dir: PathBuf::from("/var/lib/mediaplane/hls"),
            segment_duration_sec: 1,
            playlist_length: 10,
        }
    }
}

/// State of one recording session. `degraded` means the recording branch
/// failed to initialize or write; the pipeline keeps running without it.
#[derive(Debug, Clone, Default)]
pub struct HlsSession {
    pub session_id: String,
    pub dir: PathBuf,
    pub degraded: bool,
    pub last_error: String,
}

impl HlsSession {
    pub fn state_label(&self) -> &'static str {
        if self.degraded {
            "DEGRADED"
        } else {
            "OK"
        }
    }
}

/// Status-record label covering the no-session case.
pub fn session_state_label(session: Option<&HlsSession>) -> &'static str {
    match session {
        Some(s) => s.state_label(),
        None => "STOPPED",
    }
}

pub fn generate_session_id() -> String {
    Alphanumeric.sample_string(&mut rand::rng(), SESSION_ID_LEN)
}

pub fn segment_file_name(index: u32) -> String {
    format!("segment_{:05}.{}", index, SEGMENT_EXT)
}

/// Rewrites the sliding-window manifest on every fragment boundary and hands
/// the splitting muxer the location of the fragment it is about to open.
#[derive(Debug, Clone)]
pub struct PlaylistWriter {
    dir: PathBuf,
    target_duration_sec: u32,
    playlist_length: u32,
}

impl PlaylistWriter {
    pub fn new(dir: PathBuf, target_duration_sec: u32, playlist_length: u32) -> Self {
        Self {
            dir,
            target_duration_sec,
            playlist_length: playlist_length.max(1),
        }
    }

    /// Render the manifest for the window ending at `index`.
    pub fn render_manifest(&self, index: u32) -> String {
        let first = index.saturating_sub(self.playlist_length - 1);

        let mut out = String::new();
        out.push_str("#EXTM3U\n");
        out.push_str("#EXT-X-VERSION:3\n");
        out.push_str(&format!(
            "#EXT-X-TARGETDURATION:{}\n",
            self.target_duration_sec
        ));
        out.push_str(&format!("#EXT-X-MEDIA-SEQUENCE:{}\n", first));
        for i in first..=index {
            out.push_str(&format!("#EXTINF:{}.0,\n", self.target_duration_sec));
            out.push_str(&segment_file_name(i));
            out.push('\n');
        }
        out
    }

    /// Path the muxer should open for fragment `index`.
    pub fn segment_location(&self, index: u32) -> PathBuf {
        self.dir.join(segment_file_name(index))
    }

    /// Rewrite the manifest for the window ending at `index`. Failures are
    /// returned so the caller can mark the session degraded; the segment
    /// location stays valid either way.
    pub fn write_manifest(&self, index: u32) -> std::io::Result<()> {
        let manifest = self.render_manifest(index);
        let path = self.dir.join(PLAYLIST_NAME);
        let mut file = fs::File::create(path)?;
        file.write_all(manifest.as_bytes())
    }

    /// Empty manifest written when the session directory is created, before
    /// the first fragment exists.
    pub fn write_initial_manifest(&self) -> std::io::Result<()> {
        let header = format!(
            "#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-TARGETDURATION:{}\n#EXT-X-MEDIA-SEQUENCE:0\n",
            self.target_duration_sec
        );
        let mut file = fs::File::create(self.dir.join(PLAYLIST_NAME))?;
        file.write_all(header.as_bytes())
    }
}

#[derive(Serialize)]
struct MetaSidecar<'a> {
    camera_id: &'a str,
    session_id: &'a str,
    created_at: u64,
    last_write_at: u64,
    hls_config: MetaHlsConfig,
}

#[derive(Serialize)]
struct MetaHlsConfig {
    target_duration: u32,
    playlist_length: u32,
}

/// Write the `meta.json` sidecar next to the segments.
pub fn write_meta_json(
    dir: &Path,
    camera_id: &str,
    session_id: &str,
    config: &HlsConfig,
) -> std::io::Result<()> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);

    let meta = MetaSidecar {
        camera_id,
        session_id,
        created_at: now,
        last_write_at: now,
        hls_config: MetaHlsConfig {
            target_duration: config.segment_duration_sec,
            playlist_length: config.playlist_length,
        },
    };

    let json = serde_json::to_string_pretty(&meta)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
    let mut file = fs::File::create(dir.join("meta.json"))?;
    file.write_all(json.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_session_id_shape() {
        let id = generate_session_id();
        assert_eq!(id.len(), SESSION_ID_LEN);
        assert!(id.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(id, generate_session_id());
    }

    #[test]
    fn test_segment_names_are_zero_padded() {
        assert_eq!(segment_file_name(0), "segment_00000.mp4");
        assert_eq!(segment_file_name(12), "segment_00012.mp4");
        assert_eq!(segment_file_name(99999), "segment_99999.mp4");
    }

    #[test]
    fn test_first_fragment_manifest() {
        let writer = PlaylistWriter::new(PathBuf::from("/tmp/x"), 2, 10);
        let manifest = writer.render_manifest(0);

        assert!(manifest.starts_with("#EXTM3U\n#EXT-X-VERSION:3\n"));
        assert!(manifest.contains("#EXT-X-TARGETDURATION:2\n"));
        assert!(manifest.contains("#EXT-X-MEDIA-SEQUENCE:0\n"));
        assert_eq!(manifest.matches("#EXTINF:").count(), 1);
        assert!(manifest.contains("segment_00000.mp4\n"));
    }

    #[test]
    fn test_window_slides_after_twelve_closes() {
        // Twelve fragment closes after the initial open: final call carries
        // index 12, so the window is segments 3..=12.
        let writer = PlaylistWriter::new(PathBuf::from("/tmp/x"), 2, 10);
        let manifest = writer.render_manifest(12);

        assert!(manifest.contains("#EXT-X-MEDIA-SEQUENCE:3\n"));
        assert_eq!(manifest.matches("#EXTINF:2.0,\n").count(), 10);
        assert!(!manifest.contains("segment_00002.mp4"));
        assert!(manifest.contains("segment_00003.mp4"));
        assert!(manifest.contains("segment_00012.mp4"));
    }

    #[test]
    fn test_write_manifest_and_segment_location() {
        let tmp = TempDir::new().unwrap();
        let writer = PlaylistWriter::new(tmp.path().to_path_buf(), 2, 10);

        assert_eq!(
            writer.segment_location(4),
            tmp.path().join("segment_00004.mp4")
        );
        writer.write_manifest(4).unwrap();

        let manifest = fs::read_to_string(tmp.path().join(PLAYLIST_NAME)).unwrap();
        assert!(manifest.contains("#EXT-X-MEDIA-SEQUENCE:0\n"));
        assert_eq!(manifest.matches("#EXTINF:").count(), 5);
    }

    #[test]
    fn test_meta_sidecar_fields() {
        let tmp = TempDir::new().unwrap();
        let config = HlsConfig {
            segment_duration_sec: 2,
            playlist_length: 10,
            ..Default::default()
        };

        write_meta_json(tmp.path(), "cam1", "AbCdEfGhIjKl", &config).unwrap();

        let raw = fs::read_to_string(tmp.path().join("meta.json")).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed["camera_id"], "cam1");
        assert_eq!(parsed["session_id"], "AbCdEfGhIjKl");
        assert!(parsed["created_at"].as_u64().unwrap() > 0);
        assert_eq!(parsed["hls_config"]["target_duration"], 2);
        assert_eq!(parsed["hls_config"]["playlist_length"], 10);
    }

    #[test]
    fn test_state_labels() {
        assert_eq!(session_state_label(None), "STOPPED");

        let mut session = HlsSession {
            session_id: "x".into(),
            dir: PathBuf::new(),
            degraded: false,
            last_error: String::new(),
        };
        assert_eq!(session_state_label(Some(&session)), "OK");

        session.degraded = true;
        assert_eq!(session_state_label(Some(&session)), "DEGRADED");
    }
}
