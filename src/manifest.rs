//! `manifest.json`: the summary record of a finalized recording session.
//!
//! Written once by `Recorder::stop`, read back unchanged by
//! `PlaybackEngine::load`.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use crate::error::{CamsyncError, CamsyncResult};
use crate::frame::CameraId;
use crate::storage::{open_reader, StreamEncoding};

pub const MANIFEST_FILE: &str = "manifest.json";
pub const MANIFEST_VERSION: u32 = 1;

/// Slack allowed when checking timestamps against the duration.
const TIMESTAMP_EPSILON: f64 = 1e-9;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub version: u32,
    /// Wall-clock session start.
    pub created_at: DateTime<Utc>,
    /// Same instant as `created_at`, in unix seconds.
    pub start_time: f64,
    /// Seconds from the earliest to the latest recorded frame.
    pub duration: f64,
    pub cameras: Vec<CameraStream>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CameraStream {
    pub id: CameraId,
    /// File name relative to the session directory.
    pub file: String,
    pub encoding: StreamEncoding,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    /// Zero-based timestamp of every persisted frame, in stream order.
    pub timestamps: Vec<f64>,
}

impl Manifest {
    pub fn new(created_at: DateTime<Utc>, duration: f64, cameras: Vec<CameraStream>) -> Self {
        Self {
            version: MANIFEST_VERSION,
            start_time: created_at.timestamp_micros() as f64 / 1_000_000.0,
            created_at,
            duration,
            cameras,
        }
    }

    pub fn camera_ids(&self) -> Vec<CameraId> {
        self.cameras.iter().map(|cam| cam.id).collect()
    }

    pub fn camera(&self, id: CameraId) -> Option<&CameraStream> {
        self.cameras.iter().find(|cam| cam.id == id)
    }

    pub fn stream_path(&self, dir: &Path, id: CameraId) -> Option<PathBuf> {
        self.camera(id).map(|cam| dir.join(&cam.file))
    }

    /// Write `manifest.json` into `dir` via a temp file and rename.
    pub fn write_atomic(&self, dir: &Path) -> CamsyncResult<PathBuf> {
        let path = dir.join(MANIFEST_FILE);
        let tmp = dir.join(format!("{}.tmp", MANIFEST_FILE));
        let result: Result<()> = (|| {
            let json = serde_json::to_vec_pretty(self).context("serialize manifest")?;
            std::fs::write(&tmp, json)
                .with_context(|| format!("write {}", tmp.display()))?;
            std::fs::rename(&tmp, &path)
                .with_context(|| format!("rename {} into place", tmp.display()))?;
            Ok(())
        })();
        result.map_err(|err| CamsyncError::storage(&path, err))?;
        Ok(path)
    }

    /// Read and validate the manifest of the session in `dir`. `dir` may also
    /// name the manifest file itself.
    pub fn load(dir: &Path) -> CamsyncResult<(PathBuf, Self)> {
        let (dir, path) = if dir.is_file() {
            let parent = dir.parent().unwrap_or(Path::new(".")).to_path_buf();
            (parent, dir.to_path_buf())
        } else {
            (dir.to_path_buf(), dir.join(MANIFEST_FILE))
        };
        let manifest = read_manifest(&path).map_err(|err| CamsyncError::manifest(&path, err))?;
        manifest
            .validate(&dir)
            .map_err(|err| CamsyncError::manifest(&path, err))?;
        Ok((dir, manifest))
    }

    fn validate(&self, dir: &Path) -> Result<()> {
        if self.version != MANIFEST_VERSION {
            return Err(anyhow!("unsupported manifest version {}", self.version));
        }
        if !self.duration.is_finite() || self.duration < 0.0 {
            return Err(anyhow!("invalid duration {}", self.duration));
        }
        if self.cameras.is_empty() {
            return Err(anyhow!("manifest lists no cameras"));
        }

        let mut seen = BTreeSet::new();
        for cam in &self.cameras {
            if !seen.insert(cam.id) {
                return Err(anyhow!("camera {} listed more than once", cam.id));
            }
            if Path::new(&cam.file).components().count() != 1 {
                return Err(anyhow!("camera {} stream '{}' escapes the session", cam.id, cam.file));
            }
            let mut last = None;
            for &t in &cam.timestamps {
                if !t.is_finite() || t < -TIMESTAMP_EPSILON || t > self.duration + TIMESTAMP_EPSILON {
                    return Err(anyhow!(
                        "camera {} timestamp {} outside [0, {}]",
                        cam.id,
                        t,
                        self.duration
                    ));
                }
                if last.is_some_and(|prev| t <= prev) {
                    return Err(anyhow!("camera {} timestamps are not increasing", cam.id));
                }
                last = Some(t);
            }

            let stream = dir.join(&cam.file);
            if !stream.is_file() {
                return Err(anyhow!("camera {} stream {} is missing", cam.id, stream.display()));
            }
            let reader = open_reader(cam.encoding, &stream, cam.id)
                .with_context(|| format!("camera {} stream is unreadable", cam.id))?;
            if reader.frame_count() != cam.timestamps.len() {
                return Err(anyhow!(
                    "camera {} stream holds {} frames but the manifest lists {}",
                    cam.id,
                    reader.frame_count(),
                    cam.timestamps.len()
                ));
            }
        }
        Ok(())
    }
}

fn read_manifest(path: &Path) -> Result<Manifest> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&raw).map_err(|e| anyhow!("invalid manifest {}: {}", path.display(), e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::VideoMode;
    use crate::frame::Frame;
    use crate::storage::create_writer;

    fn write_stream(dir: &Path, camera: CameraId, frames: usize) -> String {
        let mode = VideoMode {
            width: 2,
            height: 1,
            fps: 10,
        };
        let (path, mut writer) =
            create_writer(StreamEncoding::RawRgb24, dir, camera, mode).unwrap();
        for i in 0..frames {
            let frame = Frame::from_rgb(camera, i as u64, i as f64, 2, 1, vec![0; 6]).unwrap();
            writer.write(&frame).unwrap();
        }
        writer.finish().unwrap();
        path.file_name().unwrap().to_string_lossy().into_owned()
    }

    fn stream(id: u32, file: String, timestamps: Vec<f64>) -> CameraStream {
        CameraStream {
            id: CameraId(id),
            file,
            encoding: StreamEncoding::RawRgb24,
            width: 2,
            height: 1,
            fps: 10,
            timestamps,
        }
    }

    #[test]
    fn written_manifest_loads_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let file = write_stream(dir.path(), CameraId(0), 3);
        let manifest = Manifest::new(Utc::now(), 0.2, vec![stream(0, file, vec![0.0, 0.1, 0.2])]);
        manifest.write_atomic(dir.path()).unwrap();
        assert!(!dir.path().join("manifest.json.tmp").exists());

        let (loaded_dir, loaded) = Manifest::load(dir.path()).unwrap();
        assert_eq!(loaded, manifest);
        assert_eq!(loaded_dir, dir.path());
        assert_eq!(loaded.camera_ids(), vec![CameraId(0)]);

        let (_, by_file) = Manifest::load(&dir.path().join(MANIFEST_FILE)).unwrap();
        assert_eq!(by_file, manifest);
    }

    #[test]
    fn missing_manifest_is_a_manifest_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = Manifest::load(dir.path()).unwrap_err();
        assert_eq!(err.code(), "MANIFEST");
    }

    #[test]
    fn frame_count_mismatch_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let file = write_stream(dir.path(), CameraId(1), 2);
        let manifest = Manifest::new(Utc::now(), 0.2, vec![stream(1, file, vec![0.0, 0.1, 0.2])]);
        manifest.write_atomic(dir.path()).unwrap();
        assert!(Manifest::load(dir.path()).is_err());
    }

    #[test]
    fn missing_stream_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = Manifest::new(
            Utc::now(),
            0.0,
            vec![stream(0, "camera_0.rgb".to_string(), vec![0.0])],
        );
        manifest.write_atomic(dir.path()).unwrap();
        assert!(Manifest::load(dir.path()).is_err());
    }

    #[test]
    fn timestamps_past_duration_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let file = write_stream(dir.path(), CameraId(0), 2);
        let manifest = Manifest::new(Utc::now(), 0.1, vec![stream(0, file, vec![0.0, 0.5])]);
        manifest.write_atomic(dir.path()).unwrap();
        assert!(Manifest::load(dir.path()).is_err());
    }
}
