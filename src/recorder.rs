//! Recorder: registry snapshots into per-camera streams plus a manifest.
//!
//! The recording loop owns every writer for the lifetime of a session and
//! hands them back through its join handle, so `stop` finalizes files only
//! after the loop can no longer touch them.

use anyhow::anyhow;
use chrono::{DateTime, Local, Utc};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::capture::{CaptureRegistry, VideoMode};
use crate::config::RecordingSettings;
use crate::error::{CamsyncError, CamsyncResult};
use crate::frame::{CameraId, Frame};
use crate::manifest::{CameraStream, Manifest};
use crate::storage::{create_writer, StreamWriter};
use crate::timeline::TimelineSync;

/// What a finished session produced.
#[derive(Debug, Clone)]
pub struct RecordingSummary {
    pub session_dir: PathBuf,
    pub manifest: Manifest,
    pub frames_written: BTreeMap<CameraId, usize>,
    /// Cameras dropped after a write failure. They are not in the manifest.
    pub failed_cameras: Vec<CameraId>,
}

struct CameraTrack {
    camera: CameraId,
    file: String,
    mode: VideoMode,
    writer: Box<dyn StreamWriter>,
    last_sequence: Option<u64>,
    last_timestamp: Option<f64>,
    failed: bool,
}

impl CameraTrack {
    /// Write `frame` if it is new and later than the last one written.
    /// Returns the stream ordinal on success.
    fn offer(&mut self, frame: &Frame) -> Option<usize> {
        if self.failed || self.last_sequence == Some(frame.sequence) {
            return None;
        }
        self.last_sequence = Some(frame.sequence);
        if !frame.timestamp.is_finite()
            || self.last_timestamp.is_some_and(|last| frame.timestamp <= last)
        {
            return None;
        }
        match self.writer.write(frame) {
            Ok(ordinal) => {
                self.last_timestamp = Some(frame.timestamp);
                Some(ordinal)
            }
            Err(err) => {
                log::error!(
                    "Recorder: write failed for camera {}, skipping it from now on: {:#}",
                    self.camera,
                    err
                );
                self.failed = true;
                None
            }
        }
    }
}

struct ActiveRecording {
    session_dir: PathBuf,
    created_at: DateTime<Utc>,
    stop: Arc<AtomicBool>,
    join: JoinHandle<Vec<CameraTrack>>,
}

enum RecorderState {
    Idle,
    /// `start` or `stop` is doing I/O outside the lock.
    Busy,
    Recording(ActiveRecording),
}

pub struct Recorder {
    registry: Arc<CaptureRegistry>,
    settings: RecordingSettings,
    timeline: Arc<TimelineSync>,
    state: Mutex<RecorderState>,
}

impl Recorder {
    pub fn new(registry: Arc<CaptureRegistry>, settings: RecordingSettings) -> Self {
        Self {
            registry,
            settings,
            timeline: Arc::new(TimelineSync::new()),
            state: Mutex::new(RecorderState::Idle),
        }
    }

    pub fn is_recording(&self) -> bool {
        matches!(*self.state.lock(), RecorderState::Recording(_))
    }

    /// Live index of the current (or last) session.
    pub fn timeline(&self) -> Arc<TimelineSync> {
        self.timeline.clone()
    }

    /// Begin a session under `output_dir`. Fails without side effects when a
    /// session is already active or no camera is connected.
    pub fn start(&self, output_dir: &Path) -> CamsyncResult<PathBuf> {
        {
            let mut state = self.state.lock();
            if !matches!(*state, RecorderState::Idle) {
                return Err(CamsyncError::InvalidState("already recording"));
            }
            if self.registry.connected_cameras().is_empty() {
                return Err(CamsyncError::InvalidState("no camera connected"));
            }
            *state = RecorderState::Busy;
        }

        match self.open_session(output_dir) {
            Ok(active) => {
                let dir = active.session_dir.clone();
                *self.state.lock() = RecorderState::Recording(active);
                Ok(dir)
            }
            Err(err) => {
                *self.state.lock() = RecorderState::Idle;
                Err(err)
            }
        }
    }

    fn open_session(&self, output_dir: &Path) -> CamsyncResult<ActiveRecording> {
        let created_at = Utc::now();
        let session_dir = create_session_dir(output_dir, created_at)?;
        let snapshot = self.registry.snapshot();

        let mut tracks = Vec::new();
        for camera in self.registry.connected_cameras() {
            let Some(mut mode) = self.registry.video_mode(camera) else {
                continue;
            };
            // Size the stream to what the camera is actually delivering.
            if let Some(frame) = snapshot.get(&camera) {
                mode.width = frame.width;
                mode.height = frame.height;
            }
            match create_writer(self.settings.encoding, &session_dir, camera, mode) {
                Ok((path, writer)) => {
                    let file = path
                        .file_name()
                        .map(|name| name.to_string_lossy().into_owned())
                        .unwrap_or_default();
                    tracks.push(CameraTrack {
                        camera,
                        file,
                        mode,
                        writer,
                        last_sequence: None,
                        last_timestamp: None,
                        failed: false,
                    });
                }
                Err(err) => {
                    log::error!(
                        "Recorder: could not open stream for camera {}: {:#}",
                        camera,
                        err
                    );
                }
            }
        }

        if tracks.is_empty() {
            if let Err(err) = std::fs::remove_dir_all(&session_dir) {
                log::warn!(
                    "Recorder: failed to remove {}: {}",
                    session_dir.display(),
                    err
                );
            }
            return Err(CamsyncError::storage(
                &session_dir,
                anyhow!("no camera stream could be opened"),
            ));
        }

        self.timeline
            .begin_session(tracks.iter().map(|track| track.camera));

        let stop = Arc::new(AtomicBool::new(false));
        let loop_stop = stop.clone();
        let registry = self.registry.clone();
        let timeline = self.timeline.clone();
        let period = Duration::from_secs_f64(1.0 / self.settings.max_rate_hz);
        let cameras = tracks.len();
        let join = std::thread::Builder::new()
            .name("camsync-recorder".to_string())
            .spawn(move || recording_loop(registry, timeline, tracks, loop_stop, period))
            .map_err(|err| CamsyncError::storage(&session_dir, anyhow!("spawn recorder: {}", err)))?;

        log::info!(
            "Recorder: recording {} camera(s) to {}",
            cameras,
            session_dir.display()
        );
        Ok(ActiveRecording {
            session_dir,
            created_at,
            stop,
            join,
        })
    }

    /// End the session and write its manifest. A no-op when not recording.
    pub fn stop(&self) -> CamsyncResult<Option<RecordingSummary>> {
        let active = {
            let mut state = self.state.lock();
            match std::mem::replace(&mut *state, RecorderState::Busy) {
                RecorderState::Recording(active) => active,
                other => {
                    *state = other;
                    return Ok(None);
                }
            }
        };

        let result = self.finish_session(active);
        *self.state.lock() = RecorderState::Idle;
        result.map(Some)
    }

    fn finish_session(&self, active: ActiveRecording) -> CamsyncResult<RecordingSummary> {
        active.stop.store(true, Ordering::SeqCst);
        let tracks = active.join.join().map_err(|_| {
            CamsyncError::storage(&active.session_dir, anyhow!("recording loop panicked"))
        })?;

        let mut frames_written = BTreeMap::new();
        let mut failed_cameras = Vec::new();
        let mut finished = Vec::new();
        for track in tracks {
            let camera = track.camera;
            frames_written.insert(camera, track.writer.frames_written());
            let failed = track.failed;
            if let Err(err) = track.writer.finish() {
                log::error!(
                    "Recorder: failed to finalize stream for camera {}: {:#}",
                    camera,
                    err
                );
                failed_cameras.push(camera);
            } else if failed {
                failed_cameras.push(camera);
            } else {
                finished.push((camera, track.file, track.mode));
            }
        }

        // Cameras missing from the manifest take no part in zero-basing.
        for camera in &failed_cameras {
            self.timeline.drop_camera(*camera);
        }
        self.timeline.end_session();
        let duration = self.timeline.duration();

        let streams = finished
            .into_iter()
            .map(|(camera, file, mode)| CameraStream {
                id: camera,
                file,
                encoding: self.settings.encoding,
                width: mode.width,
                height: mode.height,
                fps: mode.fps,
                timestamps: self.timeline.timestamps(camera),
            })
            .collect();

        let manifest = Manifest::new(active.created_at, duration, streams);
        manifest.write_atomic(&active.session_dir)?;
        log::info!(
            "Recorder: session {} finished ({:.2}s, {} camera(s))",
            active.session_dir.display(),
            duration,
            manifest.cameras.len()
        );

        Ok(RecordingSummary {
            session_dir: active.session_dir,
            manifest,
            frames_written,
            failed_cameras,
        })
    }
}

impl Drop for Recorder {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            log::error!("Recorder: stop on drop failed: {}", err);
        }
    }
}

fn recording_loop(
    registry: Arc<CaptureRegistry>,
    timeline: Arc<TimelineSync>,
    mut tracks: Vec<CameraTrack>,
    stop: Arc<AtomicBool>,
    period: Duration,
) -> Vec<CameraTrack> {
    while !stop.load(Ordering::SeqCst) {
        let tick = Instant::now();
        let snapshot = registry.snapshot();
        for track in tracks.iter_mut() {
            let Some(frame) = snapshot.get(&track.camera) else {
                continue;
            };
            if let Some(ordinal) = track.offer(frame) {
                timeline.record(track.camera, frame.timestamp, ordinal);
            }
        }
        if let Some(remaining) = period.checked_sub(tick.elapsed()) {
            std::thread::sleep(remaining);
        }
    }
    tracks
}

/// Create `output_dir/%Y%m%d_%H%M%S`, adding `_N` until the name is free.
fn create_session_dir(output_dir: &Path, created_at: DateTime<Utc>) -> CamsyncResult<PathBuf> {
    std::fs::create_dir_all(output_dir)
        .map_err(|err| CamsyncError::storage(output_dir, err.into()))?;
    let stamp = created_at
        .with_timezone(&Local)
        .format("%Y%m%d_%H%M%S")
        .to_string();
    for attempt in 0..1000u32 {
        let name = if attempt == 0 {
            stamp.clone()
        } else {
            format!("{}_{}", stamp, attempt)
        };
        let candidate = output_dir.join(name);
        match std::fs::create_dir(&candidate) {
            Ok(()) => return Ok(candidate),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => continue,
            Err(err) => return Err(CamsyncError::storage(&candidate, err.into())),
        }
    }
    Err(CamsyncError::storage(
        output_dir,
        anyhow!("no free session directory name for {}", stamp),
    ))
}
