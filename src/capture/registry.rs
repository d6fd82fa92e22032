//! `CaptureRegistry`: owner of every active `FrameSource`, keyed by camera id.
//!
//! Devices are opened and threads joined outside the map lock; the lock only
//! guards inserts, removals and the per-camera buffer reads of a snapshot.

use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use super::backend::{CaptureBackend, SourceDescriptor, VideoMode};
use super::source::{FrameSource, SourceState, SourceStats};
use crate::config::CaptureSettings;
use crate::error::CamsyncResult;
use crate::frame::{CameraId, Frame};

/// Longest a snapshot waits on any one camera's buffer.
const SNAPSHOT_WAIT: Duration = Duration::from_millis(2);

pub struct CaptureRegistry {
    settings: CaptureSettings,
    sources: RwLock<BTreeMap<CameraId, FrameSource>>,
    capturing: AtomicBool,
}

impl CaptureRegistry {
    pub fn new(settings: CaptureSettings) -> Self {
        Self {
            settings,
            sources: RwLock::new(BTreeMap::new()),
            capturing: AtomicBool::new(false),
        }
    }

    pub fn settings(&self) -> &CaptureSettings {
        &self.settings
    }

    /// Open `descriptor` and register it under `id`, replacing (and stopping)
    /// any source already there. If capture is running the new source starts
    /// immediately.
    pub fn add_camera(&self, id: CameraId, descriptor: &SourceDescriptor) -> CamsyncResult<()> {
        self.remove_camera(id);
        let source = FrameSource::open(id, descriptor, &self.settings)?;
        self.install(id, source)
    }

    /// Same as `add_camera`, for a backend the caller constructed.
    pub fn add_camera_backend(
        &self,
        id: CameraId,
        backend: Box<dyn CaptureBackend>,
    ) -> CamsyncResult<()> {
        self.remove_camera(id);
        let source = FrameSource::open_with_backend(id, backend, &self.settings)?;
        self.install(id, source)
    }

    fn install(&self, id: CameraId, mut source: FrameSource) -> CamsyncResult<()> {
        if self.capturing.load(Ordering::SeqCst) {
            source.start()?;
        }
        let replaced = self.sources.write().insert(id, source);
        if let Some(mut old) = replaced {
            old.stop();
        }
        log::info!("CaptureRegistry: camera {} added", id);
        Ok(())
    }

    /// Stop and drop the source registered under `id`. Returns whether one was.
    pub fn remove_camera(&self, id: CameraId) -> bool {
        let removed = self.sources.write().remove(&id);
        match removed {
            Some(mut source) => {
                source.stop();
                log::info!("CaptureRegistry: camera {} removed", id);
                true
            }
            None => false,
        }
    }

    /// Start every registered source. Returns how many are running afterwards.
    pub fn start_all(&self) -> usize {
        self.capturing.store(true, Ordering::SeqCst);
        let mut sources = self.sources.write();
        let mut running = 0;
        for (id, source) in sources.iter_mut() {
            match source.start() {
                Ok(()) => running += 1,
                Err(err) => log::warn!("CaptureRegistry: camera {} not started: {}", id, err),
            }
        }
        log::info!(
            "CaptureRegistry: capture started ({}/{} cameras)",
            running,
            sources.len()
        );
        running
    }

    /// Stop and join every source, then clear the registry.
    pub fn stop_all(&self) {
        self.capturing.store(false, Ordering::SeqCst);
        let sources = std::mem::take(&mut *self.sources.write());
        let count = sources.len();
        for (_, mut source) in sources {
            source.stop();
        }
        if count > 0 {
            log::info!("CaptureRegistry: stopped {} camera(s)", count);
        }
    }

    /// Latest buffered frame per camera. Stopped cameras, cameras without a
    /// frame, and cameras whose buffer is momentarily contended are absent.
    pub fn snapshot(&self) -> BTreeMap<CameraId, Frame> {
        let sources = self.sources.read();
        sources
            .iter()
            .filter(|(_, source)| source.state() != SourceState::Stopped)
            .filter_map(|(id, source)| {
                source
                    .try_latest_frame(SNAPSHOT_WAIT)
                    .map(|frame| (*id, frame))
            })
            .collect()
    }

    /// Frames camera `id` captured within the last `window`, oldest first.
    pub fn recent_frames(&self, id: CameraId, window: Duration) -> Vec<Frame> {
        self.sources
            .read()
            .get(&id)
            .map(|source| source.recent_frames(window))
            .unwrap_or_default()
    }

    /// Registered and still holding its device.
    pub fn is_connected(&self, id: CameraId) -> bool {
        self.sources
            .read()
            .get(&id)
            .is_some_and(|source| source.state() != SourceState::Stopped)
    }

    pub fn is_capturing(&self) -> bool {
        self.capturing.load(Ordering::SeqCst)
            && self.sources.read().values().any(FrameSource::is_running)
    }

    pub fn connected_cameras(&self) -> Vec<CameraId> {
        self.sources
            .read()
            .iter()
            .filter(|(_, source)| source.state() != SourceState::Stopped)
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn video_mode(&self, id: CameraId) -> Option<VideoMode> {
        self.sources.read().get(&id).map(FrameSource::video_mode)
    }

    pub fn stats(&self) -> Vec<SourceStats> {
        self.sources.read().values().map(FrameSource::stats).collect()
    }

    pub fn len(&self) -> usize {
        self.sources.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for CaptureRegistry {
    fn drop(&mut self) {
        self.stop_all();
    }
}
