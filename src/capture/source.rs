//! `FrameSource`: one camera, one acquisition thread, one lossy buffer.
//!
//! Opening a source runs the driver negotiation synchronously, in the order
//! drivers expect: codec hint, reopen, resolution, frame rate, driver buffers,
//! warm-up discard, first-frame verification, optional rate probe. Only then
//! is the device handed to the acquisition thread, which owns it exclusively
//! until the loop ends.

use anyhow::anyhow;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use super::backend::{resolve_backend, CaptureBackend, CapturedImage, SourceDescriptor, VideoMode};
use super::normalize::normalize_to_rgb;
use crate::config::CaptureSettings;
use crate::error::{CamsyncError, CamsyncResult, ReadError};
use crate::frame::{monotonic_now, CameraId, Frame, FrameBuffer};

/// How long `open` waits for a first usable frame.
const VERIFY_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SourceState {
    /// Opened and verified, loop not started.
    Ready,
    Running,
    /// Terminal. The device handle has been released.
    Stopped,
}

impl SourceState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Ready,
            1 => Self::Running,
            _ => Self::Stopped,
        }
    }
}

/// Counters for one source.
#[derive(Clone, Debug)]
pub struct SourceStats {
    pub camera: CameraId,
    pub descriptor: String,
    pub state: SourceState,
    pub frames_captured: u64,
    pub frames_dropped: u64,
    pub read_failures: u64,
    /// Result of the open-time rate probe, if one ran.
    pub probe_fps: Option<f64>,
    pub low_frame_rate: bool,
}

struct SourceShared {
    buffer: FrameBuffer,
    stop: AtomicBool,
    state: AtomicU8,
    frames_captured: AtomicU64,
    frames_dropped: AtomicU64,
    read_failures: AtomicU64,
}

impl SourceShared {
    fn set_state(&self, state: SourceState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    fn state(&self) -> SourceState {
        SourceState::from_u8(self.state.load(Ordering::SeqCst))
    }
}

pub struct FrameSource {
    camera: CameraId,
    descriptor: String,
    mode: VideoMode,
    settings: CaptureSettings,
    shared: Arc<SourceShared>,
    /// Held here until `start` moves it onto the acquisition thread.
    backend: Mutex<Option<Box<dyn CaptureBackend>>>,
    join: Mutex<Option<JoinHandle<()>>>,
    probe_fps: Option<f64>,
    low_frame_rate: bool,
}

impl FrameSource {
    /// Resolve a descriptor to a backend and open it.
    pub fn open(
        camera: CameraId,
        descriptor: &SourceDescriptor,
        settings: &CaptureSettings,
    ) -> CamsyncResult<Self> {
        let backend = resolve_backend(descriptor, settings).map_err(|source| {
            CamsyncError::DeviceOpen {
                camera,
                descriptor: descriptor.to_string(),
                source,
            }
        })?;
        Self::open_with_backend(camera, backend, settings)
    }

    /// Run the initialization protocol against an already constructed backend.
    pub fn open_with_backend(
        camera: CameraId,
        mut backend: Box<dyn CaptureBackend>,
        settings: &CaptureSettings,
    ) -> CamsyncResult<Self> {
        let descriptor = backend.describe();
        let open_err = |source: anyhow::Error| CamsyncError::DeviceOpen {
            camera,
            descriptor: descriptor.clone(),
            source,
        };

        backend.open().map_err(open_err)?;

        let fourcc = settings.codec_fourcc();
        if let Err(err) = backend.set_codec_hint(fourcc) {
            log::warn!(
                "FrameSource[{}]: codec hint {} refused: {}",
                camera,
                String::from_utf8_lossy(&fourcc),
                err
            );
        }
        if let Err(err) = backend.reopen() {
            backend.release();
            return Err(open_err(err.context("reopen after codec hint")));
        }
        if let Err(err) = backend.set_resolution(settings.width, settings.height) {
            log::warn!(
                "FrameSource[{}]: resolution {}x{} refused: {}",
                camera,
                settings.width,
                settings.height,
                err
            );
        }
        if let Err(err) = backend.set_frame_rate(settings.fps) {
            log::warn!(
                "FrameSource[{}]: frame rate {} refused: {}",
                camera,
                settings.fps,
                err
            );
        }
        if let Err(err) = backend.set_driver_buffers(settings.driver_buffers) {
            log::warn!(
                "FrameSource[{}]: driver buffer count {} refused: {}",
                camera,
                settings.driver_buffers,
                err
            );
        }

        let mode = backend.video_mode();
        log::debug!(
            "FrameSource[{}]: {} negotiated {}x{} @ {}fps",
            camera,
            descriptor,
            mode.width,
            mode.height,
            mode.fps
        );

        // Devices commonly emit garbage right after open.
        for _ in 0..settings.warmup_frames {
            match backend.read() {
                Ok(_) | Err(ReadError::Idle) => {}
                Err(ReadError::Transient(err)) => {
                    log::warn!("FrameSource[{}]: warm-up read failed: {}", camera, err);
                }
                Err(ReadError::Disconnected(err)) => {
                    backend.release();
                    return Err(open_err(err.context("device lost during warm-up")));
                }
            }
        }

        if let Err(err) = verify_first_frame(backend.as_mut(), camera) {
            backend.release();
            return Err(open_err(err));
        }

        let (probe_fps, low_frame_rate) = match settings.probe {
            Some(window) => {
                let achieved = probe_frame_rate(backend.as_mut(), window);
                let floor = mode.fps as f64 * settings.low_rate_ratio;
                let low = achieved < floor;
                if low {
                    log::warn!(
                        "FrameSource[{}]: low frame rate detected: {:.1}fps (requested {})",
                        camera,
                        achieved,
                        mode.fps
                    );
                } else {
                    log::debug!("FrameSource[{}]: probe achieved {:.1}fps", camera, achieved);
                }
                (Some(achieved), low)
            }
            None => (None, false),
        };

        log::info!(
            "FrameSource[{}]: opened {} ({}x{} @ {}fps)",
            camera,
            descriptor,
            mode.width,
            mode.height,
            mode.fps
        );

        Ok(Self {
            camera,
            descriptor,
            mode,
            settings: settings.clone(),
            shared: Arc::new(SourceShared {
                buffer: FrameBuffer::new(settings.buffer_capacity),
                stop: AtomicBool::new(false),
                state: AtomicU8::new(SourceState::Ready as u8),
                frames_captured: AtomicU64::new(0),
                frames_dropped: AtomicU64::new(0),
                read_failures: AtomicU64::new(0),
            }),
            backend: Mutex::new(Some(backend)),
            join: Mutex::new(None),
            probe_fps,
            low_frame_rate,
        })
    }

    /// Start the acquisition loop on its own thread.
    pub fn start(&mut self) -> CamsyncResult<()> {
        if self.state() == SourceState::Running {
            return Ok(());
        }
        let Some(backend) = self.backend.get_mut().take() else {
            return Err(CamsyncError::InvalidState("frame source already stopped"));
        };

        self.shared.stop.store(false, Ordering::SeqCst);
        self.shared.set_state(SourceState::Running);
        let camera = self.camera;
        let shared = self.shared.clone();
        let settings = self.settings.clone();
        let handle = std::thread::Builder::new()
            .name(format!("camsync-cam-{}", camera))
            .spawn(move || acquisition_loop(camera, backend, shared, settings))
            .map_err(|err| {
                self.shared.set_state(SourceState::Stopped);
                CamsyncError::DeviceOpen {
                    camera,
                    descriptor: self.descriptor.clone(),
                    source: anyhow!("spawn acquisition thread: {}", err),
                }
            })?;
        *self.join.lock() = Some(handle);
        Ok(())
    }

    /// Signal the loop and wait for it. Safe to call repeatedly.
    pub fn stop(&mut self) {
        self.shared.stop.store(true, Ordering::SeqCst);
        let handle = self.join.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                log::error!("FrameSource[{}]: acquisition thread panicked", self.camera);
            }
        }
        if let Some(mut backend) = self.backend.get_mut().take() {
            backend.release();
        }
        self.shared.set_state(SourceState::Stopped);
    }

    pub fn latest_frame(&self) -> Option<Frame> {
        self.shared.buffer.latest()
    }

    /// Buffered frames from the last `window` of the capture clock, oldest
    /// first. How far back this reaches is bounded by the buffer capacity.
    pub fn recent_frames(&self, window: Duration) -> Vec<Frame> {
        self.shared.buffer.since(monotonic_now() - window.as_secs_f64())
    }

    /// Non-blocking variant used by registry snapshots.
    pub fn try_latest_frame(&self, timeout: Duration) -> Option<Frame> {
        self.shared.buffer.try_latest(timeout)
    }

    pub fn camera(&self) -> CameraId {
        self.camera
    }

    pub fn descriptor(&self) -> &str {
        &self.descriptor
    }

    pub fn video_mode(&self) -> VideoMode {
        self.mode
    }

    pub fn state(&self) -> SourceState {
        self.shared.state()
    }

    pub fn is_running(&self) -> bool {
        self.state() == SourceState::Running
    }

    pub fn stats(&self) -> SourceStats {
        SourceStats {
            camera: self.camera,
            descriptor: self.descriptor.clone(),
            state: self.state(),
            frames_captured: self.shared.frames_captured.load(Ordering::Relaxed),
            frames_dropped: self.shared.frames_dropped.load(Ordering::Relaxed),
            read_failures: self.shared.read_failures.load(Ordering::Relaxed),
            probe_fps: self.probe_fps,
            low_frame_rate: self.low_frame_rate,
        }
    }
}

impl Drop for FrameSource {
    fn drop(&mut self) {
        self.stop();
    }
}

fn verify_first_frame(backend: &mut dyn CaptureBackend, camera: CameraId) -> anyhow::Result<()> {
    let deadline = Instant::now() + VERIFY_TIMEOUT;
    let mut last_error = None;
    while Instant::now() < deadline {
        match backend.read() {
            Ok(image) => match normalize(camera, 0, image) {
                Ok(_) => return Ok(()),
                Err(err) => last_error = Some(err),
            },
            Err(ReadError::Idle) => {}
            Err(ReadError::Transient(err)) => last_error = Some(err),
            Err(ReadError::Disconnected(err)) => return Err(err.context("device lost")),
        }
    }
    Err(match last_error {
        Some(err) => err.context("no verifiable first frame"),
        None => anyhow!("no frame within {:?}", VERIFY_TIMEOUT),
    })
}

fn probe_frame_rate(backend: &mut dyn CaptureBackend, window: Duration) -> f64 {
    let start = Instant::now();
    let mut frames = 0u64;
    while start.elapsed() < window {
        match backend.read() {
            Ok(_) => frames += 1,
            Err(ReadError::Disconnected(_)) => break,
            Err(_) => {}
        }
    }
    frames as f64 / window.as_secs_f64()
}

fn normalize(camera: CameraId, sequence: u64, image: CapturedImage) -> anyhow::Result<Frame> {
    let rgb = normalize_to_rgb(&image.data, image.width, image.height, image.format)?;
    let timestamp = image.timestamp.unwrap_or_else(monotonic_now);
    Frame::from_rgb(camera, sequence, timestamp, image.width, image.height, rgb)
}

fn acquisition_loop(
    camera: CameraId,
    mut backend: Box<dyn CaptureBackend>,
    shared: Arc<SourceShared>,
    settings: CaptureSettings,
) {
    let mut sequence = 0u64;
    let mut consecutive_failures = 0u32;
    let mut window_frames = 0u64;
    let mut window_start = Instant::now();

    while !shared.stop.load(Ordering::SeqCst) {
        let failure = match backend.read() {
            Ok(image) => match normalize(camera, sequence, image) {
                Ok(frame) => {
                    sequence += 1;
                    consecutive_failures = 0;
                    let evicted = shared.buffer.push(frame);
                    shared.frames_captured.fetch_add(1, Ordering::Relaxed);
                    shared
                        .frames_dropped
                        .fetch_add(evicted as u64, Ordering::Relaxed);

                    window_frames += 1;
                    let elapsed = window_start.elapsed();
                    if elapsed >= Duration::from_secs(1) {
                        log::debug!(
                            "FrameSource[{}]: {:.1}fps",
                            camera,
                            window_frames as f64 / elapsed.as_secs_f64()
                        );
                        window_frames = 0;
                        window_start = Instant::now();
                    }
                    None
                }
                Err(err) => Some(err.context("frame conversion failed")),
            },
            Err(ReadError::Idle) => None,
            Err(ReadError::Transient(err)) => Some(err),
            Err(ReadError::Disconnected(err)) => {
                log::error!("FrameSource[{}]: device lost: {}", camera, err);
                break;
            }
        };

        if let Some(err) = failure {
            consecutive_failures += 1;
            let total = shared.read_failures.fetch_add(1, Ordering::Relaxed) + 1;
            if consecutive_failures == 1 || total % 30 == 0 {
                log::warn!(
                    "FrameSource[{}]: failed to read frame ({} total): {}",
                    camera,
                    total,
                    err
                );
            }
            if settings.max_consecutive_failures > 0
                && consecutive_failures >= settings.max_consecutive_failures
            {
                log::error!(
                    "FrameSource[{}]: {} consecutive read failures, stopping",
                    camera,
                    consecutive_failures
                );
                break;
            }
        }
    }

    backend.release();
    // A dead camera must not keep serving its last image.
    shared.buffer.clear();
    shared.set_state(SourceState::Stopped);
    log::info!("FrameSource[{}]: acquisition stopped", camera);
}
