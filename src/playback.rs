//! PlaybackEngine: clock-driven replay of a recorded session.
//!
//! State machine: `Idle -> Loaded -> Playing <-> Paused -> Idle` (on unload).
//!
//! One clock thread runs while playing. Each tick advances the position by
//! wall time times speed, wraps to 0 at the end of the session, looks up the
//! nearest frame of every camera and hands the resulting `FrameSet` to every
//! registered consumer. `pause` joins the clock thread, so no consumer sees a
//! frame set after it returns.

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::config::PlaybackSettings;
use crate::error::{CamsyncError, CamsyncResult};
use crate::frame::{CameraId, Frame};
use crate::manifest::Manifest;
use crate::storage::{open_reader, StreamReader};
use crate::timeline::{FrameOrdinal, TimelineSync};

/// Frames of every camera nearest to one playback position.
#[derive(Clone, Debug)]
pub struct FrameSet {
    pub position: f64,
    pub frames: BTreeMap<CameraId, Frame>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PlaybackStatus {
    Idle,
    Loaded,
    Playing,
    Paused,
}

/// Position, speed and run state, as one consistent snapshot.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PlaybackState {
    pub position: f64,
    pub speed: f64,
    pub status: PlaybackStatus,
}

pub type ConsumerId = u64;

enum Consumer {
    Callback(Arc<dyn Fn(&FrameSet) + Send + Sync>),
    Channel(Sender<FrameSet>),
}

// ----------------------------------------------------------------------------
// Loaded session
// ----------------------------------------------------------------------------

struct CameraReader {
    reader: Box<dyn StreamReader>,
    /// Last decoded frame and its ordinal.
    cached: Option<(FrameOrdinal, Frame)>,
}

impl CameraReader {
    fn frame(&mut self, ordinal: FrameOrdinal, timestamp: f64) -> anyhow::Result<Frame> {
        if let Some((cached_ordinal, frame)) = &self.cached {
            if *cached_ordinal == ordinal {
                return Ok(frame.clone());
            }
        }
        let frame = self.reader.read(ordinal)?.with_timestamp(timestamp);
        self.cached = Some((ordinal, frame.clone()));
        Ok(frame)
    }
}

struct LoadedSession {
    dir: PathBuf,
    manifest: Manifest,
    timeline: TimelineSync<FrameOrdinal>,
    readers: BTreeMap<CameraId, Mutex<CameraReader>>,
}

impl LoadedSession {
    fn open(location: &Path) -> CamsyncResult<Self> {
        let (dir, manifest) = Manifest::load(location)?;
        let mut tracks = BTreeMap::new();
        let mut readers = BTreeMap::new();
        for cam in &manifest.cameras {
            let path = dir.join(&cam.file);
            let reader = open_reader(cam.encoding, &path, cam.id)
                .map_err(|err| CamsyncError::manifest(&path, err))?;
            let entries = cam
                .timestamps
                .iter()
                .enumerate()
                .map(|(ordinal, t)| (*t, ordinal))
                .collect();
            tracks.insert(cam.id, entries);
            readers.insert(
                cam.id,
                Mutex::new(CameraReader {
                    reader,
                    cached: None,
                }),
            );
        }
        Ok(Self {
            dir,
            manifest,
            timeline: TimelineSync::from_tracks(tracks),
            readers,
        })
    }

    fn duration(&self) -> f64 {
        self.manifest.duration
    }

    fn frame_set(&self, position: f64) -> FrameSet {
        let mut frames = BTreeMap::new();
        for (camera, reader) in &self.readers {
            let Some((timestamp, ordinal)) = self.timeline.entry_near(*camera, position) else {
                continue;
            };
            match reader.lock().frame(ordinal, timestamp) {
                Ok(frame) => {
                    frames.insert(*camera, frame);
                }
                Err(err) => {
                    log::warn!(
                        "PlaybackEngine: camera {} frame {} unreadable: {:#}",
                        camera,
                        ordinal,
                        err
                    );
                }
            }
        }
        FrameSet { position, frames }
    }

    fn rewind(&self) {
        for (camera, reader) in &self.readers {
            if let Err(err) = reader.lock().reader.rewind() {
                log::warn!("PlaybackEngine: camera {} rewind failed: {:#}", camera, err);
            }
        }
    }
}

// ----------------------------------------------------------------------------
// Engine
// ----------------------------------------------------------------------------

struct Shared {
    settings: PlaybackSettings,
    session: RwLock<Option<Arc<LoadedSession>>>,
    state: Mutex<PlaybackState>,
    consumers: Mutex<Vec<(ConsumerId, Consumer)>>,
    next_consumer: AtomicU64,
}

impl Shared {
    fn session(&self) -> Option<Arc<LoadedSession>> {
        self.session.read().clone()
    }

    /// Deliver a frame set to every consumer. Consumer list is copied out so
    /// callbacks run without the lock held.
    fn emit(&self, set: &FrameSet) {
        if set.frames.is_empty() {
            return;
        }
        let targets: Vec<(ConsumerId, Consumer)> = self
            .consumers
            .lock()
            .iter()
            .map(|(id, consumer)| {
                let consumer = match consumer {
                    Consumer::Callback(cb) => Consumer::Callback(cb.clone()),
                    Consumer::Channel(tx) => Consumer::Channel(tx.clone()),
                };
                (*id, consumer)
            })
            .collect();

        let mut closed = Vec::new();
        for (id, consumer) in targets {
            match consumer {
                Consumer::Callback(cb) => cb(set),
                Consumer::Channel(tx) => match tx.try_send(set.clone()) {
                    Ok(()) | Err(TrySendError::Full(_)) => {}
                    Err(TrySendError::Disconnected(_)) => closed.push(id),
                },
            }
        }
        if !closed.is_empty() {
            self.consumers
                .lock()
                .retain(|(id, _)| !closed.contains(id));
        }
    }
}

struct ClockThread {
    stop: Arc<AtomicBool>,
    join: JoinHandle<()>,
}

pub struct PlaybackEngine {
    shared: Arc<Shared>,
    clock: Mutex<Option<ClockThread>>,
}

impl PlaybackEngine {
    pub fn new(settings: PlaybackSettings) -> Self {
        Self {
            shared: Arc::new(Shared {
                settings,
                session: RwLock::new(None),
                state: Mutex::new(PlaybackState {
                    position: 0.0,
                    speed: 1.0,
                    status: PlaybackStatus::Idle,
                }),
                consumers: Mutex::new(Vec::new()),
                next_consumer: AtomicU64::new(1),
            }),
            clock: Mutex::new(None),
        }
    }

    /// Load a session directory (or its manifest file). On failure the
    /// engine keeps whatever it had loaded before.
    pub fn load(&self, location: &Path) -> CamsyncResult<()> {
        let session = LoadedSession::open(location)?;
        self.pause();
        log::info!(
            "PlaybackEngine: loaded {} ({:.2}s, {} camera(s))",
            session.dir.display(),
            session.duration(),
            session.readers.len()
        );
        *self.shared.session.write() = Some(Arc::new(session));
        let mut state = self.shared.state.lock();
        state.position = 0.0;
        state.status = PlaybackStatus::Loaded;
        Ok(())
    }

    /// Drop the loaded session and return to `Idle`.
    pub fn unload(&self) {
        self.pause();
        *self.shared.session.write() = None;
        let mut state = self.shared.state.lock();
        state.position = 0.0;
        state.status = PlaybackStatus::Idle;
    }

    /// Start the clock. A no-op when already playing or nothing is loaded.
    pub fn play(&self) -> CamsyncResult<()> {
        let mut clock = self.clock.lock();
        if clock.is_some() {
            return Ok(());
        }
        let Some(session) = self.shared.session() else {
            log::debug!("PlaybackEngine: play ignored, nothing loaded");
            return Ok(());
        };

        let stop = Arc::new(AtomicBool::new(false));
        let loop_stop = stop.clone();
        let shared = self.shared.clone();
        let join = std::thread::Builder::new()
            .name("camsync-playback".to_string())
            .spawn(move || clock_loop(shared, session, loop_stop))
            .map_err(|err| {
                CamsyncError::storage(
                    self.session_dir().unwrap_or_default(),
                    anyhow::anyhow!("spawn playback clock: {}", err),
                )
            })?;
        self.shared.state.lock().status = PlaybackStatus::Playing;
        *clock = Some(ClockThread { stop, join });
        Ok(())
    }

    /// Stop the clock and wait for it. Safe to call in any state.
    pub fn pause(&self) {
        let Some(thread) = self.clock.lock().take() else {
            return;
        };
        thread.stop.store(true, Ordering::SeqCst);
        // A consumer pausing from inside a callback cannot join its own thread.
        if thread.join.thread().id() != std::thread::current().id()
            && thread.join.join().is_err()
        {
            log::error!("PlaybackEngine: clock thread panicked");
        }
        let mut state = self.shared.state.lock();
        if state.status == PlaybackStatus::Playing {
            state.status = PlaybackStatus::Paused;
        }
    }

    /// Move to `position`, clamped into the session. Legal while playing.
    pub fn seek(&self, position: f64) {
        let Some(session) = self.shared.session() else {
            return;
        };
        let position = clamp_position(position, session.duration());
        self.shared.state.lock().position = position;
        // Prime every camera's cache at the new position.
        let _ = session.frame_set(position);
    }

    /// Move one frame forward or back and deliver that frame set once.
    pub fn step(&self, forward: bool) -> CamsyncResult<FrameSet> {
        let Some(session) = self.shared.session() else {
            return Err(CamsyncError::InvalidState("no session loaded"));
        };
        let was_playing = self.status() == PlaybackStatus::Playing;
        if was_playing {
            self.pause();
        }

        let interval = session
            .timeline
            .smallest_interval()
            .filter(|dt| *dt > 0.0)
            .unwrap_or(self.shared.settings.default_step_secs);
        let position = {
            let mut state = self.shared.state.lock();
            let target = if forward {
                state.position + interval
            } else {
                state.position - interval
            };
            state.position = clamp_position(target, session.duration());
            state.position
        };

        let set = session.frame_set(position);
        self.shared.emit(&set);

        if was_playing {
            self.play()?;
        }
        Ok(set)
    }

    /// Clamp and apply a speed multiplier. Takes effect on the next tick.
    pub fn set_speed(&self, speed: f64) -> f64 {
        let speed = self.shared.settings.clamp_speed(speed);
        self.shared.state.lock().speed = speed;
        speed
    }

    /// Register a callback invoked with every emitted frame set. Callbacks run
    /// on the clock thread and must return quickly.
    pub fn register<F>(&self, callback: F) -> ConsumerId
    where
        F: Fn(&FrameSet) + Send + Sync + 'static,
    {
        self.add_consumer(Consumer::Callback(Arc::new(callback)))
    }

    /// Bounded, lossy subscription: frame sets that find the channel full are
    /// dropped for this subscriber.
    pub fn subscribe(&self, capacity: usize) -> (ConsumerId, Receiver<FrameSet>) {
        let (tx, rx) = bounded(capacity.max(1));
        (self.add_consumer(Consumer::Channel(tx)), rx)
    }

    fn add_consumer(&self, consumer: Consumer) -> ConsumerId {
        let id = self.shared.next_consumer.fetch_add(1, Ordering::Relaxed);
        self.shared.consumers.lock().push((id, consumer));
        id
    }

    pub fn unregister(&self, id: ConsumerId) -> bool {
        let mut consumers = self.shared.consumers.lock();
        let before = consumers.len();
        consumers.retain(|(existing, _)| *existing != id);
        consumers.len() != before
    }

    pub fn state(&self) -> PlaybackState {
        *self.shared.state.lock()
    }

    pub fn status(&self) -> PlaybackStatus {
        self.shared.state.lock().status
    }

    pub fn position(&self) -> f64 {
        self.shared.state.lock().position
    }

    pub fn speed(&self) -> f64 {
        self.shared.state.lock().speed
    }

    pub fn duration(&self) -> f64 {
        self.shared
            .session()
            .map_or(0.0, |session| session.duration())
    }

    pub fn camera_ids(&self) -> Vec<CameraId> {
        self.shared
            .session()
            .map(|session| session.readers.keys().copied().collect())
            .unwrap_or_default()
    }

    pub fn manifest(&self) -> Option<Manifest> {
        self.shared
            .session()
            .map(|session| session.manifest.clone())
    }

    pub fn session_dir(&self) -> Option<PathBuf> {
        self.shared.session().map(|session| session.dir.clone())
    }

    /// Frame set at the current position, without notifying consumers.
    pub fn current_frames(&self) -> Option<FrameSet> {
        let session = self.shared.session()?;
        Some(session.frame_set(self.position()))
    }
}

impl Drop for PlaybackEngine {
    fn drop(&mut self) {
        self.pause();
    }
}

fn clamp_position(position: f64, duration: f64) -> f64 {
    if position.is_nan() {
        return 0.0;
    }
    position.clamp(0.0, duration.max(0.0))
}

fn clock_loop(shared: Arc<Shared>, session: Arc<LoadedSession>, stop: Arc<AtomicBool>) {
    let tick = Duration::from_secs_f64(1.0 / shared.settings.max_tick_hz);
    let duration = session.duration();
    let mut last = Instant::now();

    while !stop.load(Ordering::SeqCst) {
        let now = Instant::now();
        let elapsed = now.duration_since(last).as_secs_f64();
        last = now;

        let (position, wrapped) = {
            let mut state = shared.state.lock();
            state.position += elapsed * state.speed;
            let wrapped = state.position >= duration;
            if wrapped {
                state.position = 0.0;
            }
            (state.position, wrapped && duration > 0.0)
        };
        if wrapped {
            log::debug!("PlaybackEngine: looped to start");
            session.rewind();
        }

        let set = session.frame_set(position);
        shared.emit(&set);

        if let Some(remaining) = tick.checked_sub(now.elapsed()) {
            std::thread::sleep(remaining);
        }
    }
}
