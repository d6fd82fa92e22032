//! camsync: multi-camera capture, synchronized recording and replay.
//!
//! # Architecture
//!
//! Cameras are not genlocked. Every frame is stamped on one process-wide
//! monotonic clock at capture time, and frames from different cameras are
//! associated by timestamp proximity only.
//!
//! - `capture`: device backends, `FrameSource` (one acquisition thread per
//!   camera) and `CaptureRegistry` (the owned set of sources)
//! - `timeline`: per-camera timestamp index with nearest-frame lookup
//! - `recorder`: registry snapshots into per-camera streams plus a manifest
//! - `playback`: clock-driven replay of a recorded session
//! - `storage` / `manifest`: the persisted session layout
//!
//! Loss is a policy, not an error: frame buffers evict the oldest frame, the
//! recorder skips cameras with nothing new, and playback consumers that fall
//! behind on a channel miss frame sets.

pub mod capture;
pub mod config;
pub mod error;
pub mod frame;
pub mod manifest;
pub mod playback;
pub mod recorder;
pub mod storage;
pub mod timeline;

pub use capture::{
    probe_cameras, CaptureBackend, CaptureRegistry, ChannelBackend, FrameFeeder, FrameSource,
    ProbeResult, SourceDescriptor, VideoMode,
};
pub use config::{CamsyncConfig, CaptureSettings, PlaybackSettings, RecordingSettings};
pub use error::{CamsyncError, CamsyncResult, ReadError};
pub use frame::{monotonic_now, CameraId, Frame, FrameBuffer};
pub use manifest::{CameraStream, Manifest};
pub use playback::{ConsumerId, FrameSet, PlaybackEngine, PlaybackState, PlaybackStatus};
pub use recorder::{Recorder, RecordingSummary};
pub use storage::StreamEncoding;
pub use timeline::TimelineSync;
