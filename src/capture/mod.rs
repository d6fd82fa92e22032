//! Camera acquisition.
//!
//! - `backend`: the device seam and descriptor parsing
//! - `source`: one camera's acquisition loop (`FrameSource`)
//! - `registry`: the owned collection of sources (`CaptureRegistry`)
//! - `probe`: device enumeration

pub mod backend;
pub mod channel;
pub mod normalize;
pub mod probe;
pub mod registry;
pub mod source;
pub mod synthetic;
#[cfg(feature = "capture-v4l2")]
pub mod v4l2;

pub use backend::{resolve_backend, CaptureBackend, CapturedImage, SourceDescriptor, VideoMode};
pub use channel::{ChannelBackend, FrameFeeder};
pub use normalize::{normalize_to_rgb, PixelFormat};
pub use probe::{probe_cameras, ProbeResult};
pub use registry::CaptureRegistry;
pub use source::{FrameSource, SourceState, SourceStats};
pub use synthetic::SyntheticBackend;
#[cfg(feature = "capture-v4l2")]
pub use v4l2::V4l2Backend;
