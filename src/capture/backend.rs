use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::normalize::PixelFormat;
use super::synthetic::SyntheticBackend;
#[cfg(feature = "capture-v4l2")]
use super::v4l2::V4l2Backend;
use crate::config::CaptureSettings;
use crate::error::ReadError;

/// How a camera is named to `FrameSource`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SourceDescriptor {
    /// Small non-negative device index.
    Index(u32),
    /// Platform device path, or `stub://name` for a synthetic camera.
    Path(String),
}

impl SourceDescriptor {
    pub fn is_synthetic(&self) -> bool {
        matches!(self, Self::Path(path) if path.starts_with("stub://"))
    }
}

impl FromStr for SourceDescriptor {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Err(anyhow!("empty camera descriptor"));
        }
        if s.bytes().all(|b| b.is_ascii_digit()) {
            let index = s
                .parse()
                .map_err(|_| anyhow!("camera index '{}' is out of range", s))?;
            return Ok(Self::Index(index));
        }
        Ok(Self::Path(s.to_string()))
    }
}

impl From<u32> for SourceDescriptor {
    fn from(index: u32) -> Self {
        Self::Index(index)
    }
}

impl fmt::Display for SourceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Index(index) => write!(f, "{}", index),
            Self::Path(path) => f.write_str(path),
        }
    }
}

/// Resolution and frame rate a device actually delivers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoMode {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

/// One image as read from a device, before normalization.
pub struct CapturedImage {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    /// Device-supplied capture time on the process monotonic clock, if known.
    pub timestamp: Option<f64>,
}

/// Device seam driven by `FrameSource`.
///
/// The setters mirror the order-sensitive negotiation camera drivers expect.
/// They return errors so the caller can log a refusal, but a refused setting
/// never aborts opening the device.
pub trait CaptureBackend: Send {
    /// Human-readable device name for logs.
    fn describe(&self) -> String;

    fn open(&mut self) -> Result<()>;

    fn set_codec_hint(&mut self, _fourcc: [u8; 4]) -> Result<()> {
        Ok(())
    }

    /// Close and open the device again so earlier hints take effect.
    fn reopen(&mut self) -> Result<()> {
        self.release();
        self.open()
    }

    fn set_resolution(&mut self, _width: u32, _height: u32) -> Result<()> {
        Ok(())
    }

    fn set_frame_rate(&mut self, _fps: u32) -> Result<()> {
        Ok(())
    }

    fn set_driver_buffers(&mut self, _count: u32) -> Result<()> {
        Ok(())
    }

    fn read(&mut self) -> Result<CapturedImage, ReadError>;

    /// What the device agreed to after negotiation.
    fn video_mode(&self) -> VideoMode;

    fn release(&mut self);
}

/// Pick a backend implementation for a descriptor.
pub fn resolve_backend(
    descriptor: &SourceDescriptor,
    settings: &CaptureSettings,
) -> Result<Box<dyn CaptureBackend>> {
    if descriptor.is_synthetic() {
        return Ok(Box::new(SyntheticBackend::new(
            descriptor.to_string(),
            settings,
        )));
    }
    #[cfg(feature = "capture-v4l2")]
    {
        let path = match descriptor {
            SourceDescriptor::Index(index) => format!("/dev/video{}", index),
            SourceDescriptor::Path(path) => path.clone(),
        };
        Ok(Box::new(V4l2Backend::new(path)))
    }
    #[cfg(not(feature = "capture-v4l2"))]
    {
        let _ = settings;
        Err(anyhow!(
            "camera '{}' requires the capture-v4l2 feature",
            descriptor
        ))
    }
}
