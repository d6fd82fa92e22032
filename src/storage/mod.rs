//! Persisted per-camera streams.
//!
//! Every camera in a session is written to its own file,
//! `camera_{id}.{ext}`, through a `StreamWriter`, and read back by ordinal
//! through a `StreamReader`. Which container is used is a `StreamEncoding`.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::capture::VideoMode;
use crate::frame::{CameraId, Frame};

#[cfg(feature = "video-ffmpeg")]
mod ffmpeg;
mod raw;

pub use raw::{RawStreamReader, RawStreamWriter};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamEncoding {
    /// Framed RGB24, lossless. Always available.
    #[default]
    #[serde(rename = "raw-rgb24")]
    RawRgb24,
    /// H.264 in MP4 (requires the `video-ffmpeg` feature).
    #[serde(rename = "mp4")]
    Mp4,
}

impl StreamEncoding {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RawRgb24 => "raw-rgb24",
            Self::Mp4 => "mp4",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            Self::RawRgb24 => "rgb",
            Self::Mp4 => "mp4",
        }
    }

    pub fn file_name(&self, camera: CameraId) -> String {
        format!("camera_{}.{}", camera, self.extension())
    }

    pub fn is_available(&self) -> bool {
        match self {
            Self::RawRgb24 => true,
            Self::Mp4 => cfg!(feature = "video-ffmpeg"),
        }
    }
}

impl fmt::Display for StreamEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StreamEncoding {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "raw-rgb24" | "raw" | "rgb" => Ok(Self::RawRgb24),
            "mp4" => Ok(Self::Mp4),
            other => Err(anyhow!(
                "unknown stream encoding '{}' (expected raw-rgb24 or mp4)",
                other
            )),
        }
    }
}

/// Append-only sink for one camera's frames.
pub trait StreamWriter: Send {
    /// Append a frame, returning its ordinal within the stream.
    fn write(&mut self, frame: &Frame) -> Result<usize>;

    fn frames_written(&self) -> usize;

    /// Flush and close. The file is complete once this returns.
    fn finish(self: Box<Self>) -> Result<()>;
}

/// Random access over a finished stream.
pub trait StreamReader: Send {
    fn frame_count(&self) -> usize;

    /// Decode the frame at `ordinal`. The returned frame carries whatever
    /// timestamp the container stored; callers rebase it.
    fn read(&mut self, ordinal: usize) -> Result<Frame>;

    /// Return to the first frame, dropping any decoder state.
    fn rewind(&mut self) -> Result<()>;
}

/// Create the stream file for `camera` inside `dir`.
pub fn create_writer(
    encoding: StreamEncoding,
    dir: &Path,
    camera: CameraId,
    mode: VideoMode,
) -> Result<(PathBuf, Box<dyn StreamWriter>)> {
    let path = dir.join(encoding.file_name(camera));
    let writer: Box<dyn StreamWriter> = match encoding {
        StreamEncoding::RawRgb24 => Box::new(RawStreamWriter::create(&path, mode)?),
        #[cfg(feature = "video-ffmpeg")]
        StreamEncoding::Mp4 => Box::new(ffmpeg::Mp4StreamWriter::create(&path, mode)?),
        #[cfg(not(feature = "video-ffmpeg"))]
        StreamEncoding::Mp4 => {
            return Err(anyhow!("mp4 streams require the video-ffmpeg feature"));
        }
    };
    Ok((path, writer))
}

pub fn open_reader(
    encoding: StreamEncoding,
    path: &Path,
    camera: CameraId,
) -> Result<Box<dyn StreamReader>> {
    match encoding {
        StreamEncoding::RawRgb24 => Ok(Box::new(RawStreamReader::open(path, camera)?)),
        #[cfg(feature = "video-ffmpeg")]
        StreamEncoding::Mp4 => Ok(Box::new(ffmpeg::Mp4StreamReader::open(path, camera)?)),
        #[cfg(not(feature = "video-ffmpeg"))]
        StreamEncoding::Mp4 => {
            let _ = (path, camera);
            Err(anyhow!("mp4 streams require the video-ffmpeg feature"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encoding_names_round_trip_through_serde() {
        let json = serde_json::to_string(&StreamEncoding::RawRgb24).unwrap();
        assert_eq!(json, "\"raw-rgb24\"");
        let parsed: StreamEncoding = serde_json::from_str("\"mp4\"").unwrap();
        assert_eq!(parsed, StreamEncoding::Mp4);
        assert_eq!("RAW".parse::<StreamEncoding>().unwrap(), StreamEncoding::RawRgb24);
        assert!("avi".parse::<StreamEncoding>().is_err());
    }

    #[test]
    fn file_names_follow_camera_id() {
        assert_eq!(StreamEncoding::RawRgb24.file_name(CameraId(2)), "camera_2.rgb");
        assert_eq!(StreamEncoding::Mp4.file_name(CameraId(0)), "camera_0.mp4");
    }

    #[cfg(not(feature = "video-ffmpeg"))]
    #[test]
    fn mp4_without_feature_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let mode = VideoMode {
            width: 2,
            height: 2,
            fps: 30,
        };
        assert!(!StreamEncoding::Mp4.is_available());
        assert!(create_writer(StreamEncoding::Mp4, dir.path(), CameraId(0), mode).is_err());
    }
}
