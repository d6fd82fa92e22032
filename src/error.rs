//! Error taxonomy for capture, recording and playback.
//!
//! Only failures that make a whole operation meaningless leave the crate as a
//! `CamsyncError`. Per-frame problems are `ReadError`s and stay inside the
//! acquisition loop that produced them.

use std::path::PathBuf;

use thiserror::Error;

use crate::frame::CameraId;

#[derive(Error, Debug)]
pub enum CamsyncError {
    /// The camera could not be opened or never produced a usable frame.
    #[error("camera {camera} ({descriptor}) could not be opened: {source}")]
    DeviceOpen {
        camera: CameraId,
        descriptor: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("storage error at {}: {source}", path.display())]
    Storage {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },

    #[error("manifest error at {}: {source}", path.display())]
    Manifest {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },

    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    #[error("configuration error: {0}")]
    Config(#[source] anyhow::Error),
}

impl CamsyncError {
    pub(crate) fn storage(path: impl Into<PathBuf>, source: anyhow::Error) -> Self {
        Self::Storage {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn manifest(path: impl Into<PathBuf>, source: anyhow::Error) -> Self {
        Self::Manifest {
            path: path.into(),
            source,
        }
    }

    /// Stable short code, used by the binaries when reporting failures.
    pub fn code(&self) -> &'static str {
        match self {
            Self::DeviceOpen { .. } => "DEVICE_OPEN",
            Self::Storage { .. } => "STORAGE",
            Self::Manifest { .. } => "MANIFEST",
            Self::InvalidState(_) => "INVALID_STATE",
            Self::Config(_) => "CONFIG",
        }
    }
}

/// A failed read from a capture backend.
#[derive(Error, Debug)]
pub enum ReadError {
    /// A single bad read. The acquisition loop logs it and keeps going.
    #[error("transient read failure: {0}")]
    Transient(#[source] anyhow::Error),

    /// Nothing arrived within the backend's poll interval. Not a failure.
    #[error("no frame ready")]
    Idle,

    /// The device is gone. The acquisition loop exits.
    #[error("device disconnected: {0}")]
    Disconnected(#[source] anyhow::Error),
}

pub type CamsyncResult<T> = Result<T, CamsyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        let err = CamsyncError::InvalidState("already recording");
        assert_eq!(err.code(), "INVALID_STATE");
        assert_eq!(err.to_string(), "invalid state: already recording");

        let err = CamsyncError::manifest("/tmp/x/manifest.json", anyhow::anyhow!("missing"));
        assert_eq!(err.code(), "MANIFEST");
        assert!(err.to_string().contains("manifest.json"));
    }
}
