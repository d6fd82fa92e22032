//! Camera enumeration: try each device index and report what answers.

use serde::Serialize;

use super::backend::{resolve_backend, SourceDescriptor, VideoMode};
use crate::config::CaptureSettings;
use crate::error::ReadError;

/// Reads attempted per candidate before giving up on it.
const PROBE_READ_ATTEMPTS: u32 = 20;

#[derive(Clone, Debug, Serialize)]
pub struct ProbeResult {
    pub index: u32,
    pub available: bool,
    pub mode: Option<VideoMode>,
}

/// Open indices `0..max_index` one at a time and read a single frame from each.
pub fn probe_cameras(max_index: u32, settings: &CaptureSettings) -> Vec<ProbeResult> {
    (0..max_index)
        .map(|index| probe_index(index, settings))
        .collect()
}

fn probe_index(index: u32, settings: &CaptureSettings) -> ProbeResult {
    let unavailable = ProbeResult {
        index,
        available: false,
        mode: None,
    };
    let descriptor = SourceDescriptor::Index(index);
    let mut backend = match resolve_backend(&descriptor, settings) {
        Ok(backend) => backend,
        Err(err) => {
            log::debug!("probe: index {} skipped: {}", index, err);
            return unavailable;
        }
    };
    if let Err(err) = backend.open() {
        log::debug!("probe: index {} did not open: {}", index, err);
        return unavailable;
    }

    let mut result = unavailable;
    for _ in 0..PROBE_READ_ATTEMPTS {
        match backend.read() {
            Ok(image) => {
                let mut mode = backend.video_mode();
                mode.width = image.width;
                mode.height = image.height;
                result.available = true;
                result.mode = Some(mode);
                break;
            }
            Err(ReadError::Disconnected(_)) => break,
            Err(_) => {}
        }
    }
    backend.release();
    log::info!(
        "probe: index {} {}",
        index,
        if result.available { "available" } else { "unavailable" }
    );
    result
}
