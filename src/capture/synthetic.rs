//! Synthetic camera (`stub://name`).
//!
//! Generates paced RGB frames with a moving pattern. Descriptors starting with
//! `stub://offline` refuse to open, which is how demos and tests model a
//! camera that is unplugged.

use anyhow::{anyhow, Result};
use std::time::{Duration, Instant};

use super::backend::{CaptureBackend, CapturedImage, VideoMode};
use super::normalize::PixelFormat;
use crate::config::CaptureSettings;
use crate::error::ReadError;

pub struct SyntheticBackend {
    name: String,
    mode: VideoMode,
    opened: bool,
    frame_count: u64,
    /// Simulated scene state, bumped every 50 frames.
    scene_state: u8,
    next_frame_at: Option<Instant>,
}

impl SyntheticBackend {
    pub fn new(name: String, settings: &CaptureSettings) -> Self {
        Self {
            name,
            mode: VideoMode {
                width: settings.width,
                height: settings.height,
                fps: settings.fps,
            },
            opened: false,
            frame_count: 0,
            scene_state: 0,
            next_frame_at: None,
        }
    }

    fn frame_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.mode.fps.max(1) as f64)
    }

    fn generate_synthetic_pixels(&mut self) -> Vec<u8> {
        let pixel_count = (self.mode.width as usize) * (self.mode.height as usize) * 3;

        if self.frame_count % 50 == 0 {
            self.scene_state = self.scene_state.wrapping_add(1);
        }

        let mut pixels = vec![0u8; pixel_count];
        for (i, pixel) in pixels.iter_mut().enumerate() {
            *pixel = ((i as u64 + self.frame_count + self.scene_state as u64) % 256) as u8;
        }
        pixels
    }
}

impl CaptureBackend for SyntheticBackend {
    fn describe(&self) -> String {
        self.name.clone()
    }

    fn open(&mut self) -> Result<()> {
        if self.name.starts_with("stub://offline") {
            return Err(anyhow!("{} is not connected", self.name));
        }
        self.opened = true;
        self.next_frame_at = None;
        log::info!("SyntheticBackend: opened {}", self.name);
        Ok(())
    }

    fn set_resolution(&mut self, width: u32, height: u32) -> Result<()> {
        if width == 0 || height == 0 {
            return Err(anyhow!("resolution {}x{} is not supported", width, height));
        }
        self.mode.width = width;
        self.mode.height = height;
        Ok(())
    }

    fn set_frame_rate(&mut self, fps: u32) -> Result<()> {
        if fps == 0 {
            return Err(anyhow!("frame rate must be non-zero"));
        }
        self.mode.fps = fps;
        Ok(())
    }

    fn read(&mut self) -> Result<CapturedImage, ReadError> {
        if !self.opened {
            return Err(ReadError::Disconnected(anyhow!("{} is closed", self.name)));
        }

        // Pace to the negotiated rate like a real sensor would.
        let now = Instant::now();
        let due = self.next_frame_at.unwrap_or(now);
        if due > now {
            std::thread::sleep(due - now);
        }
        self.next_frame_at = Some(due.max(now) + self.frame_interval());

        self.frame_count += 1;
        let data = self.generate_synthetic_pixels();
        Ok(CapturedImage {
            data,
            width: self.mode.width,
            height: self.mode.height,
            format: PixelFormat::Rgb24,
            timestamp: None,
        })
    }

    fn video_mode(&self) -> VideoMode {
        self.mode
    }

    fn release(&mut self) {
        self.opened = false;
    }
}
