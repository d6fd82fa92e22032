//! Camera fed by another thread over a bounded channel.
//!
//! Hosts that already own a frame producer (and tests that need exact
//! timestamps) push `CapturedImage`s through a `FrameFeeder`; the acquisition
//! loop reads them like any device.

use anyhow::{anyhow, Result};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use std::time::Duration;

use super::backend::{CaptureBackend, CapturedImage, VideoMode};
use super::normalize::PixelFormat;
use crate::error::ReadError;

const POLL_INTERVAL: Duration = Duration::from_millis(10);

pub struct ChannelBackend {
    name: String,
    mode: VideoMode,
    rx: Receiver<CapturedImage>,
    opened: bool,
}

/// Producer half of a `ChannelBackend`. Dropping it disconnects the camera.
#[derive(Clone)]
pub struct FrameFeeder {
    tx: Sender<CapturedImage>,
}

impl ChannelBackend {
    pub fn new(name: impl Into<String>, mode: VideoMode, capacity: usize) -> (Self, FrameFeeder) {
        let (tx, rx) = bounded(capacity.max(1));
        let backend = Self {
            name: name.into(),
            mode,
            rx,
            opened: false,
        };
        (backend, FrameFeeder { tx })
    }
}

impl FrameFeeder {
    /// Queue an image without blocking. Fails if the queue is full or the
    /// camera has gone away.
    pub fn send(&self, image: CapturedImage) -> Result<()> {
        self.tx.try_send(image).map_err(|err| match err {
            TrySendError::Full(_) => anyhow!("channel camera queue is full"),
            TrySendError::Disconnected(_) => anyhow!("channel camera is closed"),
        })
    }

    /// Queue an RGB24 image stamped with an explicit capture time.
    pub fn send_rgb(&self, width: u32, height: u32, data: Vec<u8>, timestamp: f64) -> Result<()> {
        self.send(CapturedImage {
            data,
            width,
            height,
            format: PixelFormat::Rgb24,
            timestamp: Some(timestamp),
        })
    }
}

impl CaptureBackend for ChannelBackend {
    fn describe(&self) -> String {
        self.name.clone()
    }

    fn open(&mut self) -> Result<()> {
        self.opened = true;
        Ok(())
    }

    fn read(&mut self) -> Result<CapturedImage, ReadError> {
        if !self.opened {
            return Err(ReadError::Disconnected(anyhow!("{} is closed", self.name)));
        }
        match self.rx.recv_timeout(POLL_INTERVAL) {
            Ok(image) => Ok(image),
            Err(RecvTimeoutError::Timeout) => Err(ReadError::Idle),
            Err(RecvTimeoutError::Disconnected) => Err(ReadError::Disconnected(anyhow!(
                "{}: producer dropped",
                self.name
            ))),
        }
    }

    fn video_mode(&self) -> VideoMode {
        self.mode
    }

    fn release(&mut self) {
        self.opened = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mode() -> VideoMode {
        VideoMode {
            width: 2,
            height: 1,
            fps: 10,
        }
    }

    #[test]
    fn delivers_fed_images_in_order() -> Result<()> {
        let (mut backend, feeder) = ChannelBackend::new("chan://0", mode(), 4);
        backend.open()?;
        feeder.send_rgb(2, 1, vec![1; 6], 0.5)?;
        feeder.send_rgb(2, 1, vec![2; 6], 0.6)?;
        assert_eq!(backend.read()?.timestamp, Some(0.5));
        assert_eq!(backend.read()?.timestamp, Some(0.6));
        assert!(matches!(backend.read(), Err(ReadError::Idle)));
        Ok(())
    }

    #[test]
    fn full_queue_rejects_instead_of_blocking() -> Result<()> {
        let (_backend, feeder) = ChannelBackend::new("chan://0", mode(), 1);
        feeder.send_rgb(2, 1, vec![0; 6], 0.0)?;
        assert!(feeder.send_rgb(2, 1, vec![0; 6], 0.1).is_err());
        Ok(())
    }

    #[test]
    fn dropping_feeder_disconnects() -> Result<()> {
        let (mut backend, feeder) = ChannelBackend::new("chan://0", mode(), 1);
        backend.open()?;
        drop(feeder);
        assert!(matches!(backend.read(), Err(ReadError::Disconnected(_))));
        Ok(())
    }
}
