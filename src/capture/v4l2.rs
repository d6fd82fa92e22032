//! V4L2 capture backend.
//!
//! The device is configured while idle and only starts streaming on the first
//! read, so every setter issued by `FrameSource` lands before buffers are
//! mapped.

use anyhow::{anyhow, Context, Result};
use ouroboros::self_referencing;

use super::backend::{CaptureBackend, CapturedImage, VideoMode};
use super::normalize::PixelFormat;
use crate::error::ReadError;

pub struct V4l2Backend {
    path: String,
    /// Opened, not yet streaming.
    device: Option<v4l::Device>,
    state: Option<DeviceV4l2State>,
    codec_hint: Option<[u8; 4]>,
    driver_buffers: u32,
    mode: VideoMode,
    format: PixelFormat,
}

#[self_referencing]
struct DeviceV4l2State {
    device: v4l::Device,
    #[borrows(mut device)]
    #[covariant]
    stream: v4l::prelude::MmapStream<'this, v4l::Device>,
}

impl V4l2Backend {
    pub fn new(path: String) -> Self {
        Self {
            path,
            device: None,
            state: None,
            codec_hint: None,
            driver_buffers: 1,
            mode: VideoMode {
                width: 0,
                height: 0,
                fps: 0,
            },
            format: PixelFormat::Rgb24,
        }
    }

    fn idle_device(&mut self) -> Result<&mut v4l::Device> {
        if self.state.is_some() {
            return Err(anyhow!("{} is already streaming", self.path));
        }
        self.device
            .as_mut()
            .ok_or_else(|| anyhow!("{} is not open", self.path))
    }

    fn apply_format(&mut self, resolution: Option<(u32, u32)>) -> Result<()> {
        use v4l::video::Capture;

        let hint = self.codec_hint;
        let path = self.path.clone();
        let device = self.idle_device()?;
        let mut format = device.format().context("read v4l2 format")?;
        if let Some((w, h)) = resolution {
            format.width = w;
            format.height = h;
        }
        if let Some(fourcc) = hint {
            format.fourcc = v4l::FourCC::new(&fourcc);
        }
        let applied = match device.set_format(&format) {
            Ok(applied) => applied,
            Err(err) => {
                log::warn!("V4l2Backend: failed to set format on {}: {}", path, err);
                device
                    .format()
                    .context("read v4l2 format after set failure")?
            }
        };
        self.mode.width = applied.width;
        self.mode.height = applied.height;
        self.format = PixelFormat::from_fourcc(&applied.fourcc.repr).ok_or_else(|| {
            anyhow!(
                "{} delivers unsupported pixel format {}",
                path,
                applied.fourcc
            )
        })?;
        Ok(())
    }

    fn start_streaming(&mut self) -> Result<()> {
        use v4l::buffer::Type;

        let device = self
            .device
            .take()
            .ok_or_else(|| anyhow!("{} is not open", self.path))?;
        let buffers = self.driver_buffers.max(1);
        let state = DeviceV4l2StateBuilder {
            device,
            stream_builder: |device| {
                v4l::prelude::MmapStream::with_buffers(device, Type::VideoCapture, buffers)
                    .map_err(|err| anyhow::Error::new(err).context("create v4l2 buffer stream"))
            },
        }
        .try_build()?;
        self.state = Some(state);
        log::debug!(
            "V4l2Backend: streaming {} with {} buffer(s)",
            self.path,
            buffers
        );
        Ok(())
    }
}

impl CaptureBackend for V4l2Backend {
    fn describe(&self) -> String {
        self.path.clone()
    }

    fn open(&mut self) -> Result<()> {
        use v4l::video::Capture;

        let device = v4l::Device::with_path(&self.path)
            .with_context(|| format!("open v4l2 device {}", self.path))?;
        let format = device.format().context("read v4l2 format")?;
        self.mode.width = format.width;
        self.mode.height = format.height;
        self.format = PixelFormat::from_fourcc(&format.fourcc.repr).unwrap_or(PixelFormat::Rgb24);
        if let Ok(params) = device.params() {
            let interval = params.interval;
            if interval.numerator > 0 {
                self.mode.fps = interval.denominator / interval.numerator;
            }
        }
        self.device = Some(device);
        Ok(())
    }

    fn set_codec_hint(&mut self, fourcc: [u8; 4]) -> Result<()> {
        self.codec_hint = Some(fourcc);
        self.apply_format(None)
    }

    fn set_resolution(&mut self, width: u32, height: u32) -> Result<()> {
        self.apply_format(Some((width, height)))?;
        if self.mode.width != width || self.mode.height != height {
            return Err(anyhow!(
                "driver chose {}x{}",
                self.mode.width,
                self.mode.height
            ));
        }
        Ok(())
    }

    fn set_frame_rate(&mut self, fps: u32) -> Result<()> {
        use v4l::video::Capture;

        let device = self.idle_device()?;
        let params = v4l::video::capture::Parameters::with_fps(fps);
        let applied = device.set_params(&params).context("set v4l2 frame rate")?;
        let interval = applied.interval;
        if interval.numerator > 0 {
            self.mode.fps = interval.denominator / interval.numerator;
        }
        Ok(())
    }

    fn set_driver_buffers(&mut self, count: u32) -> Result<()> {
        self.driver_buffers = count.max(1);
        Ok(())
    }

    fn read(&mut self) -> Result<CapturedImage, ReadError> {
        use v4l::io::traits::CaptureStream;

        if self.state.is_none() {
            self.start_streaming().map_err(ReadError::Disconnected)?;
        }
        let Some(state) = self.state.as_mut() else {
            return Err(ReadError::Disconnected(anyhow!("{} is not open", self.path)));
        };
        let data = state
            .with_mut(|fields| fields.stream.next().map(|(buf, _meta)| buf.to_vec()))
            .map_err(|err| match err.kind() {
                std::io::ErrorKind::NotFound | std::io::ErrorKind::BrokenPipe => {
                    ReadError::Disconnected(anyhow::Error::new(err))
                }
                _ => ReadError::Transient(anyhow::Error::new(err).context("capture v4l2 frame")),
            })?;

        Ok(CapturedImage {
            data,
            width: self.mode.width,
            height: self.mode.height,
            format: self.format,
            timestamp: None,
        })
    }

    fn video_mode(&self) -> VideoMode {
        self.mode
    }

    fn release(&mut self) {
        self.state = None;
        self.device = None;
    }
}
