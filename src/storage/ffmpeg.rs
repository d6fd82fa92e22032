//! MP4 streams.
//!
//! Encoding pipes raw RGB24 into an `ffmpeg` child process; decoding goes
//! through `ffmpeg-next`. Frames come back in write order, so the ordinal of a
//! decoded frame is its position in decode order.

use anyhow::{anyhow, Context, Result};
use ffmpeg_next as ffmpeg;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, Stdio};

use super::{StreamReader, StreamWriter};
use crate::capture::VideoMode;
use crate::frame::{CameraId, Frame};

pub struct Mp4StreamWriter {
    path: PathBuf,
    mode: VideoMode,
    process: Child,
    stdin: Option<ChildStdin>,
    frames: usize,
}

impl Mp4StreamWriter {
    pub fn create(path: &Path, mode: VideoMode) -> Result<Self> {
        let output = path
            .to_str()
            .ok_or_else(|| anyhow!("stream path {} is not valid UTF-8", path.display()))?;
        let mut process = Command::new("ffmpeg")
            .args([
                "-y",
                "-loglevel",
                "error",
                "-f",
                "rawvideo",
                "-pix_fmt",
                "rgb24",
                "-s",
                &format!("{}x{}", mode.width, mode.height),
                "-r",
                &mode.fps.max(1).to_string(),
                "-i",
                "-",
                "-c:v",
                "libx264",
                "-preset",
                "veryfast",
                "-pix_fmt",
                "yuv420p",
                output,
            ])
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .context("start ffmpeg encoder")?;
        let stdin = process
            .stdin
            .take()
            .ok_or_else(|| anyhow!("failed to capture ffmpeg stdin"))?;
        Ok(Self {
            path: path.to_path_buf(),
            mode,
            process,
            stdin: Some(stdin),
            frames: 0,
        })
    }
}

impl StreamWriter for Mp4StreamWriter {
    fn write(&mut self, frame: &Frame) -> Result<usize> {
        if frame.width != self.mode.width || frame.height != self.mode.height {
            return Err(anyhow!(
                "frame is {}x{} but {} was opened at {}x{}",
                frame.width,
                frame.height,
                self.path.display(),
                self.mode.width,
                self.mode.height
            ));
        }
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| anyhow!("encoder already finished"))?;
        stdin
            .write_all(frame.pixels())
            .context("write frame to ffmpeg")?;
        let ordinal = self.frames;
        self.frames += 1;
        Ok(ordinal)
    }

    fn frames_written(&self) -> usize {
        self.frames
    }

    fn finish(mut self: Box<Self>) -> Result<()> {
        // Closing stdin is the end-of-stream signal.
        drop(self.stdin.take());
        let output = self
            .process
            .wait_with_output()
            .context("wait for ffmpeg encoder")?;
        if !output.status.success() {
            return Err(anyhow!(
                "ffmpeg exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }
        log::debug!(
            "Mp4StreamWriter: {} finished with {} frames",
            self.path.display(),
            self.frames
        );
        Ok(())
    }
}

struct DecodeState {
    input: ffmpeg::format::context::Input,
    stream_index: usize,
    decoder: ffmpeg::codec::decoder::Video,
    scaler: ffmpeg::software::scaling::Context,
    /// Seconds per pts tick.
    time_base: f64,
    flushed: bool,
}

pub struct Mp4StreamReader {
    camera: CameraId,
    path: PathBuf,
    frame_count: usize,
    state: DecodeState,
    /// Ordinal the next decoded frame will have.
    next_ordinal: usize,
}

impl Mp4StreamReader {
    pub fn open(path: &Path, camera: CameraId) -> Result<Self> {
        ffmpeg::init().context("initialize ffmpeg")?;
        let frame_count = count_video_packets(path)?;
        let state = open_decoder(path)?;
        Ok(Self {
            camera,
            path: path.to_path_buf(),
            frame_count,
            state,
            next_ordinal: 0,
        })
    }

    fn decode_next(&mut self) -> Result<Frame> {
        let mut decoded = ffmpeg::frame::Video::empty();
        let mut rgb_frame = ffmpeg::frame::Video::empty();
        let state = &mut self.state;

        loop {
            if state.decoder.receive_frame(&mut decoded).is_ok() {
                state
                    .scaler
                    .run(&decoded, &mut rgb_frame)
                    .context("scale frame to RGB")?;
                let (pixels, width, height) = frame_to_pixels(&rgb_frame)?;
                let timestamp = decoded
                    .timestamp()
                    .map(|pts| pts as f64 * state.time_base)
                    .unwrap_or(0.0);
                let ordinal = self.next_ordinal;
                self.next_ordinal += 1;
                return Frame::from_rgb(
                    self.camera,
                    ordinal as u64,
                    timestamp,
                    width,
                    height,
                    pixels,
                );
            }
            if state.flushed {
                return Err(anyhow!("{} ended early", self.path.display()));
            }

            let mut sent = false;
            for (stream, packet) in state.input.packets() {
                if stream.index() != state.stream_index {
                    continue;
                }
                state
                    .decoder
                    .send_packet(&packet)
                    .context("send packet to ffmpeg decoder")?;
                sent = true;
                break;
            }
            if !sent {
                state.decoder.send_eof().context("flush ffmpeg decoder")?;
                state.flushed = true;
            }
        }
    }
}

impl StreamReader for Mp4StreamReader {
    fn frame_count(&self) -> usize {
        self.frame_count
    }

    fn read(&mut self, ordinal: usize) -> Result<Frame> {
        if ordinal >= self.frame_count {
            return Err(anyhow!("frame {} out of range", ordinal));
        }
        if ordinal < self.next_ordinal {
            self.rewind()?;
        }
        loop {
            let frame = self.decode_next()?;
            if frame.sequence as usize == ordinal {
                return Ok(frame);
            }
        }
    }

    fn rewind(&mut self) -> Result<()> {
        self.state = open_decoder(&self.path)?;
        self.next_ordinal = 0;
        Ok(())
    }
}

fn open_decoder(path: &Path) -> Result<DecodeState> {
    let input = ffmpeg::format::input(&path)
        .with_context(|| format!("failed to open '{}' with ffmpeg", path.display()))?;
    let input_stream = input
        .streams()
        .best(ffmpeg::media::Type::Video)
        .ok_or_else(|| anyhow!("{} has no video track", path.display()))?;
    let stream_index = input_stream.index();
    let time_base = f64::from(input_stream.time_base());
    let context = ffmpeg::codec::context::Context::from_parameters(input_stream.parameters())
        .context("load video decoder parameters")?;
    let decoder = context
        .decoder()
        .video()
        .context("open ffmpeg video decoder")?;
    let scaler = ffmpeg::software::scaling::context::Context::get(
        decoder.format(),
        decoder.width(),
        decoder.height(),
        ffmpeg::util::format::pixel::Pixel::RGB24,
        decoder.width(),
        decoder.height(),
        ffmpeg::software::scaling::flag::Flags::BILINEAR,
    )
    .context("create ffmpeg scaler")?;
    Ok(DecodeState {
        input,
        stream_index,
        decoder,
        scaler,
        time_base,
        flushed: false,
    })
}

fn count_video_packets(path: &Path) -> Result<usize> {
    let mut input = ffmpeg::format::input(&path)
        .with_context(|| format!("failed to open '{}' with ffmpeg", path.display()))?;
    let stream_index = input
        .streams()
        .best(ffmpeg::media::Type::Video)
        .ok_or_else(|| anyhow!("{} has no video track", path.display()))?
        .index();
    Ok(input
        .packets()
        .filter(|(stream, _)| stream.index() == stream_index)
        .count())
}

fn frame_to_pixels(frame: &ffmpeg::frame::Video) -> Result<(Vec<u8>, u32, u32)> {
    let width = frame.width();
    let height = frame.height();
    let row_bytes = (width as usize) * 3;
    let stride = frame.stride(0);
    let data = frame.data(0);

    if stride == row_bytes {
        let pixels = data
            .get(..row_bytes * height as usize)
            .ok_or_else(|| anyhow!("ffmpeg frame is shorter than {}x{}", width, height))?;
        return Ok((pixels.to_vec(), width, height));
    }

    let mut pixels = Vec::with_capacity(row_bytes * height as usize);
    for row in 0..height as usize {
        let start = row * stride;
        let end = start + row_bytes;
        pixels.extend_from_slice(
            data.get(start..end)
                .ok_or_else(|| anyhow!("ffmpeg frame row is out of bounds"))?,
        );
    }
    Ok((pixels, width, height))
}
