//! Framed RGB24 container.
//!
//! Layout, all integers little-endian:
//!
//! ```text
//! header:  "CSRG" | version u32 | width u32 | height u32 | fps u32
//! record:  width u32 | height u32 | timestamp f64 | len u32 | len bytes of RGB24
//! ```
//!
//! A truncated trailing record (a crash mid-write) is ignored on open.

use anyhow::{anyhow, Context, Result};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use super::{StreamReader, StreamWriter};
use crate::capture::VideoMode;
use crate::frame::{rgb_len, CameraId, Frame};

const MAGIC: &[u8; 4] = b"CSRG";
const VERSION: u32 = 1;
const HEADER_LEN: u64 = 20;
const RECORD_HEADER_LEN: u64 = 20;

/// Largest frame accepted on read (8K RGB24 is ~100 MiB).
const MAX_FRAME_LEN: usize = 128 * 1024 * 1024;

pub struct RawStreamWriter {
    path: PathBuf,
    out: BufWriter<File>,
    frames: usize,
}

impl RawStreamWriter {
    pub fn create(path: &Path, mode: VideoMode) -> Result<Self> {
        let file = File::create(path)
            .with_context(|| format!("create stream file {}", path.display()))?;
        let mut out = BufWriter::new(file);
        out.write_all(MAGIC)?;
        for value in [VERSION, mode.width, mode.height, mode.fps] {
            out.write_all(&value.to_le_bytes())?;
        }
        Ok(Self {
            path: path.to_path_buf(),
            out,
            frames: 0,
        })
    }
}

impl StreamWriter for RawStreamWriter {
    fn write(&mut self, frame: &Frame) -> Result<usize> {
        let pixels = frame.pixels();
        let len = u32::try_from(pixels.len()).map_err(|_| anyhow!("frame too large"))?;
        self.out.write_all(&frame.width.to_le_bytes())?;
        self.out.write_all(&frame.height.to_le_bytes())?;
        self.out.write_all(&frame.timestamp.to_le_bytes())?;
        self.out.write_all(&len.to_le_bytes())?;
        self.out
            .write_all(pixels)
            .with_context(|| format!("write frame to {}", self.path.display()))?;
        let ordinal = self.frames;
        self.frames += 1;
        Ok(ordinal)
    }

    fn frames_written(&self) -> usize {
        self.frames
    }

    fn finish(mut self: Box<Self>) -> Result<()> {
        self.out
            .flush()
            .with_context(|| format!("flush {}", self.path.display()))?;
        self.out.get_ref().sync_all()?;
        Ok(())
    }
}

pub struct RawStreamReader {
    camera: CameraId,
    input: BufReader<File>,
    mode: VideoMode,
    /// File offset of each record header.
    offsets: Vec<u64>,
}

impl RawStreamReader {
    pub fn open(path: &Path, camera: CameraId) -> Result<Self> {
        let file =
            File::open(path).with_context(|| format!("open stream file {}", path.display()))?;
        let file_len = file.metadata()?.len();
        let mut input = BufReader::new(file);

        let mut header = [0u8; HEADER_LEN as usize];
        input
            .read_exact(&mut header)
            .with_context(|| format!("{} has no stream header", path.display()))?;
        if &header[..4] != MAGIC {
            return Err(anyhow!("{} is not a raw-rgb24 stream", path.display()));
        }
        let version = le_u32(&header[4..8]);
        if version != VERSION {
            return Err(anyhow!(
                "{} has unsupported stream version {}",
                path.display(),
                version
            ));
        }
        let mode = VideoMode {
            width: le_u32(&header[8..12]),
            height: le_u32(&header[12..16]),
            fps: le_u32(&header[16..20]),
        };

        let mut offsets = Vec::new();
        let mut offset = HEADER_LEN;
        let mut record = [0u8; RECORD_HEADER_LEN as usize];
        while offset + RECORD_HEADER_LEN <= file_len {
            input.seek(SeekFrom::Start(offset))?;
            input.read_exact(&mut record)?;
            let len = le_u32(&record[16..20]) as u64;
            let next = offset + RECORD_HEADER_LEN + len;
            if next > file_len {
                log::warn!(
                    "RawStreamReader: {} ends with a truncated frame, ignoring it",
                    path.display()
                );
                break;
            }
            offsets.push(offset);
            offset = next;
        }

        Ok(Self {
            camera,
            input,
            mode,
            offsets,
        })
    }

    pub fn video_mode(&self) -> VideoMode {
        self.mode
    }
}

impl StreamReader for RawStreamReader {
    fn frame_count(&self) -> usize {
        self.offsets.len()
    }

    fn read(&mut self, ordinal: usize) -> Result<Frame> {
        let offset = *self
            .offsets
            .get(ordinal)
            .ok_or_else(|| anyhow!("frame {} out of range", ordinal))?;
        self.input.seek(SeekFrom::Start(offset))?;
        let mut record = [0u8; RECORD_HEADER_LEN as usize];
        self.input.read_exact(&mut record)?;
        let width = le_u32(&record[0..4]);
        let height = le_u32(&record[4..8]);
        let mut ts = [0u8; 8];
        ts.copy_from_slice(&record[8..16]);
        let timestamp = f64::from_le_bytes(ts);
        let len = le_u32(&record[16..20]) as usize;
        if len > MAX_FRAME_LEN || len != rgb_len(width, height)? {
            return Err(anyhow!(
                "frame {} has inconsistent length {} for {}x{}",
                ordinal,
                len,
                width,
                height
            ));
        }
        let mut pixels = vec![0u8; len];
        self.input.read_exact(&mut pixels)?;
        Frame::from_rgb(
            self.camera,
            ordinal as u64,
            timestamp,
            width,
            height,
            pixels,
        )
    }

    fn rewind(&mut self) -> Result<()> {
        self.input.seek(SeekFrom::Start(HEADER_LEN))?;
        Ok(())
    }
}

fn le_u32(bytes: &[u8]) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[..4]);
    u32::from_le_bytes(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::OpenOptions;

    fn mode() -> VideoMode {
        VideoMode {
            width: 2,
            height: 2,
            fps: 30,
        }
    }

    fn make_test_frame(sequence: u64, fill: u8) -> Frame {
        Frame::from_rgb(CameraId(1), sequence, sequence as f64 * 0.5, 2, 2, vec![fill; 12]).unwrap()
    }

    #[test]
    fn frames_read_back_by_ordinal() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("camera_1.rgb");
        let mut writer = Box::new(RawStreamWriter::create(&path, mode())?);
        for i in 0..3 {
            assert_eq!(writer.write(&make_test_frame(i, i as u8 * 10))?, i as usize);
        }
        writer.finish()?;

        let mut reader = RawStreamReader::open(&path, CameraId(1))?;
        assert_eq!(reader.frame_count(), 3);
        assert_eq!(reader.video_mode(), mode());
        let frame = reader.read(2)?;
        assert_eq!(frame.pixels(), &[20u8; 12][..]);
        assert_eq!(frame.timestamp, 1.0);
        let frame = reader.read(0)?;
        assert_eq!(frame.pixels()[0], 0);
        assert!(reader.read(3).is_err());
        Ok(())
    }

    #[test]
    fn truncated_tail_is_ignored() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("camera_1.rgb");
        let mut writer = Box::new(RawStreamWriter::create(&path, mode())?);
        writer.write(&make_test_frame(0, 1))?;
        writer.write(&make_test_frame(1, 2))?;
        writer.finish()?;

        let len = std::fs::metadata(&path)?.len();
        OpenOptions::new().write(true).open(&path)?.set_len(len - 5)?;

        let reader = RawStreamReader::open(&path, CameraId(1))?;
        assert_eq!(reader.frame_count(), 1);
        Ok(())
    }

    #[test]
    fn foreign_file_is_rejected() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("camera_1.rgb");
        std::fs::write(&path, b"definitely not a stream header")?;
        assert!(RawStreamReader::open(&path, CameraId(1)).is_err());
        Ok(())
    }
}
