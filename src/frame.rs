//! Frames and the lossy frame buffer.
//!
//! - `Frame`: immutable interleaved RGB24 image plus capture metadata.
//! - `FrameBuffer`: bounded slot set that evicts the oldest frame when full.
//!
//! Pixel data is shared behind an `Arc<[u8]>`, so handing a frame from the
//! acquisition loop to the buffer, the UI and the recorder never copies pixels
//! and never exposes them mutably.

use anyhow::{anyhow, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

/// Default number of slots in a camera's frame buffer.
pub const DEFAULT_BUFFER_CAPACITY: usize = 3;

/// Bytes per pixel of the canonical interchange format.
pub const RGB_CHANNELS: usize = 3;

// ----------------------------------------------------------------------------
// CameraId
// ----------------------------------------------------------------------------

/// Logical camera id, unique within a `CaptureRegistry`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CameraId(pub u32);

impl fmt::Display for CameraId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for CameraId {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

// ----------------------------------------------------------------------------
// Monotonic clock
// ----------------------------------------------------------------------------

static CLOCK_ORIGIN: OnceLock<Instant> = OnceLock::new();

/// Seconds on the process monotonic clock.
///
/// All capture timestamps share this origin, which is what makes frames from
/// independently running cameras comparable.
pub fn monotonic_now() -> f64 {
    let origin = CLOCK_ORIGIN.get_or_init(Instant::now);
    origin.elapsed().as_secs_f64()
}

// ----------------------------------------------------------------------------
// Frame
// ----------------------------------------------------------------------------

#[derive(Clone)]
pub struct Frame {
    pixels: Arc<[u8]>,
    pub width: u32,
    pub height: u32,
    /// Capture time in seconds. Monotonic clock while live, zero-based in replay.
    pub timestamp: f64,
    pub camera: CameraId,
    /// Per-source counter. Strictly increasing for one camera.
    pub sequence: u64,
}

impl Frame {
    /// Build a frame from RGB24 pixels. Fails when the buffer size does not
    /// match the dimensions.
    pub fn from_rgb(
        camera: CameraId,
        sequence: u64,
        timestamp: f64,
        width: u32,
        height: u32,
        pixels: Vec<u8>,
    ) -> Result<Self> {
        let expected = rgb_len(width, height)?;
        if pixels.len() != expected {
            return Err(anyhow!(
                "RGB frame length mismatch: expected {}, got {}",
                expected,
                pixels.len()
            ));
        }
        Ok(Self {
            pixels: pixels.into(),
            width,
            height,
            timestamp,
            camera,
            sequence,
        })
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    pub fn byte_len(&self) -> usize {
        self.pixels.len()
    }

    /// Same pixels under a different timestamp. Used by replay, where the
    /// persisted index carries the zero-based time.
    pub fn with_timestamp(&self, timestamp: f64) -> Self {
        Self {
            timestamp,
            ..self.clone()
        }
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("camera", &self.camera)
            .field("sequence", &self.sequence)
            .field("timestamp", &self.timestamp)
            .field("width", &self.width)
            .field("height", &self.height)
            .finish_non_exhaustive()
    }
}

pub(crate) fn rgb_len(width: u32, height: u32) -> Result<usize> {
    (width as usize)
        .checked_mul(height as usize)
        .and_then(|v| v.checked_mul(RGB_CHANNELS))
        .ok_or_else(|| anyhow!("frame dimensions overflow"))
}

// ----------------------------------------------------------------------------
// FrameBuffer: bounded, evict-oldest
// ----------------------------------------------------------------------------

/// Bounded frame slots shared between one producer and its consumers.
///
/// - `push` never blocks the producer: a full buffer drops its oldest frame.
/// - reads never wait for a frame: an empty buffer yields `None`.
pub struct FrameBuffer {
    slots: Mutex<VecDeque<Frame>>,
    capacity: usize,
}

impl FrameBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            slots: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    /// Push a frame. Returns the number of frames evicted to make room.
    pub fn push(&self, frame: Frame) -> usize {
        let mut slots = self.slots.lock();
        let mut evicted = 0;
        while slots.len() >= self.capacity {
            slots.pop_front();
            evicted += 1;
        }
        slots.push_back(frame);
        evicted
    }

    /// Most recently pushed frame, without consuming it.
    pub fn latest(&self) -> Option<Frame> {
        self.slots.lock().back().cloned()
    }

    /// Like `latest`, but gives up after `timeout` if the lock is contended.
    pub fn try_latest(&self, timeout: Duration) -> Option<Frame> {
        self.slots.try_lock_for(timeout)?.back().cloned()
    }

    /// Buffered frames captured at or after `since`, oldest first.
    pub fn since(&self, since: f64) -> Vec<Frame> {
        self.slots
            .lock()
            .iter()
            .filter(|frame| frame.timestamp >= since)
            .cloned()
            .collect()
    }

    /// Remove and return the oldest frame.
    pub fn pop_oldest(&self) -> Option<Frame> {
        self.slots.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&self) {
        self.slots.lock().clear();
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_CAPACITY)
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn make_test_frame(sequence: u64) -> Frame {
        Frame::from_rgb(
            CameraId(0),
            sequence,
            sequence as f64 * 0.1,
            2,
            2,
            vec![sequence as u8; 12],
        )
        .unwrap()
    }

    #[test]
    fn frame_rejects_wrong_length() {
        let result = Frame::from_rgb(CameraId(1), 0, 0.0, 4, 4, vec![0u8; 10]);
        assert!(result.is_err());
    }

    #[test]
    fn clones_share_pixels() {
        let frame = make_test_frame(7);
        let copy = frame.with_timestamp(1.5);
        assert_eq!(copy.timestamp, 1.5);
        assert_eq!(copy.pixels(), frame.pixels());
        assert_eq!(copy.sequence, 7);
    }

    #[test]
    fn frame_buffer_is_fresh_and_bounded() {
        for capacity in 1..=3 {
            let buf = FrameBuffer::new(capacity);
            assert!(buf.latest().is_none());
            for n in 0..10u64 {
                buf.push(make_test_frame(n));
                assert_eq!(buf.latest().map(|f| f.sequence), Some(n));
                assert!(buf.len() <= capacity);
            }
            assert_eq!(buf.len(), capacity);
        }
    }

    #[test]
    fn frame_buffer_evicts_oldest() {
        let buf = FrameBuffer::new(2);
        assert_eq!(buf.push(make_test_frame(0)), 0);
        assert_eq!(buf.push(make_test_frame(1)), 0);
        assert_eq!(buf.push(make_test_frame(2)), 1);
        assert_eq!(buf.pop_oldest().map(|f| f.sequence), Some(1));
        assert_eq!(buf.pop_oldest().map(|f| f.sequence), Some(2));
        assert!(buf.pop_oldest().is_none());
    }

    #[test]
    fn since_returns_the_trailing_window() {
        let buf = FrameBuffer::new(4);
        for n in 0..6u64 {
            buf.push(make_test_frame(n));
        }
        let seqs: Vec<u64> = buf.since(0.35).iter().map(|f| f.sequence).collect();
        assert_eq!(seqs, vec![4, 5]);
        assert_eq!(buf.since(0.0).len(), 4);
        assert!(buf.since(9.0).is_empty());
    }

    #[test]
    fn zero_capacity_is_raised_to_one() {
        let buf = FrameBuffer::new(0);
        assert_eq!(buf.capacity(), 1);
        buf.push(make_test_frame(3));
        assert_eq!(buf.try_latest(Duration::from_millis(5)).map(|f| f.sequence), Some(3));
    }

    #[test]
    fn monotonic_clock_advances() {
        let a = monotonic_now();
        std::thread::sleep(Duration::from_millis(2));
        assert!(monotonic_now() > a);
    }
}
