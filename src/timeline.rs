//! Per-camera timestamp index used to pair frames across cameras.
//!
//! Each camera owns an append-only, strictly increasing sequence of
//! `(timestamp, item)` entries. The item is whatever the caller needs to get
//! back to the frame: the recorder and the playback engine store the frame's
//! ordinal within its persisted stream.

use parking_lot::Mutex;
use std::collections::BTreeMap;

use crate::frame::CameraId;

/// Ordinal of a frame within its camera's persisted stream.
pub type FrameOrdinal = usize;

pub struct TimelineSync<T: Clone = FrameOrdinal> {
    inner: Mutex<TimelineState<T>>,
}

struct TimelineState<T> {
    active: bool,
    /// Set once timestamps have been shifted so the earliest one is 0.
    normalized: bool,
    tracks: BTreeMap<CameraId, Vec<(f64, T)>>,
}

impl<T: Clone> Default for TimelineSync<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> TimelineSync<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(TimelineState {
                active: false,
                normalized: false,
                tracks: BTreeMap::new(),
            }),
        }
    }

    /// Build an already normalized index, e.g. from a loaded manifest.
    /// Entries that would break ordering are dropped.
    pub fn from_tracks(tracks: BTreeMap<CameraId, Vec<(f64, T)>>) -> Self {
        let tracks = tracks
            .into_iter()
            .map(|(camera, entries)| {
                let mut kept: Vec<(f64, T)> = Vec::with_capacity(entries.len());
                for (timestamp, item) in entries {
                    if kept.last().map_or(true, |(last, _)| timestamp > *last) {
                        kept.push((timestamp, item));
                    }
                }
                (camera, kept)
            })
            .collect();
        Self {
            inner: Mutex::new(TimelineState {
                active: false,
                normalized: true,
                tracks,
            }),
        }
    }

    /// Reset to one empty sequence per camera and start accepting entries.
    pub fn begin_session<I: IntoIterator<Item = CameraId>>(&self, cameras: I) {
        let mut state = self.inner.lock();
        state.tracks = cameras.into_iter().map(|id| (id, Vec::new())).collect();
        state.active = true;
        state.normalized = false;
    }

    /// Append an entry. Returns false when it was ignored: unknown camera,
    /// no active session, or a timestamp not after the camera's last one.
    pub fn record(&self, camera: CameraId, timestamp: f64, item: T) -> bool {
        if !timestamp.is_finite() {
            return false;
        }
        let mut state = self.inner.lock();
        if !state.active {
            return false;
        }
        let Some(track) = state.tracks.get_mut(&camera) else {
            return false;
        };
        if track.last().is_some_and(|(last, _)| timestamp <= *last) {
            return false;
        }
        track.push((timestamp, item));
        true
    }

    /// Forget a camera and its entries. Only allowed before normalization,
    /// since the dropped track may hold the earliest timestamp.
    pub fn drop_camera(&self, camera: CameraId) -> bool {
        let mut state = self.inner.lock();
        if state.normalized {
            return false;
        }
        state.tracks.remove(&camera).is_some()
    }

    /// Close the session and shift every timestamp so the earliest is 0.
    /// Returns the shift that was subtracted.
    pub fn end_session(&self) -> f64 {
        let mut state = self.inner.lock();
        state.active = false;
        if state.normalized {
            return 0.0;
        }
        let base = min_first(&state.tracks).unwrap_or(0.0);
        for track in state.tracks.values_mut() {
            for (timestamp, _) in track.iter_mut() {
                *timestamp -= base;
            }
        }
        state.normalized = true;
        base
    }

    pub fn is_active(&self) -> bool {
        self.inner.lock().active
    }

    /// Entry whose timestamp is closest to `position`; ties go to the earlier one.
    pub fn entry_near(&self, camera: CameraId, position: f64) -> Option<(f64, T)> {
        let state = self.inner.lock();
        let track = state.tracks.get(&camera)?;
        nearest_index(track, position).map(|idx| track[idx].clone())
    }

    pub fn frame_near(&self, camera: CameraId, position: f64) -> Option<T> {
        self.entry_near(camera, position).map(|(_, item)| item)
    }

    /// Latest last-timestamp across cameras. While a session is still open
    /// this is measured from the earliest first timestamp.
    pub fn duration(&self) -> f64 {
        let state = self.inner.lock();
        let last = state
            .tracks
            .values()
            .filter_map(|track| track.last().map(|(t, _)| *t))
            .fold(None, |acc: Option<f64>, t| Some(acc.map_or(t, |a| a.max(t))));
        let Some(last) = last else {
            return 0.0;
        };
        if state.normalized {
            last
        } else {
            last - min_first(&state.tracks).unwrap_or(last)
        }
    }

    /// Smallest gap between successive entries of any camera.
    pub fn smallest_interval(&self) -> Option<f64> {
        let state = self.inner.lock();
        state
            .tracks
            .values()
            .flat_map(|track| track.windows(2).map(|pair| pair[1].0 - pair[0].0))
            .fold(None, |acc: Option<f64>, dt| Some(acc.map_or(dt, |a| a.min(dt))))
    }

    pub fn timestamps(&self, camera: CameraId) -> Vec<f64> {
        self.inner
            .lock()
            .tracks
            .get(&camera)
            .map(|track| track.iter().map(|(t, _)| *t).collect())
            .unwrap_or_default()
    }

    pub fn camera_ids(&self) -> Vec<CameraId> {
        self.inner.lock().tracks.keys().copied().collect()
    }

    pub fn len(&self, camera: CameraId) -> usize {
        self.inner
            .lock()
            .tracks
            .get(&camera)
            .map_or(0, |track| track.len())
    }

    pub fn total_entries(&self) -> usize {
        self.inner.lock().tracks.values().map(Vec::len).sum()
    }
}

fn min_first<T>(tracks: &BTreeMap<CameraId, Vec<(f64, T)>>) -> Option<f64> {
    tracks
        .values()
        .filter_map(|track| track.first().map(|(t, _)| *t))
        .fold(None, |acc: Option<f64>, t| Some(acc.map_or(t, |a| a.min(t))))
}

fn nearest_index<T>(track: &[(f64, T)], position: f64) -> Option<usize> {
    if track.is_empty() {
        return None;
    }
    let idx = track.partition_point(|(t, _)| *t < position);
    if idx == 0 {
        return Some(0);
    }
    if idx == track.len() {
        return Some(track.len() - 1);
    }
    let before = position - track[idx - 1].0;
    let after = track[idx].0 - position;
    Some(if before <= after { idx - 1 } else { idx })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recorded(entries: &[(u32, f64)]) -> TimelineSync<usize> {
        let timeline = TimelineSync::new();
        let mut cameras: Vec<CameraId> = entries.iter().map(|(c, _)| CameraId(*c)).collect();
        cameras.dedup();
        timeline.begin_session(cameras);
        for (i, (camera, t)) in entries.iter().enumerate() {
            timeline.record(CameraId(*camera), *t, i);
        }
        timeline
    }

    #[test]
    fn end_session_zero_bases_across_cameras() {
        let timeline = recorded(&[(0, 10.5), (0, 10.6), (1, 10.4), (1, 10.9)]);
        assert!((timeline.duration() - 0.5).abs() < 1e-9);

        let base = timeline.end_session();
        assert_eq!(base, 10.4);
        let cam1 = timeline.timestamps(CameraId(1));
        assert_eq!(cam1[0], 0.0);
        assert!((timeline.duration() - 0.5).abs() < 1e-9);
        assert!(!timeline.is_active());
    }

    #[test]
    fn dropped_camera_does_not_set_the_base() {
        let timeline = recorded(&[(0, 10.0), (1, 10.05), (1, 10.25)]);
        assert!(timeline.drop_camera(CameraId(0)));
        assert!(!timeline.drop_camera(CameraId(0)));
        assert!(!timeline.record(CameraId(0), 10.3, 9));

        assert_eq!(timeline.end_session(), 10.05);
        assert_eq!(timeline.camera_ids(), vec![CameraId(1)]);
        assert_eq!(timeline.timestamps(CameraId(1))[0], 0.0);
        assert!((timeline.duration() - 0.2).abs() < 1e-9);
        assert!(!timeline.drop_camera(CameraId(1)));
    }

    #[test]
    fn frame_near_prefers_earlier_on_tie() {
        let timeline = recorded(&[(0, 0.0), (0, 0.1), (0, 0.2)]);
        timeline.end_session();
        assert_eq!(timeline.frame_near(CameraId(0), 0.15), Some(1));
        assert_eq!(timeline.frame_near(CameraId(0), 0.16), Some(2));
        assert_eq!(timeline.frame_near(CameraId(0), -3.0), Some(0));
        assert_eq!(timeline.frame_near(CameraId(0), 99.0), Some(2));
        assert_eq!(timeline.frame_near(CameraId(5), 0.0), None);
    }

    #[test]
    fn record_rejects_unknown_camera_and_regressions() {
        let timeline: TimelineSync<usize> = TimelineSync::new();
        assert!(!timeline.record(CameraId(0), 1.0, 0));

        timeline.begin_session([CameraId(0)]);
        assert!(timeline.record(CameraId(0), 1.0, 0));
        assert!(!timeline.record(CameraId(0), 1.0, 1));
        assert!(!timeline.record(CameraId(0), 0.5, 2));
        assert!(!timeline.record(CameraId(3), 2.0, 3));
        assert!(!timeline.record(CameraId(0), f64::NAN, 4));
        assert_eq!(timeline.len(CameraId(0)), 1);
    }

    #[test]
    fn smallest_interval_needs_two_frames() {
        let timeline = recorded(&[(0, 1.0), (1, 2.0)]);
        assert_eq!(timeline.smallest_interval(), None);

        let timeline = recorded(&[(0, 1.0), (0, 1.5), (1, 2.0), (1, 2.1)]);
        let interval = timeline.smallest_interval().unwrap();
        assert!((interval - 0.1).abs() < 1e-9);
    }

    #[test]
    fn empty_session_has_zero_duration() {
        let timeline: TimelineSync<usize> = TimelineSync::new();
        timeline.begin_session([CameraId(0), CameraId(1)]);
        assert_eq!(timeline.end_session(), 0.0);
        assert_eq!(timeline.duration(), 0.0);
        assert_eq!(timeline.camera_ids(), vec![CameraId(0), CameraId(1)]);
    }

    #[test]
    fn from_tracks_drops_out_of_order_entries() {
        let mut tracks = BTreeMap::new();
        tracks.insert(CameraId(0), vec![(0.0, 0), (0.2, 1), (0.1, 2), (0.3, 3)]);
        let timeline = TimelineSync::from_tracks(tracks);
        assert_eq!(timeline.timestamps(CameraId(0)), vec![0.0, 0.2, 0.3]);
        assert_eq!(timeline.end_session(), 0.0);
    }
}
