use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use camsync::{
    CameraId, CaptureRegistry, CaptureSettings, ChannelBackend, FrameFeeder, Manifest,
    PlaybackEngine, PlaybackSettings, PlaybackStatus, Recorder, RecordingSettings,
    StreamEncoding, VideoMode,
};

const WIDTH: u32 = 2;
const HEIGHT: u32 = 1;

fn capture_settings() -> CaptureSettings {
    CaptureSettings {
        width: WIDTH,
        height: HEIGHT,
        fps: 30,
        warmup_frames: 0,
        buffer_capacity: 2,
        ..CaptureSettings::default()
    }
}

fn recording_settings(dir: &std::path::Path) -> RecordingSettings {
    RecordingSettings {
        output_dir: dir.to_path_buf(),
        max_rate_hz: 200.0,
        encoding: StreamEncoding::RawRgb24,
    }
}

fn wait_for<F: Fn() -> bool>(cond: F) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    false
}

/// Register a channel camera. The first image only satisfies open-time
/// verification and never reaches the frame buffer.
fn add_channel_camera(registry: &CaptureRegistry, id: u32) -> FrameFeeder {
    let mode = VideoMode {
        width: WIDTH,
        height: HEIGHT,
        fps: 30,
    };
    let (backend, feeder) = ChannelBackend::new(format!("chan://{}", id), mode, 4);
    feeder
        .send_rgb(WIDTH, HEIGHT, vec![0; 6], 1.0)
        .expect("verification frame");
    registry
        .add_camera_backend(CameraId(id), Box::new(backend))
        .expect("add channel camera");
    feeder
}

fn approx(a: f64, b: f64) -> bool {
    (a - b).abs() < 1e-9
}

/// Feed one frame and wait until the recorder has indexed it.
fn feed_recorded(recorder: &Recorder, feeder: &FrameFeeder, camera: u32, value: u8, ts: f64) {
    let timeline = recorder.timeline();
    let before = timeline.len(CameraId(camera));
    feeder
        .send_rgb(WIDTH, HEIGHT, vec![value; 6], ts)
        .expect("feed frame");
    assert!(
        wait_for(|| timeline.len(CameraId(camera)) == before + 1),
        "camera {} frame at {} was not recorded",
        camera,
        ts
    );
}

/// Record cam 0 at 10.0/10.1/10.2 and cam 1 at 10.04/10.14, then stop.
fn record_two_camera_session(root: &std::path::Path) -> camsync::RecordingSummary {
    let registry = Arc::new(CaptureRegistry::new(capture_settings()));
    let cam0 = add_channel_camera(&registry, 0);
    let cam1 = add_channel_camera(&registry, 1);
    assert_eq!(registry.start_all(), 2);

    let recorder = Recorder::new(registry.clone(), recording_settings(root));
    recorder.start(root).expect("start recording");
    assert!(recorder.is_recording());

    feed_recorded(&recorder, &cam0, 0, 1, 10.0);
    feed_recorded(&recorder, &cam1, 1, 101, 10.04);
    feed_recorded(&recorder, &cam0, 0, 2, 10.1);
    feed_recorded(&recorder, &cam1, 1, 102, 10.14);
    feed_recorded(&recorder, &cam0, 0, 3, 10.2);

    let summary = recorder
        .stop()
        .expect("stop recording")
        .expect("a session was active");
    assert!(!recorder.is_recording());
    registry.stop_all();
    summary
}

#[test]
fn recorded_session_is_zero_based_and_replays() {
    let root = tempfile::tempdir().expect("tempdir");
    let summary = record_two_camera_session(root.path());

    assert!(summary.failed_cameras.is_empty());
    assert_eq!(summary.frames_written.get(&CameraId(0)), Some(&3));
    assert_eq!(summary.frames_written.get(&CameraId(1)), Some(&2));

    let manifest = &summary.manifest;
    assert!(approx(manifest.duration, 0.2));
    let cam0 = manifest.camera(CameraId(0)).expect("camera 0 stream");
    let cam1 = manifest.camera(CameraId(1)).expect("camera 1 stream");
    assert_eq!(cam0.timestamps.len(), 3);
    assert_eq!(cam0.timestamps[0], 0.0);
    assert!(approx(cam0.timestamps[2], 0.2));
    assert!(approx(cam1.timestamps[0], 0.04));
    assert_eq!(cam0.file, "camera_0.rgb");

    // The persisted manifest matches the one returned by stop.
    let (dir, loaded) = Manifest::load(&summary.session_dir).expect("load manifest");
    assert_eq!(dir, summary.session_dir);
    assert_eq!(loaded.camera_ids(), vec![CameraId(0), CameraId(1)]);
    assert_eq!(loaded.duration, manifest.duration);

    let engine = PlaybackEngine::new(PlaybackSettings::default());
    engine.load(&summary.session_dir).expect("load session");
    assert_eq!(engine.status(), PlaybackStatus::Loaded);
    assert_eq!(engine.camera_ids(), vec![CameraId(0), CameraId(1)]);
    assert!(approx(engine.duration(), 0.2));

    let initial = engine.current_frames().expect("frames at position 0");
    assert_eq!(initial.frames[&CameraId(0)].pixels(), &[1u8; 6][..]);
    assert_eq!(initial.frames[&CameraId(1)].pixels(), &[101u8; 6][..]);

    // One step lands on the smallest observed interval (~0.1s): cam 0's
    // second frame, and cam 1's frame at 0.14 which is closer than 0.04.
    let set = engine.step(true).expect("step forward");
    assert!(approx(set.position, 0.1));
    assert_eq!(set.frames[&CameraId(0)].pixels(), &[2u8; 6][..]);
    assert_eq!(set.frames[&CameraId(1)].pixels(), &[102u8; 6][..]);
    assert!(approx(set.frames[&CameraId(1)].timestamp, 0.14));

    let back = engine.step(false).expect("step back");
    assert_eq!(back.position, 0.0);
    assert_eq!(back.frames[&CameraId(0)].pixels(), &[1u8; 6][..]);
}

#[test]
fn seek_clamps_and_play_pause_are_idempotent() {
    let root = tempfile::tempdir().expect("tempdir");
    let summary = record_two_camera_session(root.path());

    let engine = PlaybackEngine::new(PlaybackSettings::default());
    engine.load(&summary.session_dir).expect("load session");

    engine.seek(-3.0);
    assert_eq!(engine.position(), 0.0);
    engine.seek(99.0);
    assert!(approx(engine.position(), 0.2));
    let end = engine.current_frames().expect("frames at end");
    assert_eq!(end.frames[&CameraId(0)].pixels(), &[3u8; 6][..]);

    let delivered = Arc::new(AtomicUsize::new(0));
    let counter = delivered.clone();
    engine.register(move |set| {
        assert!(!set.frames.is_empty());
        counter.fetch_add(1, Ordering::SeqCst);
    });

    engine.play().expect("play");
    engine.play().expect("play again");
    assert_eq!(engine.status(), PlaybackStatus::Playing);
    assert!(wait_for(|| delivered.load(Ordering::SeqCst) >= 3));

    engine.pause();
    engine.pause();
    assert_eq!(engine.status(), PlaybackStatus::Paused);
    let after_pause = delivered.load(Ordering::SeqCst);
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(delivered.load(Ordering::SeqCst), after_pause);

    // Playback wraps, so the position never leaves the session.
    let position = engine.position();
    assert!((0.0..=engine.duration()).contains(&position));

    engine.unload();
    assert_eq!(engine.status(), PlaybackStatus::Idle);
    assert!(engine.step(true).is_err());
}

#[test]
fn tampered_manifest_is_rejected_and_previous_session_kept() {
    let root = tempfile::tempdir().expect("tempdir");
    let summary = record_two_camera_session(root.path());

    let engine = PlaybackEngine::new(PlaybackSettings::default());
    engine.load(&summary.session_dir).expect("load session");

    let copy = root.path().join("tampered");
    std::fs::create_dir(&copy).expect("create copy dir");
    for entry in std::fs::read_dir(&summary.session_dir).expect("read session") {
        let entry = entry.expect("dir entry");
        std::fs::copy(entry.path(), copy.join(entry.file_name())).expect("copy file");
    }
    let manifest_path = copy.join("manifest.json");
    let raw = std::fs::read_to_string(&manifest_path).expect("read manifest");
    let mut value: serde_json::Value = serde_json::from_str(&raw).expect("parse manifest");
    value["cameras"][0]["timestamps"] = serde_json::json!([0.2, 0.1, 0.0]);
    std::fs::write(&manifest_path, value.to_string()).expect("write manifest");

    assert!(Manifest::load(&copy).is_err());
    assert!(engine.load(&copy).is_err());
    assert_eq!(engine.status(), PlaybackStatus::Loaded);
    assert_eq!(engine.session_dir(), Some(summary.session_dir.clone()));
}

#[test]
fn lost_camera_leaves_the_others_capturing() {
    let registry = CaptureRegistry::new(capture_settings());
    let steady = add_channel_camera(&registry, 0);
    let lost = add_channel_camera(&registry, 1);
    assert_eq!(registry.start_all(), 2);

    drop(lost);
    assert!(wait_for(|| !registry.is_connected(CameraId(1))));

    steady
        .send_rgb(WIDTH, HEIGHT, vec![7; 6], 20.0)
        .expect("feed frame");
    assert!(wait_for(|| registry.snapshot().contains_key(&CameraId(0))));

    let snapshot = registry.snapshot();
    assert!(!snapshot.contains_key(&CameraId(1)));
    assert_eq!(snapshot[&CameraId(0)].timestamp, 20.0);
    assert!(registry.is_capturing());
    assert_eq!(registry.connected_cameras(), vec![CameraId(0)]);

    registry.stop_all();
    registry.stop_all();
    assert!(registry.is_empty());
}

#[test]
fn recording_requires_a_connected_camera() {
    let root = tempfile::tempdir().expect("tempdir");
    let registry = Arc::new(CaptureRegistry::new(capture_settings()));
    let recorder = Recorder::new(registry, recording_settings(root.path()));
    assert!(recorder.start(root.path()).is_err());
    assert!(recorder.stop().expect("stop while idle").is_none());
    assert_eq!(std::fs::read_dir(root.path()).expect("read root").count(), 0);
}

#[test]
fn nearest_frame_after_reload_prefers_the_earlier_tie() {
    let root = tempfile::tempdir().expect("tempdir");
    let registry = Arc::new(CaptureRegistry::new(capture_settings()));
    let cam0 = add_channel_camera(&registry, 0);
    registry.start_all();

    let recorder = Recorder::new(registry.clone(), recording_settings(root.path()));
    recorder.start(root.path()).expect("start recording");
    feed_recorded(&recorder, &cam0, 0, 10, 0.0);
    feed_recorded(&recorder, &cam0, 0, 11, 0.1);
    feed_recorded(&recorder, &cam0, 0, 12, 0.2);
    let summary = recorder.stop().expect("stop").expect("session");
    registry.stop_all();

    assert_eq!(summary.manifest.camera_ids(), vec![CameraId(0)]);
    assert_eq!(summary.manifest.duration, 0.2);

    let engine = PlaybackEngine::new(PlaybackSettings::default());
    engine.load(&summary.session_dir).expect("load session");
    assert_eq!(engine.camera_ids(), vec![CameraId(0)]);
    assert_eq!(engine.duration(), 0.2);

    engine.seek(0.15);
    let set = engine.current_frames().expect("frames at 0.15");
    let frame = &set.frames[&CameraId(0)];
    assert_eq!(frame.timestamp, 0.1);
    assert_eq!(frame.pixels(), &[11u8; 6][..]);
}

#[test]
fn non_finite_timestamps_do_not_corrupt_the_session() {
    let root = tempfile::tempdir().expect("tempdir");
    let registry = Arc::new(CaptureRegistry::new(capture_settings()));
    let cam0 = add_channel_camera(&registry, 0);
    registry.start_all();

    let recorder = Recorder::new(registry.clone(), recording_settings(root.path()));
    recorder.start(root.path()).expect("start recording");

    cam0.send_rgb(WIDTH, HEIGHT, vec![1; 6], f64::NAN)
        .expect("feed frame");
    assert!(wait_for(|| {
        registry
            .snapshot()
            .get(&CameraId(0))
            .is_some_and(|frame| frame.timestamp.is_nan())
    }));
    // Give the recorder several ticks to see the bad frame.
    std::thread::sleep(Duration::from_millis(30));
    feed_recorded(&recorder, &cam0, 0, 2, 5.0);

    let summary = recorder.stop().expect("stop").expect("session");
    registry.stop_all();

    assert_eq!(summary.frames_written.get(&CameraId(0)), Some(&1));
    let cam = summary.manifest.camera(CameraId(0)).expect("camera 0");
    assert_eq!(cam.timestamps, vec![0.0]);

    let (_, loaded) = Manifest::load(&summary.session_dir).expect("session loads");
    assert_eq!(loaded.camera(CameraId(0)).map(|c| c.timestamps.len()), Some(1));
}
