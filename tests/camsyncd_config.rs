use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use tempfile::{Builder, NamedTempFile};

use camsync::{CameraId, CamsyncConfig, StreamEncoding};

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "CAMSYNC_CONFIG",
        "CAMSYNC_OUTPUT_DIR",
        "CAMSYNC_CAMERAS",
        "CAMSYNC_CAPTURE_FPS",
        "CAMSYNC_BUFFER_CAPACITY",
        "CAMSYNC_ENCODING",
    ] {
        std::env::remove_var(key);
    }
}

#[test]
fn loads_config_from_file_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    let json = r#"{
        "capture": {
            "width": 1280,
            "height": 720,
            "fps": 30,
            "codec": "YUYV",
            "warmup_frames": 2,
            "probe_secs": 2.0
        },
        "recording": {
            "output_dir": "/var/lib/camsync",
            "max_rate_hz": 30.0
        },
        "playback": {
            "min_speed": 0.25,
            "max_speed": 2.0
        },
        "cameras": [
            { "id": 0, "source": "0" },
            { "id": 1, "source": "/dev/video2" }
        ]
    }"#;
    std::io::Write::write_all(&mut file, json.as_bytes()).expect("write config");

    std::env::set_var("CAMSYNC_CONFIG", file.path());
    std::env::set_var("CAMSYNC_CAPTURE_FPS", "25");
    std::env::set_var("CAMSYNC_OUTPUT_DIR", "/tmp/camsync-out");

    let cfg = CamsyncConfig::load().expect("load config");

    assert_eq!(cfg.capture.width, 1280);
    assert_eq!(cfg.capture.height, 720);
    assert_eq!(cfg.capture.fps, 25);
    assert_eq!(cfg.capture.codec, "YUYV");
    assert_eq!(cfg.capture.warmup_frames, 2);
    assert_eq!(cfg.capture.probe, Some(Duration::from_secs(2)));
    assert_eq!(cfg.recording.output_dir, PathBuf::from("/tmp/camsync-out"));
    assert_eq!(cfg.recording.max_rate_hz, 30.0);
    assert_eq!(cfg.recording.encoding, StreamEncoding::RawRgb24);
    assert_eq!(cfg.playback.clamp_speed(8.0), 2.0);
    assert_eq!(cfg.cameras.len(), 2);
    assert_eq!(cfg.cameras[1].id, CameraId(1));
    assert_eq!(cfg.cameras[1].source, "/dev/video2");

    clear_env();
}

#[test]
fn env_camera_list_replaces_file_cameras() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = Builder::new().suffix(".toml").tempfile().expect("temp config");
    let toml = r#"
        [recording]
        encoding = "raw-rgb24"

        [[cameras]]
        id = 4
        source = "stub://file-camera"
    "#;
    std::io::Write::write_all(&mut file, toml.as_bytes()).expect("write config");

    std::env::set_var("CAMSYNC_CONFIG", file.path());
    std::env::set_var("CAMSYNC_CAMERAS", "0=stub://left, 1=stub://right");
    std::env::set_var("CAMSYNC_BUFFER_CAPACITY", "5");

    let cfg = CamsyncConfig::load().expect("load config");
    let ids: Vec<CameraId> = cfg.cameras.iter().map(|c| c.id).collect();
    assert_eq!(ids, vec![CameraId(0), CameraId(1)]);
    assert_eq!(cfg.cameras[1].source, "stub://right");
    assert_eq!(cfg.capture.buffer_capacity, 5);

    clear_env();
}

#[test]
fn invalid_values_are_rejected() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("CAMSYNC_BUFFER_CAPACITY", "0");
    assert!(CamsyncConfig::load().is_err());
    clear_env();

    std::env::set_var("CAMSYNC_CAPTURE_FPS", "fast");
    assert!(CamsyncConfig::load().is_err());
    clear_env();

    std::env::set_var("CAMSYNC_ENCODING", "avi");
    assert!(CamsyncConfig::load().is_err());
    clear_env();

    std::env::set_var("CAMSYNC_CONFIG", "/nonexistent/camsync.json");
    assert!(CamsyncConfig::load().is_err());
    clear_env();
}
