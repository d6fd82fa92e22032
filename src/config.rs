use anyhow::{anyhow, Context, Result};
use regex::Regex;
use serde::Deserialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use crate::frame::{CameraId, DEFAULT_BUFFER_CAPACITY};
use crate::storage::StreamEncoding;

const DEFAULT_WIDTH: u32 = 640;
const DEFAULT_HEIGHT: u32 = 480;
const DEFAULT_FPS: u32 = 60;
const DEFAULT_CODEC: &str = "MJPG";
const DEFAULT_DRIVER_BUFFERS: u32 = 1;
const DEFAULT_WARMUP_FRAMES: u32 = 5;
const DEFAULT_LOW_RATE_RATIO: f64 = 0.5;
const DEFAULT_MAX_CONSECUTIVE_FAILURES: u32 = 120;
const DEFAULT_OUTPUT_DIR: &str = "recordings";
const DEFAULT_RECORD_RATE_HZ: f64 = 60.0;
const DEFAULT_MIN_SPEED: f64 = 0.1;
const DEFAULT_MAX_SPEED: f64 = 4.0;
const DEFAULT_TICK_RATE_HZ: f64 = 60.0;
const DEFAULT_STEP_SECS: f64 = 1.0 / 30.0;

#[derive(Debug, Deserialize, Default)]
struct CamsyncConfigFile {
    capture: Option<CaptureConfigFile>,
    recording: Option<RecordingConfigFile>,
    playback: Option<PlaybackConfigFile>,
    cameras: Option<Vec<CameraConfigFile>>,
}

#[derive(Debug, Deserialize, Default)]
struct CaptureConfigFile {
    width: Option<u32>,
    height: Option<u32>,
    fps: Option<u32>,
    codec: Option<String>,
    driver_buffers: Option<u32>,
    warmup_frames: Option<u32>,
    buffer_capacity: Option<usize>,
    probe_secs: Option<f64>,
    low_rate_ratio: Option<f64>,
    max_consecutive_failures: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct RecordingConfigFile {
    output_dir: Option<PathBuf>,
    max_rate_hz: Option<f64>,
    encoding: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct PlaybackConfigFile {
    min_speed: Option<f64>,
    max_speed: Option<f64>,
    max_tick_hz: Option<f64>,
    default_step_secs: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct CameraConfigFile {
    id: u32,
    source: String,
}

#[derive(Debug, Clone, Default)]
pub struct CamsyncConfig {
    pub capture: CaptureSettings,
    pub recording: RecordingSettings,
    pub playback: PlaybackSettings,
    pub cameras: Vec<CameraEntry>,
}

/// Device negotiation and acquisition-loop settings, shared by every camera.
#[derive(Debug, Clone)]
pub struct CaptureSettings {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    /// Fourcc requested from the driver before anything else.
    pub codec: String,
    /// Driver-side buffer count. Kept at the minimum to bound latency.
    pub driver_buffers: u32,
    /// Frames read and thrown away right after open.
    pub warmup_frames: u32,
    pub buffer_capacity: usize,
    /// Length of the achievable-rate probe; `None` skips it.
    pub probe: Option<Duration>,
    /// Probe results below `fps * low_rate_ratio` are flagged.
    pub low_rate_ratio: f64,
    /// Consecutive failed reads after which the loop gives up.
    pub max_consecutive_failures: u32,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            width: DEFAULT_WIDTH,
            height: DEFAULT_HEIGHT,
            fps: DEFAULT_FPS,
            codec: DEFAULT_CODEC.to_string(),
            driver_buffers: DEFAULT_DRIVER_BUFFERS,
            warmup_frames: DEFAULT_WARMUP_FRAMES,
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
            probe: None,
            low_rate_ratio: DEFAULT_LOW_RATE_RATIO,
            max_consecutive_failures: DEFAULT_MAX_CONSECUTIVE_FAILURES,
        }
    }
}

impl CaptureSettings {
    pub fn codec_fourcc(&self) -> [u8; 4] {
        let mut out = [b' '; 4];
        for (slot, byte) in out.iter_mut().zip(self.codec.bytes()) {
            *slot = byte;
        }
        out
    }
}

#[derive(Debug, Clone)]
pub struct RecordingSettings {
    pub output_dir: PathBuf,
    /// Upper bound on recorder loop iterations per second.
    pub max_rate_hz: f64,
    pub encoding: StreamEncoding,
}

impl Default for RecordingSettings {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from(DEFAULT_OUTPUT_DIR),
            max_rate_hz: DEFAULT_RECORD_RATE_HZ,
            encoding: StreamEncoding::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PlaybackSettings {
    pub min_speed: f64,
    pub max_speed: f64,
    pub max_tick_hz: f64,
    /// Step size used when no frame interval can be observed.
    pub default_step_secs: f64,
}

impl Default for PlaybackSettings {
    fn default() -> Self {
        Self {
            min_speed: DEFAULT_MIN_SPEED,
            max_speed: DEFAULT_MAX_SPEED,
            max_tick_hz: DEFAULT_TICK_RATE_HZ,
            default_step_secs: DEFAULT_STEP_SECS,
        }
    }
}

impl PlaybackSettings {
    pub fn clamp_speed(&self, speed: f64) -> f64 {
        if speed.is_nan() {
            return 1.0_f64.clamp(self.min_speed, self.max_speed);
        }
        speed.clamp(self.min_speed, self.max_speed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CameraEntry {
    pub id: CameraId,
    pub source: String,
}

impl CamsyncConfig {
    /// Load from the file named by `CAMSYNC_CONFIG`, if any.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("CAMSYNC_CONFIG").ok().map(PathBuf::from);
        Self::load_from(config_path.as_deref())
    }

    /// Load from an explicit file (or defaults), then apply env overrides.
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: CamsyncConfigFile) -> Result<Self> {
        let capture_file = file.capture.unwrap_or_default();
        let defaults = CaptureSettings::default();
        let capture = CaptureSettings {
            width: capture_file.width.unwrap_or(defaults.width),
            height: capture_file.height.unwrap_or(defaults.height),
            fps: capture_file.fps.unwrap_or(defaults.fps),
            codec: capture_file.codec.unwrap_or(defaults.codec),
            driver_buffers: capture_file
                .driver_buffers
                .unwrap_or(defaults.driver_buffers),
            warmup_frames: capture_file.warmup_frames.unwrap_or(defaults.warmup_frames),
            buffer_capacity: capture_file
                .buffer_capacity
                .unwrap_or(defaults.buffer_capacity),
            probe: match capture_file.probe_secs {
                Some(secs) if secs > 0.0 => Some(
                    Duration::try_from_secs_f64(secs)
                        .map_err(|_| anyhow!("capture probe_secs {} is out of range", secs))?,
                ),
                Some(_) => None,
                None => defaults.probe,
            },
            low_rate_ratio: capture_file
                .low_rate_ratio
                .unwrap_or(defaults.low_rate_ratio),
            max_consecutive_failures: capture_file
                .max_consecutive_failures
                .unwrap_or(defaults.max_consecutive_failures),
        };

        let recording_file = file.recording.unwrap_or_default();
        let recording = RecordingSettings {
            output_dir: recording_file
                .output_dir
                .unwrap_or_else(|| PathBuf::from(DEFAULT_OUTPUT_DIR)),
            max_rate_hz: recording_file.max_rate_hz.unwrap_or(DEFAULT_RECORD_RATE_HZ),
            encoding: match recording_file.encoding {
                Some(name) => name.parse()?,
                None => StreamEncoding::default(),
            },
        };

        let playback_file = file.playback.unwrap_or_default();
        let playback = PlaybackSettings {
            min_speed: playback_file.min_speed.unwrap_or(DEFAULT_MIN_SPEED),
            max_speed: playback_file.max_speed.unwrap_or(DEFAULT_MAX_SPEED),
            max_tick_hz: playback_file.max_tick_hz.unwrap_or(DEFAULT_TICK_RATE_HZ),
            default_step_secs: playback_file
                .default_step_secs
                .unwrap_or(DEFAULT_STEP_SECS),
        };

        let cameras = file
            .cameras
            .unwrap_or_default()
            .into_iter()
            .map(|cam| CameraEntry {
                id: CameraId(cam.id),
                source: cam.source,
            })
            .collect();

        Ok(Self {
            capture,
            recording,
            playback,
            cameras,
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(dir) = std::env::var("CAMSYNC_OUTPUT_DIR") {
            if !dir.trim().is_empty() {
                self.recording.output_dir = PathBuf::from(dir);
            }
        }
        if let Ok(cameras) = std::env::var("CAMSYNC_CAMERAS") {
            let parsed = parse_camera_list(&cameras)?;
            if !parsed.is_empty() {
                self.cameras = parsed;
            }
        }
        if let Ok(fps) = std::env::var("CAMSYNC_CAPTURE_FPS") {
            self.capture.fps = fps
                .trim()
                .parse()
                .map_err(|_| anyhow!("CAMSYNC_CAPTURE_FPS must be an integer frame rate"))?;
        }
        if let Ok(capacity) = std::env::var("CAMSYNC_BUFFER_CAPACITY") {
            self.capture.buffer_capacity = capacity
                .trim()
                .parse()
                .map_err(|_| anyhow!("CAMSYNC_BUFFER_CAPACITY must be an integer"))?;
        }
        if let Ok(encoding) = std::env::var("CAMSYNC_ENCODING") {
            if !encoding.trim().is_empty() {
                self.recording.encoding = encoding.trim().parse()?;
            }
        }
        Ok(())
    }

    pub fn validate(&mut self) -> Result<()> {
        validate_fourcc(&self.capture.codec)?;
        if self.capture.fps == 0 {
            return Err(anyhow!("capture fps must be greater than zero"));
        }
        if self.capture.width == 0 || self.capture.height == 0 {
            return Err(anyhow!("capture resolution must be non-zero"));
        }
        if self.capture.buffer_capacity == 0 {
            return Err(anyhow!("frame buffer capacity must be at least 1"));
        }
        if self.capture.driver_buffers == 0 {
            self.capture.driver_buffers = 1;
        }
        if !(self.recording.max_rate_hz > 0.0) {
            return Err(anyhow!("recording max_rate_hz must be greater than zero"));
        }
        if !(self.playback.min_speed > 0.0) || self.playback.min_speed > self.playback.max_speed
        {
            return Err(anyhow!(
                "playback speed range [{}, {}] is invalid",
                self.playback.min_speed,
                self.playback.max_speed
            ));
        }
        if !(self.playback.max_tick_hz > 0.0) {
            return Err(anyhow!("playback max_tick_hz must be greater than zero"));
        }
        if !(self.playback.default_step_secs > 0.0) {
            return Err(anyhow!("playback default_step_secs must be greater than zero"));
        }

        let mut seen = BTreeSet::new();
        for cam in &self.cameras {
            if !seen.insert(cam.id) {
                return Err(anyhow!("camera id {} configured more than once", cam.id));
            }
            if cam.source.trim().is_empty() {
                return Err(anyhow!("camera {} has an empty source", cam.id));
            }
        }
        Ok(())
    }
}

/// Parse `id=descriptor` pairs separated by commas.
pub fn parse_camera_list(value: &str) -> Result<Vec<CameraEntry>> {
    split_csv(value)
        .into_iter()
        .map(|entry| {
            let (id, source) = entry
                .split_once('=')
                .ok_or_else(|| anyhow!("camera entry '{}' must look like id=source", entry))?;
            let id: u32 = id
                .trim()
                .parse()
                .map_err(|_| anyhow!("camera id '{}' is not an integer", id.trim()))?;
            Ok(CameraEntry {
                id: CameraId(id),
                source: source.trim().to_string(),
            })
        })
        .collect()
}

fn validate_fourcc(codec: &str) -> Result<()> {
    static FOURCC_RE: OnceLock<Regex> = OnceLock::new();
    let re = match FOURCC_RE.get() {
        Some(re) => re,
        None => {
            let re = Regex::new(r"^[A-Z0-9 ]{4}$")?;
            FOURCC_RE.get_or_init(|| re)
        }
    };
    if !re.is_match(codec) {
        return Err(anyhow!(
            "codec hint '{}' must be a four character code (e.g. MJPG)",
            codec
        ));
    }
    Ok(())
}

fn read_config_file(path: &Path) -> Result<CamsyncConfigFile> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let is_toml = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|entry| entry.trim())
        .filter(|entry| !entry.is_empty())
        .map(|entry| entry.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let mut cfg = CamsyncConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.capture.codec_fourcc(), *b"MJPG");
        assert_eq!(cfg.playback.clamp_speed(10.0), 4.0);
        assert_eq!(cfg.playback.clamp_speed(0.0), 0.1);
    }

    #[test]
    fn camera_list_parses_indices_and_paths() {
        let cams = parse_camera_list("0=0, 1=/dev/video2,2=stub://side").unwrap();
        assert_eq!(cams.len(), 3);
        assert_eq!(cams[1].id, CameraId(1));
        assert_eq!(cams[1].source, "/dev/video2");
        assert!(parse_camera_list("nope").is_err());
    }

    #[test]
    fn rejects_bad_codec_and_duplicate_ids() {
        let mut cfg = CamsyncConfig::default();
        cfg.capture.codec = "mjpeg".to_string();
        assert!(cfg.validate().is_err());

        let mut cfg = CamsyncConfig::default();
        cfg.cameras = parse_camera_list("0=stub://a,0=stub://b").unwrap();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn toml_file_is_accepted() {
        let file: CamsyncConfigFile = toml::from_str(
            r#"
            [capture]
            fps = 30
            probe_secs = 1.5

            [[cameras]]
            id = 3
            source = "stub://rear"
            "#,
        )
        .unwrap();
        let cfg = CamsyncConfig::from_file(file).unwrap();
        assert_eq!(cfg.capture.fps, 30);
        assert_eq!(cfg.capture.probe, Some(Duration::from_millis(1500)));
        assert_eq!(cfg.cameras[0].id, CameraId(3));
    }

    #[test]
    fn infinite_probe_window_is_rejected() {
        let file: CamsyncConfigFile = toml::from_str(
            r#"
            [capture]
            probe_secs = inf
            "#,
        )
        .unwrap();
        assert!(CamsyncConfig::from_file(file).is_err());
    }
}
