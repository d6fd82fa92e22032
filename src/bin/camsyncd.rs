//! camsyncd - multi-camera capture daemon
//!
//! This daemon:
//! 1. Loads configuration (file named by CAMSYNC_CONFIG, env overrides, flags)
//! 2. Opens every configured camera and starts one acquisition thread each
//! 3. Logs per-camera health every few seconds
//! 4. Optionally records a synchronized session until Ctrl-C or --duration

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use camsync::config::parse_camera_list;
use camsync::{CamsyncConfig, CaptureRegistry, Recorder, SourceDescriptor};

#[path = "../ui.rs"]
mod ui;

const HEALTH_INTERVAL: Duration = Duration::from_secs(5);
const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Parser, Debug)]
#[command(name = "camsyncd", version, about = "Capture (and optionally record) several cameras in sync")]
struct Args {
    /// Config file (JSON, or TOML by extension).
    #[arg(long, env = "CAMSYNC_CONFIG", value_name = "PATH")]
    config: Option<PathBuf>,

    /// Camera as id=descriptor (index, device path or stub://name). Repeatable;
    /// replaces the configured camera list.
    #[arg(long = "camera", value_name = "ID=SOURCE")]
    cameras: Vec<String>,

    /// Record a session while capturing.
    #[arg(long)]
    record: bool,

    /// Stop after this many seconds instead of waiting for Ctrl-C.
    #[arg(long, value_name = "SECS")]
    duration: Option<f64>,

    /// Directory that receives session directories.
    #[arg(long, value_name = "DIR")]
    output_dir: Option<PathBuf>,

    /// UI mode for stderr progress.
    #[arg(long, value_enum, default_value = "auto")]
    ui: ui::UiMode,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let ui = ui::Ui::new(args.ui, std::io::stderr().is_terminal());
    let deadline = args
        .duration
        .map(Duration::try_from_secs_f64)
        .transpose()
        .map_err(|_| anyhow!("--duration must be a non-negative number of seconds"))?;

    let mut config = CamsyncConfig::load_from(args.config.as_deref())?;
    if !args.cameras.is_empty() {
        config.cameras = parse_camera_list(&args.cameras.join(","))?;
    }
    if let Some(dir) = &args.output_dir {
        config.recording.output_dir = dir.clone();
    }
    config.validate()?;
    if config.cameras.is_empty() {
        return Err(anyhow!(
            "no cameras configured (use --camera 0=0 or CAMSYNC_CAMERAS=0=stub://front)"
        ));
    }

    let registry = Arc::new(CaptureRegistry::new(config.capture.clone()));
    {
        let _stage = ui.stage("Open cameras");
        for entry in &config.cameras {
            let descriptor: SourceDescriptor = entry.source.parse()?;
            if let Err(err) = registry.add_camera(entry.id, &descriptor) {
                log::warn!("camsyncd: {} ({})", err, err.code());
            }
        }
    }
    if registry.is_empty() {
        return Err(anyhow!("none of the configured cameras could be opened"));
    }
    let running = registry.start_all();
    log::info!("camsyncd: capturing from {} camera(s)", running);

    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = shutdown.clone();
    ctrlc::set_handler(move || flag.store(true, Ordering::SeqCst))
        .context("error setting Ctrl-C handler")?;

    let recorder = Recorder::new(registry.clone(), config.recording.clone());
    if args.record {
        let _stage = ui.stage("Start recording");
        let dir = recorder.start(&config.recording.output_dir)?;
        log::info!("camsyncd: recording to {}", dir.display());
    }

    let started = Instant::now();
    let mut last_health = Instant::now();
    while !shutdown.load(Ordering::SeqCst) {
        if deadline.is_some_and(|limit| started.elapsed() >= limit) {
            break;
        }
        if !registry.is_capturing() {
            log::error!("camsyncd: every camera has stopped");
            break;
        }
        if last_health.elapsed() >= HEALTH_INTERVAL {
            for stats in registry.stats() {
                log::info!(
                    "camsyncd: camera {} {:?} captured={} dropped={} failures={}",
                    stats.camera,
                    stats.state,
                    stats.frames_captured,
                    stats.frames_dropped,
                    stats.read_failures
                );
            }
            last_health = Instant::now();
        }
        std::thread::sleep(POLL_INTERVAL);
    }
    log::info!("camsyncd: shutting down");

    let summary = if recorder.is_recording() {
        let _stage = ui.stage("Finalize recording");
        recorder.stop()?
    } else {
        None
    };
    if let Some(summary) = summary {
        println!("session: {}", summary.session_dir.display());
        println!("duration: {:.3}s", summary.manifest.duration);
        for (camera, frames) in &summary.frames_written {
            println!("camera {}: {} frame(s)", camera, frames);
        }
        for camera in &summary.failed_cameras {
            println!("camera {}: FAILED during recording", camera);
        }
    }

    {
        let _stage = ui.stage("Stop cameras");
        registry.stop_all();
    }
    Ok(())
}
