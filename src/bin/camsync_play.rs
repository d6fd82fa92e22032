//! camsync_play - replay a recorded session
//!
//! Prints the session manifest, then either plays it for a while at a chosen
//! speed or steps through it frame by frame, reporting the frame sets the
//! engine delivered.

use anyhow::{anyhow, Result};
use clap::Parser;
use std::collections::BTreeMap;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use camsync::{CameraId, CamsyncConfig, PlaybackEngine};

#[path = "../ui.rs"]
mod ui;

#[derive(Parser, Debug)]
#[command(name = "camsync_play", version, about = "Replay a recorded camsync session")]
struct Args {
    /// Session directory (or its manifest.json).
    session: PathBuf,

    /// Config file (JSON, or TOML by extension).
    #[arg(long, env = "CAMSYNC_CONFIG", value_name = "PATH")]
    config: Option<PathBuf>,

    /// Wall-clock seconds to play for.
    #[arg(long, default_value_t = 5.0)]
    seconds: f64,

    /// Playback speed multiplier (clamped to the configured range).
    #[arg(long, default_value_t = 1.0)]
    speed: f64,

    /// Start position in seconds.
    #[arg(long, default_value_t = 0.0)]
    seek: f64,

    /// Step this many frames instead of playing.
    #[arg(long, value_name = "N")]
    step: Option<u32>,

    /// Step backwards.
    #[arg(long, requires = "step")]
    backward: bool,

    /// UI mode for stderr progress.
    #[arg(long, value_enum, default_value = "auto")]
    ui: ui::UiMode,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let play_for = play_duration(args.seconds)?;
    let ui = ui::Ui::new(args.ui, std::io::stderr().is_terminal());
    let config = CamsyncConfig::load_from(args.config.as_deref())?;

    let engine = PlaybackEngine::new(config.playback.clone());
    {
        let _stage = ui.stage("Load session");
        engine.load(&args.session)?;
    }
    let manifest = engine
        .manifest()
        .ok_or_else(|| anyhow!("session did not load"))?;

    println!("session: {}", args.session.display());
    println!("recorded: {}", manifest.created_at.to_rfc3339());
    println!("duration: {:.3}s", manifest.duration);
    for cam in &manifest.cameras {
        println!(
            "camera {}: {} ({}x{} @ {}fps, {} frames, {})",
            cam.id,
            cam.file,
            cam.width,
            cam.height,
            cam.fps,
            cam.timestamps.len(),
            cam.encoding
        );
    }
    println!();

    engine.seek(args.seek);
    let (_, frames_rx) = engine.subscribe(256);

    if let Some(steps) = args.step {
        for _ in 0..steps {
            let set = engine.step(!args.backward)?;
            let cameras: Vec<String> = set.frames.keys().map(|id| id.to_string()).collect();
            println!("t={:.4}s cameras=[{}]", set.position, cameras.join(", "));
        }
        return Ok(());
    }

    let speed = engine.set_speed(args.speed);
    let bar = ui.timeline_bar(
        &format!("Playing at {:.2}x", speed),
        play_for.as_millis() as u64,
    );

    let mut per_camera: BTreeMap<CameraId, u64> = BTreeMap::new();
    let mut frame_sets = 0u64;
    let started = Instant::now();
    engine.play()?;
    while started.elapsed() < play_for {
        if let Ok(set) = frames_rx.recv_timeout(Duration::from_millis(50)) {
            frame_sets += 1;
            for camera in set.frames.keys() {
                *per_camera.entry(*camera).or_default() += 1;
            }
        }
        bar.set_position(started.elapsed().as_millis() as u64);
    }
    engine.pause();
    bar.finish_and_clear();

    println!("frame sets received: {}", frame_sets);
    for (camera, count) in &per_camera {
        println!("camera {}: {} frame(s)", camera, count);
    }
    println!("final position: {:.3}s", engine.position());
    Ok(())
}

fn play_duration(seconds: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(seconds)
        .map_err(|_| anyhow!("--seconds must be a finite, non-negative number"))
}
