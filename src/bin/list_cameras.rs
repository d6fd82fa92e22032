//! list_cameras - report which camera indices can be opened

use anyhow::Result;
use clap::Parser;
use std::io::IsTerminal;
use std::path::PathBuf;

use camsync::{probe_cameras, CamsyncConfig};

#[path = "../ui.rs"]
mod ui;

#[derive(Parser, Debug)]
#[command(name = "list_cameras", version, about = "Probe camera device indices")]
struct Args {
    /// Probe indices 0..MAX.
    #[arg(long, default_value_t = 10, value_name = "MAX")]
    max_index: u32,

    /// Config file (capture settings are used when opening devices).
    #[arg(long, env = "CAMSYNC_CONFIG", value_name = "PATH")]
    config: Option<PathBuf>,

    /// Print results as JSON.
    #[arg(long)]
    json: bool,

    /// UI mode for stderr progress.
    #[arg(long, value_enum, default_value = "auto")]
    ui: ui::UiMode,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args = Args::parse();
    let ui = ui::Ui::new(args.ui, std::io::stderr().is_terminal());
    let config = CamsyncConfig::load_from(args.config.as_deref())?;

    let results = {
        let _stage = ui.stage("Probe cameras");
        probe_cameras(args.max_index, &config.capture)
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&results)?);
        return Ok(());
    }

    let available: Vec<_> = results.iter().filter(|r| r.available).collect();
    if available.is_empty() {
        println!("no cameras found in 0..{}", args.max_index);
        return Ok(());
    }
    for result in available {
        match result.mode {
            Some(mode) => println!(
                "camera {}: {}x{} @ {}fps",
                result.index, mode.width, mode.height, mode.fps
            ),
            None => println!("camera {}: available", result.index),
        }
    }
    Ok(())
}
