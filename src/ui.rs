use clap::ValueEnum;
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::time::{Duration, Instant};

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum UiMode {
    Auto,
    Plain,
    Pretty,
}

/// Stage progress on stderr: spinners on a terminal, `==>` lines otherwise.
#[derive(Clone, Debug)]
pub struct Ui {
    pretty: bool,
}

impl Ui {
    pub fn new(mode: UiMode, stderr_is_tty: bool) -> Self {
        let pretty = stderr_is_tty
            && match mode {
                UiMode::Pretty | UiMode::Auto => true,
                UiMode::Plain => false,
            };
        Self { pretty }
    }

    pub fn stage(&self, name: &str) -> StageGuard {
        if self.pretty {
            let spinner = ProgressBar::new_spinner();
            spinner.set_draw_target(ProgressDrawTarget::stderr());
            spinner.enable_steady_tick(Duration::from_millis(120));
            let style = ProgressStyle::with_template("{spinner} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner());
            spinner.set_style(style);
            spinner.set_message(format!("{name}…"));
            StageGuard::new(name.to_string(), Some(spinner))
        } else {
            eprintln!("==> {}", name);
            StageGuard::new(name.to_string(), None)
        }
    }

    /// A bar counting up to `total_ms`, or a hidden bar in plain mode.
    pub fn timeline_bar(&self, label: &str, total_ms: u64) -> ProgressBar {
        if !self.pretty {
            eprintln!("==> {}", label);
            return ProgressBar::hidden();
        }
        let bar = ProgressBar::new(total_ms.max(1));
        bar.set_draw_target(ProgressDrawTarget::stderr());
        let style = ProgressStyle::with_template("{msg} [{bar:30}] {pos}/{len}ms")
            .unwrap_or_else(|_| ProgressStyle::default_bar());
        bar.set_style(style);
        bar.set_message(label.to_string());
        bar
    }
}

pub struct StageGuard {
    name: String,
    start: Instant,
    spinner: Option<ProgressBar>,
}

impl StageGuard {
    fn new(name: String, spinner: Option<ProgressBar>) -> Self {
        Self {
            name,
            start: Instant::now(),
            spinner,
        }
    }
}

impl Drop for StageGuard {
    fn drop(&mut self) {
        let message = format!("✔ {} ({})", self.name, format_duration(self.start.elapsed()));
        match &self.spinner {
            Some(spinner) => spinner.finish_with_message(message),
            None => eprintln!("{message}"),
        }
    }
}

fn format_duration(duration: Duration) -> String {
    if duration.as_secs() >= 1 {
        format!("{:.2}s", duration.as_secs_f64())
    } else {
        format!("{}ms", duration.as_millis())
    }
}
