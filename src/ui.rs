use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};

use crate::frame::FrameHandle;
use crate::overlay::OverlaySurface;
use crate::pipeline::Dashboard;
use crate::process::{CategoryCounts, DetectionEvent};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UiMode {
    Auto,
    Plain,
    Pretty,
}

#[derive(Clone, Debug)]
pub struct Ui {
    mode: UiMode,
    is_tty: bool,
    disable_pretty: bool,
}

impl Ui {
    pub fn new(mode: UiMode, is_tty: bool, disable_pretty: bool) -> Self {
        Self {
            mode,
            is_tty,
            disable_pretty,
        }
    }

    pub fn from_args(ui_flag: Option<&str>, is_tty: bool, disable_pretty: bool) -> Self {
        let mode = match ui_flag {
            Some("plain") => UiMode::Plain,
            Some("pretty") => UiMode::Pretty,
            _ => UiMode::Auto,
        };
        Self::new(mode, is_tty, disable_pretty)
    }

    pub fn use_pretty(&self) -> bool {
        self.is_tty
            && match self.mode {
                UiMode::Pretty => true,
                UiMode::Auto => !self.disable_pretty,
                UiMode::Plain => false,
            }
    }

    pub fn stage(&self, name: &str) -> StageGuard {
        if self.use_pretty() {
            let spinner = spinner("{spinner} {msg}");
            spinner.set_message(format!("{name}…"));
            StageGuard::new(name.to_string(), Some(spinner))
        } else {
            eprintln!("==> {}", name);
            StageGuard::new(name.to_string(), None)
        }
    }
}

fn spinner(template: &str) -> ProgressBar {
    let spinner = ProgressBar::new_spinner();
    spinner.set_draw_target(ProgressDrawTarget::stderr());
    spinner.enable_steady_tick(Duration::from_millis(120));
    let style =
        ProgressStyle::with_template(template).unwrap_or_else(|_| ProgressStyle::default_spinner());
    spinner.set_style(style);
    spinner
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
        let elapsed = self.start.elapsed();
        let message = format!("✔ {} ({})", self.name, format_duration(elapsed));
        if let Some(spinner) = &self.spinner {
            spinner.finish_with_message(message);
        } else {
            eprintln!("{message}");
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

/// One-line summary of the running totals.
pub fn counts_line(totals: &CategoryCounts) -> String {
    format!(
        "cars {} | people {} | trucks {} | motorcycles {}",
        totals.cars, totals.people, totals.trucks, totals.motorcycles
    )
}

/// Dashboard for the terminal: a status spinner (or plain lines), optional
/// JSON-lines detection events and optional PNG snapshots of the overlay.
pub struct TerminalDashboard {
    spinner: Option<ProgressBar>,
    last_counts: Option<CategoryCounts>,
    events: Option<Box<dyn Write + Send>>,
    snapshot_dir: Option<PathBuf>,
    snapshots: u64,
    events_written: u64,
}

impl TerminalDashboard {
    pub fn new(ui: &Ui) -> Self {
        let spinner = ui
            .use_pretty()
            .then(|| spinner("{spinner} {msg}\n  {prefix}"));
        Self {
            spinner,
            last_counts: None,
            events: None,
            snapshot_dir: None,
            snapshots: 0,
            events_written: 0,
        }
    }

    /// Write each detection event as one JSON line.
    pub fn with_events(mut self, sink: Box<dyn Write + Send>) -> Self {
        self.events = Some(sink);
        self
    }

    /// Save the composited overlay as `latest.png` in `dir` after every cycle.
    pub fn with_snapshot_dir(mut self, dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create snapshot dir {}", dir.display()))?;
        self.snapshot_dir = Some(dir);
        Ok(self)
    }

    pub fn snapshots_written(&self) -> u64 {
        self.snapshots
    }

    pub fn events_written(&self) -> u64 {
        self.events_written
    }

    pub fn finish(&self) {
        if let Some(spinner) = &self.spinner {
            spinner.finish();
        }
    }

    fn write_snapshot(dir: &Path, surface: &OverlaySurface, frame: &FrameHandle) -> Result<()> {
        let path = dir.join("latest.png");
        let tmp = dir.join("latest.png.tmp");
        surface
            .composite(frame)
            .save_with_format(&tmp, image::ImageFormat::Png)
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, &path)
            .with_context(|| format!("failed to move snapshot to {}", path.display()))?;
        Ok(())
    }
}

impl Dashboard for TerminalDashboard {
    fn show_status(&mut self, status: &str) {
        match &self.spinner {
            Some(spinner) => spinner.set_message(status.to_string()),
            None => eprintln!("==> {}", status),
        }
    }

    fn show_counts(&mut self, totals: &CategoryCounts) {
        if self.last_counts.as_ref() == Some(totals) {
            return;
        }
        self.last_counts = Some(*totals);
        let line = counts_line(totals);
        match &self.spinner {
            Some(spinner) => spinner.set_prefix(line),
            None => eprintln!("    {}", line),
        }
    }

    fn show_overlay(&mut self, surface: &OverlaySurface, frame: &FrameHandle) {
        let Some(dir) = &self.snapshot_dir else {
            return;
        };
        match Self::write_snapshot(dir, surface, frame) {
            Ok(()) => self.snapshots += 1,
            Err(e) => log::warn!("snapshot failed: {:#}", e),
        }
    }

    fn detection_event(&mut self, event: &DetectionEvent) {
        let Some(sink) = self.events.as_mut() else {
            return;
        };
        let line = match serde_json::to_string(event) {
            Ok(line) => line,
            Err(e) => {
                log::warn!("failed to encode detection event: {}", e);
                return;
            }
        };
        if let Err(e) = writeln!(sink, "{}", line).and_then(|_| sink.flush()) {
            log::warn!("failed to write detection event: {}", e);
            return;
        }
        self.events_written += 1;
    }
}
