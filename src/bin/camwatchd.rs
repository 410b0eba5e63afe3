//! camwatchd - live traffic camera detection daemon
//!
//! Loads configuration, selects a camera, runs the detection loop and reports
//! status, running counts and (optionally) JSON detection events and overlay
//! snapshots until interrupted.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use camwatch::ingest::probe_credentials;
use camwatch::ui::counts_line;
use camwatch::{CamwatchConfig, Pipeline, TerminalDashboard, Ui};

const TICK: Duration = Duration::from_millis(100);
const HEALTH_LOG_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Parser, Debug)]
#[command(name = "camwatchd", version, about = "Live traffic camera object detection")]
struct Args {
    /// Camera to start on, by index or id.
    #[arg(long)]
    camera: Option<String>,

    /// Print the configured cameras and exit.
    #[arg(long)]
    list_cameras: bool,

    /// Write the composited overlay to <dir>/latest.png after every cycle.
    #[arg(long)]
    snapshot_dir: Option<PathBuf>,

    /// Print each detection event as a JSON line on stdout.
    #[arg(long)]
    events_json: bool,

    /// Terminal output style: auto, plain or pretty.
    #[arg(long, value_parser = ["auto", "plain", "pretty"])]
    ui: Option<String>,

    /// HEAD every credentialed stream and exit.
    #[arg(long)]
    probe_credentials: bool,

    /// Replacement credential as <camera-id>=<token>. Repeatable.
    #[arg(long = "token", value_name = "ID=TOKEN")]
    tokens: Vec<String>,

    /// Acquire frames without starting the detection loop.
    #[arg(long)]
    no_start: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let ui = Ui::from_args(
        args.ui.as_deref(),
        std::io::stderr().is_terminal(),
        std::env::var_os("NO_COLOR").is_some(),
    );

    let config = {
        let _stage = ui.stage("Loading configuration");
        CamwatchConfig::load()?
    };

    if args.list_cameras {
        for (index, camera) in config.build_registry()?.listing().iter().enumerate() {
            let expired = if camera.credential_expired {
                " (credential expired)"
            } else {
                ""
            };
            println!(
                "{:>2}  {:<20} {:<16} {}{}",
                index, camera.id, camera.kind, camera.display_name, expired
            );
        }
        return Ok(());
    }

    if args.probe_credentials {
        let registry = config.build_registry()?;
        let probes = {
            let _stage = ui.stage("Probing credentials");
            probe_credentials(&registry, config.polling.fetch_timeout)
        };
        if probes.is_empty() {
            println!("no credentialed streams configured");
        }
        for probe in &probes {
            let outcome = match (&probe.status, &probe.error) {
                (Some(code), _) if probe.works() => format!("ok ({})", code),
                (Some(code), _) => format!("rejected ({})", code),
                (None, Some(error)) => format!("error: {}", error),
                (None, None) => "unknown".to_string(),
            };
            println!("{:<20} {:<24} {}", probe.camera_id, probe.name, outcome);
        }
        return Ok(());
    }

    let tokens = parse_tokens(&args.tokens)?;

    let mut dashboard = TerminalDashboard::new(&ui);
    if args.events_json {
        dashboard = dashboard.with_events(Box::new(std::io::stdout()));
    }
    if let Some(dir) = args.snapshot_dir.clone() {
        dashboard = dashboard.with_snapshot_dir(dir)?;
    }

    let mut pipeline = Pipeline::from_config(&config, dashboard)?;
    let now = Instant::now();
    if let Some(camera) = args.camera.as_deref() {
        match camera.parse::<usize>() {
            Ok(index) => pipeline.select_camera(index, now)?,
            Err(_) => pipeline.select_camera_id(camera, now)?,
        }
    } else {
        pipeline.activate(now);
    }
    if !tokens.is_empty() {
        let applied = pipeline
            .apply_credentials(&tokens, Instant::now())
            .context("applying --token credentials")?;
        log::info!("applied {} credential(s)", applied);
    }
    if !args.no_start {
        pipeline.start(Instant::now());
    }

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })?;

    log::info!(
        "camwatchd running on {} ({})",
        pipeline.selected_camera().name,
        pipeline.selected_camera().id
    );

    let mut last_health = Instant::now();
    while running.load(Ordering::SeqCst) {
        let now = Instant::now();
        pipeline.tick(now);

        if now.duration_since(last_health) >= HEALTH_LOG_INTERVAL {
            last_health = now;
            let stats = pipeline.source_stats().unwrap_or_default();
            log::info!(
                "health: state={} camera={} cycles={} requests={} frames={} failures={} totals=[{}]",
                pipeline.state(),
                pipeline.selected_camera().id,
                pipeline.cycles(),
                stats.requests,
                stats.frames_loaded,
                stats.failures,
                counts_line(&pipeline.totals())
            );
        }

        std::thread::sleep(TICK);
    }

    pipeline.stop();
    pipeline.dashboard().finish();
    log::info!(
        "camwatchd stopped after {} cycles; totals: {}",
        pipeline.cycles(),
        counts_line(&pipeline.totals())
    );
    Ok(())
}

fn parse_tokens(raw: &[String]) -> Result<Vec<(String, String)>> {
    raw.iter()
        .map(|entry| {
            let (id, token) = entry
                .split_once('=')
                .ok_or_else(|| anyhow!("--token expects <camera-id>=<token>, got '{}'", entry))?;
            Ok((id.trim().to_string(), token.trim().to_string()))
        })
        .collect()
}
