//! The pipeline service object.
//!
//! `Pipeline` owns every piece of mutable state (selected source, detector,
//! counts, overlay surface, status) and is driven from one thread by
//! [`Pipeline::tick`]. The embedding program supplies a [`Dashboard`] that
//! receives status text, counts, rendered overlays and per-cycle events.

use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};

use crate::camera::{validate_token, CameraListing, CameraRegistry, CameraSource, SourceKind};
use crate::config::CamwatchConfig;
use crate::detect::{BackendRegistry, DetectorLoader};
use crate::frame::FrameHandle;
use crate::ingest::{SourceAcquisition, SourceEvent, SourceFactory, SourceStats};
use crate::overlay::{OverlayRenderer, OverlaySettings, OverlaySurface};
use crate::process::{
    CategoryCounts, DetectionEvent, LabelTable, ResultProcessor, DEFAULT_CONFIDENCE_THRESHOLD,
};
use crate::scheduler::{
    CycleContext, DetectionScheduler, PipelineState, SchedulerEvent, DEFAULT_DETECT_INTERVAL,
    DEFAULT_FRAME_RETRY,
};
use crate::status::StatusReporter;

/// Sinks the pipeline reports into. Every method defaults to a no-op.
pub trait Dashboard {
    fn show_status(&mut self, _status: &str) {}

    /// Running totals, after every cycle and after a reset.
    fn show_counts(&mut self, _totals: &CategoryCounts) {}

    /// Freshly rendered overlay and the frame it was drawn for.
    fn show_overlay(&mut self, _surface: &OverlaySurface, _frame: &FrameHandle) {}

    fn detection_event(&mut self, _event: &DetectionEvent) {}
}

/// Dashboard that discards everything.
#[derive(Debug, Default)]
pub struct NullDashboard;

impl Dashboard for NullDashboard {}

#[derive(Clone, Debug)]
pub struct PipelineOptions {
    pub detect_interval: Duration,
    pub frame_retry: Duration,
    pub confidence_threshold: f32,
    pub labels: LabelTable,
    pub overlay: OverlaySettings,
    pub reset_on_camera_switch: bool,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            detect_interval: DEFAULT_DETECT_INTERVAL,
            frame_retry: DEFAULT_FRAME_RETRY,
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            labels: LabelTable::default(),
            overlay: OverlaySettings::default(),
            reset_on_camera_switch: false,
        }
    }
}

pub struct Pipeline<D: Dashboard> {
    registry: CameraRegistry,
    sources: SourceFactory,
    source: Option<SourceAcquisition>,
    loader: DetectorLoader,
    processor: ResultProcessor,
    renderer: OverlayRenderer,
    scheduler: DetectionScheduler,
    status: StatusReporter,
    dashboard: D,
    reset_on_switch: bool,
    exhausted: bool,
    /// Reason for the last fatal detector error.
    fatal: Option<String>,
    sources_created: u64,
    sources_released: u64,
}

impl<D: Dashboard> Pipeline<D> {
    pub fn new(
        registry: CameraRegistry,
        sources: SourceFactory,
        loader: DetectorLoader,
        dashboard: D,
        options: PipelineOptions,
    ) -> Result<Self> {
        Ok(Self {
            registry,
            sources,
            source: None,
            loader,
            processor: ResultProcessor::new(options.confidence_threshold, options.labels)?,
            renderer: OverlayRenderer::new(options.overlay)?,
            scheduler: DetectionScheduler::new(options.detect_interval, options.frame_retry),
            status: StatusReporter::new(),
            dashboard,
            reset_on_switch: options.reset_on_camera_switch,
            exhausted: false,
            fatal: None,
            sources_created: 0,
            sources_released: 0,
        })
    }

    /// Network-backed pipeline built from loaded configuration.
    pub fn from_config(config: &CamwatchConfig, dashboard: D) -> Result<Self> {
        let registry = config.build_registry()?;
        let sources = SourceFactory::http(config.polling.interval, config.polling.fetch_timeout)
            .with_proxy(config.stream.proxy_base.clone())
            .with_max_media_recoveries(config.stream.max_media_recoveries);
        let backends = BackendRegistry::with_builtin();
        if !backends.contains(&config.detection.backend) {
            return Err(anyhow!(
                "detector backend '{}' is not available (built: {})",
                config.detection.backend,
                backends.list().join(", ")
            ));
        }
        let loader = DetectorLoader::from_registry(
            backends,
            &config.detection.backend,
            config.detection.detector_settings(),
        );
        let options = PipelineOptions {
            detect_interval: config.detection.interval,
            frame_retry: config.detection.frame_retry,
            confidence_threshold: config.detection.confidence_threshold,
            labels: config.detection.label_table()?,
            overlay: config.overlay,
            reset_on_camera_switch: config.reset_on_camera_switch,
        };
        Self::new(registry, sources, loader, dashboard, options)
    }

    /// Start acquiring the selected camera and begin loading the detector.
    pub fn activate(&mut self, now: Instant) {
        self.loader.begin();
        self.dashboard.show_counts(&self.processor.totals());
        self.switch_source(now);
    }

    /// Manual camera selection. Also activates the pipeline if it was not yet.
    pub fn select_camera(&mut self, index: usize, now: Instant) -> Result<()> {
        self.registry.select(index)?;
        self.loader.begin();
        self.exhausted = false;
        self.switch_source(now);
        Ok(())
    }

    /// Select by camera id.
    pub fn select_camera_id(&mut self, id: &str, now: Instant) -> Result<()> {
        let index = self
            .registry
            .index_of(id)
            .ok_or_else(|| anyhow!("unknown camera id '{}'", id))?;
        self.select_camera(index, now)
    }

    /// Tear down the current source and build one for the selected camera.
    fn switch_source(&mut self, now: Instant) {
        self.release_source();
        if self.reset_on_switch && self.sources_created > 0 {
            self.reset_counts();
        }

        let camera = self.registry.selected();
        log::info!(
            "activating camera {} ({}, {})",
            camera.id,
            camera.name,
            camera.kind
        );
        let expired_name = camera.credential_expired().then(|| camera.name.clone());
        let mut source = self.sources.build(camera);
        self.sources_created += 1;
        let generation = self.sources_created;
        let events = source.activate(now);
        self.source = Some(source);
        self.scheduler.camera_changed();

        if let Some(name) = &expired_name {
            log::warn!("camera {} has an expired credential", name);
        }
        self.handle_source_events(events, now);
        if let Some(name) = expired_name {
            // Skip if the failure path already moved on to another source.
            if self.sources_created == generation && self.source.is_some() {
                self.set_status(&format!("{} - Credential expired, update token", name));
            }
        }
    }

    fn release_source(&mut self) {
        if let Some(mut old) = self.source.take() {
            old.deactivate();
            self.sources_released += 1;
        }
    }

    /// Allocate the overlay surface and start the detection loop. Idempotent.
    pub fn start(&mut self, now: Instant) {
        self.renderer.allocate();
        if self.scheduler.start(now) {
            self.set_status("Starting detection...");
        }
    }

    /// Stop the loop and release the overlay surface. Idempotent.
    pub fn stop(&mut self) {
        let was_running = self.scheduler.stop();
        self.renderer.release();
        if was_running {
            self.set_status("Detection stopped");
        }
    }

    pub fn reset_counts(&mut self) {
        self.processor.reset();
        log::info!("detection counts reset");
        self.dashboard.show_counts(&self.processor.totals());
    }

    /// Apply replacement tokens keyed by camera id. All tokens are validated
    /// before any is applied. Reloads the active stream if its token changed.
    /// Returns the number of tokens applied.
    pub fn apply_credentials(&mut self, tokens: &[(String, String)], now: Instant) -> Result<usize> {
        for (id, token) in tokens {
            validate_token(token).with_context(|| format!("token for camera '{}'", id))?;
            let camera = self
                .registry
                .index_of(id)
                .and_then(|index| self.registry.get(index))
                .ok_or_else(|| anyhow!("unknown camera id '{}'", id))?;
            if !camera.uses_token() {
                return Err(anyhow!("camera '{}' does not take a credential token", id));
            }
        }

        let mut reload = false;
        for (id, token) in tokens {
            let index = self.registry.update_credential(id, token)?;
            if index == self.registry.selected_index()
                && self.registry.selected().kind == SourceKind::AdaptiveStream
            {
                reload = true;
            }
        }
        if reload {
            log::info!("reloading active stream with refreshed credential");
            self.exhausted = false;
            self.switch_source(now);
        }
        Ok(tokens.len())
    }

    /// Comma-separated tokens paired, in order, with the token-taking stream
    /// cameras.
    pub fn apply_positional_credentials(&mut self, input: &str, now: Instant) -> Result<usize> {
        let pairs = self.registry.positional_credentials(input);
        if pairs.is_empty() {
            return Err(anyhow!("no tokens found in input"));
        }
        self.apply_credentials(&pairs, now)
    }

    /// Tap-to-play for a stream whose autoplay was refused.
    pub fn resume_playback(&mut self, now: Instant) {
        let events = match self.source.as_mut() {
            Some(source) => source.resume_playback(),
            None => Vec::new(),
        };
        self.handle_source_events(events, now);
    }

    /// Drive sources and the detection loop. Call frequently (every ~100ms).
    pub fn tick(&mut self, now: Instant) {
        let events = match self.source.as_mut() {
            Some(source) => source.tick(now),
            None => Vec::new(),
        };
        self.handle_source_events(events, now);

        let frame = self.source.as_ref().and_then(|source| source.produce_frame());
        let event = self.scheduler.tick(
            now,
            CycleContext {
                loader: &mut self.loader,
                processor: &mut self.processor,
                renderer: &mut self.renderer,
                frame,
            },
        );
        if let Some(event) = event {
            self.handle_scheduler_event(event);
        }
    }

    fn handle_source_events(&mut self, events: Vec<SourceEvent>, now: Instant) {
        for event in events {
            match event {
                SourceEvent::FrameReady { sequence } => {
                    log::debug!("frame {} ready", sequence);
                }
                SourceEvent::Status(message) => self.set_status(&message),
                SourceEvent::Retrying(message) => {
                    let message = self.keep_fatal_visible(&message);
                    self.status.announce(&message);
                    self.dashboard.show_status(&message);
                }
                SourceEvent::Failed {
                    reason,
                    credential_suspect,
                } => {
                    self.source_failed(&reason, credential_suspect, now);
                    // Anything after a failure belongs to the replaced source.
                    return;
                }
            }
        }
    }

    fn source_failed(&mut self, reason: &str, credential_suspect: bool, now: Instant) {
        let index = self.registry.selected_index();
        let name = self.registry.selected().name.clone();
        log::warn!("camera {} failed: {}", name, reason);
        if credential_suspect && self.registry.mark_credential_expired(index) {
            log::warn!("credential for {} flagged as expired", name);
        }
        self.registry.mark_failed(index);

        match self.registry.next_candidate() {
            Some(next) => {
                if let Err(e) = self.registry.advance_to(next) {
                    log::error!("cannot advance camera selection: {:#}", e);
                    return;
                }
                let next_name = self.registry.selected().name.clone();
                self.set_status(&format!(
                    "Failed to load {} - Switching to {}",
                    name, next_name
                ));
                self.switch_source(now);
            }
            None => {
                self.release_source();
                self.exhausted = true;
                self.set_status("All cameras failed to load");
            }
        }
    }

    fn handle_scheduler_event(&mut self, event: SchedulerEvent) {
        match event {
            SchedulerEvent::LoadingModel => self.set_status("Loading detection model..."),
            SchedulerEvent::WaitingForFrame => {
                if !self.exhausted {
                    self.set_status("Waiting for camera image...");
                }
            }
            SchedulerEvent::CycleCompleted { report, frame } => {
                let totals = self.processor.totals();
                self.set_status(&format!(
                    "Live Detection: {} objects found",
                    report.detection_count()
                ));
                self.dashboard.show_counts(&totals);
                if let Some(surface) = self.renderer.surface() {
                    self.dashboard.show_overlay(surface, &frame);
                }
                let event = DetectionEvent::new(&self.registry.selected().id, &report, totals);
                self.dashboard.detection_event(&event);
            }
            SchedulerEvent::InferenceFailed(reason) => {
                self.set_status(&format!("Detection error: {}", reason));
            }
            SchedulerEvent::Fatal(reason) => {
                self.fatal = Some(reason.clone());
                self.set_status(&reason);
            }
        }
    }

    fn set_status(&mut self, message: &str) {
        let message = self.keep_fatal_visible(message);
        if self.status.report(&message) {
            self.dashboard.show_status(&message);
        }
    }

    /// While detection is halted, acquisition messages carry the fatal reason.
    fn keep_fatal_visible(&self, message: &str) -> String {
        match &self.fatal {
            Some(reason)
                if self.scheduler.state() == PipelineState::Error && message != reason =>
            {
                format!("{} - {}", message, reason)
            }
            _ => message.to_string(),
        }
    }

    pub fn state(&self) -> PipelineState {
        self.scheduler.state()
    }

    pub fn is_running(&self) -> bool {
        self.scheduler.is_running()
    }

    pub fn status(&self) -> &str {
        self.status.current()
    }

    pub fn totals(&self) -> CategoryCounts {
        self.processor.totals()
    }

    pub fn registry(&self) -> &CameraRegistry {
        &self.registry
    }

    pub fn listing(&self) -> Vec<CameraListing> {
        self.registry.listing()
    }

    pub fn selected_camera(&self) -> &CameraSource {
        self.registry.selected()
    }

    /// True once every camera has failed since the last manual selection.
    pub fn all_cameras_failed(&self) -> bool {
        self.exhausted
    }

    pub fn source_stats(&self) -> Option<SourceStats> {
        self.source.as_ref().map(|source| source.stats())
    }

    /// Whether the active camera has a frame ready.
    pub fn frame_ready(&self) -> bool {
        self.current_frame().is_some()
    }

    pub fn current_frame(&self) -> Option<FrameHandle> {
        self.source.as_ref().and_then(|source| source.produce_frame())
    }

    pub fn renderer(&self) -> &OverlayRenderer {
        &self.renderer
    }

    pub fn detector_ready(&self) -> bool {
        self.loader.is_ready()
    }

    pub fn cycles(&self) -> u64 {
        self.scheduler.cycles()
    }

    pub fn next_detection_due(&self) -> Option<Instant> {
        self.scheduler.next_due()
    }

    /// Source acquisitions created and released so far.
    pub fn source_lifecycle(&self) -> (u64, u64) {
        (self.sources_created, self.sources_released)
    }

    pub fn dashboard(&self) -> &D {
        &self.dashboard
    }

    pub fn dashboard_mut(&mut self) -> &mut D {
        &mut self.dashboard
    }
}
