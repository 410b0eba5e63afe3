//! Detection scheduling state machine.
//!
//! `Idle → LoadingModel → AwaitingFrame → Detecting → Overlaying → AwaitingFrame …`
//! with `Stopped` on an explicit stop and `Error` on a fatal condition (model
//! load failure, overlay surface missing).
//!
//! The scheduler is single-flight: a cycle runs to completion inside one tick,
//! and the next one is scheduled a full period after the tick that ran it.
//! A missing frame is re-checked after the shorter frame-retry delay.

use std::time::{Duration, Instant};

use serde::Serialize;

use crate::detect::DetectorLoader;
use crate::frame::FrameHandle;
use crate::overlay::OverlayRenderer;
use crate::process::{CycleReport, ResultProcessor};
use crate::task::Interval;

pub const DEFAULT_DETECT_INTERVAL: Duration = Duration::from_secs(2);
pub const DEFAULT_FRAME_RETRY: Duration = Duration::from_secs(1);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum PipelineState {
    Idle,
    LoadingModel,
    AwaitingFrame,
    Detecting,
    Overlaying,
    Stopped,
    Error,
}

impl std::fmt::Display for PipelineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

/// Collaborators one scheduler tick may touch.
pub struct CycleContext<'a> {
    pub loader: &'a mut DetectorLoader,
    pub processor: &'a mut ResultProcessor,
    pub renderer: &'a mut OverlayRenderer,
    /// Latest frame of the active source, if ready.
    pub frame: Option<FrameHandle>,
}

/// What happened during a scheduler tick.
#[derive(Debug)]
pub enum SchedulerEvent {
    /// Detector load started; waiting for it.
    LoadingModel,
    /// Cycle due but no frame yet.
    WaitingForFrame,
    /// Detections processed and drawn.
    CycleCompleted {
        report: CycleReport,
        frame: FrameHandle,
    },
    /// This cycle's inference failed; the next one is scheduled normally.
    InferenceFailed(String),
    /// The scheduler entered `Error` and cancelled its cycle.
    Fatal(String),
}

pub struct DetectionScheduler {
    state: PipelineState,
    running: bool,
    in_cycle: bool,
    period: Duration,
    frame_retry: Duration,
    cycle: Option<Interval>,
    cycles: u64,
    loading_announced: bool,
}

impl DetectionScheduler {
    pub fn new(period: Duration, frame_retry: Duration) -> Self {
        Self {
            state: PipelineState::Idle,
            running: false,
            in_cycle: false,
            period,
            frame_retry,
            cycle: None,
            cycles: 0,
            loading_announced: false,
        }
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Completed cycles since construction.
    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    pub fn next_due(&self) -> Option<Instant> {
        self.cycle.map(|cycle| cycle.next_due())
    }

    /// Begin the loop. Returns false if it was already running.
    pub fn start(&mut self, now: Instant) -> bool {
        if self.running {
            return false;
        }
        self.running = true;
        self.state = PipelineState::LoadingModel;
        self.loading_announced = false;
        self.cycle = Some(Interval::due_now(self.period, now));
        log::info!(
            "detection scheduler started ({}ms interval)",
            self.period.as_millis()
        );
        true
    }

    /// Terminate the loop before its next invocation. Returns false if it was
    /// not running.
    pub fn stop(&mut self) -> bool {
        let was_running = self.running;
        self.running = false;
        self.cycle = None;
        self.in_cycle = false;
        self.state = PipelineState::Stopped;
        if was_running {
            log::info!("detection scheduler stopped after {} cycles", self.cycles);
        }
        was_running
    }

    /// The active camera changed. A running loop keeps its schedule and
    /// waits for the new source's first frame.
    pub fn camera_changed(&mut self) {
        if self.state != PipelineState::Error {
            self.state = PipelineState::Idle;
        }
    }

    pub fn tick(&mut self, now: Instant, ctx: CycleContext<'_>) -> Option<SchedulerEvent> {
        if !self.running || self.in_cycle {
            return None;
        }
        let CycleContext {
            loader,
            processor,
            renderer,
            frame,
        } = ctx;

        if self.state == PipelineState::Idle {
            self.state = PipelineState::LoadingModel;
        }

        if self.state == PipelineState::LoadingModel {
            loader.begin();
            loader.poll();
            if let Some(reason) = loader.failure() {
                return Some(self.fatal(format!("Detection model failed to load: {}", reason)));
            }
            if !loader.is_ready() {
                let announce = !self.loading_announced;
                self.loading_announced = true;
                return announce.then_some(SchedulerEvent::LoadingModel);
            }
            self.state = PipelineState::AwaitingFrame;
        }

        if self.state != PipelineState::AwaitingFrame {
            return None;
        }
        let cycle = self.cycle.as_mut()?;
        if !cycle.is_due(now) {
            return None;
        }
        if !renderer.is_allocated() {
            return Some(self.fatal("Overlay surface unavailable".to_string()));
        }
        let Some(frame) = frame else {
            cycle.defer(now, self.frame_retry);
            return Some(SchedulerEvent::WaitingForFrame);
        };

        self.in_cycle = true;
        self.state = PipelineState::Detecting;
        let detected = loader
            .backend_mut()
            .and_then(|backend| backend.detect(&frame));
        let event = match detected {
            Err(e) => {
                log::warn!("inference failed: {:#}", e);
                SchedulerEvent::InferenceFailed(format!("{:#}", e))
            }
            Ok(detections) => {
                let report = processor.process(detections);
                self.state = PipelineState::Overlaying;
                if let Err(e) = renderer.render(&report, &processor.totals(), &frame) {
                    self.in_cycle = false;
                    return Some(self.fatal(format!("Overlay surface unavailable: {:#}", e)));
                }
                self.cycles += 1;
                SchedulerEvent::CycleCompleted { report, frame }
            }
        };

        self.in_cycle = false;
        self.state = PipelineState::AwaitingFrame;
        if let Some(cycle) = self.cycle.as_mut() {
            cycle.reschedule(now);
        }
        Some(event)
    }

    fn fatal(&mut self, reason: String) -> SchedulerEvent {
        log::error!("detection scheduler error: {}", reason);
        self.state = PipelineState::Error;
        self.cycle = None;
        SchedulerEvent::Fatal(reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::{BoundingBox, Detection, DetectorBackend};
    use crate::overlay::OverlaySettings;
    use crate::process::LabelTable;
    use crate::task::Pending;
    use anyhow::anyhow;
    use image::RgbImage;

    struct FixedBackend {
        fail: bool,
    }

    impl DetectorBackend for FixedBackend {
        fn name(&self) -> &'static str {
            "fixed"
        }

        fn detect(&mut self, _frame: &FrameHandle) -> anyhow::Result<Vec<Detection>> {
            if self.fail {
                return Err(anyhow!("tensor shape mismatch"));
            }
            Ok(vec![Detection::new(
                "car",
                0.9,
                BoundingBox::new(0.0, 0.0, 10.0, 10.0),
            )])
        }
    }

    fn loader(fail_detect: bool) -> DetectorLoader {
        DetectorLoader::new(move || {
            Pending::ready(Ok(
                Box::new(FixedBackend { fail: fail_detect }) as Box<dyn DetectorBackend>
            ))
        })
    }

    struct Harness {
        loader: DetectorLoader,
        processor: ResultProcessor,
        renderer: OverlayRenderer,
    }

    impl Harness {
        fn new(loader: DetectorLoader) -> Self {
            let mut renderer = OverlayRenderer::new(OverlaySettings::default()).unwrap();
            renderer.allocate();
            Self {
                loader,
                processor: ResultProcessor::new(0.5, LabelTable::default()).unwrap(),
                renderer,
            }
        }

        fn ctx(&mut self, frame: Option<FrameHandle>) -> CycleContext<'_> {
            CycleContext {
                loader: &mut self.loader,
                processor: &mut self.processor,
                renderer: &mut self.renderer,
                frame,
            }
        }
    }

    fn frame() -> FrameHandle {
        FrameHandle::still(RgbImage::new(64, 40), 1)
    }

    #[test]
    fn runs_cycles_on_period() {
        let mut harness = Harness::new(loader(false));
        let mut scheduler = DetectionScheduler::new(DEFAULT_DETECT_INTERVAL, DEFAULT_FRAME_RETRY);
        let t0 = Instant::now();
        assert!(scheduler.start(t0));

        let event = scheduler.tick(t0, harness.ctx(Some(frame())));
        assert!(matches!(event, Some(SchedulerEvent::CycleCompleted { .. })));
        assert_eq!(scheduler.state(), PipelineState::AwaitingFrame);

        assert!(scheduler
            .tick(t0 + Duration::from_secs(1), harness.ctx(Some(frame())))
            .is_none());
        assert!(matches!(
            scheduler.tick(t0 + Duration::from_secs(2), harness.ctx(Some(frame()))),
            Some(SchedulerEvent::CycleCompleted { .. })
        ));
        assert_eq!(scheduler.cycles(), 2);
        assert_eq!(harness.processor.totals().cars, 2);
    }

    #[test]
    fn start_twice_keeps_one_loop() {
        let mut scheduler = DetectionScheduler::new(DEFAULT_DETECT_INTERVAL, DEFAULT_FRAME_RETRY);
        let t0 = Instant::now();
        assert!(scheduler.start(t0));
        assert!(!scheduler.start(t0 + Duration::from_millis(500)));
        assert_eq!(scheduler.next_due(), Some(t0));
    }

    #[test]
    fn missing_frame_retries_sooner() {
        let mut harness = Harness::new(loader(false));
        let mut scheduler = DetectionScheduler::new(DEFAULT_DETECT_INTERVAL, DEFAULT_FRAME_RETRY);
        let t0 = Instant::now();
        scheduler.start(t0);
        assert!(matches!(
            scheduler.tick(t0, harness.ctx(None)),
            Some(SchedulerEvent::WaitingForFrame)
        ));
        assert_eq!(scheduler.next_due(), Some(t0 + DEFAULT_FRAME_RETRY));
    }

    #[test]
    fn inference_failure_is_recoverable() {
        let mut harness = Harness::new(loader(true));
        let mut scheduler = DetectionScheduler::new(DEFAULT_DETECT_INTERVAL, DEFAULT_FRAME_RETRY);
        let t0 = Instant::now();
        scheduler.start(t0);
        assert!(matches!(
            scheduler.tick(t0, harness.ctx(Some(frame()))),
            Some(SchedulerEvent::InferenceFailed(_))
        ));
        assert_eq!(scheduler.state(), PipelineState::AwaitingFrame);
        assert_eq!(scheduler.next_due(), Some(t0 + DEFAULT_DETECT_INTERVAL));
        assert_eq!(harness.renderer.draw_count(), 0);
    }

    #[test]
    fn model_failure_is_fatal() {
        let mut harness =
            Harness::new(DetectorLoader::new(|| Pending::ready(Err(anyhow!("no model")))));
        let mut scheduler = DetectionScheduler::new(DEFAULT_DETECT_INTERVAL, DEFAULT_FRAME_RETRY);
        let t0 = Instant::now();
        scheduler.start(t0);
        assert!(matches!(
            scheduler.tick(t0, harness.ctx(Some(frame()))),
            Some(SchedulerEvent::Fatal(_))
        ));
        assert_eq!(scheduler.state(), PipelineState::Error);
        assert_eq!(scheduler.next_due(), None);
        assert!(scheduler
            .tick(t0 + Duration::from_secs(10), harness.ctx(Some(frame())))
            .is_none());
    }

    #[test]
    fn missing_surface_is_fatal() {
        let mut harness = Harness::new(loader(false));
        harness.renderer.release();
        let mut scheduler = DetectionScheduler::new(DEFAULT_DETECT_INTERVAL, DEFAULT_FRAME_RETRY);
        let t0 = Instant::now();
        scheduler.start(t0);
        assert!(matches!(
            scheduler.tick(t0, harness.ctx(Some(frame()))),
            Some(SchedulerEvent::Fatal(_))
        ));
        assert_eq!(scheduler.state(), PipelineState::Error);
    }

    #[test]
    fn stop_cancels_next_invocation() {
        let mut harness = Harness::new(loader(false));
        let mut scheduler = DetectionScheduler::new(DEFAULT_DETECT_INTERVAL, DEFAULT_FRAME_RETRY);
        let t0 = Instant::now();
        scheduler.start(t0);
        scheduler.tick(t0, harness.ctx(Some(frame())));
        assert!(scheduler.stop());
        assert!(!scheduler.stop());
        assert_eq!(scheduler.state(), PipelineState::Stopped);
        assert!(scheduler
            .tick(t0 + Duration::from_secs(4), harness.ctx(Some(frame())))
            .is_none());
        assert_eq!(harness.renderer.draw_count(), 1);
    }
}
