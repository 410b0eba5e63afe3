//! camwatch: live object detection over public traffic cameras.
//!
//! A [`Pipeline`] acquires frames from the selected camera (a still image
//! polled on a fixed period, or an adaptive video stream), runs a detector
//! over the latest frame on a fixed cadence, keeps per-category running
//! totals, and paints an annotated overlay for a [`Dashboard`] to show.
//!
//! # Module Structure
//!
//! - `camera`: camera catalog, credentials and the selection registry
//! - `ingest`: frame acquisition (polling stills, adaptive streams)
//! - `detect`: detector backends, their registry and the async loader
//! - `process`: confidence filtering, classification, counts, congestion
//! - `overlay`: drawing plan and rasterization of the annotation layer
//! - `scheduler`: the start/stop detection loop
//! - `pipeline`: the single-owner service object tying it all together
//!
//! Nothing blocks the caller of [`Pipeline::tick`]: image fetches, stream
//! decoding and model loading run on worker threads and report back through
//! [`task::Pending`].

pub mod camera;
pub mod config;
pub mod detect;
pub mod frame;
pub mod ingest;
pub mod overlay;
pub mod pipeline;
pub mod process;
pub mod scheduler;
pub mod status;
pub mod task;
pub mod ui;

pub use camera::{validate_token, CameraListing, CameraRegistry, CameraSource, SourceKind};
pub use config::CamwatchConfig;
pub use detect::{
    BackendRegistry, BoundingBox, Detection, DetectorBackend, DetectorLoader, DetectorSettings,
    StubBackend,
};
pub use frame::FrameHandle;
pub use ingest::{SourceEvent, SourceFactory, SourceStats};
pub use overlay::{DrawOp, OverlayRenderer, OverlaySettings, OverlaySurface};
pub use pipeline::{Dashboard, NullDashboard, Pipeline, PipelineOptions};
pub use process::{
    Category, CategoryCounts, CongestionLevel, CycleReport, DetectionEvent, LabelTable,
    ResultProcessor, TrafficAnalysis,
};
pub use scheduler::PipelineState;
pub use task::{Pending, Poll};
pub use ui::{TerminalDashboard, Ui};
