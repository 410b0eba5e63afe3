//! Frame acquisition sources.
//!
//! Two variants sit behind [`SourceAcquisition`]:
//! - [`PollingImageSource`]: refetches a still image on a fixed interval.
//! - [`AdaptiveStreamSource`]: attaches a decoder to a segmented video stream.
//!
//! Sources never block the owning thread. Fetches and decoders run on workers
//! and are polled from `tick(now)`; each tick returns the [`SourceEvent`]s the
//! pipeline should act on.
//!
//! `stub://` URLs are served by synthetic fetchers/decoders so the pipeline can
//! run end to end without a network.

mod http;
mod polling;
mod stream;
#[cfg(feature = "stream-gstreamer")]
mod stream_gstreamer;

pub use http::{probe_credentials, probe_url, CredentialProbe, HttpFetcher, ImageFetcher};
pub use polling::PollingImageSource;
pub use stream::{
    AdaptiveStreamSource, DecoderFactory, DefaultDecoderFactory, StreamDecoder, StreamErrorKind,
    StreamEvent, SyntheticDecoder,
};

use std::sync::Arc;
use std::time::{Duration, Instant};

use image::{Rgb, RgbImage};
use serde::Serialize;

use crate::camera::{CameraSource, SourceKind};
use crate::frame::FrameHandle;

/// Something the pipeline should react to after a source tick.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SourceEvent {
    /// A new frame replaced the previous one.
    FrameReady { sequence: u64 },
    /// Informational status text.
    Status(String),
    /// Recoverable failure; the source keeps trying on its own.
    Retrying(String),
    /// The source gave up. `credential_suspect` is set when the failure could
    /// be caused by an expired credential.
    Failed {
        reason: String,
        credential_suspect: bool,
    },
}

/// Per-source counters for health logging.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SourceStats {
    pub requests: u64,
    pub frames_loaded: u64,
    pub failures: u64,
}

/// The active acquisition for the selected camera.
pub enum SourceAcquisition {
    Polling(PollingImageSource),
    Adaptive(AdaptiveStreamSource),
}

impl SourceAcquisition {
    pub fn camera_id(&self) -> &str {
        match self {
            SourceAcquisition::Polling(source) => source.camera_id(),
            SourceAcquisition::Adaptive(source) => source.camera_id(),
        }
    }

    pub fn kind(&self) -> SourceKind {
        match self {
            SourceAcquisition::Polling(_) => SourceKind::PollingImage,
            SourceAcquisition::Adaptive(_) => SourceKind::AdaptiveStream,
        }
    }

    /// Start acquiring. Called once, right after construction.
    pub fn activate(&mut self, now: Instant) -> Vec<SourceEvent> {
        match self {
            SourceAcquisition::Polling(source) => source.activate(now),
            SourceAcquisition::Adaptive(source) => source.activate(now),
        }
    }

    /// Advance timers and collect completed work.
    pub fn tick(&mut self, now: Instant) -> Vec<SourceEvent> {
        match self {
            SourceAcquisition::Polling(source) => source.tick(now),
            SourceAcquisition::Adaptive(source) => source.tick(now),
        }
    }

    /// Latest ready frame, or `None` while not ready.
    pub fn produce_frame(&self) -> Option<FrameHandle> {
        match self {
            SourceAcquisition::Polling(source) => source.produce_frame(),
            SourceAcquisition::Adaptive(source) => source.produce_frame(),
        }
    }

    /// Retry playback after autoplay was refused. Polling sources have
    /// nothing to resume.
    pub fn resume_playback(&mut self) -> Vec<SourceEvent> {
        match self {
            SourceAcquisition::Polling(_) => Vec::new(),
            SourceAcquisition::Adaptive(source) => source.resume_playback(),
        }
    }

    /// Stop timers and release decoder resources. An in-flight image fetch
    /// is abandoned rather than cancelled: its worker runs until the fetch
    /// timeout and the result is dropped.
    pub fn deactivate(&mut self) {
        match self {
            SourceAcquisition::Polling(source) => source.deactivate(),
            SourceAcquisition::Adaptive(source) => source.deactivate(),
        }
    }

    pub fn is_active(&self) -> bool {
        match self {
            SourceAcquisition::Polling(source) => source.is_active(),
            SourceAcquisition::Adaptive(source) => source.is_active(),
        }
    }

    pub fn stats(&self) -> SourceStats {
        match self {
            SourceAcquisition::Polling(source) => source.stats(),
            SourceAcquisition::Adaptive(source) => source.stats(),
        }
    }
}

/// Builds the acquisition variant matching a camera's kind.
#[derive(Clone)]
pub struct SourceFactory {
    pub fetcher: Arc<dyn ImageFetcher>,
    pub decoders: Arc<dyn DecoderFactory>,
    pub poll_interval: Duration,
    pub proxy_base: Option<String>,
    pub max_media_recoveries: u32,
}

impl SourceFactory {
    /// Network-backed factory with the given fetch timeout.
    pub fn http(poll_interval: Duration, fetch_timeout: Duration) -> Self {
        Self {
            fetcher: Arc::new(HttpFetcher::new(fetch_timeout)),
            decoders: Arc::new(DefaultDecoderFactory),
            poll_interval,
            proxy_base: None,
            max_media_recoveries: 3,
        }
    }

    pub fn with_proxy(mut self, proxy_base: Option<String>) -> Self {
        self.proxy_base = proxy_base;
        self
    }

    pub fn with_max_media_recoveries(mut self, max: u32) -> Self {
        self.max_media_recoveries = max;
        self
    }

    pub fn build(&self, camera: &CameraSource) -> SourceAcquisition {
        match camera.kind {
            SourceKind::PollingImage => SourceAcquisition::Polling(PollingImageSource::new(
                camera,
                self.fetcher.clone(),
                self.poll_interval,
            )),
            SourceKind::AdaptiveStream => {
                let proxy_url = self
                    .proxy_base
                    .as_deref()
                    .and_then(|base| proxy_url(base, &camera.id, &camera.resolved_url()));
                SourceAcquisition::Adaptive(AdaptiveStreamSource::new(
                    camera,
                    self.decoders.clone(),
                    proxy_url,
                    self.max_media_recoveries,
                ))
            }
        }
    }
}

/// `<proxy_base>/<camera_id>/<last path segment>`, keeping the query string.
pub fn proxy_url(proxy_base: &str, camera_id: &str, stream_url: &str) -> Option<String> {
    let parsed = url::Url::parse(stream_url).ok()?;
    let segment = parsed
        .path_segments()
        .and_then(|segments| segments.last())
        .filter(|segment| !segment.is_empty())?;
    let mut out = format!(
        "{}/{}/{}",
        proxy_base.trim_end_matches('/'),
        camera_id,
        segment
    );
    if let Some(query) = parsed.query() {
        out.push('?');
        out.push_str(query);
    }
    Some(out)
}

/// Synthetic frame raster used by `stub://` sources.
///
/// A diagonal gradient shifted by `seed`, so consecutive seeds give distinct
/// content.
pub(crate) fn synthetic_image(width: u32, height: u32, seed: u64) -> RgbImage {
    RgbImage::from_fn(width, height, |x, y| {
        let base = (x as u64 + y as u64 + seed) % 256;
        Rgb([base as u8, (base / 2) as u8, (255 - base) as u8])
    })
}
