use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use image::RgbImage;

use super::http::redact_query;
use super::{ImageFetcher, SourceEvent, SourceStats};
use crate::camera::CameraSource;
use crate::frame::FrameHandle;
use crate::task::{Interval, Pending, Poll};

/// Still-image camera refetched on a fixed interval.
///
/// One fetch is in flight at most. Failures are reported and retried on the
/// same interval, forever.
pub struct PollingImageSource {
    camera_id: String,
    name: String,
    url: String,
    fetcher: Arc<dyn ImageFetcher>,
    period: Duration,
    refresh: Option<Interval>,
    in_flight: Option<Pending<RgbImage>>,
    frame: Option<FrameHandle>,
    request_seq: u64,
    stats: SourceStats,
}

impl PollingImageSource {
    pub fn new(camera: &CameraSource, fetcher: Arc<dyn ImageFetcher>, period: Duration) -> Self {
        Self {
            camera_id: camera.id.clone(),
            name: camera.name.clone(),
            url: camera.resolved_url(),
            fetcher,
            period,
            refresh: None,
            in_flight: None,
            frame: None,
            request_seq: 0,
            stats: SourceStats::default(),
        }
    }

    pub fn camera_id(&self) -> &str {
        &self.camera_id
    }

    pub fn activate(&mut self, now: Instant) -> Vec<SourceEvent> {
        self.refresh = Some(Interval::due_now(self.period, now));
        log::info!(
            "polling source {} active ({}s interval, {})",
            self.camera_id,
            self.period.as_secs(),
            redact_query(&self.url)
        );
        let mut events = vec![SourceEvent::Status(format!("Loading {}...", self.name))];
        events.extend(self.tick(now));
        events
    }

    pub fn tick(&mut self, now: Instant) -> Vec<SourceEvent> {
        let mut events = Vec::new();
        let Some(refresh) = self.refresh.as_mut() else {
            return events;
        };

        if refresh.is_due(now) {
            refresh.reschedule(now);
            if self.in_flight.is_some() {
                log::debug!("polling source {}: fetch still in flight, skipping", self.camera_id);
            } else {
                self.request_seq += 1;
                self.stats.requests += 1;
                let url = cache_busted(&self.url, self.request_seq);
                self.in_flight = Some(self.fetcher.fetch(&url));
            }
        }

        self.collect(&mut events);
        events
    }

    fn collect(&mut self, events: &mut Vec<SourceEvent>) {
        let Some(pending) = self.in_flight.as_mut() else {
            return;
        };
        match pending.poll() {
            Poll::Waiting => {}
            Poll::Done(Ok(image)) => {
                self.in_flight = None;
                self.stats.frames_loaded += 1;
                let frame = FrameHandle::still(image, self.request_seq);
                log::debug!("polling source {}: frame {:?}", self.camera_id, frame);
                self.frame = Some(frame);
                events.push(SourceEvent::FrameReady {
                    sequence: self.request_seq,
                });
                events.push(SourceEvent::Status(format!("{} - Live feed active", self.name)));
            }
            Poll::Done(Err(e)) => {
                self.in_flight = None;
                self.stats.failures += 1;
                log::warn!("polling source {}: fetch failed: {:#}", self.camera_id, e);
                events.push(SourceEvent::Retrying(format!(
                    "Failed to load {} - Retrying...",
                    self.name
                )));
            }
        }
    }

    /// The last successfully loaded image. A failed refresh keeps the
    /// previous frame.
    pub fn produce_frame(&self) -> Option<FrameHandle> {
        self.frame.clone()
    }

    /// Stops the refresh schedule and abandons any in-flight fetch.
    pub fn deactivate(&mut self) {
        self.refresh = None;
        self.in_flight = None;
        self.frame = None;
        log::info!("polling source {} released", self.camera_id);
    }

    pub fn is_active(&self) -> bool {
        self.refresh.is_some()
    }

    pub fn stats(&self) -> SourceStats {
        self.stats.clone()
    }
}

/// Append `t=<unix-millis>-<seq>`, keeping any existing query.
pub(crate) fn cache_busted(url: &str, seq: u64) -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    let stamp = format!("{}-{}", millis, seq);
    match url::Url::parse(url) {
        Ok(mut parsed) => {
            parsed.query_pairs_mut().append_pair("t", &stamp);
            parsed.to_string()
        }
        Err(_) => {
            let sep = if url.contains('?') { '&' } else { '?' };
            format!("{}{}t={}", url, sep, stamp)
        }
    }
}
