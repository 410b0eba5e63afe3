use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};

use super::http::redact_query;
use super::{synthetic_image, SourceEvent, SourceStats};
use crate::camera::CameraSource;
use crate::frame::FrameHandle;

/// Decoder error classes, mirroring what adaptive players report.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamErrorKind {
    Network,
    Media,
    Other,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StreamEvent {
    /// Playlist parsed; playback may start.
    ManifestParsed,
    Error {
        kind: StreamErrorKind,
        fatal: bool,
        detail: String,
    },
}

/// A playback element attached to one stream URL.
///
/// Implementations do their blocking work off the owning thread and only
/// report through `poll_event` / `take_frame`.
pub trait StreamDecoder: Send {
    /// Begin loading the manifest.
    fn load(&mut self, url: &str) -> Result<()>;

    /// Next pending decoder event, if any.
    fn poll_event(&mut self) -> Option<StreamEvent>;

    /// Most recent decoded frame since the last call.
    fn take_frame(&mut self) -> Option<FrameHandle>;

    /// Start playback. An error means playback was refused (autoplay policy)
    /// and needs an explicit resume.
    fn play(&mut self) -> Result<()>;

    /// In-place recovery after a media error.
    fn recover_media_error(&mut self) -> Result<()>;

    /// Release all decoder resources.
    fn destroy(&mut self);
}

pub trait DecoderFactory: Send + Sync {
    fn create(&self, url: &str) -> Result<Box<dyn StreamDecoder>>;
}

/// Synthetic decoder for `stub://` URLs, GStreamer for everything else when
/// the `stream-gstreamer` feature is on.
pub struct DefaultDecoderFactory;

impl DecoderFactory for DefaultDecoderFactory {
    fn create(&self, url: &str) -> Result<Box<dyn StreamDecoder>> {
        if url.starts_with("stub://") {
            return Ok(Box::new(SyntheticDecoder::new()));
        }
        #[cfg(feature = "stream-gstreamer")]
        {
            Ok(Box::new(super::stream_gstreamer::GstreamerDecoder::new()?))
        }
        #[cfg(not(feature = "stream-gstreamer"))]
        {
            Err(anyhow!(
                "adaptive streams require the stream-gstreamer feature ({})",
                redact_query(url)
            ))
        }
    }
}

/// Playback progress of the current decoder.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Playback {
    Loading,
    Playing,
    /// Autoplay refused; waiting for `resume_playback`.
    Blocked,
    Failed,
}

/// Camera backed by a segmented/adaptive video stream.
pub struct AdaptiveStreamSource {
    camera_id: String,
    name: String,
    url: String,
    proxy_url: Option<String>,
    using_proxy: bool,
    credentialed: bool,
    decoders: Arc<dyn DecoderFactory>,
    decoder: Option<Box<dyn StreamDecoder>>,
    playback: Playback,
    media_recoveries: u32,
    max_media_recoveries: u32,
    frame: Option<FrameHandle>,
    stats: SourceStats,
}

impl AdaptiveStreamSource {
    pub fn new(
        camera: &CameraSource,
        decoders: Arc<dyn DecoderFactory>,
        proxy_url: Option<String>,
        max_media_recoveries: u32,
    ) -> Self {
        Self {
            camera_id: camera.id.clone(),
            name: camera.name.clone(),
            url: camera.resolved_url(),
            proxy_url,
            using_proxy: false,
            credentialed: camera.credential().is_some(),
            decoders,
            decoder: None,
            playback: Playback::Loading,
            media_recoveries: 0,
            max_media_recoveries,
            frame: None,
            stats: SourceStats::default(),
        }
    }

    pub fn camera_id(&self) -> &str {
        &self.camera_id
    }

    pub fn activate(&mut self, _now: Instant) -> Vec<SourceEvent> {
        let mut events = vec![SourceEvent::Status(format!("Loading {}...", self.name))];
        let url = self.url.clone();
        if let Err(e) = self.attach(&url) {
            events.push(self.fail(format!("{:#}", e), false));
        }
        events
    }

    fn attach(&mut self, url: &str) -> Result<()> {
        if let Some(mut old) = self.decoder.take() {
            old.destroy();
        }
        self.playback = Playback::Loading;
        self.stats.requests += 1;
        let mut decoder = self.decoders.create(url)?;
        decoder.load(url)?;
        log::info!(
            "stream source {} attached to {}",
            self.camera_id,
            redact_query(url)
        );
        self.decoder = Some(decoder);
        Ok(())
    }

    pub fn tick(&mut self, _now: Instant) -> Vec<SourceEvent> {
        let mut events = Vec::new();
        while self.playback != Playback::Failed {
            let Some(event) = self.decoder.as_mut().and_then(|d| d.poll_event()) else {
                break;
            };
            self.handle_event(event, &mut events);
        }

        if self.playback == Playback::Playing {
            if let Some(frame) = self.decoder.as_mut().and_then(|d| d.take_frame()) {
                self.stats.frames_loaded += 1;
                let sequence = frame.sequence();
                self.frame = Some(frame);
                events.push(SourceEvent::FrameReady { sequence });
            }
        }
        events
    }

    fn handle_event(&mut self, event: StreamEvent, events: &mut Vec<SourceEvent>) {
        match event {
            StreamEvent::ManifestParsed => {
                log::info!("stream source {}: manifest parsed", self.camera_id);
                events.push(self.start_playback());
            }
            StreamEvent::Error {
                kind,
                fatal: false,
                detail,
            } => {
                log::debug!(
                    "stream source {}: non-fatal {:?} error: {}",
                    self.camera_id,
                    kind,
                    detail
                );
            }
            StreamEvent::Error {
                kind: StreamErrorKind::Media,
                fatal: true,
                detail,
            } => {
                self.stats.failures += 1;
                events.push(self.recover_media(&detail));
            }
            StreamEvent::Error {
                kind: StreamErrorKind::Network,
                fatal: true,
                detail,
            } => {
                self.stats.failures += 1;
                log::warn!("stream source {}: network error: {}", self.camera_id, detail);
                let suspect = self.credentialed;
                events.push(self.retry_via_proxy_or_fail(detail, suspect));
            }
            StreamEvent::Error {
                kind: StreamErrorKind::Other,
                fatal: true,
                detail,
            } => {
                self.stats.failures += 1;
                log::warn!("stream source {}: fatal error: {}", self.camera_id, detail);
                events.push(self.retry_via_proxy_or_fail(detail, false));
            }
        }
    }

    /// One reload through the proxy, then failure.
    fn retry_via_proxy_or_fail(&mut self, detail: String, credential_suspect: bool) -> SourceEvent {
        let Some(proxy) = self.take_proxy() else {
            return self.fail(detail, credential_suspect);
        };
        log::info!("stream source {}: retrying through proxy", self.camera_id);
        match self.attach(&proxy) {
            Ok(()) => SourceEvent::Retrying(format!("{} - Retrying via proxy...", self.name)),
            Err(e) => self.fail(format!("{:#}", e), credential_suspect),
        }
    }

    fn take_proxy(&mut self) -> Option<String> {
        if self.using_proxy {
            return None;
        }
        let proxy = self.proxy_url.clone()?;
        self.using_proxy = true;
        Some(proxy)
    }

    fn start_playback(&mut self) -> SourceEvent {
        let Some(decoder) = self.decoder.as_mut() else {
            return SourceEvent::Status(format!("{} - Stream not attached", self.name));
        };
        match decoder.play() {
            Ok(()) => {
                self.playback = Playback::Playing;
                SourceEvent::Status(format!("{} - Live stream ready", self.name))
            }
            Err(e) => {
                log::info!("stream source {}: autoplay refused: {:#}", self.camera_id, e);
                self.playback = Playback::Blocked;
                SourceEvent::Status(format!("{} - Tap to play", self.name))
            }
        }
    }

    fn recover_media(&mut self, detail: &str) -> SourceEvent {
        if self.media_recoveries >= self.max_media_recoveries {
            return self.fail(
                format!("media error after {} recoveries: {}", self.media_recoveries, detail),
                false,
            );
        }
        self.media_recoveries += 1;
        log::warn!(
            "stream source {}: media error, recovery {}/{}: {}",
            self.camera_id,
            self.media_recoveries,
            self.max_media_recoveries,
            detail
        );
        let recovered = match self.decoder.as_mut() {
            Some(decoder) => decoder.recover_media_error(),
            None => Err(anyhow!("no decoder attached")),
        };
        match recovered {
            Ok(()) => SourceEvent::Retrying(format!("{} - Recovering stream...", self.name)),
            Err(e) => self.fail(format!("media recovery failed: {:#}", e), false),
        }
    }

    fn fail(&mut self, reason: String, credential_suspect: bool) -> SourceEvent {
        log::warn!("stream source {} failed: {}", self.camera_id, reason);
        self.playback = Playback::Failed;
        if let Some(mut decoder) = self.decoder.take() {
            decoder.destroy();
        }
        self.frame = None;
        SourceEvent::Failed {
            reason,
            credential_suspect,
        }
    }

    /// Tap-to-play: retry playback after autoplay was refused.
    pub fn resume_playback(&mut self) -> Vec<SourceEvent> {
        if self.playback != Playback::Blocked {
            return Vec::new();
        }
        vec![self.start_playback()]
    }

    pub fn produce_frame(&self) -> Option<FrameHandle> {
        if self.playback == Playback::Failed {
            return None;
        }
        self.frame.clone()
    }

    pub fn deactivate(&mut self) {
        if let Some(mut decoder) = self.decoder.take() {
            decoder.destroy();
        }
        self.frame = None;
        log::info!("stream source {} released", self.camera_id);
    }

    pub fn is_active(&self) -> bool {
        self.decoder.is_some()
    }

    pub fn is_failed(&self) -> bool {
        self.playback == Playback::Failed
    }

    pub fn is_using_proxy(&self) -> bool {
        self.using_proxy
    }

    pub fn stats(&self) -> SourceStats {
        self.stats.clone()
    }
}

const SYNTHETIC_WIDTH: u32 = 1280;
const SYNTHETIC_HEIGHT: u32 = 720;
const SYNTHETIC_RASTER_WIDTH: u32 = 320;
const SYNTHETIC_RASTER_HEIGHT: u32 = 180;
const SYNTHETIC_FRAME_GAP: Duration = Duration::from_millis(500);

/// Decoder for `stub://` streams.
///
/// `stub://fail...` reports a fatal network error after loading and
/// `stub://no-autoplay...` refuses the first `play`. Anything else plays a
/// synthetic 1280x720 stream, delivered as a downscaled raster.
pub struct SyntheticDecoder {
    url: String,
    events: Vec<StreamEvent>,
    playing: bool,
    play_attempts: u32,
    sequence: u64,
    last_frame_at: Option<Instant>,
}

impl SyntheticDecoder {
    pub fn new() -> Self {
        Self {
            url: String::new(),
            events: Vec::new(),
            playing: false,
            play_attempts: 0,
            sequence: 0,
            last_frame_at: None,
        }
    }
}

impl Default for SyntheticDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamDecoder for SyntheticDecoder {
    fn load(&mut self, url: &str) -> Result<()> {
        self.url = url.to_string();
        let event = if url.starts_with("stub://fail") {
            StreamEvent::Error {
                kind: StreamErrorKind::Network,
                fatal: true,
                detail: "synthetic manifest load error".to_string(),
            }
        } else {
            StreamEvent::ManifestParsed
        };
        self.events.push(event);
        Ok(())
    }

    fn poll_event(&mut self) -> Option<StreamEvent> {
        if self.events.is_empty() {
            None
        } else {
            Some(self.events.remove(0))
        }
    }

    fn take_frame(&mut self) -> Option<FrameHandle> {
        if !self.playing {
            return None;
        }
        let now = Instant::now();
        if self
            .last_frame_at
            .is_some_and(|last| now.duration_since(last) < SYNTHETIC_FRAME_GAP)
        {
            return None;
        }
        self.last_frame_at = Some(now);
        self.sequence += 1;
        let pixels = synthetic_image(
            SYNTHETIC_RASTER_WIDTH,
            SYNTHETIC_RASTER_HEIGHT,
            self.sequence * 7,
        );
        Some(FrameHandle::video(
            pixels,
            SYNTHETIC_WIDTH,
            SYNTHETIC_HEIGHT,
            self.sequence,
        ))
    }

    fn play(&mut self) -> Result<()> {
        self.play_attempts += 1;
        if self.url.starts_with("stub://no-autoplay") && self.play_attempts == 1 {
            return Err(anyhow!("autoplay blocked"));
        }
        self.playing = true;
        Ok(())
    }

    fn recover_media_error(&mut self) -> Result<()> {
        Ok(())
    }

    fn destroy(&mut self) {
        self.playing = false;
        self.events.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::SourceKind;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Script {
        events: Vec<StreamEvent>,
        loads: Vec<String>,
        destroyed: u32,
        recover_fails: bool,
    }

    struct ScriptedDecoder(Arc<Mutex<Script>>);

    impl StreamDecoder for ScriptedDecoder {
        fn load(&mut self, url: &str) -> Result<()> {
            self.0.lock().unwrap().loads.push(url.to_string());
            Ok(())
        }
        fn poll_event(&mut self) -> Option<StreamEvent> {
            let mut script = self.0.lock().unwrap();
            if script.events.is_empty() {
                None
            } else {
                Some(script.events.remove(0))
            }
        }
        fn take_frame(&mut self) -> Option<FrameHandle> {
            None
        }
        fn play(&mut self) -> Result<()> {
            Ok(())
        }
        fn recover_media_error(&mut self) -> Result<()> {
            if self.0.lock().unwrap().recover_fails {
                Err(anyhow!("decoder wedged"))
            } else {
                Ok(())
            }
        }
        fn destroy(&mut self) {
            self.0.lock().unwrap().destroyed += 1;
        }
    }

    struct ScriptedFactory(Arc<Mutex<Script>>);

    impl DecoderFactory for ScriptedFactory {
        fn create(&self, _url: &str) -> Result<Box<dyn StreamDecoder>> {
            Ok(Box::new(ScriptedDecoder(self.0.clone())))
        }
    }

    fn camera() -> CameraSource {
        CameraSource::new(
            "fl511-1",
            "FL511 1",
            SourceKind::AdaptiveStream,
            "https://streams.example/chan-1/index.m3u8?token={token}",
        )
        .unwrap()
        .with_credential("tok", false)
        .unwrap()
    }

    fn network_error() -> StreamEvent {
        StreamEvent::Error {
            kind: StreamErrorKind::Network,
            fatal: true,
            detail: "manifestLoadError".to_string(),
        }
    }

    fn media_error() -> StreamEvent {
        StreamEvent::Error {
            kind: StreamErrorKind::Media,
            fatal: true,
            detail: "bufferStalledError".to_string(),
        }
    }

    #[test]
    fn network_failure_is_credential_suspect() {
        let script = Arc::new(Mutex::new(Script {
            events: vec![network_error()],
            ..Default::default()
        }));
        let mut source =
            AdaptiveStreamSource::new(&camera(), Arc::new(ScriptedFactory(script.clone())), None, 3);
        let t0 = Instant::now();
        source.activate(t0);
        let events = source.tick(t0);
        assert!(matches!(
            events.last(),
            Some(SourceEvent::Failed {
                credential_suspect: true,
                ..
            })
        ));
        assert!(source.is_failed());
        assert_eq!(script.lock().unwrap().destroyed, 1);
    }

    #[test]
    fn proxy_fallback_happens_once() {
        let script = Arc::new(Mutex::new(Script {
            events: vec![network_error()],
            ..Default::default()
        }));
        let proxy = "https://proxy.example/fl511-1/index.m3u8?token=tok".to_string();
        let mut source = AdaptiveStreamSource::new(
            &camera(),
            Arc::new(ScriptedFactory(script.clone())),
            Some(proxy.clone()),
            3,
        );
        let t0 = Instant::now();
        source.activate(t0);
        let events = source.tick(t0);
        assert!(matches!(events.last(), Some(SourceEvent::Retrying(_))));
        assert!(source.is_using_proxy());
        assert_eq!(script.lock().unwrap().loads.last(), Some(&proxy));

        script.lock().unwrap().events.push(network_error());
        let events = source.tick(t0);
        assert!(matches!(events.last(), Some(SourceEvent::Failed { .. })));
    }

    #[test]
    fn other_fatal_error_also_tries_proxy() {
        let other = || StreamEvent::Error {
            kind: StreamErrorKind::Other,
            fatal: true,
            detail: "internalException".to_string(),
        };
        let script = Arc::new(Mutex::new(Script {
            events: vec![other()],
            ..Default::default()
        }));
        let proxy = "https://proxy.example/fl511-1/index.m3u8?token=tok".to_string();
        let mut source = AdaptiveStreamSource::new(
            &camera(),
            Arc::new(ScriptedFactory(script.clone())),
            Some(proxy.clone()),
            3,
        );
        let t0 = Instant::now();
        source.activate(t0);
        let events = source.tick(t0);
        assert!(matches!(events.last(), Some(SourceEvent::Retrying(_))));
        assert_eq!(script.lock().unwrap().loads.last(), Some(&proxy));

        script.lock().unwrap().events.push(other());
        assert!(matches!(
            source.tick(t0).last(),
            Some(SourceEvent::Failed {
                credential_suspect: false,
                ..
            })
        ));
    }

    #[test]
    fn media_recovery_is_bounded() {
        let script = Arc::new(Mutex::new(Script {
            events: vec![StreamEvent::ManifestParsed, media_error(), media_error()],
            ..Default::default()
        }));
        let mut source =
            AdaptiveStreamSource::new(&camera(), Arc::new(ScriptedFactory(script.clone())), None, 1);
        let t0 = Instant::now();
        source.activate(t0);
        let events = source.tick(t0);
        assert!(events.iter().any(|e| matches!(e, SourceEvent::Retrying(_))));
        assert!(matches!(
            events.last(),
            Some(SourceEvent::Failed {
                credential_suspect: false,
                ..
            })
        ));
    }

    #[test]
    fn failed_recovery_is_acquisition_failure() {
        let script = Arc::new(Mutex::new(Script {
            events: vec![media_error()],
            recover_fails: true,
            ..Default::default()
        }));
        let mut source =
            AdaptiveStreamSource::new(&camera(), Arc::new(ScriptedFactory(script.clone())), None, 3);
        let t0 = Instant::now();
        source.activate(t0);
        assert!(matches!(
            source.tick(t0).last(),
            Some(SourceEvent::Failed { .. })
        ));
    }

    #[test]
    fn synthetic_autoplay_block_and_resume() {
        let camera = CameraSource::new(
            "demo",
            "Demo",
            SourceKind::AdaptiveStream,
            "stub://no-autoplay/stream",
        )
        .unwrap();
        let mut source =
            AdaptiveStreamSource::new(&camera, Arc::new(DefaultDecoderFactory), None, 3);
        let t0 = Instant::now();
        source.activate(t0);
        let events = source.tick(t0);
        assert!(events.contains(&SourceEvent::Status("Demo - Tap to play".to_string())));
        assert!(source.produce_frame().is_none());

        let events = source.resume_playback();
        assert_eq!(
            events,
            vec![SourceEvent::Status("Demo - Live stream ready".to_string())]
        );
        let events = source.tick(t0);
        assert!(matches!(events[0], SourceEvent::FrameReady { .. }));
        let frame = source.produce_frame().unwrap();
        assert_eq!(frame.native_size(), (SYNTHETIC_WIDTH, SYNTHETIC_HEIGHT));

        source.deactivate();
        assert!(!source.is_active());
        assert!(source.produce_frame().is_none());
    }
}
