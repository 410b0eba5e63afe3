//! GStreamer-backed adaptive stream decoder.
//!
//! Pipeline: `uridecodebin ! videoconvert ! video/x-raw,format=RGB ! appsink`.
//! `uridecodebin` picks `hlsdemux`/`dashdemux` from the URL, so the decoder
//! handles whatever segmented formats the installed plugins support.

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use gstreamer::prelude::*;
use image::RgbImage;

use super::stream::{StreamDecoder, StreamErrorKind, StreamEvent};
use crate::frame::FrameHandle;

pub struct GstreamerDecoder {
    pipeline: Option<gstreamer::Pipeline>,
    appsink: Option<gstreamer_app::AppSink>,
    manifest_reported: bool,
    sequence: u64,
}

impl GstreamerDecoder {
    pub fn new() -> Result<Self> {
        gstreamer::init().context("initialize gstreamer")?;
        Ok(Self {
            pipeline: None,
            appsink: None,
            manifest_reported: false,
            sequence: 0,
        })
    }

    fn pipeline(&self) -> Result<&gstreamer::Pipeline> {
        self.pipeline
            .as_ref()
            .ok_or_else(|| anyhow!("stream pipeline not loaded"))
    }
}

impl StreamDecoder for GstreamerDecoder {
    fn load(&mut self, url: &str) -> Result<()> {
        let description = format!(
            "uridecodebin uri=\"{}\" ! videoconvert ! video/x-raw,format=RGB ! \
             appsink name=appsink sync=false max-buffers=1 drop=true",
            url
        );
        let pipeline = gstreamer::parse::launch(&description)
            .context("build stream pipeline")?
            .downcast::<gstreamer::Pipeline>()
            .map_err(|_| anyhow!("stream pipeline is not a Pipeline"))?;
        let appsink = pipeline
            .by_name("appsink")
            .context("appsink element missing from pipeline")?
            .downcast::<gstreamer_app::AppSink>()
            .map_err(|_| anyhow!("appsink element has unexpected type"))?;

        // Paused prerolls the manifest and first segment without presenting.
        pipeline
            .set_state(gstreamer::State::Paused)
            .context("set stream pipeline to Paused")?;
        self.pipeline = Some(pipeline);
        self.appsink = Some(appsink);
        self.manifest_reported = false;
        Ok(())
    }

    fn poll_event(&mut self) -> Option<StreamEvent> {
        let bus = self.pipeline.as_ref()?.bus()?;
        while let Some(message) = bus.timed_pop(gstreamer::ClockTime::ZERO) {
            use gstreamer::MessageView;
            match message.view() {
                MessageView::AsyncDone(..) if !self.manifest_reported => {
                    self.manifest_reported = true;
                    return Some(StreamEvent::ManifestParsed);
                }
                MessageView::Error(err) => {
                    let error = err.error();
                    let kind = if error.is::<gstreamer::ResourceError>() {
                        StreamErrorKind::Network
                    } else if error.is::<gstreamer::StreamError>() {
                        StreamErrorKind::Media
                    } else {
                        StreamErrorKind::Other
                    };
                    return Some(StreamEvent::Error {
                        kind,
                        fatal: true,
                        detail: format!(
                            "{} (from {:?})",
                            error,
                            err.src().map(|s| s.path_string())
                        ),
                    });
                }
                MessageView::Warning(warning) => {
                    return Some(StreamEvent::Error {
                        kind: StreamErrorKind::Other,
                        fatal: false,
                        detail: warning.error().to_string(),
                    });
                }
                MessageView::Eos(..) => {
                    return Some(StreamEvent::Error {
                        kind: StreamErrorKind::Network,
                        fatal: true,
                        detail: "stream reached EOS".to_string(),
                    });
                }
                _ => {}
            }
        }
        None
    }

    fn take_frame(&mut self) -> Option<FrameHandle> {
        let sample = self
            .appsink
            .as_ref()?
            .try_pull_sample(gstreamer::ClockTime::ZERO)?;
        match sample_to_image(&sample) {
            Ok(image) => {
                self.sequence += 1;
                let (width, height) = image.dimensions();
                Some(FrameHandle::video(image, width, height, self.sequence))
            }
            Err(e) => {
                log::warn!("dropping undecodable stream sample: {:#}", e);
                None
            }
        }
    }

    fn play(&mut self) -> Result<()> {
        self.pipeline()?
            .set_state(gstreamer::State::Playing)
            .context("set stream pipeline to Playing")?;
        Ok(())
    }

    fn recover_media_error(&mut self) -> Result<()> {
        let pipeline = self.pipeline()?;
        pipeline
            .set_state(gstreamer::State::Ready)
            .context("reset stream pipeline")?;
        let (result, _, _) = pipeline.state(gstreamer::ClockTime::from_mseconds(
            Duration::from_secs(2).as_millis() as u64,
        ));
        result.context("stream pipeline did not reach Ready")?;
        pipeline
            .set_state(gstreamer::State::Playing)
            .context("restart stream pipeline")?;
        Ok(())
    }

    fn destroy(&mut self) {
        if let Some(pipeline) = self.pipeline.take() {
            if let Err(e) = pipeline.set_state(gstreamer::State::Null) {
                log::warn!("failed to stop stream pipeline: {}", e);
            }
        }
        self.appsink = None;
    }
}

impl Drop for GstreamerDecoder {
    fn drop(&mut self) {
        self.destroy();
    }
}

fn sample_to_image(sample: &gstreamer::Sample) -> Result<RgbImage> {
    let buffer = sample.buffer().context("stream sample missing buffer")?;
    let caps = sample.caps().context("stream sample missing caps")?;
    let info =
        gstreamer_video::VideoInfo::from_caps(caps).context("parse stream caps as video info")?;

    let width = info.width();
    let height = info.height();
    let row_bytes = (width as usize) * 3;
    let stride = info.stride()[0] as usize;

    let map = buffer.map_readable().context("map stream buffer")?;
    let data = map.as_slice();

    let mut pixels = Vec::with_capacity(row_bytes * height as usize);
    for row in 0..height as usize {
        let start = row * stride;
        pixels.extend_from_slice(
            data.get(start..start + row_bytes)
                .context("stream buffer row is out of bounds")?,
        );
    }
    RgbImage::from_raw(width, height, pixels).ok_or_else(|| anyhow!("stream frame size mismatch"))
}
