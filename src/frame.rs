//! Decoded frames handed from sources to the detection scheduler.
//!
//! - `FrameHandle`: cheap-to-clone reference to the latest decoded frame.
//! - `FrameKind`: where the native dimensions come from (still image vs video).
//!
//! A source replaces its handle on every refresh. Clones held by the scheduler
//! stay valid after a refresh, so a cycle may run against a stale frame but never
//! against a half-written one.

use image::RgbImage;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Instant;

/// Native size assumed when a source has not reported one yet.
pub const FALLBACK_NATIVE_WIDTH: u32 = 640;
pub const FALLBACK_NATIVE_HEIGHT: u32 = 400;

/// How the native frame size is known.
///
/// Stills report the natural size of the decoded image. Video frames report the
/// size advertised by the stream, which may differ from the raster the decoder
/// hands over (or be unknown until the first caps negotiation).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameKind {
    Still {
        natural_width: u32,
        natural_height: u32,
    },
    Video {
        video_width: u32,
        video_height: u32,
    },
}

#[derive(Clone)]
pub struct FrameHandle {
    pixels: Arc<RgbImage>,
    kind: FrameKind,
    sequence: u64,
    fingerprint: [u8; 32],
    captured_at: Instant,
}

impl FrameHandle {
    /// Frame decoded from a still image. Natural size is the raster size.
    pub fn still(pixels: RgbImage, sequence: u64) -> Self {
        let kind = FrameKind::Still {
            natural_width: pixels.width(),
            natural_height: pixels.height(),
        };
        Self::new(pixels, kind, sequence)
    }

    /// Frame pulled from a video stream with the stream-advertised size.
    pub fn video(pixels: RgbImage, video_width: u32, video_height: u32, sequence: u64) -> Self {
        let kind = FrameKind::Video {
            video_width,
            video_height,
        };
        Self::new(pixels, kind, sequence)
    }

    fn new(pixels: RgbImage, kind: FrameKind, sequence: u64) -> Self {
        let fingerprint = fingerprint_pixels(pixels.as_raw());
        Self {
            pixels: Arc::new(pixels),
            kind,
            sequence,
            fingerprint,
            captured_at: Instant::now(),
        }
    }

    pub fn kind(&self) -> FrameKind {
        self.kind
    }

    pub fn pixels(&self) -> &RgbImage {
        &self.pixels
    }

    pub fn width(&self) -> u32 {
        self.pixels.width()
    }

    pub fn height(&self) -> u32 {
        self.pixels.height()
    }

    /// Dimensions detections are expressed in.
    ///
    /// Zero dimensions (not yet reported) fall back to 640x400.
    pub fn native_size(&self) -> (u32, u32) {
        let (w, h) = match self.kind {
            FrameKind::Still {
                natural_width,
                natural_height,
            } => (natural_width, natural_height),
            FrameKind::Video {
                video_width,
                video_height,
            } => (video_width, video_height),
        };
        let w = if w == 0 { FALLBACK_NATIVE_WIDTH } else { w };
        let h = if h == 0 { FALLBACK_NATIVE_HEIGHT } else { h };
        (w, h)
    }

    /// Per-source sequence number, incremented on every refresh.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn fingerprint(&self) -> [u8; 32] {
        self.fingerprint
    }

    /// True when both handles carry identical pixel content.
    pub fn same_content(&self, other: &FrameHandle) -> bool {
        self.fingerprint == other.fingerprint
    }

    pub fn age_secs(&self) -> u64 {
        self.captured_at.elapsed().as_secs()
    }
}

impl std::fmt::Debug for FrameHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameHandle")
            .field("kind", &self.kind)
            .field("raster", &(self.width(), self.height()))
            .field("sequence", &self.sequence)
            .field("fingerprint", &hex::encode(&self.fingerprint[..4]))
            .finish()
    }
}

fn fingerprint_pixels(pixels: &[u8]) -> [u8; 32] {
    Sha256::digest(pixels).into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn still_uses_natural_size() {
        let frame = FrameHandle::still(RgbImage::new(1280, 720), 1);
        assert_eq!(frame.native_size(), (1280, 720));
        assert_eq!(
            frame.kind(),
            FrameKind::Still {
                natural_width: 1280,
                natural_height: 720
            }
        );
    }

    #[test]
    fn video_uses_advertised_size() {
        // Decoder hands over a downscaled raster; detections are in stream size.
        let frame = FrameHandle::video(RgbImage::new(320, 180), 1920, 1080, 3);
        assert_eq!(frame.native_size(), (1920, 1080));
        assert_eq!(frame.width(), 320);
    }

    #[test]
    fn unknown_video_size_falls_back() {
        let frame = FrameHandle::video(RgbImage::new(16, 16), 0, 0, 1);
        assert_eq!(
            frame.native_size(),
            (FALLBACK_NATIVE_WIDTH, FALLBACK_NATIVE_HEIGHT)
        );
    }

    #[test]
    fn clones_share_content() {
        let frame = FrameHandle::still(RgbImage::from_pixel(4, 4, Rgb([1, 2, 3])), 1);
        let clone = frame.clone();
        assert!(frame.same_content(&clone));

        let other = FrameHandle::still(RgbImage::from_pixel(4, 4, Rgb([9, 9, 9])), 2);
        assert!(!frame.same_content(&other));
    }
}
