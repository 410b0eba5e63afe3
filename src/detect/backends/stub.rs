use anyhow::Result;

use crate::detect::backend::DetectorBackend;
use crate::detect::result::{BoundingBox, Detection};
use crate::frame::FrameHandle;

/// Stub backend for testing and demos.
///
/// Compares frame fingerprints: when the content changed since the previous
/// call it reports a single "car" at the centre of the native frame, otherwise
/// nothing. The first frame always counts as changed.
pub struct StubBackend {
    last_hash: Option<[u8; 32]>,
}

impl StubBackend {
    pub fn new() -> Self {
        Self { last_hash: None }
    }
}

impl Default for StubBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl DetectorBackend for StubBackend {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn detect(&mut self, frame: &FrameHandle) -> Result<Vec<Detection>> {
        let current = frame.fingerprint();
        let changed = self.last_hash != Some(current);
        self.last_hash = Some(current);

        if !changed {
            return Ok(Vec::new());
        }
        let (width, height) = frame.native_size();
        let (w, h) = (width as f32 / 4.0, height as f32 / 4.0);
        let bbox = BoundingBox::new(
            width as f32 / 2.0 - w / 2.0,
            height as f32 / 2.0 - h / 2.0,
            w,
            h,
        );
        Ok(vec![Detection::new("car", 0.85, bbox)])
    }
}
