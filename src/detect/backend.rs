use anyhow::Result;

use crate::detect::result::Detection;
use crate::frame::FrameHandle;

/// Detector backend trait.
///
/// The backend is an opaque capability: it receives a decoded frame and returns
/// raw detections in native-frame coordinates. Filtering, classification and
/// counting happen downstream.
///
/// `detect` runs on the pipeline's cooperative thread. A backend that hangs
/// stalls the pipeline; there is no per-call timeout.
pub trait DetectorBackend: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Run detection on a frame.
    fn detect(&mut self, frame: &FrameHandle) -> Result<Vec<Detection>>;

    /// Optional warm-up hook, called once by the loader after construction.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}
