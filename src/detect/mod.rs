//! Object detection: backend trait, named backend factories and the one-shot
//! loader the scheduler waits on.

mod backend;
mod backends;
mod loader;
mod registry;
mod result;

pub use backend::DetectorBackend;
#[cfg(feature = "backend-tract")]
pub use backends::TractBackend;
pub use backends::StubBackend;
pub use loader::DetectorLoader;
pub use registry::{BackendRegistry, DetectorSettings};
pub use result::{BoundingBox, Detection};
