use anyhow::{anyhow, Result};

use super::backend::DetectorBackend;
use super::registry::{BackendRegistry, DetectorSettings};
use crate::task::{Pending, Poll};

type LoadFn = Box<dyn FnOnce() -> Pending<Box<dyn DetectorBackend>> + Send>;

enum LoaderState {
    Unloaded(LoadFn),
    Loading(Pending<Box<dyn DetectorBackend>>),
    Ready(Box<dyn DetectorBackend>),
    Failed(String),
}

/// Loads the detector capability exactly once.
///
/// `begin` is idempotent: the first call starts the load, later calls do
/// nothing. A failed load stays failed for the life of the loader.
pub struct DetectorLoader {
    state: LoaderState,
}

impl DetectorLoader {
    /// Loader around an arbitrary load operation.
    pub fn new<F>(load: F) -> Self
    where
        F: FnOnce() -> Pending<Box<dyn DetectorBackend>> + Send + 'static,
    {
        Self {
            state: LoaderState::Unloaded(Box::new(load)),
        }
    }

    /// Build the named backend from `registry` on a worker thread.
    pub fn from_registry(registry: BackendRegistry, name: &str, settings: DetectorSettings) -> Self {
        let name = name.to_string();
        Self::new(move || {
            Pending::spawn("detector-load", move || {
                let mut backend = registry.create(&name, &settings)?;
                backend.warm_up()?;
                Ok(backend)
            })
        })
    }

    /// Start loading if nothing has been started yet.
    pub fn begin(&mut self) {
        if !matches!(self.state, LoaderState::Unloaded(_)) {
            return;
        }
        let placeholder = LoaderState::Failed(String::new());
        if let LoaderState::Unloaded(load) = std::mem::replace(&mut self.state, placeholder) {
            log::info!("detector load started");
            self.state = LoaderState::Loading(load());
        }
    }

    /// Advance a running load. Call once per tick.
    pub fn poll(&mut self) {
        let LoaderState::Loading(pending) = &mut self.state else {
            return;
        };
        match pending.poll() {
            Poll::Waiting => {}
            Poll::Done(Ok(backend)) => {
                log::info!("detector backend '{}' ready", backend.name());
                self.state = LoaderState::Ready(backend);
            }
            Poll::Done(Err(e)) => {
                log::error!("detector load failed: {:#}", e);
                self.state = LoaderState::Failed(format!("{:#}", e));
            }
        }
    }

    pub fn is_started(&self) -> bool {
        !matches!(self.state, LoaderState::Unloaded(_))
    }

    pub fn is_ready(&self) -> bool {
        matches!(self.state, LoaderState::Ready(_))
    }

    /// Load error, if the load failed.
    pub fn failure(&self) -> Option<&str> {
        match &self.state {
            LoaderState::Failed(reason) => Some(reason),
            _ => None,
        }
    }

    /// The loaded backend.
    pub fn backend_mut(&mut self) -> Result<&mut dyn DetectorBackend> {
        match &mut self.state {
            LoaderState::Ready(backend) => Ok(backend.as_mut()),
            LoaderState::Failed(reason) => Err(anyhow!("detector failed to load: {}", reason)),
            _ => Err(anyhow!("detector not loaded yet")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::backends::StubBackend;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn begin_is_idempotent() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let mut loader = DetectorLoader::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Pending::ready(Ok(Box::new(StubBackend::new()) as Box<dyn DetectorBackend>))
        });

        assert!(!loader.is_started());
        loader.begin();
        loader.begin();
        loader.poll();
        loader.begin();

        assert!(loader.is_ready());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(loader.backend_mut().unwrap().name(), "stub");
    }

    #[test]
    fn failure_is_sticky() {
        let mut loader = DetectorLoader::new(|| Pending::ready(Err(anyhow!("model missing"))));
        loader.begin();
        loader.poll();
        assert!(!loader.is_ready());
        assert!(loader.failure().unwrap().contains("model missing"));

        loader.begin();
        loader.poll();
        assert!(loader.failure().is_some());
        assert!(loader.backend_mut().is_err());
    }

    #[test]
    fn registry_load_runs_on_worker() {
        let mut loader = DetectorLoader::from_registry(
            BackendRegistry::with_builtin(),
            "stub",
            DetectorSettings::default(),
        );
        loader.begin();
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while !loader.is_ready() && std::time::Instant::now() < deadline {
            loader.poll();
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        assert!(loader.is_ready());
    }
}
