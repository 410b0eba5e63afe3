use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Result};

use super::backend::DetectorBackend;
use super::backends::StubBackend;

/// Settings handed to backend factories.
#[derive(Clone, Debug, Default)]
pub struct DetectorSettings {
    /// Model file for backends that load one.
    pub model_path: Option<PathBuf>,
    /// Model input size (width, height).
    pub input_size: (u32, u32),
}

type BackendFactory = Arc<dyn Fn(&DetectorSettings) -> Result<Box<dyn DetectorBackend>> + Send + Sync>;

/// Named backend factories.
///
/// Backends are constructed lazily by the detector loader, on a worker thread,
/// so registering one costs nothing until it is selected.
#[derive(Clone)]
pub struct BackendRegistry {
    factories: BTreeMap<String, BackendFactory>,
    default_name: Option<String>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self {
            factories: BTreeMap::new(),
            default_name: None,
        }
    }

    /// Registry with every backend compiled into this build.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register("stub", |_| Ok(Box::new(StubBackend::new())));
        #[cfg(feature = "backend-tract")]
        registry.register("tract", |settings| {
            let path = settings
                .model_path
                .as_ref()
                .ok_or_else(|| anyhow!("tract backend requires detection.model_path"))?;
            let (width, height) = settings.input_size;
            Ok(Box::new(super::backends::TractBackend::new(
                path, width, height,
            )?))
        });
        registry
    }

    /// Register a factory. The first registered backend becomes the default.
    pub fn register<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(&DetectorSettings) -> Result<Box<dyn DetectorBackend>> + Send + Sync + 'static,
    {
        if self.default_name.is_none() {
            self.default_name = Some(name.to_string());
        }
        self.factories.insert(name.to_string(), Arc::new(factory));
    }

    /// Set default backend by name.
    pub fn set_default(&mut self, name: &str) -> Result<()> {
        if !self.factories.contains_key(name) {
            return Err(anyhow!("backend '{}' not registered", name));
        }
        self.default_name = Some(name.to_string());
        Ok(())
    }

    pub fn default_name(&self) -> Option<&str> {
        self.default_name.as_deref()
    }

    /// List registered backends, sorted by name.
    pub fn list(&self) -> Vec<String> {
        self.factories.keys().cloned().collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Construct a backend by name.
    pub fn create(&self, name: &str, settings: &DetectorSettings) -> Result<Box<dyn DetectorBackend>> {
        let factory = self.factories.get(name).ok_or_else(|| {
            anyhow!(
                "backend '{}' not registered (available: {})",
                name,
                self.list().join(", ")
            )
        })?;
        factory(settings)
    }

    /// Construct the default backend.
    pub fn create_default(&self, settings: &DetectorSettings) -> Result<Box<dyn DetectorBackend>> {
        let name = self
            .default_name
            .clone()
            .ok_or_else(|| anyhow!("no detector backends registered"))?;
        self.create(&name, settings)
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::with_builtin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_registry_has_stub_default() {
        let registry = BackendRegistry::with_builtin();
        assert_eq!(registry.default_name(), Some("stub"));
        let backend = registry
            .create_default(&DetectorSettings::default())
            .unwrap();
        assert_eq!(backend.name(), "stub");
    }

    #[test]
    fn unknown_backend_lists_available() {
        let registry = BackendRegistry::with_builtin();
        let err = match registry.create("yolo", &DetectorSettings::default()) {
            Ok(_) => panic!("unexpected backend"),
            Err(e) => e,
        };
        assert!(err.to_string().contains("stub"));
    }

    #[test]
    fn set_default_requires_registration() {
        let mut registry = BackendRegistry::new();
        assert!(registry.set_default("stub").is_err());
        registry.register("stub", |_| Ok(Box::new(StubBackend::new())));
        registry.set_default("stub").unwrap();
        assert_eq!(registry.list(), vec!["stub".to_string()]);
    }
}
