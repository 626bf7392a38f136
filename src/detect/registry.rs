use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Result};

use super::backend::FaceBackend;
use super::backends::StubBackend;
use crate::config::RecognitionConfig;

type BackendFactory = Arc<dyn Fn() -> Result<Box<dyn FaceBackend>> + Send + Sync>;

/// Registry of face backends, looked up by the name used in configuration.
///
/// Holds factories rather than instances: every recognition consumer gets its own
/// backend so cameras never contend on a shared lock.
#[derive(Clone)]
pub struct BackendRegistry {
    factories: HashMap<String, BackendFactory>,
    default_name: Option<String>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
            default_name: None,
        }
    }

    /// Registry with the built-in backends.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register("stub", || Ok(Box::new(StubBackend::new())));
        registry
    }

    /// Built-in backends plus those that need settings from `config`, with the configured
    /// backend as the default.
    pub fn for_config(config: &RecognitionConfig) -> Result<Self> {
        let mut registry = Self::with_builtin();
        registry.register_models(config);
        registry.set_default(&config.backend)?;
        Ok(registry)
    }

    #[cfg(feature = "backend-tract")]
    fn register_models(&mut self, config: &RecognitionConfig) {
        let (Some(detector), Some(embedder)) =
            (config.detector_model.clone(), config.embedder_model.clone())
        else {
            return;
        };
        let threshold = config.detection_threshold;
        self.register("tract", move || {
            let backend = super::backends::TractFaceBackend::new(&detector, &embedder)?
                .with_threshold(threshold);
            Ok(Box::new(backend))
        });
    }

    #[cfg(not(feature = "backend-tract"))]
    fn register_models(&mut self, _config: &RecognitionConfig) {}

    /// Register a backend factory. The first registered backend becomes the default.
    pub fn register<F>(&mut self, name: &str, factory: F)
    where
        F: Fn() -> Result<Box<dyn FaceBackend>> + Send + Sync + 'static,
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

    /// Build a fresh, warmed-up backend instance.
    pub fn create(&self, name: &str) -> Result<Box<dyn FaceBackend>> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| anyhow!("backend '{}' not registered", name))?;
        let mut backend = factory()?;
        backend.warm_up()?;
        Ok(backend)
    }

    /// Build the default backend.
    pub fn create_default(&self) -> Result<Box<dyn FaceBackend>> {
        let name = self
            .default_name
            .as_deref()
            .ok_or_else(|| anyhow!("no face backend registered"))?;
        self.create(name)
    }

    /// List registered backends.
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
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
    fn builtin_registry_creates_stub() {
        let registry = BackendRegistry::with_builtin();
        assert_eq!(registry.list(), vec!["stub".to_string()]);
        assert_eq!(registry.create("stub").unwrap().name(), "stub");
        assert_eq!(registry.create_default().unwrap().name(), "stub");
    }

    #[test]
    fn config_selects_the_default_backend() {
        let registry = BackendRegistry::for_config(&RecognitionConfig::default()).unwrap();
        assert_eq!(registry.create_default().unwrap().name(), "stub");

        let config = RecognitionConfig {
            backend: "dlib".to_string(),
            ..RecognitionConfig::default()
        };
        assert!(BackendRegistry::for_config(&config).is_err());
    }

    #[test]
    fn unknown_backend_is_rejected() {
        let mut registry = BackendRegistry::with_builtin();
        assert!(registry.create("dlib").is_err());
        assert!(registry.set_default("dlib").is_err());
    }
}
