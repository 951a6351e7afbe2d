use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use tracing::info;

use super::heuristic::SkinToneDetector;
use super::{SharedDetector, SharedEmbedder, SharedTagger, SharedUpscaler};
use crate::utils::config::Config;

type Loader<T> = Arc<dyn Fn() -> Result<T> + Send + Sync>;

/// A named way of constructing one capability. Loading may be slow
/// (model files, downloads) and always runs on a blocking thread.
pub struct Provider<T> {
    pub name: String,
    loader: Loader<T>,
}

impl<T> Provider<T> {
    pub fn new(name: impl Into<String>, loader: impl Fn() -> Result<T> + Send + Sync + 'static) -> Self {
        Self { name: name.into(), loader: Arc::new(loader) }
    }

    pub fn load(&self) -> Result<T> {
        (self.loader)()
    }
}

impl<T> Clone for Provider<T> {
    fn clone(&self) -> Self {
        Self { name: self.name.clone(), loader: self.loader.clone() }
    }
}

impl<T> fmt::Debug for Provider<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Provider").field("name", &self.name).finish()
    }
}

/// Ranked provider lists per capability kind. The first provider that loads
/// successfully wins; the list is fixed once the pipeline is built.
#[derive(Clone, Default, Debug)]
pub struct CapabilityRegistry {
    pub upscalers: Vec<Provider<SharedUpscaler>>,
    pub detectors: Vec<Provider<SharedDetector>>,
    pub face_detectors: Vec<Provider<SharedDetector>>,
    pub heuristic_detectors: Vec<Provider<SharedDetector>>,
    pub taggers: Vec<Provider<SharedTagger>>,
    pub embedders: Vec<Provider<SharedEmbedder>>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Providers found on disk under the configured models directory, plus
    /// the built-in skin-tone detector as the last detection tier.
    pub fn discover(cfg: &Config) -> Self {
        let mut registry = Self::new();
        #[cfg(feature = "onnx")]
        super::onnx::register_providers(&mut registry, cfg);
        #[cfg(not(feature = "onnx"))]
        let _ = cfg;
        registry = registry.with_heuristic_detector("skin-tone", || Ok(Arc::new(SkinToneDetector) as SharedDetector));
        info!(
            "capability providers: upscaler={} detector={} face={} heuristic={} tagger={} embedder={}",
            registry.upscalers.len(),
            registry.detectors.len(),
            registry.face_detectors.len(),
            registry.heuristic_detectors.len(),
            registry.taggers.len(),
            registry.embedders.len()
        );
        registry
    }

    pub fn with_upscaler(mut self, name: &str, f: impl Fn() -> Result<SharedUpscaler> + Send + Sync + 'static) -> Self {
        self.upscalers.push(Provider::new(name, f));
        self
    }

    pub fn with_detector(mut self, name: &str, f: impl Fn() -> Result<SharedDetector> + Send + Sync + 'static) -> Self {
        self.detectors.push(Provider::new(name, f));
        self
    }

    pub fn with_face_detector(mut self, name: &str, f: impl Fn() -> Result<SharedDetector> + Send + Sync + 'static) -> Self {
        self.face_detectors.push(Provider::new(name, f));
        self
    }

    pub fn with_heuristic_detector(
        mut self,
        name: &str,
        f: impl Fn() -> Result<SharedDetector> + Send + Sync + 'static,
    ) -> Self {
        self.heuristic_detectors.push(Provider::new(name, f));
        self
    }

    pub fn with_tagger(mut self, name: &str, f: impl Fn() -> Result<SharedTagger> + Send + Sync + 'static) -> Self {
        self.taggers.push(Provider::new(name, f));
        self
    }

    pub fn with_embedder(mut self, name: &str, f: impl Fn() -> Result<SharedEmbedder> + Send + Sync + 'static) -> Self {
        self.embedders.push(Provider::new(name, f));
        self
    }
}
