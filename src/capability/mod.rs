//! Heavyweight inference capabilities used by the stages, and the machinery
//! that prepares them in the background.

pub mod heuristic;
pub mod preload;
pub mod registry;
#[cfg(feature = "onnx")]
pub mod onnx;

use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use image::DynamicImage;

use crate::models::Detection;

pub use preload::{CapabilityPreloader, CapabilitySlot, SlotState, SlotStatus};
pub use registry::{CapabilityRegistry, Provider};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CapabilityKind {
    Upscaler,
    Detector,
    FaceDetector,
    HeuristicDetector,
    Tagger,
    Embedder,
}

impl CapabilityKind {
    /// Capabilities started before the first stage when preloading is on.
    pub const PRELOADED: [CapabilityKind; 3] =
        [CapabilityKind::Upscaler, CapabilityKind::Detector, CapabilityKind::Tagger];

    pub fn as_str(self) -> &'static str {
        match self {
            CapabilityKind::Upscaler => "upscaler",
            CapabilityKind::Detector => "detector",
            CapabilityKind::FaceDetector => "face-detector",
            CapabilityKind::HeuristicDetector => "heuristic-detector",
            CapabilityKind::Tagger => "tagger",
            CapabilityKind::Embedder => "embedder",
        }
    }
}

impl fmt::Display for CapabilityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Finds subject boxes. Returns one list per input image, in input order,
/// already filtered to `confidence` and in the detector's output order.
pub trait Detector: Send + Sync {
    fn detect(&self, images: &[DynamicImage], confidence: f32) -> Result<Vec<Vec<Detection>>>;
}

/// Scores the full tag vocabulary for an image, highest score first.
pub trait Tagger: Send + Sync {
    fn tag(&self, image: &DynamicImage) -> Result<Vec<(String, f32)>>;
}

/// Learned super-resolution at a fixed native factor.
pub trait Upscaler: Send + Sync {
    fn scale(&self) -> u32;
    fn enhance(&self, image: &DynamicImage) -> Result<DynamicImage>;
}

/// Fixed-length feature vector used to group unclassified images.
pub trait Embedder: Send + Sync {
    fn embed(&self, image: &DynamicImage) -> Result<Vec<f32>>;
}

pub type SharedDetector = Arc<dyn Detector>;
pub type SharedTagger = Arc<dyn Tagger>;
pub type SharedUpscaler = Arc<dyn Upscaler>;
pub type SharedEmbedder = Arc<dyn Embedder>;
