pub mod annotate;
pub mod classify;
pub mod cluster;
pub mod crop;
pub mod dedup;
pub mod extract;
pub mod filter;
pub mod package;
pub mod quality;
pub mod runner;
pub mod upscale;

use serde::{Deserialize, Serialize};

pub use extract::MediaSource;
pub use runner::{Pipeline, ProgressFn};

/// The seven transformation stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    Extraction,
    Deduplication,
    Filtering,
    Upscaling,
    Cropping,
    Annotation,
    Classification,
}

impl StageKind {
    pub const ALL: [StageKind; 7] = [
        StageKind::Extraction,
        StageKind::Deduplication,
        StageKind::Filtering,
        StageKind::Upscaling,
        StageKind::Cropping,
        StageKind::Annotation,
        StageKind::Classification,
    ];

    /// Progress index reported to the callback. 0 is the run start and 8 is packaging.
    pub fn index(self) -> usize {
        match self {
            StageKind::Extraction => 1,
            StageKind::Deduplication => 2,
            StageKind::Filtering => 3,
            StageKind::Upscaling => 4,
            StageKind::Cropping => 5,
            StageKind::Annotation => 6,
            StageKind::Classification => 7,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            StageKind::Extraction => "Frame Extraction",
            StageKind::Deduplication => "Deduplication",
            StageKind::Filtering => "Filtering",
            StageKind::Upscaling => "Upscaling",
            StageKind::Cropping => "Cropping",
            StageKind::Annotation => "Annotation",
            StageKind::Classification => "Classification",
        }
    }

    /// Working subdirectory written by this stage. Annotation writes captions
    /// straight into the output directory and owns no working directory.
    pub fn work_dir_name(self) -> Option<&'static str> {
        match self {
            StageKind::Extraction => Some("frames"),
            StageKind::Deduplication => Some("dedup"),
            StageKind::Filtering => Some("filtering"),
            StageKind::Upscaling => Some("upscaling"),
            StageKind::Cropping => Some("cropping"),
            StageKind::Annotation => None,
            StageKind::Classification => Some("classification"),
        }
    }
}

pub const START_LABEL: &str = "Starting";
pub const PACKAGING_LABEL: &str = "Packaging";
pub const PACKAGING_INDEX: usize = 8;
pub const SKIPPED_SUFFIX: &str = " (skipped)";

/// Item counts for one stage run, used for run statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StageOutcome {
    pub items_in: usize,
    pub items_out: usize,
}

impl StageOutcome {
    pub fn new(items_in: usize, items_out: usize) -> Self {
        Self { items_in, items_out }
    }
}

/// Per-run options. Defaults match the command line defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineOptions {
    pub trigger_word: String,
    pub fps: u32,
    pub dedup_threshold: u32,
    pub scale: u32,
    pub blur_threshold: f64,
    pub dark_threshold: f64,
    pub margin: f32,
    pub confidence: f32,
    pub batch_size: usize,
    pub skip_deduplication: bool,
    pub skip_filtering: bool,
    pub skip_upscaling: bool,
    pub skip_cropping: bool,
    pub skip_annotation: bool,
    pub skip_classification: bool,
    /// Fixed number of clusters for unclassified images; searched when unset.
    pub cluster_count: Option<usize>,
    pub use_face_detector: bool,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            trigger_word: "name".to_string(),
            fps: 1,
            dedup_threshold: 8,
            scale: 4,
            blur_threshold: 100.0,
            dark_threshold: 40.0,
            margin: 0.3,
            confidence: 0.5,
            batch_size: 4,
            skip_deduplication: false,
            skip_filtering: false,
            skip_upscaling: false,
            skip_cropping: false,
            skip_annotation: false,
            skip_classification: false,
            cluster_count: None,
            use_face_detector: true,
        }
    }
}

impl PipelineOptions {
    /// Everything except extraction can be bypassed.
    pub fn is_skipped(&self, stage: StageKind) -> bool {
        match stage {
            StageKind::Extraction => false,
            StageKind::Deduplication => self.skip_deduplication,
            StageKind::Filtering => self.skip_filtering,
            StageKind::Upscaling => self.skip_upscaling,
            StageKind::Cropping => self.skip_cropping,
            StageKind::Annotation => self.skip_annotation,
            StageKind::Classification => self.skip_classification,
        }
    }

    pub fn skip_all(mut self) -> Self {
        self.skip_deduplication = true;
        self.skip_filtering = true;
        self.skip_upscaling = true;
        self.skip_cropping = true;
        self.skip_annotation = true;
        self.skip_classification = true;
        self
    }
}
