pub mod capability;
pub mod error;
pub mod models;
pub mod pipeline;
pub mod stats;
pub mod utils;

pub use capability::{CapabilityKind, CapabilityPreloader, CapabilityRegistry};
pub use error::PipelineError;
pub use pipeline::{MediaSource, Pipeline, PipelineOptions, ProgressFn, StageKind};
pub use stats::RunStats;
