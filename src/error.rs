use std::fmt;

use thiserror::Error;

use crate::capability::CapabilityKind;
use crate::pipeline::StageKind;

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("unsupported input format: {0}")]
    UnsupportedFormat(String),
    #[error("external tool failed: {0}")]
    ExternalTool(String),
    #[error("capability {kind} unavailable: {reason}")]
    CapabilityUnavailable { kind: CapabilityKind, reason: String },
    #[error("{stage} failed: {source}")]
    StageExecution {
        stage: StageKind,
        #[source]
        source: BoxError,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    /// Wrap a stage failure. Errors that already carry a pipeline error kind
    /// (e.g. a missing ffmpeg binary) keep it instead of becoming a
    /// `StageExecution`.
    pub fn from_stage(stage: StageKind, err: anyhow::Error) -> Self {
        match err.downcast::<PipelineError>() {
            Ok(pe) => pe,
            Err(other) => PipelineError::StageExecution { stage, source: other.into() },
        }
    }

    pub fn is_fatal(&self) -> bool {
        !matches!(self, PipelineError::CapabilityUnavailable { .. })
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_error_keeps_existing_kind() {
        let inner = anyhow::Error::new(PipelineError::ExternalTool("ffmpeg missing".into()));
        let err = PipelineError::from_stage(StageKind::Extraction, inner);
        assert!(matches!(err, PipelineError::ExternalTool(_)));
    }

    #[test]
    fn stage_error_wraps_other_failures() {
        let err = PipelineError::from_stage(StageKind::Cropping, anyhow::anyhow!("decoder exploded"));
        match err {
            PipelineError::StageExecution { stage, source } => {
                assert_eq!(stage, StageKind::Cropping);
                assert!(source.to_string().contains("decoder exploded"));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn capability_unavailable_is_recoverable() {
        let err = PipelineError::CapabilityUnavailable { kind: CapabilityKind::Tagger, reason: "no model".into() };
        assert!(!err.is_fatal());
        assert!(PipelineError::UnsupportedFormat(".gif".into()).is_fatal());
    }
}
