use std::sync::Arc;

use tokio::sync::{watch, Semaphore};
use tracing::{debug, info, warn};

use super::registry::{CapabilityRegistry, Provider};
use super::{CapabilityKind, SharedDetector, SharedEmbedder, SharedTagger, SharedUpscaler};
use crate::error::PipelineError;

pub const DEFAULT_WORKERS: usize = 3;

#[derive(Clone)]
pub enum SlotState<T> {
    Unrequested,
    Pending,
    Ready(T),
    Failed(String),
}

/// Untyped view of a slot, for logging and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotStatus {
    Unrequested,
    Pending,
    Ready,
    Failed,
}

impl<T> SlotState<T> {
    pub fn status(&self) -> SlotStatus {
        match self {
            SlotState::Unrequested => SlotStatus::Unrequested,
            SlotState::Pending => SlotStatus::Pending,
            SlotState::Ready(_) => SlotStatus::Ready,
            SlotState::Failed(_) => SlotStatus::Failed,
        }
    }
}

/// Typed handle to one capability. The state only moves forward:
/// Unrequested -> Pending -> Ready | Failed.
#[derive(Clone)]
pub struct CapabilitySlot<T> {
    kind: CapabilityKind,
    state: Arc<watch::Sender<SlotState<T>>>,
}

impl<T: Clone + Send + Sync + 'static> CapabilitySlot<T> {
    pub fn new(kind: CapabilityKind) -> Self {
        let (tx, _rx) = watch::channel(SlotState::Unrequested);
        Self { kind, state: Arc::new(tx) }
    }

    pub fn kind(&self) -> CapabilityKind {
        self.kind
    }

    pub fn status(&self) -> SlotStatus {
        self.state.borrow().status()
    }

    /// Claim the slot for loading. Only the first caller gets `true`.
    fn begin(&self) -> bool {
        self.state.send_if_modified(|s| {
            if matches!(s, SlotState::Unrequested) {
                *s = SlotState::Pending;
                true
            } else {
                false
            }
        })
    }

    fn finish(&self, outcome: Result<T, String>) {
        let next = match outcome {
            Ok(v) => SlotState::Ready(v),
            Err(reason) => SlotState::Failed(reason),
        };
        self.state.send_replace(next);
    }

    /// Wait for the slot to settle. `Ok(None)` means nothing was ever
    /// requested for this kind.
    pub async fn resolve(&self) -> Result<Option<T>, PipelineError> {
        let mut rx = self.state.subscribe();
        let settled = rx
            .wait_for(|s| !matches!(s, SlotState::Pending))
            .await
            .map_err(|_| PipelineError::CapabilityUnavailable {
                kind: self.kind,
                reason: "preloader shut down".to_string(),
            })?;
        match &*settled {
            SlotState::Ready(v) => Ok(Some(v.clone())),
            SlotState::Failed(reason) => {
                Err(PipelineError::CapabilityUnavailable { kind: self.kind, reason: reason.clone() })
            }
            _ => Ok(None),
        }
    }
}

fn load_first<T>(kind: CapabilityKind, providers: &[Provider<T>]) -> Result<T, String> {
    let mut failures = Vec::new();
    for p in providers {
        match p.load() {
            Ok(v) => {
                info!("{} ready ({})", kind, p.name);
                return Ok(v);
            }
            Err(e) => {
                warn!("{} provider {} failed: {:#}", kind, p.name, e);
                failures.push(format!("{}: {:#}", p.name, e));
            }
        }
    }
    if failures.is_empty() {
        Err("no provider registered".to_string())
    } else {
        Err(failures.join("; "))
    }
}

/// Prepares capabilities on a small pool of blocking workers. Each kind is
/// loaded at most once; every resolver of a kind observes the same outcome.
pub struct CapabilityPreloader {
    registry: Arc<CapabilityRegistry>,
    permits: Arc<Semaphore>,
    upscaler: CapabilitySlot<SharedUpscaler>,
    detector: CapabilitySlot<SharedDetector>,
    face_detector: CapabilitySlot<SharedDetector>,
    heuristic_detector: CapabilitySlot<SharedDetector>,
    tagger: CapabilitySlot<SharedTagger>,
    embedder: CapabilitySlot<SharedEmbedder>,
}

impl CapabilityPreloader {
    pub fn new(registry: CapabilityRegistry, workers: usize) -> Self {
        Self {
            registry: Arc::new(registry),
            permits: Arc::new(Semaphore::new(workers.max(1))),
            upscaler: CapabilitySlot::new(CapabilityKind::Upscaler),
            detector: CapabilitySlot::new(CapabilityKind::Detector),
            face_detector: CapabilitySlot::new(CapabilityKind::FaceDetector),
            heuristic_detector: CapabilitySlot::new(CapabilityKind::HeuristicDetector),
            tagger: CapabilitySlot::new(CapabilityKind::Tagger),
            embedder: CapabilitySlot::new(CapabilityKind::Embedder),
        }
    }

    pub fn status(&self, kind: CapabilityKind) -> SlotStatus {
        match kind {
            CapabilityKind::Upscaler => self.upscaler.status(),
            CapabilityKind::Detector => self.detector.status(),
            CapabilityKind::FaceDetector => self.face_detector.status(),
            CapabilityKind::HeuristicDetector => self.heuristic_detector.status(),
            CapabilityKind::Tagger => self.tagger.status(),
            CapabilityKind::Embedder => self.embedder.status(),
        }
    }

    /// Start constructing `kind` in the background without waiting.
    /// Must be called from within a tokio runtime.
    pub fn prepare(&self, kind: CapabilityKind) {
        match kind {
            CapabilityKind::Upscaler => self.spawn_load(&self.upscaler, &self.registry.upscalers),
            CapabilityKind::Detector => self.spawn_load(&self.detector, &self.registry.detectors),
            CapabilityKind::FaceDetector => self.spawn_load(&self.face_detector, &self.registry.face_detectors),
            CapabilityKind::HeuristicDetector => {
                self.spawn_load(&self.heuristic_detector, &self.registry.heuristic_detectors)
            }
            CapabilityKind::Tagger => self.spawn_load(&self.tagger, &self.registry.taggers),
            CapabilityKind::Embedder => self.spawn_load(&self.embedder, &self.registry.embedders),
        }
    }

    fn spawn_load<T: Clone + Send + Sync + 'static>(&self, slot: &CapabilitySlot<T>, providers: &[Provider<T>]) {
        if !slot.begin() {
            return;
        }
        let kind = slot.kind();
        if providers.is_empty() {
            debug!("no providers registered for {}", kind);
            slot.finish(Err("no provider registered".to_string()));
            return;
        }
        debug!("preparing {} ({} providers)", kind, providers.len());
        let slot = slot.clone();
        let providers = providers.to_vec();
        let permits = self.permits.clone();
        tokio::spawn(async move {
            let _permit = permits.acquire_owned().await.ok();
            let outcome = tokio::task::spawn_blocking(move || load_first(kind, &providers))
                .await
                .unwrap_or_else(|e| Err(format!("loader panicked: {}", e)));
            slot.finish(outcome);
        });
    }

    pub async fn resolve_upscaler(&self) -> Result<Option<SharedUpscaler>, PipelineError> {
        self.upscaler.resolve().await
    }

    pub async fn resolve_detector(&self, kind: CapabilityKind) -> Result<Option<SharedDetector>, PipelineError> {
        match kind {
            CapabilityKind::Detector => self.detector.resolve().await,
            CapabilityKind::FaceDetector => self.face_detector.resolve().await,
            CapabilityKind::HeuristicDetector => self.heuristic_detector.resolve().await,
            other => Err(PipelineError::CapabilityUnavailable {
                kind: other,
                reason: "not a detector kind".to_string(),
            }),
        }
    }

    pub async fn resolve_tagger(&self) -> Result<Option<SharedTagger>, PipelineError> {
        self.tagger.resolve().await
    }

    pub async fn resolve_embedder(&self) -> Result<Option<SharedEmbedder>, PipelineError> {
        self.embedder.resolve().await
    }

    /// Prepare on demand, then wait. Used by stages so that disabling
    /// preloading changes only when loading happens.
    pub async fn upscaler(&self) -> Result<SharedUpscaler, PipelineError> {
        self.prepare(CapabilityKind::Upscaler);
        settled(CapabilityKind::Upscaler, self.resolve_upscaler().await)
    }

    pub async fn detector(&self, kind: CapabilityKind) -> Result<SharedDetector, PipelineError> {
        self.prepare(kind);
        settled(kind, self.resolve_detector(kind).await)
    }

    pub async fn tagger(&self) -> Result<SharedTagger, PipelineError> {
        self.prepare(CapabilityKind::Tagger);
        settled(CapabilityKind::Tagger, self.resolve_tagger().await)
    }

    pub async fn embedder(&self) -> Result<SharedEmbedder, PipelineError> {
        self.prepare(CapabilityKind::Embedder);
        settled(CapabilityKind::Embedder, self.resolve_embedder().await)
    }
}

fn settled<T>(kind: CapabilityKind, res: Result<Option<T>, PipelineError>) -> Result<T, PipelineError> {
    res?.ok_or_else(|| PipelineError::CapabilityUnavailable { kind, reason: "never requested".to_string() })
}
