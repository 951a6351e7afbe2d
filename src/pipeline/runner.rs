//! The orchestrator: runs the stages in order over a scratch directory and
//! packages the result into a single archive.

use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, warn};

use super::crop::{CropParams, DetectionSource};
use super::quality::QualityGate;
use super::{
    annotate, classify, cluster, crop, dedup, extract, filter, package, upscale, MediaSource, PipelineOptions,
    StageKind, PACKAGING_INDEX, PACKAGING_LABEL, SKIPPED_SUFFIX, START_LABEL,
};
use crate::capability::{CapabilityKind, CapabilityPreloader, CapabilityRegistry, SharedDetector};
use crate::error::PipelineError;
use crate::stats::RunStats;
use crate::utils::config::Config;
use crate::utils::fs;
use crate::utils::logging::RunLog;

/// Progress callback: step index (0 start, 1..=7 stages, 8 packaging) and label.
pub type ProgressFn<'a> = dyn Fn(usize, &str) + Send + Sync + 'a;

fn report(progress: Option<&ProgressFn<'_>>, index: usize, label: &str) {
    let Some(cb) = progress else {
        return;
    };
    if std::panic::catch_unwind(AssertUnwindSafe(|| cb(index, label))).is_err() {
        warn!("progress callback panicked at step {} ({}); ignoring", index, label);
    }
}

async fn blocking<T, F>(f: F) -> anyhow::Result<T>
where
    F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| anyhow::anyhow!("stage worker failed: {}", e))?
}

fn packaging_error(err: anyhow::Error) -> PipelineError {
    match err.downcast::<std::io::Error>() {
        Ok(io) => PipelineError::Io(io),
        Err(other) => PipelineError::Io(std::io::Error::other(format!("packaging failed: {:#}", other))),
    }
}

/// Removes the scratch directory on every exit path, and the partial output
/// and archive unless the run was committed.
struct CleanupGuard {
    work: PathBuf,
    output: PathBuf,
    archive: PathBuf,
    committed: bool,
}

impl CleanupGuard {
    fn commit(&mut self) {
        self.committed = true;
    }
}

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_dir_if_exists(&self.work) {
            warn!("failed to remove work dir {:?}: {}", self.work, e);
        }
        if self.committed {
            return;
        }
        if let Err(e) = fs::remove_dir_if_exists(&self.output) {
            warn!("failed to remove partial output {:?}: {}", self.output, e);
        }
        if let Err(e) = fs::remove_file_if_exists(&self.archive) {
            warn!("failed to remove partial archive {:?}: {}", self.archive, e);
        }
    }
}

pub struct Pipeline {
    preloader: Arc<CapabilityPreloader>,
    work_dir: PathBuf,
    log: Arc<RunLog>,
    preload: bool,
}

impl Pipeline {
    pub fn new(preloader: CapabilityPreloader, work_dir: impl Into<PathBuf>, log: Arc<RunLog>) -> Self {
        Self { preloader: Arc::new(preloader), work_dir: work_dir.into(), log, preload: true }
    }

    /// Discover providers from the environment configuration.
    pub fn from_config(cfg: &Config, log: Arc<RunLog>) -> Self {
        let registry = CapabilityRegistry::discover(cfg);
        let preloader = CapabilityPreloader::new(registry, cfg.preload_workers);
        Self::new(preloader, cfg.work_dir.clone(), log).with_preload(cfg.preload)
    }

    pub fn with_preload(mut self, preload: bool) -> Self {
        self.preload = preload;
        self
    }

    pub fn preloader(&self) -> &CapabilityPreloader {
        &self.preloader
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    pub fn log(&self) -> &RunLog {
        &self.log
    }

    /// Run every stage over `source` and archive the result to
    /// `<output>.zip`. On failure nothing is left behind: no output
    /// directory, no archive, no working directory.
    pub async fn run(
        &self,
        source: &MediaSource,
        output: &Path,
        options: &PipelineOptions,
        progress: Option<&ProgressFn<'_>>,
    ) -> Result<PathBuf, PipelineError> {
        let archive = fs::archive_path_for(output);
        fs::remove_dir_if_exists(output)?;
        fs::remove_file_if_exists(&archive)?;
        fs::remove_dir_if_exists(&self.work_dir)?;

        let mut guard = CleanupGuard {
            work: self.work_dir.clone(),
            output: output.to_path_buf(),
            archive: archive.clone(),
            committed: false,
        };
        let mut stats = RunStats::new();
        match self.execute(source, output, options, progress, &mut stats).await {
            Ok(path) => {
                guard.commit();
                stats.finish();
                self.log.step(&format!("Run statistics: {}", stats.to_json_line()));
                self.log.step(&format!("Pipeline completed successfully: {}", path.display()));
                Ok(path)
            }
            Err(e) => {
                self.log.error(&format!("Pipeline failed: {}", e));
                Err(e)
            }
        }
    }

    async fn execute(
        &self,
        source: &MediaSource,
        output: &Path,
        options: &PipelineOptions,
        progress: Option<&ProgressFn<'_>>,
        stats: &mut RunStats,
    ) -> Result<PathBuf, PipelineError> {
        source.validate()?;
        if self.preload {
            for kind in CapabilityKind::PRELOADED {
                self.preloader.prepare(kind);
            }
        }
        report(progress, 0, START_LABEL);
        std::fs::create_dir_all(output)?;
        std::fs::create_dir_all(&self.work_dir)?;

        // Extraction
        let stage = StageKind::Extraction;
        self.announce(stage, false, progress);
        let frames = self.stage_dir(stage);
        let started = Instant::now();
        let outcome = extract::run(source, &frames, options.fps, &self.log)
            .await
            .map_err(|e| PipelineError::from_stage(stage, e))?;
        stats.record(stage, outcome, started.elapsed());
        let mut current = frames;

        // Deduplication
        let stage = StageKind::Deduplication;
        if self.enter(stage, options, progress, stats) {
            let (input, out, log) = (current.clone(), self.stage_dir(stage), self.log.clone());
            let threshold = options.dedup_threshold;
            let started = Instant::now();
            let outcome = blocking(move || dedup::run(&input, &out, threshold, &log))
                .await
                .map_err(|e| PipelineError::from_stage(stage, e))?;
            stats.record(stage, outcome, started.elapsed());
            current = self.advance(&current, stage)?;
        }

        // Filtering
        let stage = StageKind::Filtering;
        if self.enter(stage, options, progress, stats) {
            let (input, out, log) = (current.clone(), self.stage_dir(stage), self.log.clone());
            let started = Instant::now();
            let outcome = blocking(move || filter::run(&input, &out, &log))
                .await
                .map_err(|e| PipelineError::from_stage(stage, e))?;
            stats.record(stage, outcome, started.elapsed());
            current = self.advance(&current, stage)?;
        }

        // Upscaling
        let stage = StageKind::Upscaling;
        if self.enter(stage, options, progress, stats) {
            let upscaler = match self.preloader.upscaler().await {
                Ok(u) => Some(u),
                Err(e) => {
                    self.log.warn(&format!("{}; falling back to Lanczos resize", e));
                    None
                }
            };
            let (input, out, log) = (current.clone(), self.stage_dir(stage), self.log.clone());
            let gate = QualityGate::new(options.blur_threshold, options.dark_threshold);
            let scale = options.scale;
            let started = Instant::now();
            let outcome = blocking(move || upscale::run(&input, &out, scale, gate, upscaler.as_deref(), &log))
                .await
                .map_err(|e| PipelineError::from_stage(stage, e))?;
            stats.record(stage, outcome, started.elapsed());
            current = self.advance(&current, stage)?;
        }

        // Cropping
        let stage = StageKind::Cropping;
        if self.enter(stage, options, progress, stats) {
            let source = self.detection_source(options).await;
            let (input, out, log) = (current.clone(), self.stage_dir(stage), self.log.clone());
            let params =
                CropParams { margin: options.margin, confidence: options.confidence, batch_size: options.batch_size };
            let started = Instant::now();
            let outcome = blocking(move || {
                let source = source.as_ref().map(|(kind, det)| DetectionSource { kind: *kind, detector: det.as_ref() });
                crop::run(&input, &out, params, source, &log)
            })
            .await
            .map_err(|e| PipelineError::from_stage(stage, e))?;
            stats.record(stage, outcome, started.elapsed());
            current = self.advance(&current, stage)?;
        }

        // Annotation writes captions into the output directory and leaves
        // the current image set untouched.
        let stage = StageKind::Annotation;
        if self.enter(stage, options, progress, stats) {
            let tagger = match self.preloader.tagger().await {
                Ok(t) => Some(t),
                Err(e) => {
                    self.log.warn(&format!("{}; writing placeholder captions", e));
                    None
                }
            };
            let (input, log) = (current.clone(), self.log.clone());
            let captions = output.join(package::CAPTIONS_DIR);
            let trigger = options.trigger_word.clone();
            let started = Instant::now();
            let outcome = blocking(move || annotate::run(&input, &captions, &trigger, tagger.as_deref(), &log))
                .await
                .map_err(|e| PipelineError::from_stage(stage, e))?;
            stats.record(stage, outcome, started.elapsed());
        }

        // Classification
        let stage = StageKind::Classification;
        if self.enter(stage, options, progress, stats) {
            let tagger = match self.preloader.tagger().await {
                Ok(t) => Some(t),
                Err(e) => {
                    self.log.warn(&format!("{}; every image goes to unclassified", e));
                    None
                }
            };
            let (input, out, log) = (current.clone(), self.stage_dir(stage), self.log.clone());
            let started = Instant::now();
            let classify_out = out.clone();
            let classified = blocking(move || classify::run(&input, &classify_out, tagger.as_deref(), &log))
                .await
                .map_err(|e| PipelineError::from_stage(stage, e))?;
            for (key, count) in &classified.buckets {
                debug!("{}: {} images", key, count);
            }
            if classified.tagged && classified.unclassified() >= 2 {
                stats.clusters = self.cluster(&out, options.cluster_count).await?;
            }
            stats.record(stage, classified.outcome, started.elapsed());
            current = self.advance(&current, stage)?;
        }

        report(progress, PACKAGING_INDEX, PACKAGING_LABEL);
        self.log.step(PACKAGING_LABEL);
        let (final_dir, out, log) = (current, output.to_path_buf(), self.log.clone());
        blocking(move || package::run(&final_dir, &out, &log)).await.map_err(packaging_error)
    }

    fn stage_dir(&self, stage: StageKind) -> PathBuf {
        self.work_dir.join(stage.work_dir_name().unwrap_or("scratch"))
    }

    fn announce(&self, stage: StageKind, skipped: bool, progress: Option<&ProgressFn<'_>>) {
        let label = if skipped {
            format!("{}{}", stage.label(), SKIPPED_SUFFIX)
        } else {
            stage.label().to_string()
        };
        report(progress, stage.index(), &label);
        self.log.step(&format!("Stage {}/{}: {}", stage.index(), StageKind::ALL.len(), label));
    }

    /// Announce `stage` and tell whether it should run.
    fn enter(
        &self,
        stage: StageKind,
        options: &PipelineOptions,
        progress: Option<&ProgressFn<'_>>,
        stats: &mut RunStats,
    ) -> bool {
        let skipped = options.is_skipped(stage);
        self.announce(stage, skipped, progress);
        if skipped {
            stats.record_skip(stage);
        }
        !skipped
    }

    /// Drop the consumed input directory; the stage's own directory becomes
    /// the next input.
    fn advance(&self, consumed: &Path, stage: StageKind) -> Result<PathBuf, PipelineError> {
        fs::remove_dir_if_exists(consumed)?;
        Ok(self.stage_dir(stage))
    }

    /// Pick one detection source for the whole cropping stage: the object
    /// detector, then the face detector when enabled, then the heuristic.
    async fn detection_source(&self, options: &PipelineOptions) -> Option<(CapabilityKind, SharedDetector)> {
        let mut kinds = vec![CapabilityKind::Detector];
        if options.use_face_detector {
            kinds.push(CapabilityKind::FaceDetector);
        }
        kinds.push(CapabilityKind::HeuristicDetector);
        for kind in kinds {
            match self.preloader.detector(kind).await {
                Ok(det) => {
                    info!("cropping with {}", kind);
                    return Some((kind, det));
                }
                Err(e) => self.log.warn(&e.to_string()),
            }
        }
        self.log.warn("No detection source available; images pass through uncropped");
        None
    }

    async fn cluster(&self, classified: &Path, requested: Option<usize>) -> Result<Option<usize>, PipelineError> {
        let embedder = match self.preloader.embedder().await {
            Ok(e) => e,
            Err(e) => {
                self.log.warn(&format!("{}; unclassified images stay ungrouped", e));
                return Ok(None);
            }
        };
        let (dir, log) = (classify::unclassified_dir(classified), self.log.clone());
        let clusters = blocking(move || cluster::cluster_dir(&dir, embedder.as_ref(), requested, &log))
            .await
            .map_err(|e| PipelineError::from_stage(StageKind::Classification, e))?;
        Ok(Some(clusters))
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline").field("work_dir", &self.work_dir).field("preload", &self.preload).finish()
    }
}
