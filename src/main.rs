use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{ArgGroup, Parser};
use reelset::pipeline::{MediaSource, Pipeline, PipelineOptions};
use reelset::utils::config::Config;
use reelset::utils::logging::{self, RunLog};
use tracing::info;

/// Turn an anime video or image folder into a captioned training set.
#[derive(Parser, Debug)]
#[command(name = "reelset")]
#[command(version)]
#[command(group(ArgGroup::new("source").required(true).args(["video", "images"])))]
struct Args {
    /// Input video (mp4, mkv, avi, mov, webm)
    #[arg(long)]
    video: Option<PathBuf>,

    /// Directory of images to use instead of a video
    #[arg(long)]
    images: Option<PathBuf>,

    /// Output directory; the archive is written next to it as <output>.zip
    output: PathBuf,

    /// Scratch directory for intermediate stages
    #[arg(long, env = "REELSET_WORK")]
    work: Option<PathBuf>,

    /// Token placed first in every caption
    #[arg(long, default_value = "name")]
    trigger: String,

    /// Frames extracted per second of video
    #[arg(long, default_value_t = 1)]
    fps: u32,

    /// Maximum perceptual hash distance treated as a duplicate
    #[arg(long, default_value_t = 8)]
    dedup: u32,

    /// Upscaling factor
    #[arg(long, default_value_t = 4)]
    scale: u32,

    /// Minimum Laplacian variance to keep an upscaled image
    #[arg(long, default_value_t = 100.0)]
    blur: f64,

    /// Minimum mean luminance to keep an upscaled image
    #[arg(long, default_value_t = 40.0)]
    dark: f64,

    /// Fraction of the box size added on each side of a crop
    #[arg(long, default_value_t = 0.3)]
    margin: f32,

    /// Minimum detection confidence
    #[arg(long, default_value_t = 0.5)]
    confidence: f32,

    /// Images per detector batch
    #[arg(long, default_value_t = 4)]
    batch: usize,

    #[arg(long)]
    skip_dedup: bool,
    #[arg(long)]
    skip_filter: bool,
    #[arg(long)]
    skip_upscale: bool,
    #[arg(long)]
    skip_crop: bool,
    #[arg(long)]
    skip_annotate: bool,
    #[arg(long)]
    skip_classify: bool,

    /// Load models on demand instead of in the background at start
    #[arg(long)]
    no_preload: bool,

    /// Fixed number of groups for unclassified images
    #[arg(long)]
    cluster_count: Option<usize>,

    /// Never fall back to the face detector when cropping
    #[arg(long)]
    no_face_detector: bool,
}

impl Args {
    fn source(&self) -> Option<MediaSource> {
        match (&self.video, &self.images) {
            (Some(v), _) => Some(MediaSource::Video(v.clone())),
            (None, Some(dir)) => Some(MediaSource::ImageSet(dir.clone())),
            (None, None) => None,
        }
    }

    fn options(&self, cfg: &Config) -> PipelineOptions {
        PipelineOptions {
            trigger_word: self.trigger.clone(),
            fps: self.fps,
            dedup_threshold: self.dedup,
            scale: self.scale,
            blur_threshold: self.blur,
            dark_threshold: self.dark,
            margin: self.margin,
            confidence: self.confidence,
            batch_size: self.batch,
            skip_deduplication: self.skip_dedup,
            skip_filtering: self.skip_filter,
            skip_upscaling: self.skip_upscale,
            skip_cropping: self.skip_crop,
            skip_annotation: self.skip_annotate,
            skip_classification: self.skip_classify,
            cluster_count: self.cluster_count,
            use_face_detector: cfg.face_detector && !self.no_face_detector,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init();
    let args = Args::parse();

    let mut cfg = Config::from_env();
    if let Some(work) = &args.work {
        cfg.work_dir = work.clone();
    }
    let source = args.source().context("either --video or --images is required")?;
    let options = args.options(&cfg);

    let log = RunLog::open(&cfg.log_dir)?;
    let job = args
        .output
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "run".to_string());
    if let Some(previous) = log.rotate(&job)? {
        info!("previous process log kept at {:?}", previous);
    }

    let pipeline = Pipeline::from_config(&cfg, Arc::new(log)).with_preload(cfg.preload && !args.no_preload);
    info!("input: {:?}, output: {:?}, work: {:?}", source.path(), args.output, pipeline.work_dir());

    let progress = |index: usize, label: &str| info!("[{}/8] {}", index, label);
    let archive = pipeline.run(&source, &args.output, &options, Some(&progress)).await?;
    println!("{}", archive.display());
    Ok(())
}
