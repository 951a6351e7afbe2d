use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use image::ImageFormat;
use tracing::warn;

use super::StageOutcome;
use crate::error::PipelineError;
use crate::utils::fs::{self, has_extension};
use crate::utils::ffmpeg;
use crate::utils::logging::RunLog;

pub const VIDEO_EXTENSIONS: &[&str] = &["mp4", "mkv", "avi", "mov", "webm"];
pub const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "webp", "bmp"];

/// Raw input of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaSource {
    Video(PathBuf),
    ImageSet(PathBuf),
}

impl MediaSource {
    /// Directories are image sets; anything else is treated as a video.
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        if path.is_dir() {
            MediaSource::ImageSet(path)
        } else {
            MediaSource::Video(path)
        }
    }

    pub fn path(&self) -> &Path {
        match self {
            MediaSource::Video(p) | MediaSource::ImageSet(p) => p,
        }
    }

    /// Checks that can fail before any stage runs.
    pub fn validate(&self) -> Result<(), PipelineError> {
        match self {
            MediaSource::Video(p) => {
                if !has_extension(p, VIDEO_EXTENSIONS) {
                    let ext = p.extension().and_then(|e| e.to_str()).unwrap_or("");
                    return Err(PipelineError::UnsupportedFormat(format!(
                        "unsupported video format '.{}' ({:?})",
                        ext, p
                    )));
                }
                if !p.is_file() {
                    return Err(PipelineError::Io(std::io::Error::new(
                        std::io::ErrorKind::NotFound,
                        format!("video not found: {:?}", p),
                    )));
                }
                Ok(())
            }
            MediaSource::ImageSet(p) => {
                if !p.is_dir() {
                    return Err(PipelineError::Io(std::io::Error::new(
                        std::io::ErrorKind::NotFound,
                        format!("image directory not found: {:?}", p),
                    )));
                }
                Ok(())
            }
        }
    }
}

/// Extraction stage: decode the source into `frame` PNGs in `output`.
pub async fn run(source: &MediaSource, output: &Path, fps: u32, log: &RunLog) -> Result<StageOutcome> {
    std::fs::create_dir_all(output).with_context(|| format!("Failed to create {:?}", output))?;
    match source {
        MediaSource::Video(video) => {
            ffmpeg::extract_frames(video, output, fps.max(1)).await?;
            let n = fs::list_pngs(output)?.len();
            log.step(&format!("Extracted {} frames from {:?}", n, video));
            Ok(StageOutcome::new(1, n))
        }
        MediaSource::ImageSet(dir) => {
            let dir = dir.clone();
            let output = output.to_path_buf();
            let (found, written) = tokio::task::spawn_blocking(move || import_images(&dir, &output))
                .await
                .context("image import task failed")??;
            log.step(&format!("Imported {} of {} images", written, found));
            Ok(StageOutcome::new(found, written))
        }
    }
}

/// Copy supported images into `output` as PNG, sorted by name. PNGs are
/// copied byte for byte; other formats are decoded and re-encoded.
pub fn import_images(dir: &Path, output: &Path) -> Result<(usize, usize)> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)
        .with_context(|| format!("Failed to read {:?}", dir))?
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| p.is_file() && has_extension(p, IMAGE_EXTENSIONS))
        .collect();
    files.sort();

    let mut written = 0;
    for src in &files {
        let Some(stem) = src.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        let dst = output.join(format!("{}.png", stem));
        if dst.exists() {
            warn!("skipping {:?}: {:?} already imported", src, dst);
            continue;
        }
        if has_extension(src, &["png"]) {
            std::fs::copy(src, &dst).with_context(|| format!("Failed to copy {:?}", src))?;
        } else {
            let img = image::open(src).with_context(|| format!("Failed to decode {:?}", src))?;
            img.save_with_format(&dst, ImageFormat::Png)
                .with_context(|| format!("Failed to write {:?}", dst))?;
        }
        written += 1;
    }
    Ok((files.len(), written))
}
