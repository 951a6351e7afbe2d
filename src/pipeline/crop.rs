use std::path::Path;

use anyhow::{Context, Result};
use image::{DynamicImage, ImageFormat};

use super::{StageKind, StageOutcome};
use crate::capability::{CapabilityKind, Detector};
use crate::models::{BBox, Detection, MediaItem};
use crate::utils::fs;
use crate::utils::logging::RunLog;

/// Pixel rectangle inside an image: left, top, width, height.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CropRect {
    pub left: u32,
    pub top: u32,
    pub width: u32,
    pub height: u32,
}

/// Grow `bbox` by `margin * w / 2` horizontally and `margin * h / 2`
/// vertically on each side (truncated to whole pixels) and clamp it to the
/// image. Boxes with no area left after clamping yield `None`.
pub fn expand_box(bbox: &BBox, margin: f32, img_w: u32, img_h: u32) -> Option<CropRect> {
    let m_w = (bbox.width as f64 * margin as f64 / 2.0) as i64;
    let m_h = (bbox.height as f64 * margin as f64 / 2.0) as i64;
    let (x, y, w, h) = (bbox.x as i64, bbox.y as i64, bbox.width as i64, bbox.height as i64);
    let left = (x - m_w).max(0);
    let top = (y - m_h).max(0);
    let right = (x + w + m_w).min(img_w as i64);
    let bottom = (y + h + m_h).min(img_h as i64);
    if right <= left || bottom <= top {
        return None;
    }
    Some(CropRect {
        left: left as u32,
        top: top as u32,
        width: (right - left) as u32,
        height: (bottom - top) as u32,
    })
}

/// Output names for `count` crops of `item`: the original name for a single
/// crop, `<stem>_NN.png` otherwise.
pub fn crop_names(item: &MediaItem, count: usize) -> Vec<String> {
    if count == 1 {
        return vec![item.name.clone()];
    }
    (0..count).map(|i| format!("{}_{:02}.png", item.stem(), i)).collect()
}

/// Crop rectangles for one image, in detector order.
pub fn crop_rects(detections: &[Detection], confidence: f32, margin: f32, img_w: u32, img_h: u32) -> Vec<CropRect> {
    detections
        .iter()
        .filter(|d| d.confidence >= confidence)
        .filter_map(|d| expand_box(&d.bbox, margin, img_w, img_h))
        .collect()
}

#[derive(Debug, Clone, Copy)]
pub struct CropParams {
    pub margin: f32,
    pub confidence: f32,
    pub batch_size: usize,
}

/// Detector picked for the whole stage run.
pub struct DetectionSource<'a> {
    pub kind: CapabilityKind,
    pub detector: &'a dyn Detector,
}

impl DetectionSource<'_> {
    /// Only the learned object detector is fed in batches.
    fn batch_size(&self, requested: usize) -> usize {
        if self.kind == CapabilityKind::Detector {
            requested.max(1)
        } else {
            1
        }
    }
}

/// Cropping stage. Without a source every image passes through unchanged.
pub fn run(
    input: &Path,
    output: &Path,
    params: CropParams,
    source: Option<DetectionSource<'_>>,
    log: &RunLog,
) -> Result<StageOutcome> {
    std::fs::create_dir_all(output).with_context(|| format!("Failed to create {:?}", output))?;
    let items = fs::list_pngs(input)?;
    let total = items.len();
    let mut written = 0;
    let mut processed = 0;

    let Some(source) = source else {
        for item in &items {
            pass_through(item, output)?;
            written += 1;
            processed += 1;
            log.progress(StageKind::Cropping.label(), processed, total);
        }
        return Ok(StageOutcome::new(total, written));
    };

    for batch in items.chunks(source.batch_size(params.batch_size)) {
        let images = batch
            .iter()
            .map(|item| item.load().map(|img| DynamicImage::ImageRgb8(img.to_rgb8())))
            .collect::<Result<Vec<_>>>()?;
        let detections = source.detector.detect(&images, params.confidence)?;
        anyhow::ensure!(
            detections.len() == images.len(),
            "{} returned {} results for {} images",
            source.kind,
            detections.len(),
            images.len()
        );
        for ((item, img), dets) in batch.iter().zip(&images).zip(&detections) {
            let rects = crop_rects(dets, params.confidence, params.margin, img.width(), img.height());
            if rects.is_empty() {
                pass_through(item, output)?;
                written += 1;
            } else {
                for (rect, name) in rects.iter().zip(crop_names(item, rects.len())) {
                    let dst = output.join(&name);
                    img.crop_imm(rect.left, rect.top, rect.width, rect.height)
                        .save_with_format(&dst, ImageFormat::Png)
                        .with_context(|| format!("Failed to write {:?}", dst))?;
                    written += 1;
                }
            }
            processed += 1;
            log.progress(StageKind::Cropping.label(), processed, total);
        }
    }
    Ok(StageOutcome::new(total, written))
}

fn pass_through(item: &MediaItem, output: &Path) -> Result<()> {
    let dst = item.target_in(output);
    std::fs::copy(&item.path, &dst).with_context(|| format!("Failed to copy {:?}", item.path))?;
    Ok(())
}
