use std::path::Path;

use anyhow::{Context, Result};
use image::imageops::FilterType;
use image::{DynamicImage, ImageFormat};
use tracing::{debug, warn};

use super::quality::QualityGate;
use super::{StageKind, StageOutcome};
use crate::capability::Upscaler;
use crate::utils::fs;
use crate::utils::logging::RunLog;

/// Enlarge by `scale`, through the learned upscaler when present. The result
/// is always exactly `scale` times the input dimensions.
pub fn enlarge(img: &DynamicImage, scale: u32, upscaler: Option<&dyn Upscaler>) -> Result<DynamicImage> {
    let (w, h) = target_size(img.width(), img.height(), scale)?;
    if let Some(up) = upscaler {
        let out = up.enhance(img)?;
        if out.width() == w && out.height() == h {
            return Ok(out);
        }
        debug!("upscaler produced {}x{} (native x{}), resizing to {}x{}", out.width(), out.height(), up.scale(), w, h);
        return Ok(out.resize_exact(w, h, FilterType::Lanczos3));
    }
    Ok(img.resize_exact(w, h, FilterType::Lanczos3))
}

/// Output dimensions for `scale`, failing instead of overflowing.
pub fn target_size(width: u32, height: u32, scale: u32) -> Result<(u32, u32)> {
    let scale = scale.max(1);
    match (width.checked_mul(scale), height.checked_mul(scale)) {
        (Some(w), Some(h)) => Ok((w, h)),
        _ => anyhow::bail!("{}x{} scaled by {} does not fit in u32 dimensions", width, height, scale),
    }
}

/// Upscaling stage: gate, then enlarge survivors into `output`.
pub fn run(
    input: &Path,
    output: &Path,
    scale: u32,
    gate: QualityGate,
    upscaler: Option<&dyn Upscaler>,
    log: &RunLog,
) -> Result<StageOutcome> {
    std::fs::create_dir_all(output).with_context(|| format!("Failed to create {:?}", output))?;
    let items = fs::list_pngs(input)?;
    let total = items.len();
    let mut written = 0;
    for (idx, item) in items.iter().enumerate() {
        let img = DynamicImage::ImageRgb8(item.load()?.to_rgb8());
        let score = QualityGate::measure(&img);
        if gate.accepts(&score) {
            let big = match enlarge(&img, scale, upscaler) {
                Ok(big) => big,
                Err(e) => {
                    warn!("upscaler failed on {}: {:#}; using resize", item.name, e);
                    enlarge(&img, scale, None)?
                }
            };
            let dst = item.target_in(output);
            big.save_with_format(&dst, ImageFormat::Png).with_context(|| format!("Failed to write {:?}", dst))?;
            written += 1;
        } else {
            debug!(
                "rejecting {} (sharpness {:.1}, brightness {:.1})",
                item.name, score.sharpness, score.brightness
            );
        }
        log.progress(StageKind::Upscaling.label(), idx + 1, total);
    }
    Ok(StageOutcome::new(total, written))
}
