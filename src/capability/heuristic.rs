//! CPU-only subject finder used when no learned detector is available.
//!
//! Frames are shrunk to a small working size, pixels are classified as skin
//! with an RGB rule widened for the pale tones of cel shading, and connected
//! skin regions that are large and compact enough become detections.
//! Confidence is the fraction of the region's box covered by skin.

use anyhow::Result;
use image::{imageops::FilterType, DynamicImage, RgbImage};

use super::Detector;
use crate::models::{BBox, Detection};

/// Long side of the working image.
const WORK_SIDE: u32 = 128;
/// Smallest region kept, as a fraction of the working image area.
const MIN_AREA_FRACTION: f32 = 0.01;
const MIN_ASPECT: f32 = 0.4;
const MAX_ASPECT: f32 = 2.5;
const MIN_FILL: f32 = 0.3;
const MAX_REGIONS: usize = 4;

pub fn is_skin(r: u8, g: u8, b: u8) -> bool {
    let (ri, gi, bi) = (r as i32, g as i32, b as i32);
    let spread = ri.max(gi).max(bi) - ri.min(gi).min(bi);
    let daylight = ri > 95 && gi > 40 && bi > 20 && spread > 15 && ri - gi > 15 && ri > bi;
    let pale = ri > 220 && gi > 170 && bi > 150 && ri > bi && ri >= gi && ri - bi > 15;
    daylight || pale
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Region {
    x0: u32,
    y0: u32,
    x1: u32,
    y1: u32,
    area: u32,
}

impl Region {
    fn width(&self) -> u32 {
        self.x1 - self.x0 + 1
    }

    fn height(&self) -> u32 {
        self.y1 - self.y0 + 1
    }

    fn fill(&self) -> f32 {
        self.area as f32 / (self.width() * self.height()) as f32
    }
}

/// 4-connected regions of `mask` (row-major, `w` x `h`).
fn regions(mask: &[bool], w: u32, h: u32) -> Vec<Region> {
    let mut seen = vec![false; mask.len()];
    let mut found = Vec::new();
    let mut stack = Vec::new();
    for start in 0..mask.len() {
        if !mask[start] || seen[start] {
            continue;
        }
        seen[start] = true;
        stack.push(start);
        let (sx, sy) = ((start as u32) % w, (start as u32) / w);
        let mut region = Region { x0: sx, y0: sy, x1: sx, y1: sy, area: 0 };
        while let Some(i) = stack.pop() {
            let (x, y) = ((i as u32) % w, (i as u32) / w);
            region.area += 1;
            region.x0 = region.x0.min(x);
            region.x1 = region.x1.max(x);
            region.y0 = region.y0.min(y);
            region.y1 = region.y1.max(y);
            let mut visit = |nx: u32, ny: u32| {
                let j = (ny * w + nx) as usize;
                if mask[j] && !seen[j] {
                    seen[j] = true;
                    stack.push(j);
                }
            };
            if x > 0 {
                visit(x - 1, y);
            }
            if x + 1 < w {
                visit(x + 1, y);
            }
            if y > 0 {
                visit(x, y - 1);
            }
            if y + 1 < h {
                visit(x, y + 1);
            }
        }
        found.push(region);
    }
    found
}

fn working_copy(img: &DynamicImage) -> (RgbImage, f32) {
    let long = img.width().max(img.height()).max(1);
    if long <= WORK_SIDE {
        return (img.to_rgb8(), 1.0);
    }
    let scale = WORK_SIDE as f32 / long as f32;
    let w = ((img.width() as f32 * scale).round() as u32).max(1);
    let h = ((img.height() as f32 * scale).round() as u32).max(1);
    (img.resize_exact(w, h, FilterType::Triangle).to_rgb8(), scale)
}

/// Skin regions of one image in original pixel coordinates, largest first.
pub fn skin_regions(img: &DynamicImage) -> Vec<Detection> {
    let (small, scale) = working_copy(img);
    let (w, h) = small.dimensions();
    if w == 0 || h == 0 {
        return Vec::new();
    }
    let mask: Vec<bool> = small.pixels().map(|p| is_skin(p[0], p[1], p[2])).collect();
    let min_area = ((w * h) as f32 * MIN_AREA_FRACTION).ceil() as u32;

    let mut kept: Vec<Region> = regions(&mask, w, h)
        .into_iter()
        .filter(|r| r.area >= min_area.max(1))
        .filter(|r| {
            let aspect = r.width() as f32 / r.height() as f32;
            (MIN_ASPECT..=MAX_ASPECT).contains(&aspect) && r.fill() >= MIN_FILL
        })
        .collect();
    kept.sort_by(|a, b| b.area.cmp(&a.area).then(a.y0.cmp(&b.y0)).then(a.x0.cmp(&b.x0)));
    kept.truncate(MAX_REGIONS);

    kept.iter()
        .map(|r| {
            let bbox = BBox::from_corners(
                r.x0 as f32 / scale,
                r.y0 as f32 / scale,
                (r.x1 + 1) as f32 / scale,
                (r.y1 + 1) as f32 / scale,
            );
            Detection::new(bbox, r.fill())
        })
        .collect()
}

pub struct SkinToneDetector;

impl Detector for SkinToneDetector {
    fn detect(&self, images: &[DynamicImage], confidence: f32) -> Result<Vec<Vec<Detection>>> {
        Ok(images
            .iter()
            .map(|img| skin_regions(img).into_iter().filter(|d| d.confidence >= confidence).collect())
            .collect())
    }
}
