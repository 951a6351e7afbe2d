use std::path::Path;

use anyhow::{Context, Result};
use image::{imageops::FilterType, DynamicImage, Rgb, RgbImage};

use super::OnnxModel;
use crate::capability::Tagger;

/// Square input side of the WD14 v3 taggers.
pub const INPUT_SIZE: u32 = 448;
/// The first score columns are not part of the label list.
const SCORE_OFFSET: usize = 4;

/// Second column of every row after the header. Handles quoted fields.
pub fn parse_tag_csv(text: &str) -> Vec<String> {
    text.lines()
        .skip(1)
        .filter(|l| !l.trim().is_empty())
        .filter_map(|line| split_csv_line(line).into_iter().nth(1))
        .collect()
}

fn split_csv_line(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut field = String::new();
    let mut quoted = false;
    let mut chars = line.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '"' if quoted && chars.peek() == Some(&'"') => {
                field.push('"');
                chars.next();
            }
            '"' => quoted = !quoted,
            ',' if !quoted => fields.push(std::mem::take(&mut field)),
            _ => field.push(c),
        }
    }
    fields.push(field);
    fields
}

/// `long_hair` -> `long hair`; short emoticon tags such as `^_^` stay as is.
pub fn normalize_label(label: &str) -> String {
    if label.chars().count() > 3 {
        label.replace('_', " ")
    } else {
        label.to_string()
    }
}

/// Flatten transparency onto white, pad to a centred white square of at
/// least `size`, resize to `size` and lay out as NHWC BGR floats in 0..=255.
pub fn preprocess(img: &DynamicImage, size: u32) -> Vec<f32> {
    let rgba = img.to_rgba8();
    let (w, h) = rgba.dimensions();
    let side = w.max(h).max(size);
    let mut canvas = RgbImage::from_pixel(side, side, Rgb([255, 255, 255]));
    let (left, top) = ((side - w) / 2, (side - h) / 2);
    for (x, y, p) in rgba.enumerate_pixels() {
        let a = p[3] as f32 / 255.0;
        let blend = |c: u8| (c as f32 * a + 255.0 * (1.0 - a)).round() as u8;
        canvas.put_pixel(x + left, y + top, Rgb([blend(p[0]), blend(p[1]), blend(p[2])]));
    }
    let canvas = if side != size {
        let filter = if side > size { FilterType::Triangle } else { FilterType::CatmullRom };
        image::imageops::resize(&canvas, size, size, filter)
    } else {
        canvas
    };
    let mut data = Vec::with_capacity((size * size * 3) as usize);
    for p in canvas.pixels() {
        data.extend_from_slice(&[p[2] as f32, p[1] as f32, p[0] as f32]);
    }
    data
}

pub struct Wd14Tagger {
    model: OnnxModel,
    labels: Vec<String>,
}

impl Wd14Tagger {
    pub fn open(model: &Path, tags_csv: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(tags_csv).with_context(|| format!("Failed to read {:?}", tags_csv))?;
        let labels: Vec<String> = parse_tag_csv(&text).iter().map(|l| normalize_label(l)).collect();
        anyhow::ensure!(!labels.is_empty(), "{:?} holds no tags", tags_csv);
        Ok(Self { model: OnnxModel::open(model)?, labels })
    }
}

impl Tagger for Wd14Tagger {
    fn tag(&self, image: &DynamicImage) -> Result<Vec<(String, f32)>> {
        let data = preprocess(image, INPUT_SIZE);
        let shape = vec![1, INPUT_SIZE as i64, INPUT_SIZE as i64, 3];
        let scores = self.model.run_first(shape, data)?.data;
        let n = self.labels.len().min(scores.len().saturating_sub(SCORE_OFFSET));
        let mut scored: Vec<(String, f32)> =
            (0..n).map(|i| (self.labels[i].clone(), scores[i + SCORE_OFFSET])).collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        Ok(scored)
    }
}
