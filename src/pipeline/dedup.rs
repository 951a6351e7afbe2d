use std::path::Path;

use anyhow::{Context, Result};
use image::imageops::{self, FilterType};
use image::DynamicImage;
use rayon::prelude::*;
use rustdct::{Dct2, DctPlanner};
use tracing::debug;

use super::quality::luma601;
use super::{StageKind, StageOutcome};
use crate::models::MediaItem;
use crate::utils::fs;
use crate::utils::logging::RunLog;

const HASH_INPUT: usize = 32;
const HASH_SIZE: usize = 8;

/// 64-bit DCT perceptual hash: 32x32 Lanczos grayscale, 2D DCT-II, the
/// 8x8 lowest frequencies compared against their median.
pub fn phash(img: &DynamicImage) -> u64 {
    let gray = luma601(img);
    let small = imageops::resize(&gray, HASH_INPUT as u32, HASH_INPUT as u32, FilterType::Lanczos3);
    let mut pixels: Vec<f32> = small.as_raw().iter().map(|&v| v as f32).collect();

    let mut planner = DctPlanner::new();
    let dct = planner.plan_dct2(HASH_INPUT);
    for row in pixels.chunks_exact_mut(HASH_INPUT) {
        dct.process_dct2(row);
    }
    let mut column = vec![0f32; HASH_INPUT];
    for x in 0..HASH_INPUT {
        for y in 0..HASH_INPUT {
            column[y] = pixels[y * HASH_INPUT + x];
        }
        dct.process_dct2(&mut column);
        for y in 0..HASH_INPUT {
            pixels[y * HASH_INPUT + x] = column[y];
        }
    }

    let mut low = Vec::with_capacity(HASH_SIZE * HASH_SIZE);
    for y in 0..HASH_SIZE {
        low.extend_from_slice(&pixels[y * HASH_INPUT..y * HASH_INPUT + HASH_SIZE]);
    }
    let median = median(&low);
    low.iter()
        .enumerate()
        .fold(0u64, |acc, (i, &v)| if v > median { acc | (1 << (63 - i)) } else { acc })
}

fn median(values: &[f32]) -> f32 {
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

pub fn hamming_distance(a: u64, b: u64) -> u32 {
    (a ^ b).count_ones()
}

/// Greedy first-seen retention over an ordered hash sequence: an item is
/// kept iff its distance to every previously kept hash exceeds `threshold`.
pub struct Deduplicator {
    threshold: u32,
    kept: Vec<u64>,
}

impl Deduplicator {
    pub fn new(threshold: u32) -> Self {
        Self { threshold, kept: Vec::new() }
    }

    /// Offer the next hash; returns whether it is retained.
    pub fn offer(&mut self, hash: u64) -> bool {
        let distinct = self.kept.iter().all(|&k| hamming_distance(hash, k) > self.threshold);
        if distinct {
            self.kept.push(hash);
        }
        distinct
    }

    /// Indices of the retained hashes, in input order.
    pub fn retain_indices(threshold: u32, hashes: &[u64]) -> Vec<usize> {
        let mut dedup = Self::new(threshold);
        hashes.iter().enumerate().filter(|(_, h)| dedup.offer(**h)).map(|(i, _)| i).collect()
    }
}

/// Stage entry: copy the retained PNGs of `input` into `output`.
pub fn run(input: &Path, output: &Path, threshold: u32, log: &RunLog) -> Result<StageOutcome> {
    std::fs::create_dir_all(output).with_context(|| format!("Failed to create {:?}", output))?;
    let items = fs::list_pngs(input)?;
    let total = items.len();

    let hashes = items
        .par_iter()
        .map(|item| item.load().map(|img| phash(&img)))
        .collect::<Result<Vec<u64>>>()?;

    let mut dedup = Deduplicator::new(threshold);
    let mut kept = 0;
    for (idx, (item, hash)) in items.iter().zip(&hashes).enumerate() {
        if dedup.offer(*hash) {
            copy_item(item, output)?;
            kept += 1;
        } else {
            debug!("dropping near-duplicate {}", item.name);
        }
        log.progress(StageKind::Deduplication.label(), idx + 1, total);
    }
    Ok(StageOutcome::new(total, kept))
}

fn copy_item(item: &MediaItem, dir: &Path) -> Result<()> {
    let dst = item.target_in(dir);
    std::fs::copy(&item.path, &dst).with_context(|| format!("Failed to copy {:?} to {:?}", item.path, dst))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    fn gradient(seed: u32) -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_fn(64, 64, |x, y| {
            let v = ((x * (seed + 1) + y * (seed * 3 + 2)) % 256) as u8;
            Rgb([v, v.wrapping_add(40), v.wrapping_mul(3)])
        }))
    }

    #[test]
    fn hamming_counts_differing_bits() {
        assert_eq!(hamming_distance(0, 0), 0);
        assert_eq!(hamming_distance(0b1011, 0b0001), 2);
        assert_eq!(hamming_distance(u64::MAX, 0), 64);
    }

    #[test]
    fn identical_images_hash_identically() {
        let a = gradient(3);
        assert_eq!(phash(&a), phash(&a.clone()));
    }

    #[test]
    fn empty_and_single_inputs() {
        assert!(Deduplicator::retain_indices(8, &[]).is_empty());
        assert_eq!(Deduplicator::retain_indices(64, &[42]), vec![0]);
    }

    #[test]
    fn maximal_threshold_keeps_only_the_first() {
        let hashes = [0u64, u64::MAX, 0xF0F0, 1];
        assert_eq!(Deduplicator::retain_indices(64, &hashes), vec![0]);
        assert_eq!(Deduplicator::retain_indices(u32::MAX, &hashes), vec![0]);
    }

    #[test]
    fn zero_threshold_drops_only_exact_duplicates() {
        let hashes = [0b1u64, 0b1, 0b11, 0b1];
        assert_eq!(Deduplicator::retain_indices(0, &hashes), vec![0, 2]);
    }

    #[test]
    fn output_is_ordered_subsequence() {
        let hashes = [0u64, 0xFF, 0x1, 0xFFFF_0000, 0xFF00, 0x3];
        for threshold in 0..10 {
            let kept = Deduplicator::retain_indices(threshold, &hashes);
            assert!(kept.windows(2).all(|w| w[0] < w[1]));
            assert_eq!(kept.first(), Some(&0));
            for (i, &a) in kept.iter().enumerate() {
                for &b in &kept[i + 1..] {
                    assert!(hamming_distance(hashes[a], hashes[b]) > threshold);
                }
            }
        }
    }

    #[test]
    fn near_duplicates_of_kept_items_are_dropped() {
        // 0x1 is within 1 bit of 0x0; 0xFFF00 is 12 bits from both.
        let hashes = [0x0u64, 0x1, 0xFFF00, 0xFFF01];
        assert_eq!(Deduplicator::retain_indices(8, &hashes), vec![0, 2]);
        assert_eq!(Deduplicator::retain_indices(0, &hashes), vec![0, 1, 2, 3]);
    }
}
