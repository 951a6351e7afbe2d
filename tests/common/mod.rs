#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::Result;
use image::{DynamicImage, Rgb, RgbImage};
use parking_lot::Mutex;
use reelset::capability::{CapabilityPreloader, CapabilityRegistry, Detector, Embedder, SharedDetector, Tagger};
use reelset::models::Detection;
use reelset::pipeline::Pipeline;
use reelset::utils::logging::RunLog;
use tempfile::TempDir;

pub const FRAME_SIDE: u32 = 64;
const BLOCK: u32 = 8;

/// Colour family of a synthetic frame. Every family stays bright and sharp
/// enough to pass the default quality gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Palette {
    Gray,
    Warm,
    Blue,
    Green,
}

impl Palette {
    fn pixel(self, v: u8) -> Rgb<u8> {
        let (full, half, quarter) = (v, v / 2, v / 4);
        match self {
            Palette::Gray => Rgb([full, full, full]),
            Palette::Warm => Rgb([half + 100, quarter + 40, quarter]),
            Palette::Blue => Rgb([quarter, quarter + 40, half + 100]),
            Palette::Green => Rgb([quarter, half + 100, quarter + 40]),
        }
    }
}

fn lcg(state: &mut u64) -> u8 {
    *state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
    (*state >> 56) as u8
}

/// Blocky noise: each 8x8 block gets one pseudo-random level, so distinct
/// seeds give unrelated perceptual hashes.
pub fn noise_frame(seed: u64, palette: Palette) -> RgbImage {
    let blocks = FRAME_SIDE / BLOCK;
    let mut state = seed.wrapping_add(1).wrapping_mul(0x9E3779B97F4A7C15);
    let levels: Vec<u8> = (0..blocks * blocks).map(|_| lcg(&mut state)).collect();
    RgbImage::from_fn(FRAME_SIDE, FRAME_SIDE, |x, y| palette.pixel(levels[((y / BLOCK) * blocks + x / BLOCK) as usize]))
}

/// Same picture with one pixel nudged, so the files differ but the hash does not.
pub fn near_duplicate(img: &RgbImage) -> RgbImage {
    let mut copy = img.clone();
    let p = copy.get_pixel_mut(3, 3);
    p[0] = p[0].saturating_add(1);
    copy
}

pub fn frame_name(index: usize) -> String {
    format!("frame_{:04}.png", index)
}

pub fn write_frames(dir: &Path, frames: &[RgbImage]) -> Vec<PathBuf> {
    std::fs::create_dir_all(dir).unwrap();
    frames
        .iter()
        .enumerate()
        .map(|(i, img)| {
            let path = dir.join(frame_name(i + 1));
            img.save(&path).unwrap();
            path
        })
        .collect()
}

/// Ten frames, seven distinct: frames 2, 5 and 9 repeat their predecessor.
pub fn ten_frames_seven_distinct() -> Vec<RgbImage> {
    let mut frames = Vec::new();
    let mut seed = 0;
    for i in 1..=10 {
        if matches!(i, 2 | 5 | 9) {
            let prev = near_duplicate(frames.last().unwrap());
            frames.push(prev);
        } else {
            seed += 1;
            frames.push(noise_frame(seed, Palette::Gray));
        }
    }
    frames
}

pub struct Workspace {
    pub tmp: TempDir,
    pub input: PathBuf,
    pub output: PathBuf,
    pub work: PathBuf,
}

impl Workspace {
    pub fn new() -> Self {
        let tmp = TempDir::new().unwrap();
        let input = tmp.path().join("input");
        let output = tmp.path().join("dataset");
        let work = tmp.path().join("work");
        std::fs::create_dir_all(&input).unwrap();
        Self { tmp, input, output, work }
    }

    pub fn archive(&self) -> PathBuf {
        self.tmp.path().join("dataset.zip")
    }

    pub fn pipeline(&self, registry: CapabilityRegistry) -> Pipeline {
        Pipeline::new(CapabilityPreloader::new(registry, 2), self.work.clone(), Arc::new(RunLog::disabled()))
    }
}

/// Entries of a zip archive as (name, bytes), in archive order.
pub fn read_archive(path: &Path) -> Vec<(String, Vec<u8>)> {
    use std::io::Read;
    let file = std::fs::File::open(path).unwrap();
    let mut zip = zip::ZipArchive::new(file).unwrap();
    (0..zip.len())
        .map(|i| {
            let mut entry = zip.by_index(i).unwrap();
            let mut data = Vec::new();
            entry.read_to_end(&mut data).unwrap();
            (entry.name().to_string(), data)
        })
        .collect()
}

pub fn names_under<'a>(entries: &'a [(String, Vec<u8>)], prefix: &str) -> Vec<&'a str> {
    entries.iter().map(|(n, _)| n.as_str()).filter(|n| n.starts_with(prefix)).collect()
}

/// Records every progress notification.
#[derive(Default)]
pub struct ProgressLog(pub Mutex<Vec<(usize, String)>>);

impl ProgressLog {
    pub fn callback(&self) -> impl Fn(usize, &str) + Send + Sync + '_ {
        move |index, label| self.0.lock().push((index, label.to_string()))
    }

    pub fn events(&self) -> Vec<(usize, String)> {
        self.0.lock().clone()
    }
}

fn channel_means(img: &DynamicImage) -> [f32; 3] {
    let rgb = img.to_rgb8();
    let n = (rgb.width() * rgb.height()).max(1) as f32;
    let mut sums = [0f32; 3];
    for p in rgb.pixels() {
        for c in 0..3 {
            sums[c] += p[c] as f32;
        }
    }
    sums.map(|s| s / n)
}

/// Warm frames read as blonde hair with blue eyes; everything else only
/// gets generic tags.
pub struct PaletteTagger;

impl Tagger for PaletteTagger {
    fn tag(&self, image: &DynamicImage) -> Result<Vec<(String, f32)>> {
        let [r, g, b] = channel_means(image);
        let tags: &[(&str, f32)] = if r > g && r > b {
            &[("blonde hair", 0.9), ("blue eyes", 0.8), ("smile", 0.4)]
        } else {
            &[("smile", 0.6), ("1girl", 0.5)]
        };
        Ok(tags.iter().map(|(t, s)| (t.to_string(), *s)).collect())
    }
}

/// Green and blue means as the feature vector.
pub struct ColorEmbedder;

impl Embedder for ColorEmbedder {
    fn embed(&self, image: &DynamicImage) -> Result<Vec<f32>> {
        let [_, g, b] = channel_means(image);
        Ok(vec![g / 255.0, b / 255.0])
    }
}

pub struct BrokenDetector;

impl Detector for BrokenDetector {
    fn detect(&self, _images: &[DynamicImage], _confidence: f32) -> Result<Vec<Vec<Detection>>> {
        anyhow::bail!("inference backend crashed")
    }
}

/// Counts how often a detector tier is loaded and asked to detect. The
/// detector finds nothing, so every image passes through uncropped.
#[derive(Clone, Default)]
pub struct DetectorTier {
    loads: Arc<AtomicUsize>,
    detects: Arc<AtomicUsize>,
}

struct RecordingDetector(Arc<AtomicUsize>);

impl Detector for RecordingDetector {
    fn detect(&self, images: &[DynamicImage], _confidence: f32) -> Result<Vec<Vec<Detection>>> {
        self.0.fetch_add(1, Ordering::SeqCst);
        Ok(vec![Vec::new(); images.len()])
    }
}

impl DetectorTier {
    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    pub fn detects(&self) -> usize {
        self.detects.load(Ordering::SeqCst)
    }

    pub fn loader(&self) -> impl Fn() -> Result<SharedDetector> + Send + Sync + 'static {
        let (loads, detects) = (self.loads.clone(), self.detects.clone());
        move || {
            loads.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(RecordingDetector(detects.clone())) as SharedDetector)
        }
    }

    /// Loader that is counted and then fails, as when weights are missing.
    pub fn failing_loader(&self) -> impl Fn() -> Result<SharedDetector> + Send + Sync + 'static {
        let loads = self.loads.clone();
        move || {
            loads.fetch_add(1, Ordering::SeqCst);
            anyhow::bail!("weights not found")
        }
    }
}
