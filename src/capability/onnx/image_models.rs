use std::path::Path;

use anyhow::{Context, Result};
use image::{imageops::FilterType, DynamicImage, Rgb, RgbImage};
use tracing::warn;

use super::{planar, OnnxModel};
use crate::capability::{Embedder, Upscaler};

const DEFAULT_NATIVE_SCALE: u32 = 4;
const EMBED_INPUT: u32 = 224;
const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Native factor from names such as `RealESRGAN_x4plus_anime_6B.onnx` or
/// `realesr-animevideov3-x2.onnx`.
pub fn native_scale_from_name(name: &str) -> Option<u32> {
    let lower = name.to_ascii_lowercase();
    let bytes = lower.as_bytes();
    bytes.windows(2).find_map(|w| match (w[0], w[1]) {
        (b'x', d @ b'2'..=b'8') => Some((d - b'0') as u32),
        _ => None,
    })
}

/// Super-resolution network with NCHW RGB input and output in `[0, 1]`.
pub struct OnnxUpscaler {
    model: OnnxModel,
    scale: u32,
}

impl OnnxUpscaler {
    pub fn open(path: &Path) -> Result<Self> {
        let name = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
        let scale = native_scale_from_name(&name).unwrap_or_else(|| {
            warn!("no scale in model name {:?}; assuming x{}", name, DEFAULT_NATIVE_SCALE);
            DEFAULT_NATIVE_SCALE
        });
        Ok(Self { model: OnnxModel::open(path)?, scale })
    }
}

impl Upscaler for OnnxUpscaler {
    fn scale(&self) -> u32 {
        self.scale
    }

    fn enhance(&self, image: &DynamicImage) -> Result<DynamicImage> {
        let rgb = image.to_rgb8();
        let (w, h) = rgb.dimensions();
        let data = planar(&rgb, |_, v| v as f32 / 255.0);
        let out = self.model.run_first(vec![1, 3, h as i64, w as i64], data)?;
        let &[_, 3, oh, ow] = out.shape.as_slice() else {
            anyhow::bail!("unexpected upscaler output shape {:?}", out.shape);
        };
        let (ow, oh) = (ow as u32, oh as u32);
        let plane = (ow * oh) as usize;
        anyhow::ensure!(out.data.len() >= 3 * plane, "upscaler output too short");
        let to_u8 = |v: f32| (v.clamp(0.0, 1.0) * 255.0).round() as u8;
        let img = RgbImage::from_fn(ow, oh, |x, y| {
            let i = (y * ow + x) as usize;
            Rgb([to_u8(out.data[i]), to_u8(out.data[plane + i]), to_u8(out.data[2 * plane + i])])
        });
        Ok(DynamicImage::ImageRgb8(img))
    }
}

/// Image feature extractor; the output vector is L2-normalized.
pub struct OnnxEmbedder {
    model: OnnxModel,
}

impl OnnxEmbedder {
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self { model: OnnxModel::open(path)? })
    }
}

pub(crate) fn l2_normalize(mut v: Vec<f32>) -> Result<Vec<f32>> {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    anyhow::ensure!(norm > 0.0, "embedding has zero norm");
    for x in &mut v {
        *x /= norm;
    }
    Ok(v)
}

impl Embedder for OnnxEmbedder {
    fn embed(&self, image: &DynamicImage) -> Result<Vec<f32>> {
        let rgb = image.resize_exact(EMBED_INPUT, EMBED_INPUT, FilterType::Triangle).to_rgb8();
        let data = planar(&rgb, |c, v| (v as f32 / 255.0 - IMAGENET_MEAN[c]) / IMAGENET_STD[c]);
        let side = EMBED_INPUT as i64;
        let out = self.model.run_first(vec![1, 3, side, side], data)?;
        l2_normalize(out.data).context("embedder produced an unusable vector")
    }
}
