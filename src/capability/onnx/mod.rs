//! ONNX Runtime backed capabilities and the on-disk model store.
//!
//! Layout under the models directory:
//! `detector/*.onnx`, `upscaler/*.onnx`, `embedder/*.onnx`,
//! `tagger/model.onnx` + `tagger/selected_tags.csv`, and the face detector
//! `scrfd_500m_bnkps.onnx` at the top level.

mod detect;
mod image_models;
mod tagger;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use image::{imageops::FilterType, DynamicImage, Rgb, RgbImage};
use ort::session::Session;
use ort::value::Value;
use parking_lot::Mutex;
use tracing::{info, warn};

pub use detect::{nms, RawBox, ScrfdDetector, YoloDetector};
pub use image_models::{native_scale_from_name, OnnxEmbedder, OnnxUpscaler};
pub use tagger::{parse_tag_csv, Wd14Tagger};

use super::registry::{CapabilityRegistry, Provider};
use super::{SharedDetector, SharedEmbedder, SharedTagger, SharedUpscaler};
use crate::utils::config::Config;

pub const SCRFD_FILE: &str = "scrfd_500m_bnkps.onnx";
const SCRFD_MODEL_URL_HF: &str =
    "https://huggingface.co/ykk648/face_lib/resolve/main/face_detect/scrfd_onnx/scrfd_500m_bnkps.onnx";
const SCRFD_MODEL_URL_GH: &str = "https://github.com/deepinsight/insightface/releases/download/v0.7/scrfd_500m_bnkps.onnx";

pub const TAGGER_DIR: &str = "tagger";
pub const TAGGER_MODEL_FILE: &str = "model.onnx";
pub const TAGGER_TAGS_FILE: &str = "selected_tags.csv";
const TAGGER_REPO_URL: &str = "https://huggingface.co/SmilingWolf/wd-swinv2-tagger-v3/resolve/main";

/// Smallest file accepted as a downloaded model.
const MIN_MODEL_BYTES: usize = 1024;

/// One loaded ONNX session. Inference is serialized per model.
pub(crate) struct OnnxModel {
    session: Mutex<Session>,
    input_name: String,
    path: PathBuf,
}

/// Output tensor copied out of a session run.
pub(crate) struct Tensor {
    pub name: String,
    pub shape: Vec<i64>,
    pub data: Vec<f32>,
}

impl OnnxModel {
    pub(crate) fn open(path: &Path) -> Result<Self> {
        let session = Session::builder()?
            .commit_from_file(path)
            .with_context(|| format!("Failed to create session for {:?}", path))?;
        let input_name = session
            .inputs
            .first()
            .map(|i| i.name.clone())
            .with_context(|| format!("{:?} declares no inputs", path))?;
        info!("Loaded model {:?} (input {})", path, input_name);
        Ok(Self { session: Mutex::new(session), input_name, path: path.to_path_buf() })
    }

    pub(crate) fn run(&self, shape: Vec<i64>, data: Vec<f32>) -> Result<Vec<Tensor>> {
        let mut session = self.session.lock();
        let input = Value::from_array((shape, data)).context("Failed to create input tensor")?;
        let outputs = session
            .run(ort::inputs![self.input_name.clone() => input])
            .with_context(|| format!("Inference failed for {:?}", self.path))?;
        let mut tensors = Vec::new();
        for (name, value) in outputs.iter() {
            let (shape, data) = value
                .try_extract_tensor::<f32>()
                .with_context(|| format!("Output {} is not a float tensor", name))?;
            tensors.push(Tensor { name: name.to_string(), shape: shape.to_vec(), data: data.to_vec() });
        }
        Ok(tensors)
    }

    pub(crate) fn run_first(&self, shape: Vec<i64>, data: Vec<f32>) -> Result<Tensor> {
        self.run(shape, data)?
            .into_iter()
            .next()
            .with_context(|| format!("{:?} produced no outputs", self.path))
    }
}

/// Planar float tensor data (CHW) from an RGB image, one value per channel
/// per pixel, transformed by `f(channel, value)`.
pub(crate) fn planar(rgb: &RgbImage, f: impl Fn(usize, u8) -> f32) -> Vec<f32> {
    let (w, h) = rgb.dimensions();
    let mut data = Vec::with_capacity(3 * (w * h) as usize);
    for c in 0..3 {
        for y in 0..h {
            for x in 0..w {
                data.push(f(c, rgb.get_pixel(x, y)[c]));
            }
        }
    }
    data
}

/// Resize to fit a `side` x `side` square, anchored top-left, padding with
/// `fill`. Returns the canvas and the applied scale.
pub(crate) fn letterbox(img: &DynamicImage, side: u32, fill: [u8; 3]) -> (RgbImage, f32) {
    let (w, h) = (img.width().max(1) as f32, img.height().max(1) as f32);
    let scale = side as f32 / w.max(h);
    let nw = ((w * scale) as u32).clamp(1, side);
    let nh = ((h * scale) as u32).clamp(1, side);
    let resized = img.resize_exact(nw, nh, FilterType::Triangle).to_rgb8();
    let mut canvas = RgbImage::from_pixel(side, side, Rgb(fill));
    image::imageops::overlay(&mut canvas, &resized, 0, 0);
    (canvas, scale)
}

fn http_client() -> Result<reqwest::blocking::Client> {
    let mut headers = reqwest::header::HeaderMap::new();
    if let Ok(token) = std::env::var("HF_TOKEN") {
        if !token.is_empty() {
            info!("Using Hugging Face token for model download.");
            headers.insert(
                reqwest::header::AUTHORIZATION,
                reqwest::header::HeaderValue::from_str(&format!("Bearer {}", token))?,
            );
        }
    }
    reqwest::blocking::Client::builder()
        .default_headers(headers)
        .build()
        .context("Failed to create HTTP client")
}

/// Download `url` to `path`, verifying the written size. The file is staged
/// next to the target and renamed into place once complete.
fn download_file(client: &reqwest::blocking::Client, url: &str, path: &Path) -> Result<()> {
    let response = client.get(url).send().with_context(|| format!("Failed to download model from {}", url))?;
    if !response.status().is_success() {
        anyhow::bail!("Failed to download model: HTTP {}", response.status());
    }
    let bytes = response.bytes().context("Failed to read response body")?;
    if bytes.len() < MIN_MODEL_BYTES {
        anyhow::bail!("Downloaded file is suspiciously small ({} bytes), may be corrupted", bytes.len());
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).with_context(|| format!("Failed to create {:?}", parent))?;
    }
    let staged = path.with_extension("part");
    std::fs::write(&staged, &bytes).with_context(|| format!("Failed to write file: {:?}", staged))?;
    let written = std::fs::metadata(&staged)
        .with_context(|| format!("Failed to read metadata for downloaded file: {:?}", staged))?
        .len();
    if written != bytes.len() as u64 {
        anyhow::bail!("File integrity check failed: expected {} bytes, got {} bytes", bytes.len(), written);
    }
    std::fs::rename(&staged, path).with_context(|| format!("Failed to move {:?} into place", staged))?;
    info!("Downloaded model to {:?} ({} bytes, verified)", path, bytes.len());
    Ok(())
}

/// Make sure `path` exists, fetching it from the first working mirror when
/// allowed.
fn ensure_file(path: &Path, mirrors: &[String], auto_download: bool) -> Result<()> {
    if path.is_file() {
        return Ok(());
    }
    if !auto_download {
        anyhow::bail!("{:?} missing and auto-download is disabled", path);
    }
    let client = http_client()?;
    let mut last_err = None;
    for url in mirrors {
        match download_file(&client, url, path) {
            Ok(()) => return Ok(()),
            Err(e) => {
                warn!("Download from {} failed: {:#}", url, e);
                last_err = Some(e);
            }
        }
    }
    Err(last_err.unwrap_or_else(|| anyhow::anyhow!("no download source for {:?}", path)))
}

/// `*.onnx` files directly inside `dir`, sorted by name.
fn onnx_files(dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut files: Vec<PathBuf> = entries
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| p.is_file() && crate::utils::fs::has_extension(p, &["onnx"]))
        .collect();
    files.sort();
    files
}

fn provider_name(prefix: &str, path: &Path) -> String {
    let file = path.file_name().map(|f| f.to_string_lossy().into_owned()).unwrap_or_default();
    format!("{}:{}", prefix, file)
}

/// Register every ONNX provider that can be derived from `cfg`. Loading is
/// deferred to the preloader; nothing is opened or downloaded here.
pub fn register_providers(registry: &mut CapabilityRegistry, cfg: &Config) {
    let models = cfg.models_dir.clone();

    for path in onnx_files(&models.join("detector")) {
        let name = provider_name("yolo", &path);
        registry.detectors.push(Provider::new(name, move || {
            Ok(Arc::new(YoloDetector::open(&path)?) as SharedDetector)
        }));
    }

    if cfg.face_detector {
        let path = models.join(SCRFD_FILE);
        let auto = cfg.auto_download;
        registry.face_detectors.push(Provider::new("scrfd", move || {
            ensure_file(&path, &[SCRFD_MODEL_URL_HF.to_string(), SCRFD_MODEL_URL_GH.to_string()], auto)?;
            Ok(Arc::new(ScrfdDetector::open(&path)?) as SharedDetector)
        }));
    }

    for path in onnx_files(&models.join("upscaler")) {
        let name = provider_name("upscaler", &path);
        registry.upscalers.push(Provider::new(name, move || {
            Ok(Arc::new(OnnxUpscaler::open(&path)?) as SharedUpscaler)
        }));
    }

    for path in onnx_files(&models.join("embedder")) {
        let name = provider_name("embedder", &path);
        registry.embedders.push(Provider::new(name, move || {
            Ok(Arc::new(OnnxEmbedder::open(&path)?) as SharedEmbedder)
        }));
    }

    let tagger_dir = models.join(TAGGER_DIR);
    let auto = cfg.auto_download;
    registry.taggers.push(Provider::new("wd14", move || {
        let model = tagger_dir.join(TAGGER_MODEL_FILE);
        let tags = tagger_dir.join(TAGGER_TAGS_FILE);
        ensure_file(&model, &[format!("{}/{}", TAGGER_REPO_URL, TAGGER_MODEL_FILE)], auto)?;
        ensure_file(&tags, &[format!("{}/{}", TAGGER_REPO_URL, TAGGER_TAGS_FILE)], auto)?;
        Ok(Arc::new(Wd14Tagger::open(&model, &tags)?) as SharedTagger)
    }));
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn letterbox_keeps_aspect_and_pads() {
        let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(200, 100, Rgb([255, 0, 0])));
        let (canvas, scale) = letterbox(&img, 64, [0, 0, 0]);
        assert_eq!(canvas.dimensions(), (64, 64));
        assert!((scale - 0.32).abs() < 1e-6);
        assert_eq!(canvas.get_pixel(10, 10), &Rgb([255, 0, 0]));
        assert_eq!(canvas.get_pixel(10, 50), &Rgb([0, 0, 0]));
    }

    #[test]
    fn planar_orders_channels_first() {
        let mut rgb = RgbImage::new(2, 1);
        rgb.put_pixel(0, 0, Rgb([1, 2, 3]));
        rgb.put_pixel(1, 0, Rgb([4, 5, 6]));
        let data = planar(&rgb, |_, v| v as f32);
        assert_eq!(data, vec![1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);
    }

    #[test]
    fn discovery_registers_files_without_loading() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir_all(tmp.path().join("detector")).unwrap();
        std::fs::write(tmp.path().join("detector/b.onnx"), b"x").unwrap();
        std::fs::write(tmp.path().join("detector/a.onnx"), b"x").unwrap();
        std::fs::write(tmp.path().join("detector/notes.txt"), b"x").unwrap();
        let cfg = Config {
            work_dir: tmp.path().join("work"),
            models_dir: tmp.path().to_path_buf(),
            log_dir: tmp.path().join("logs"),
            preload: true,
            preload_workers: 1,
            face_detector: false,
            auto_download: false,
        };
        let mut registry = CapabilityRegistry::new();
        register_providers(&mut registry, &cfg);
        let names: Vec<&str> = registry.detectors.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["yolo:a.onnx", "yolo:b.onnx"]);
        assert!(registry.face_detectors.is_empty());
        assert_eq!(registry.taggers.len(), 1);
        assert!(registry.upscalers.is_empty());
    }

    #[test]
    fn missing_file_without_download_fails() {
        let tmp = TempDir::new().unwrap();
        let err = ensure_file(&tmp.path().join("m.onnx"), &[], false).unwrap_err();
        assert!(err.to_string().contains("auto-download is disabled"));
    }
}
