use std::path::Path;

use anyhow::Result;
use image::DynamicImage;
use tracing::{debug, warn};

use super::{letterbox, planar, OnnxModel, Tensor};
use crate::capability::Detector;
use crate::models::{BBox, Detection};

const YOLO_INPUT: u32 = 640;
const YOLO_IOU: f32 = 0.7;
const SCRFD_INPUT: u32 = 640;
const SCRFD_IOU: f32 = 0.4;
const SCRFD_STRIDES: [u32; 3] = [8, 16, 32];
const MIN_FACE_PX: f32 = 8.0;

/// Candidate box in image coordinates, before suppression.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
    pub confidence: f32,
}

impl RawBox {
    fn clamped(self, w: f32, h: f32) -> Self {
        Self {
            x1: self.x1.clamp(0.0, w),
            y1: self.y1.clamp(0.0, h),
            x2: self.x2.clamp(0.0, w),
            y2: self.y2.clamp(0.0, h),
            confidence: self.confidence,
        }
    }

    fn into_detection(self) -> Detection {
        Detection::new(BBox::from_corners(self.x1, self.y1, self.x2, self.y2), self.confidence)
    }
}

fn iou(a: &RawBox, b: &RawBox) -> f32 {
    let x1 = a.x1.max(b.x1);
    let y1 = a.y1.max(b.y1);
    let x2 = a.x2.min(b.x2);
    let y2 = a.y2.min(b.y2);
    if x2 <= x1 || y2 <= y1 {
        return 0.0;
    }
    let intersection = (x2 - x1) * (y2 - y1);
    let union = (a.x2 - a.x1) * (a.y2 - a.y1) + (b.x2 - b.x1) * (b.y2 - b.y1) - intersection;
    if union <= 0.0 {
        return 0.0;
    }
    intersection / union
}

/// Greedy non-maximum suppression. Returns kept indices, best first.
pub fn nms(boxes: &[RawBox], iou_threshold: f32) -> Vec<usize> {
    let mut order: Vec<usize> = (0..boxes.len()).collect();
    order.sort_by(|&a, &b| {
        boxes[b].confidence.partial_cmp(&boxes[a].confidence).unwrap_or(std::cmp::Ordering::Equal)
    });
    let mut suppressed = vec![false; boxes.len()];
    let mut keep = Vec::new();
    for (i, &ia) in order.iter().enumerate() {
        if suppressed[ia] {
            continue;
        }
        keep.push(ia);
        for &ib in &order[i + 1..] {
            if !suppressed[ib] && iou(&boxes[ia], &boxes[ib]) > iou_threshold {
                suppressed[ib] = true;
            }
        }
    }
    keep
}

fn suppress(raw: Vec<RawBox>, iou_threshold: f32) -> Vec<Detection> {
    nms(&raw, iou_threshold).into_iter().map(|i| raw[i].into_detection()).collect()
}

/// Decode one image of a YOLOv8-style output `[batch, 4 + classes, anchors]`
/// (rows cx, cy, w, h, then class scores) back to original image space.
pub fn decode_yolo(
    shape: &[i64],
    data: &[f32],
    batch_index: usize,
    confidence: f32,
    scale: f32,
    img_w: f32,
    img_h: f32,
) -> Vec<RawBox> {
    let [_, rows, anchors] = match shape {
        [b, r, a] => [*b as usize, *r as usize, *a as usize],
        _ => return Vec::new(),
    };
    if rows < 5 {
        return Vec::new();
    }
    let base = batch_index * rows * anchors;
    let Some(plane) = data.get(base..base + rows * anchors) else {
        return Vec::new();
    };
    let at = |r: usize, j: usize| plane[r * anchors + j];
    let mut out = Vec::new();
    for j in 0..anchors {
        let score = (4..rows).map(|r| at(r, j)).fold(f32::NEG_INFINITY, f32::max);
        if score < confidence {
            continue;
        }
        let (cx, cy, w, h) = (at(0, j), at(1, j), at(2, j), at(3, j));
        let b = RawBox {
            x1: (cx - w / 2.0) / scale,
            y1: (cy - h / 2.0) / scale,
            x2: (cx + w / 2.0) / scale,
            y2: (cy + h / 2.0) / scale,
            confidence: score,
        }
        .clamped(img_w, img_h);
        if b.x2 > b.x1 && b.y2 > b.y1 {
            out.push(b);
        }
    }
    out
}

/// YOLO-style object detector exported to ONNX with a dynamic batch axis.
pub struct YoloDetector {
    model: OnnxModel,
}

impl YoloDetector {
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self { model: OnnxModel::open(path)? })
    }

    fn infer(&self, images: &[DynamicImage]) -> Result<(Tensor, Vec<f32>)> {
        let side = YOLO_INPUT as i64;
        let mut data = Vec::with_capacity(images.len() * 3 * (side * side) as usize);
        let mut scales = Vec::with_capacity(images.len());
        for img in images {
            let (canvas, scale) = letterbox(img, YOLO_INPUT, [114, 114, 114]);
            data.extend(planar(&canvas, |_, v| v as f32 / 255.0));
            scales.push(scale);
        }
        let tensor = self.model.run_first(vec![images.len() as i64, 3, side, side], data)?;
        Ok((tensor, scales))
    }

    fn decode(&self, images: &[DynamicImage], confidence: f32) -> Result<Vec<Vec<Detection>>> {
        let (tensor, scales) = self.infer(images)?;
        Ok(images
            .iter()
            .zip(&scales)
            .enumerate()
            .map(|(i, (img, &scale))| {
                let raw =
                    decode_yolo(&tensor.shape, &tensor.data, i, confidence, scale, img.width() as f32, img.height() as f32);
                suppress(raw, YOLO_IOU)
            })
            .collect())
    }
}

impl Detector for YoloDetector {
    fn detect(&self, images: &[DynamicImage], confidence: f32) -> Result<Vec<Vec<Detection>>> {
        if images.is_empty() {
            return Ok(Vec::new());
        }
        match self.decode(images, confidence) {
            Ok(dets) => Ok(dets),
            Err(e) if images.len() > 1 => {
                // Models exported with a fixed batch of one reject larger batches.
                warn!("batched detection failed ({:#}); retrying one image at a time", e);
                let mut out = Vec::with_capacity(images.len());
                for img in images {
                    out.extend(self.decode(std::slice::from_ref(img), confidence)?);
                }
                Ok(out)
            }
            Err(e) => Err(e),
        }
    }
}

/// Decode one SCRFD stride: per grid point `anchors` scores and
/// `(left, top, right, bottom)` distances in stride units, in 640 space.
pub fn decode_scrfd_stride(
    scores: &[f32],
    boxes: &[f32],
    stride: u32,
    confidence: f32,
    scale: f32,
    img_w: f32,
    img_h: f32,
) -> Vec<RawBox> {
    let side = (SCRFD_INPUT / stride) as usize;
    let points = side * side;
    if points == 0 || scores.len() % points != 0 || boxes.len() < scores.len() * 4 {
        warn!("SCRFD stride {}: unexpected output sizes ({} scores, {} boxes)", stride, scores.len(), boxes.len());
        return Vec::new();
    }
    let anchors = scores.len() / points;
    let s = stride as f32;
    let mut out = Vec::new();
    for i in 0..points {
        let cy = (i / side) as f32 * s;
        let cx = (i % side) as f32 * s;
        for a in 0..anchors {
            let idx = i * anchors + a;
            let conf = scores[idx];
            if conf < confidence {
                continue;
            }
            let d = &boxes[idx * 4..idx * 4 + 4];
            let b = RawBox {
                x1: (cx - d[0] * s) / scale,
                y1: (cy - d[1] * s) / scale,
                x2: (cx + d[2] * s) / scale,
                y2: (cy + d[3] * s) / scale,
                confidence: conf,
            }
            .clamped(img_w, img_h);
            if b.x2 - b.x1 >= MIN_FACE_PX && b.y2 - b.y1 >= MIN_FACE_PX {
                out.push(b);
            }
        }
    }
    out
}

/// SCRFD face detector (InsightFace `scrfd_500m_bnkps`).
pub struct ScrfdDetector {
    model: OnnxModel,
}

impl ScrfdDetector {
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self { model: OnnxModel::open(path)? })
    }

    fn detect_one(&self, img: &DynamicImage, confidence: f32) -> Result<Vec<Detection>> {
        let (canvas, scale) = letterbox(img, SCRFD_INPUT, [0, 0, 0]);
        // InsightFace models expect BGR normalized to [-1, 1].
        let plane = (SCRFD_INPUT * SCRFD_INPUT) as usize;
        let mut data = vec![0.0f32; 3 * plane];
        for (i, p) in canvas.pixels().enumerate() {
            for c in 0..3 {
                data[c * plane + i] = (p[2 - c] as f32 - 127.5) / 128.0;
            }
        }
        let side = SCRFD_INPUT as i64;
        let outputs = self.model.run(vec![1, 3, side, side], data)?;
        let find = |name: String| outputs.iter().find(|t| t.name == name);
        let (w, h) = (img.width() as f32, img.height() as f32);

        let mut raw = Vec::new();
        for stride in SCRFD_STRIDES {
            let (Some(scores), Some(boxes)) = (find(format!("score_{}", stride)), find(format!("bbox_{}", stride)))
            else {
                continue;
            };
            raw.extend(decode_scrfd_stride(&scores.data, &boxes.data, stride, confidence, scale, w, h));
        }
        if raw.is_empty() && outputs.len() >= 6 {
            // Exports without named outputs list scores for strides 8/16/32
            // first, then the boxes.
            for (k, stride) in SCRFD_STRIDES.iter().enumerate() {
                raw.extend(decode_scrfd_stride(&outputs[k].data, &outputs[k + 3].data, *stride, confidence, scale, w, h));
            }
        }
        debug!("SCRFD: {} candidates above {:.2}", raw.len(), confidence);
        Ok(suppress(raw, SCRFD_IOU))
    }
}

impl Detector for ScrfdDetector {
    fn detect(&self, images: &[DynamicImage], confidence: f32) -> Result<Vec<Vec<Detection>>> {
        images.iter().map(|img| self.detect_one(img, confidence)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rb(x1: f32, y1: f32, x2: f32, y2: f32, confidence: f32) -> RawBox {
        RawBox { x1, y1, x2, y2, confidence }
    }

    #[test]
    fn nms_drops_overlapping_weaker_boxes() {
        let boxes = [rb(0.0, 0.0, 10.0, 10.0, 0.6), rb(1.0, 1.0, 10.0, 10.0, 0.9), rb(50.0, 50.0, 60.0, 60.0, 0.5)];
        assert_eq!(nms(&boxes, 0.4), vec![1, 2]);
    }

    #[test]
    fn yolo_rows_decode_to_image_space() {
        // One image, 4 box rows + 1 class, 2 anchors.
        let shape = [1i64, 5, 2];
        let data = [
            100.0, 10.0, // cx
            100.0, 10.0, // cy
            40.0, 4.0, // w
            20.0, 4.0, // h
            0.9, 0.1, // class score
        ];
        let boxes = decode_yolo(&shape, &data, 0, 0.5, 0.5, 1000.0, 1000.0);
        assert_eq!(boxes, vec![rb(160.0, 180.0, 240.0, 220.0, 0.9)]);
    }

    #[test]
    fn yolo_out_of_range_batch_is_empty() {
        let shape = [1i64, 5, 1];
        assert!(decode_yolo(&shape, &[0.0; 5], 3, 0.1, 1.0, 10.0, 10.0).is_empty());
    }

    #[test]
    fn scrfd_stride_decoding() {
        // Stride 32 -> 20x20 grid, one anchor. Point 21 sits at (32, 32).
        let mut scores = vec![0.0f32; 400];
        let mut boxes = vec![0.0f32; 1600];
        scores[21] = 0.8;
        boxes[84..88].copy_from_slice(&[0.5, 0.5, 0.5, 0.5]);
        let raw = decode_scrfd_stride(&scores, &boxes, 32, 0.5, 1.0, 640.0, 640.0);
        assert_eq!(raw, vec![rb(16.0, 16.0, 48.0, 48.0, 0.8)]);
    }
}
