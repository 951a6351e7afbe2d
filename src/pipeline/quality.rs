//! Blur and darkness gate applied before upscaling.
//!
//! Sharpness is the variance of the 3x3 Laplacian response over the
//! grayscale image; brightness is the mean gray level. Both are measured on
//! the raw 0-255 scale. Borders are handled by reflecting around the edge
//! pixel (`dcb|abcd|cba`), and the gray conversion uses the ITU-R 601 integer
//! weights so scores line up with the usual Python tooling.

use image::{DynamicImage, GrayImage, Luma};
use ndarray::Array2;
use serde::Serialize;

/// ITU-R 601-2 luma with 16-bit fixed point rounding.
pub fn luma601(img: &DynamicImage) -> GrayImage {
    let rgb = img.to_rgb8();
    let (w, h) = rgb.dimensions();
    let mut out = GrayImage::new(w, h);
    for (x, y, p) in rgb.enumerate_pixels() {
        let [r, g, b] = p.0;
        let l = (r as u32 * 19595 + g as u32 * 38470 + b as u32 * 7471 + 0x8000) >> 16;
        out.put_pixel(x, y, Luma([l as u8]));
    }
    out
}

fn gray_array(gray: &GrayImage) -> Array2<f64> {
    let (w, h) = gray.dimensions();
    Array2::from_shape_fn((h as usize, w as usize), |(y, x)| gray.get_pixel(x as u32, y as u32)[0] as f64)
}

// Neighbour index one step outside the image, mirrored without repeating the edge.
fn reflect101(i: isize, n: usize) -> usize {
    let n = n as isize;
    if n == 1 {
        return 0;
    }
    let r = if i < 0 {
        -i
    } else if i >= n {
        2 * n - 2 - i
    } else {
        i
    };
    r as usize
}

/// Population variance of the Laplacian response.
pub fn laplacian_variance(gray: &GrayImage) -> f64 {
    let arr = gray_array(gray);
    let (h, w) = arr.dim();
    if h == 0 || w == 0 {
        return 0.0;
    }
    let mut lap = Array2::<f64>::zeros((h, w));
    for y in 0..h {
        let up = reflect101(y as isize - 1, h);
        let down = reflect101(y as isize + 1, h);
        for x in 0..w {
            let left = reflect101(x as isize - 1, w);
            let right = reflect101(x as isize + 1, w);
            lap[[y, x]] =
                arr[[up, x]] + arr[[down, x]] + arr[[y, left]] + arr[[y, right]] - 4.0 * arr[[y, x]];
        }
    }
    let n = lap.len() as f64;
    let mean = lap.sum() / n;
    lap.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / n
}

pub fn mean_brightness(gray: &GrayImage) -> f64 {
    let n = gray.len();
    if n == 0 {
        return 0.0;
    }
    gray.as_raw().iter().map(|&v| v as f64).sum::<f64>() / n as f64
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct QualityScore {
    pub sharpness: f64,
    pub brightness: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QualityGate {
    pub blur_threshold: f64,
    pub dark_threshold: f64,
}

impl QualityGate {
    pub fn new(blur_threshold: f64, dark_threshold: f64) -> Self {
        Self { blur_threshold, dark_threshold }
    }

    pub fn measure(img: &DynamicImage) -> QualityScore {
        let gray = luma601(img);
        QualityScore { sharpness: laplacian_variance(&gray), brightness: mean_brightness(&gray) }
    }

    pub fn accepts(&self, score: &QualityScore) -> bool {
        score.sharpness >= self.blur_threshold && score.brightness >= self.dark_threshold
    }

    pub fn is_acceptable(&self, img: &DynamicImage) -> bool {
        self.accepts(&Self::measure(img))
    }
}
