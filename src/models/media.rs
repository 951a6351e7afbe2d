use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use image::DynamicImage;
use serde::{Deserialize, Serialize};

/// An image file inside a stage directory. Items are never modified in
/// place; stages read them and write new files into their own directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaItem {
    pub path: PathBuf,
    pub name: String,
}

impl MediaItem {
    pub fn from_path(path: impl Into<PathBuf>) -> Option<Self> {
        let path = path.into();
        let name = path.file_name()?.to_str()?.to_string();
        Some(Self { path, name })
    }

    pub fn stem(&self) -> &str {
        self.path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or(&self.name)
    }

    pub fn load(&self) -> Result<DynamicImage> {
        image::open(&self.path).with_context(|| format!("Failed to open image: {:?}", self.path))
    }

    pub fn dimensions(&self) -> Result<(u32, u32)> {
        image::image_dimensions(&self.path)
            .with_context(|| format!("Failed to read dimensions: {:?}", self.path))
    }

    pub fn bytes(&self) -> Result<Vec<u8>> {
        std::fs::read(&self.path).with_context(|| format!("Failed to read {:?}", self.path))
    }

    /// Path of this item's counterpart inside `dir`, keeping the file name.
    pub fn target_in(&self, dir: &Path) -> PathBuf {
        dir.join(&self.name)
    }
}

/// Axis-aligned detection box in integer pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BBox {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl BBox {
    pub fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self { x, y, width, height }
    }

    /// Build a box from corner coordinates, truncating to whole pixels.
    pub fn from_corners(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        let (x1, y1, x2, y2) = (x1 as i32, y1 as i32, x2 as i32, y2 as i32);
        Self { x: x1, y: y1, width: x2 - x1, height: y2 - y1 }
    }

    pub fn area(&self) -> i64 {
        self.width.max(0) as i64 * self.height.max(0) as i64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub bbox: BBox,
    pub confidence: f32,
}

impl Detection {
    pub fn new(bbox: BBox, confidence: f32) -> Self {
        Self { bbox, confidence }
    }
}

/// Trigger token followed by the ordered tag list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caption(String);

impl Caption {
    pub const PLACEHOLDER_TAG: &'static str = "anime_style";

    pub fn from_tags(trigger: &str, tags: &[String]) -> Self {
        if tags.is_empty() {
            Self(trigger.to_string())
        } else {
            Self(format!("{}, {}", trigger, tags.join(", ")))
        }
    }

    pub fn placeholder(trigger: &str) -> Self {
        Self(format!("{}, {}", trigger, Self::PLACEHOLDER_TAG))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn file_name(stem: &str) -> String {
        format!("{}.txt", stem)
    }
}

impl fmt::Display for Caption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Category directory name derived from detected attributes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClassificationKey(String);

impl ClassificationKey {
    pub const UNCLASSIFIED: &'static str = "unclassified";

    pub fn unclassified() -> Self {
        Self(Self::UNCLASSIFIED.to_string())
    }

    pub fn from_parts(parts: &[&str]) -> Self {
        Self(parts.join("_"))
    }

    pub fn is_unclassified(&self) -> bool {
        self.0 == Self::UNCLASSIFIED
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClassificationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Group id assigned inside the `unclassified` bucket only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClusterLabel(pub usize);

impl ClusterLabel {
    pub fn dir_name(&self) -> String {
        format!("cluster_{:02}", self.0)
    }
}
