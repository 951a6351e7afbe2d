use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use image::DynamicImage;

use super::annotate::select_tags;
use super::{StageKind, StageOutcome};
use crate::capability::Tagger;
use crate::models::ClassificationKey;
use crate::utils::fs;
use crate::utils::logging::RunLog;

pub const PRIMARY_THRESHOLD: f32 = 0.20;
pub const RETRY_THRESHOLD: f32 = 0.15;

// Vocabularies are in priority order: the first entry found wins.
pub const HAIR_COLORS: &[&str] = &[
    "blonde hair", "black hair", "brown hair", "red hair", "blue hair", "green hair",
    "purple hair", "pink hair", "orange hair", "silver hair", "white hair", "gray hair",
    "aqua hair", "grey hair", "violet hair", "lavender hair", "teal hair", "auburn hair",
];

pub const EYE_COLORS: &[&str] = &[
    "blue eyes", "brown eyes", "red eyes", "green eyes", "purple eyes", "yellow eyes",
    "pink eyes", "aqua eyes", "orange eyes", "gray eyes", "grey eyes", "silver eyes",
    "gold eyes", "teal eyes", "violet eyes",
];

pub const HAIR_LENGTHS: &[&str] = &["long hair", "short hair", "twintails", "ponytail"];

pub const ACCESSORIES: &[&str] = &["glasses"];

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Attributes {
    pub hair: Option<String>,
    pub eyes: Option<String>,
    pub length: Option<String>,
    pub accessory: Option<String>,
}

fn detect_color(tag_str: &str, colors: &[&str], suffix: &str) -> Option<String> {
    colors
        .iter()
        .find(|c| tag_str.contains(*c))
        .map(|c| c.trim_end_matches(suffix).trim().to_string())
}

fn detect_feature(tag_str: &str, features: &[&str]) -> Option<String> {
    features.iter().find(|f| tag_str.contains(*f)).map(|f| f.replace(' ', "_"))
}

impl Attributes {
    /// Match the vocabularies against a comma-joined tag string.
    pub fn detect(tag_str: &str) -> Self {
        Self {
            hair: detect_color(tag_str, HAIR_COLORS, " hair"),
            eyes: detect_color(tag_str, EYE_COLORS, " eyes"),
            length: detect_feature(tag_str, HAIR_LENGTHS),
            accessory: detect_feature(tag_str, ACCESSORIES),
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.hair.is_some() && self.eyes.is_some()
    }

    /// `hair_eyes[_length][_accessory]`, or `unclassified`.
    pub fn key(&self) -> ClassificationKey {
        match (&self.hair, &self.eyes) {
            (Some(hair), Some(eyes)) => {
                let mut parts = vec![hair.as_str(), eyes.as_str()];
                if let Some(l) = &self.length {
                    parts.push(l);
                }
                if let Some(a) = &self.accessory {
                    parts.push(a);
                }
                ClassificationKey::from_parts(&parts)
            }
            _ => ClassificationKey::unclassified(),
        }
    }
}

/// Attributes from one tagging pass. Only a missing hair or eye colour
/// triggers the retry; the retry result then replaces every attribute.
pub fn classify_scores(scored: &[(String, f32)]) -> Attributes {
    let primary = select_tags(scored, PRIMARY_THRESHOLD, None, None).join(", ");
    let attrs = Attributes::detect(&primary);
    if attrs.is_resolved() {
        return attrs;
    }
    let relaxed = select_tags(scored, RETRY_THRESHOLD, None, None).join(", ");
    Attributes::detect(&relaxed)
}

pub fn classify_image(tagger: &dyn Tagger, img: &DynamicImage) -> Result<ClassificationKey> {
    Ok(classify_scores(&tagger.tag(img)?).key())
}

#[derive(Debug, Clone, Default)]
pub struct ClassifyReport {
    pub outcome: StageOutcome,
    /// Items per category directory.
    pub buckets: BTreeMap<String, usize>,
    /// Whether the tagger ran; clustering only applies when it did.
    pub tagged: bool,
}

impl ClassifyReport {
    pub fn unclassified(&self) -> usize {
        self.buckets.get(ClassificationKey::UNCLASSIFIED).copied().unwrap_or(0)
    }
}

pub fn unclassified_dir(output: &Path) -> PathBuf {
    output.join(ClassificationKey::UNCLASSIFIED)
}

/// Classification stage: copy each image into `output/<key>/`.
pub fn run(input: &Path, output: &Path, tagger: Option<&dyn Tagger>, log: &RunLog) -> Result<ClassifyReport> {
    std::fs::create_dir_all(output).with_context(|| format!("Failed to create {:?}", output))?;
    let items = fs::list_pngs(input)?;
    let total = items.len();
    let mut report = ClassifyReport { tagged: tagger.is_some(), ..Default::default() };
    for (idx, item) in items.iter().enumerate() {
        let key = match tagger {
            Some(t) => classify_image(t, &item.load()?)?,
            None => ClassificationKey::unclassified(),
        };
        let dir = output.join(key.as_str());
        std::fs::create_dir_all(&dir).with_context(|| format!("Failed to create {:?}", dir))?;
        let dst = item.target_in(&dir);
        std::fs::copy(&item.path, &dst).with_context(|| format!("Failed to copy {:?}", item.path))?;
        *report.buckets.entry(key.as_str().to_string()).or_default() += 1;
        log.progress(StageKind::Classification.label(), idx + 1, total);
    }
    report.outcome = StageOutcome::new(total, total);
    Ok(report)
}
