use std::path::Path;

use anyhow::{Context, Result};

use super::{StageKind, StageOutcome};
use crate::capability::Tagger;
use crate::models::Caption;
use crate::utils::fs;
use crate::utils::logging::RunLog;

pub const CAPTION_THRESHOLD: f32 = 0.3;
pub const MAX_TAGS: usize = 30;
pub const MIN_TAGS: usize = 10;

/// Sort scored tags by descending score, keeping the tagger's order on ties.
pub fn rank(scored: &[(String, f32)]) -> Vec<(String, f32)> {
    let mut ranked = scored.to_vec();
    ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    ranked
}

/// Tags scoring strictly above `threshold`, capped at `max`. When fewer than
/// `min` qualify, the next best tags are appended regardless of score.
pub fn select_tags(scored: &[(String, f32)], threshold: f32, max: Option<usize>, min: Option<usize>) -> Vec<String> {
    let ranked = rank(scored);
    let mut selected: Vec<String> =
        ranked.iter().filter(|(_, s)| *s > threshold).map(|(t, _)| t.clone()).collect();
    if let Some(max) = max {
        selected.truncate(max);
    }
    if let Some(min) = min {
        if selected.len() < min {
            let missing = min - selected.len();
            let extra: Vec<String> = ranked
                .iter()
                .map(|(t, _)| t)
                .filter(|t| !selected.contains(*t))
                .take(missing)
                .cloned()
                .collect();
            selected.extend(extra);
        }
    }
    selected
}

pub fn caption_for(tagger: &dyn Tagger, img: &image::DynamicImage, trigger: &str) -> Result<Caption> {
    let scored = tagger.tag(img)?;
    let tags = select_tags(&scored, CAPTION_THRESHOLD, Some(MAX_TAGS), Some(MIN_TAGS));
    Ok(Caption::from_tags(trigger, &tags))
}

/// Annotation stage: one `<stem>.txt` per image in `captions_dir`. Without a
/// tagger every image gets the placeholder caption.
pub fn run(input: &Path, captions_dir: &Path, trigger: &str, tagger: Option<&dyn Tagger>, log: &RunLog) -> Result<StageOutcome> {
    std::fs::create_dir_all(captions_dir).with_context(|| format!("Failed to create {:?}", captions_dir))?;
    let items = fs::list_pngs(input)?;
    let total = items.len();
    for (idx, item) in items.iter().enumerate() {
        let caption = match tagger {
            Some(t) => caption_for(t, &item.load()?, trigger)?,
            None => Caption::placeholder(trigger),
        };
        let dst = captions_dir.join(Caption::file_name(item.stem()));
        std::fs::write(&dst, caption.as_str()).with_context(|| format!("Failed to write {:?}", dst))?;
        log.progress(StageKind::Annotation.label(), idx + 1, total);
    }
    Ok(StageOutcome::new(total, total))
}
