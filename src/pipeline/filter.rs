use std::path::Path;

use anyhow::{Context, Result};
use tracing::warn;

use super::{StageKind, StageOutcome};
use crate::utils::fs;
use crate::utils::logging::RunLog;

/// Flatten every PNG below `input` into `output`, keyed by file name.
/// When two files share a name the one visited later wins.
pub fn run(input: &Path, output: &Path, log: &RunLog) -> Result<StageOutcome> {
    std::fs::create_dir_all(output).with_context(|| format!("Failed to create {:?}", output))?;
    let items = fs::list_pngs_recursive(input)?;
    let total = items.len();
    for (idx, item) in items.iter().enumerate() {
        let dst = item.target_in(output);
        if dst.exists() {
            warn!("{} appears more than once; keeping {:?}", item.name, item.path);
        }
        std::fs::copy(&item.path, &dst).with_context(|| format!("Failed to copy {:?}", item.path))?;
        log.progress(StageKind::Filtering.label(), idx + 1, total);
    }
    let written = fs::list_pngs(output)?.len();
    Ok(StageOutcome::new(total, written))
}
