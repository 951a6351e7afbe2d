use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::PipelineError;
use crate::utils::exec::exec_capture;

pub const FRAME_PATTERN: &str = "frame_%04d.png";

/// Locate the ffmpeg binary on PATH.
pub fn ensure_available() -> Result<PathBuf, PipelineError> {
    which::which("ffmpeg")
        .map_err(|_| PipelineError::ExternalTool("ffmpeg is not installed or not in PATH".to_string()))
}

pub fn frame_extraction_args(video: &Path, out_dir: &Path, fps: u32) -> Vec<String> {
    vec![
        "-hide_banner".to_string(),
        "-loglevel".to_string(),
        "error".to_string(),
        "-i".to_string(),
        video.to_string_lossy().to_string(),
        "-vf".to_string(),
        format!("fps={}", fps),
        out_dir.join(FRAME_PATTERN).to_string_lossy().to_string(),
    ]
}

/// Decode `video` into numbered PNG frames inside `out_dir`.
pub async fn extract_frames(video: &Path, out_dir: &Path, fps: u32) -> Result<(), PipelineError> {
    let bin = ensure_available()?;
    let args = frame_extraction_args(video, out_dir, fps);
    debug!("running {:?} {:?}", bin, args);
    let out = exec_capture(&bin, &args)
        .await
        .map_err(|e| PipelineError::ExternalTool(format!("failed to launch ffmpeg: {}", e)))?;
    if !out.success() {
        return Err(PipelineError::ExternalTool(format!(
            "ffmpeg exited with code {}: {}",
            out.code,
            out.stderr_tail(5)
        )));
    }
    Ok(())
}
