use std::env;
use std::path::PathBuf;

fn flag(name: &str, default: bool) -> bool {
    env::var(name)
        .map(|v| !matches!(v.as_str(), "0" | "false" | "FALSE"))
        .unwrap_or(default)
}

#[derive(Clone, Debug)]
pub struct Config {
    pub work_dir: PathBuf,
    pub models_dir: PathBuf,
    pub log_dir: PathBuf,
    pub preload: bool,
    pub preload_workers: usize,
    pub face_detector: bool,
    pub auto_download: bool,
}

impl Config {
    pub fn from_env() -> Self {
        let work_dir = env::var("REELSET_WORK").unwrap_or_else(|_| "/tmp/reelset-work".to_string());
        let models_dir = env::var("REELSET_MODELS").unwrap_or_else(|_| "models".to_string());
        let log_dir = env::var("REELSET_LOGS").unwrap_or_else(|_| "logs".to_string());
        let preload = flag("REELSET_PRELOAD", true);
        let preload_workers = env::var("REELSET_PRELOAD_WORKERS").ok().and_then(|v| v.parse().ok()).unwrap_or(3);
        let face_detector = flag("REELSET_FACE_DETECTOR", true);
        let auto_download = flag("REELSET_AUTO_DOWNLOAD", true);
        Self {
            work_dir: PathBuf::from(work_dir),
            models_dir: PathBuf::from(models_dir),
            log_dir: PathBuf::from(log_dir),
            preload,
            preload_workers,
            face_detector,
            auto_download,
        }
    }
}
