use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

pub fn init() {
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    let fmt = tracing_subscriber::fmt().with_env_filter(EnvFilter::new(filter)).with_ansi(false);
    fmt.init();
}

pub const LOG_FILE_NAME: &str = "process.log";

/// Process log for one pipeline: `<timestamp> - <LEVEL> - <message>` lines
/// appended to `<dir>/process.log`, each also emitted through `tracing`.
pub struct RunLog {
    dir: Option<PathBuf>,
    file: Mutex<Option<File>>,
}

impl RunLog {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).with_context(|| format!("Failed to create log directory {:?}", dir))?;
        let file = open_append(&dir.join(LOG_FILE_NAME))?;
        Ok(Self { dir: Some(dir), file: Mutex::new(Some(file)) })
    }

    /// Log through `tracing` only.
    pub fn disabled() -> Self {
        Self { dir: None, file: Mutex::new(None) }
    }

    pub fn path(&self) -> Option<PathBuf> {
        self.dir.as_ref().map(|d| d.join(LOG_FILE_NAME))
    }

    pub fn step(&self, msg: &str) {
        info!("{}", msg);
        self.write_line("INFO", msg);
    }

    pub fn progress(&self, prefix: &str, count: usize, total: usize) {
        let msg = format!("{} {}/{}", prefix, count, total);
        info!("{}", msg);
        self.write_line("INFO", &msg);
    }

    pub fn warn(&self, msg: &str) {
        warn!("{}", msg);
        self.write_line("WARNING", msg);
    }

    pub fn error(&self, msg: &str) {
        error!("{}", msg);
        self.write_line("ERROR", msg);
    }

    /// Rename the current file to `process-YYYYmmdd-HHMMSS-<job>.log` and
    /// continue in a fresh `process.log`.
    pub fn rotate(&self, job_name: &str) -> Result<Option<PathBuf>> {
        let Some(dir) = &self.dir else {
            return Ok(None);
        };
        let mut guard = self.file.lock();
        if let Some(f) = guard.as_mut() {
            f.flush().ok();
        }
        *guard = None;
        let current = dir.join(LOG_FILE_NAME);
        let stamp = chrono::Local::now().format("%Y%m%d-%H%M%S");
        let rotated = dir.join(format!("process-{}-{}.log", stamp, job_name));
        let moved = if current.exists() {
            std::fs::rename(&current, &rotated)
                .with_context(|| format!("Failed to rotate {:?} to {:?}", current, rotated))?;
            Some(rotated)
        } else {
            None
        };
        *guard = Some(open_append(&current)?);
        Ok(moved)
    }

    fn write_line(&self, level: &str, msg: &str) {
        let mut guard = self.file.lock();
        if let Some(f) = guard.as_mut() {
            let ts = chrono::Local::now().format("%Y-%m-%d %H:%M:%S,%3f");
            if let Err(e) = writeln!(f, "{} - {} - {}", ts, level, msg) {
                warn!("process log write failed: {}", e);
            }
        }
    }
}

fn open_append(path: &Path) -> Result<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open log file {:?}", path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn lines_carry_level_and_progress_format() {
        let tmp = TempDir::new().unwrap();
        let log = RunLog::open(tmp.path()).unwrap();
        log.step("Deduplication started");
        log.progress("Deduplication", 3, 10);
        log.warn("Tagger unavailable");
        let text = std::fs::read_to_string(tmp.path().join(LOG_FILE_NAME)).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].ends_with(" - INFO - Deduplication started"));
        assert!(lines[1].ends_with(" - INFO - Deduplication 3/10"));
        assert!(lines[2].ends_with(" - WARNING - Tagger unavailable"));
    }

    #[test]
    fn rotate_moves_file_and_starts_fresh() {
        let tmp = TempDir::new().unwrap();
        let log = RunLog::open(tmp.path()).unwrap();
        log.step("before");
        let rotated = log.rotate("job42").unwrap().unwrap();
        let name = rotated.file_name().unwrap().to_str().unwrap().to_string();
        assert!(name.starts_with("process-") && name.ends_with("-job42.log"));
        assert!(std::fs::read_to_string(&rotated).unwrap().contains("before"));
        log.step("after");
        let fresh = std::fs::read_to_string(tmp.path().join(LOG_FILE_NAME)).unwrap();
        assert!(fresh.contains("after"));
        assert!(!fresh.contains("before"));
    }

    #[test]
    fn disabled_log_does_not_touch_disk() {
        let log = RunLog::disabled();
        log.step("nothing");
        assert!(log.path().is_none());
        assert!(log.rotate("x").unwrap().is_none());
    }
}
