use std::time::{Duration, Instant};

use serde::Serialize;

use crate::pipeline::{StageKind, StageOutcome};

#[derive(Debug, Clone, Serialize)]
pub struct StageStats {
    pub stage: StageKind,
    pub skipped: bool,
    pub items_in: usize,
    pub items_out: usize,
    pub elapsed_ms: u64,
}

/// Per-run record of what each stage consumed and produced.
#[derive(Debug, Clone, Serialize)]
pub struct RunStats {
    pub stages: Vec<StageStats>,
    /// Groups created inside `unclassified`, when clustering ran.
    pub clusters: Option<usize>,
    pub elapsed_ms: u64,
    #[serde(skip)]
    started: Instant,
}

impl Default for RunStats {
    fn default() -> Self {
        Self::new()
    }
}

fn millis(d: Duration) -> u64 {
    d.as_millis().min(u64::MAX as u128) as u64
}

impl RunStats {
    pub fn new() -> Self {
        Self { stages: Vec::new(), clusters: None, elapsed_ms: 0, started: Instant::now() }
    }

    pub fn record(&mut self, stage: StageKind, outcome: StageOutcome, elapsed: Duration) {
        self.stages.push(StageStats {
            stage,
            skipped: false,
            items_in: outcome.items_in,
            items_out: outcome.items_out,
            elapsed_ms: millis(elapsed),
        });
    }

    pub fn record_skip(&mut self, stage: StageKind) {
        self.stages.push(StageStats { stage, skipped: true, items_in: 0, items_out: 0, elapsed_ms: 0 });
    }

    pub fn stage(&self, stage: StageKind) -> Option<&StageStats> {
        self.stages.iter().find(|s| s.stage == stage)
    }

    pub fn finish(&mut self) {
        self.elapsed_ms = millis(self.started.elapsed());
    }

    pub fn to_json_line(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| format!("{{\"error\":\"{}\"}}", e))
    }
}
