//! Per-execution reporting

use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::query::cursor::ColumnDesc;
use crate::uws::job::ExecutionProgression;

/// Immutable snapshot attached to a job at terminal phase
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionReport {
    /// Whether the pipeline ran to the end
    pub success: bool,

    /// Translated SQL, once translation succeeded
    pub sql: Option<String>,

    /// Result column descriptors
    pub columns: Vec<ColumnDesc>,

    /// Wall-clock milliseconds spent in each entered stage, in stage order
    pub stage_durations_ms: Vec<(ExecutionProgression, u64)>,

    /// Wall-clock milliseconds from pipeline start to finalization
    pub total_ms: u64,

    /// Rows handed to the formatter
    pub rows_written: u64,

    /// The row cap was exceeded (the overflow sentinel row came back)
    pub overflow: bool,

    /// Stage in progress when the pipeline faulted
    pub failed_stage: Option<ExecutionProgression>,
}

impl ExecutionReport {
    pub fn stage_ms(&self, stage: ExecutionProgression) -> Option<u64> {
        self.stage_durations_ms
            .iter()
            .find(|(s, _)| *s == stage)
            .map(|(_, ms)| *ms)
    }
}

/// Tracks which stage is running and for how long
pub struct StageTimer {
    started: Instant,
    current: Option<(ExecutionProgression, Instant)>,
    durations: Vec<(ExecutionProgression, u64)>,
}

impl StageTimer {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            current: None,
            durations: Vec::new(),
        }
    }

    /// Close the running stage and open the next one
    pub fn enter(&mut self, stage: ExecutionProgression) {
        self.close_current();
        self.current = Some((stage, Instant::now()));
    }

    /// The stage currently running, for fault attribution
    pub fn current_stage(&self) -> Option<ExecutionProgression> {
        self.current.map(|(stage, _)| stage)
    }

    fn close_current(&mut self) {
        if let Some((stage, since)) = self.current.take() {
            self.durations
                .push((stage, since.elapsed().as_millis() as u64));
        }
    }

    /// Close everything and report (per-stage durations, total)
    pub fn finish(mut self) -> (Vec<(ExecutionProgression, u64)>, u64) {
        self.close_current();
        (self.durations, self.started.elapsed().as_millis() as u64)
    }
}

impl Default for StageTimer {
    fn default() -> Self {
        Self::new()
    }
}
