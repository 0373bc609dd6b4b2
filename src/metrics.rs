//! Run status and telemetry.
//!
//! [`PipelineStatus`] answers "where is the run now?", [`PipelineMetrics`]
//! answers "how did it go?". Both live for exactly one `execute()` call.

use crate::document::{ProcessingStatus, SourceDocument};
use crate::processor::ResultMetrics;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelinePhase {
    #[default]
    Initializing,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl PipelinePhase {
    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            PipelinePhase::Completed | PipelinePhase::Failed | PipelinePhase::Cancelled
        )
    }
}

/// Where the run currently stands.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineStatus {
    pub phase: PipelinePhase,
    pub current_stage: Option<String>,
    /// 0–100, never decreases during a run.
    pub progress: u8,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl PipelineStatus {
    /// Raise progress to `round(100 * processed / total)`; never lowers it.
    pub(crate) fn advance(&mut self, processed: usize, total: usize) -> u8 {
        let pct = progress_percent(processed, total);
        self.progress = self.progress.max(pct);
        self.progress
    }
}

pub fn progress_percent(processed: usize, total: usize) -> u8 {
    if total == 0 {
        return 100;
    }
    let pct = (100.0 * processed as f64 / total as f64).round();
    pct.clamp(0.0, 100.0) as u8
}

/// Counters and running averages for one run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineMetrics {
    pub total_stages: usize,
    pub stages_completed: usize,
    pub stages_failed: usize,
    pub stages_skipped: usize,
    pub total_documents: usize,
    pub documents_processed: usize,
    pub documents_failed: usize,
    pub total_errors: usize,
    pub total_warnings: usize,
    pub average_quality_score: f64,
    pub average_preservation_score: f64,
    pub processing_time_ms: u64,
}

impl PipelineMetrics {
    /// Fold one successful stage into the running averages and count it.
    ///
    /// `n` is the number of stages completed before this one, so the update is
    /// `new = (old * n + value) / (n + 1)`.
    pub(crate) fn record_success(&mut self, metrics: &ResultMetrics) {
        let n = self.stages_completed as f64;
        self.average_quality_score =
            (self.average_quality_score * n + metrics.quality_score) / (n + 1.0);
        self.average_preservation_score =
            (self.average_preservation_score * n + metrics.content_preserved) / (n + 1.0);
        self.stages_completed += 1;
    }

    /// Fill end-of-run figures.
    pub(crate) fn finalize(
        &mut self,
        started_at: DateTime<Utc>,
        ended_at: DateTime<Utc>,
        documents: &[SourceDocument],
        total_errors: usize,
    ) {
        self.processing_time_ms = (ended_at - started_at).num_milliseconds().max(0) as u64;
        self.total_documents = documents.len();
        self.documents_processed = documents
            .iter()
            .filter(|d| d.status == ProcessingStatus::Completed)
            .count();
        self.documents_failed = documents
            .iter()
            .filter(|d| d.status == ProcessingStatus::Failed)
            .count();
        self.total_errors = total_errors;
    }
}
