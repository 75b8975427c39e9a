//! Task types
//!
//! Pipeline kinds, task state machine, and poll snapshots.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// The chained pipeline a task runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PipelineKind {
    /// Search the source sites, then download the hits
    SearchDownload,
    /// Download one URL, then caption it
    DownloadAnalyze,
    /// Caption every stored image without a caption
    AnalyzeUnprocessed,
    /// Auto-select a device, load an instance if needed, then analyze
    SmartAnalyze,
    /// Search, download, then analyze the downloads
    FullPipeline,
}

impl fmt::Display for PipelineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PipelineKind::SearchDownload => "search-download",
            PipelineKind::DownloadAnalyze => "download-analyze",
            PipelineKind::AnalyzeUnprocessed => "analyze-unprocessed",
            PipelineKind::SmartAnalyze => "smart-analyze",
            PipelineKind::FullPipeline => "full-pipeline",
        };
        write!(f, "{}", name)
    }
}

/// Task lifecycle state. The three terminal states are absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Succeeded | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

/// Per-stage result accumulator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageCounts {
    pub succeeded: u64,
    pub failed: u64,
    pub skipped: u64,
    /// Most recent item-level error message for this stage
    pub last_error: Option<String>,
}

impl StageCounts {
    pub fn record_ok(&mut self) {
        self.succeeded += 1;
    }

    pub fn record_skip(&mut self) {
        self.skipped += 1;
    }

    pub fn record_err(&mut self, message: impl Into<String>) {
        self.failed += 1;
        self.last_error = Some(message.into());
    }

    /// Sum of two accumulators. `other`'s last error wins when present,
    /// since it is the more recent one.
    pub fn merged(&self, other: &StageCounts) -> StageCounts {
        StageCounts {
            succeeded: self.succeeded + other.succeeded,
            failed: self.failed + other.failed,
            skipped: self.skipped + other.skipped,
            last_error: other.last_error.clone().or_else(|| self.last_error.clone()),
        }
    }
}

/// Immutable copy of a task's state, returned by `poll`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub id: String,
    pub kind: PipelineKind,
    pub status: TaskStatus,
    /// Name of the current (or last executed) stage
    pub stage: String,
    /// Accumulated counts per executed stage, in execution order
    pub stages: Vec<(String, StageCounts)>,
    /// Most recent error text across all stages
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl TaskSnapshot {
    /// Counts for a named stage, if that stage has started
    pub fn counts_for(&self, stage: &str) -> Option<&StageCounts> {
        self.stages
            .iter()
            .find(|(name, _)| name == stage)
            .map(|(_, counts)| counts)
    }

    /// Item counts summed over all stages
    pub fn totals(&self) -> StageCounts {
        let mut total = StageCounts::default();
        for (_, counts) in &self.stages {
            total.succeeded += counts.succeeded;
            total.failed += counts.failed;
            total.skipped += counts.skipped;
        }
        total.last_error = self.last_error.clone();
        total
    }
}

/// A validated pipeline request, one variant per [`PipelineKind`].
///
/// `sources` maps a source site name to the number of result pages to pull.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TaskRequest {
    SearchDownload {
        query: String,
        sources: BTreeMap<String, u32>,
        limit: usize,
    },
    DownloadAnalyze {
        url: String,
        tags: Vec<String>,
        source: String,
        query: String,
    },
    AnalyzeUnprocessed {
        limit: usize,
        /// Filter by source site; empty means all sources
        sources: Vec<String>,
    },
    SmartAnalyze {
        /// Explicit image IDs; empty means all unprocessed
        ids: Vec<String>,
        limit: usize,
        /// Unload every instance once the batch completes
        auto_unload: bool,
    },
    FullPipeline {
        query: String,
        sources: BTreeMap<String, u32>,
        limit: usize,
        auto_unload: bool,
    },
}

impl TaskRequest {
    pub fn kind(&self) -> PipelineKind {
        match self {
            TaskRequest::SearchDownload { .. } => PipelineKind::SearchDownload,
            TaskRequest::DownloadAnalyze { .. } => PipelineKind::DownloadAnalyze,
            TaskRequest::AnalyzeUnprocessed { .. } => PipelineKind::AnalyzeUnprocessed,
            TaskRequest::SmartAnalyze { .. } => PipelineKind::SmartAnalyze,
            TaskRequest::FullPipeline { .. } => PipelineKind::FullPipeline,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(!TaskStatus::Queued.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
        assert!(TaskStatus::Succeeded.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
    }

    #[test]
    fn test_stage_counts() {
        let mut counts = StageCounts::default();
        counts.record_ok();
        counts.record_ok();
        counts.record_skip();
        counts.record_err("boom");
        assert_eq!(counts.succeeded, 2);
        assert_eq!(counts.skipped, 1);
        assert_eq!(counts.failed, 1);
        assert_eq!(counts.last_error.as_deref(), Some("boom"));
    }

    #[test]
    fn test_stage_counts_merged() {
        let mut seed = StageCounts::default();
        seed.record_err("missing id");
        let mut batch = StageCounts::default();
        batch.record_ok();
        batch.record_skip();

        let merged = seed.merged(&batch);
        assert_eq!(merged.succeeded, 1);
        assert_eq!(merged.failed, 1);
        assert_eq!(merged.skipped, 1);
        // The seed's error survives when the batch recorded none.
        assert_eq!(merged.last_error.as_deref(), Some("missing id"));

        let mut late = StageCounts::default();
        late.record_err("inference failed");
        assert_eq!(
            seed.merged(&late).last_error.as_deref(),
            Some("inference failed")
        );
    }

    #[test]
    fn test_kind_display() {
        assert_eq!(PipelineKind::SearchDownload.to_string(), "search-download");
        assert_eq!(PipelineKind::SmartAnalyze.to_string(), "smart-analyze");
    }

    #[test]
    fn test_snapshot_totals() {
        let mut search = StageCounts::default();
        search.record_ok();
        let mut download = StageCounts::default();
        download.record_ok();
        download.record_err("404");

        let snapshot = TaskSnapshot {
            id: "t".to_string(),
            kind: PipelineKind::SearchDownload,
            status: TaskStatus::Succeeded,
            stage: "download".to_string(),
            stages: vec![
                ("search".to_string(), search),
                ("download".to_string(), download),
            ],
            last_error: Some("404".to_string()),
            created_at: Utc::now(),
            finished_at: Some(Utc::now()),
        };

        let totals = snapshot.totals();
        assert_eq!(totals.succeeded, 2);
        assert_eq!(totals.failed, 1);
        assert_eq!(snapshot.counts_for("download").map(|c| c.failed), Some(1));
        assert!(snapshot.counts_for("analyze").is_none());
    }
}
