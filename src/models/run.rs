//! Extraction run state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle of an extraction run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl RunStatus {
    /// True while the run holds the per-project extraction slot.
    pub fn is_active(self) -> bool {
        matches!(self, RunStatus::Pending | RunStatus::Running)
    }

    pub fn is_terminal(self) -> bool {
        !self.is_active()
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::Pending => write!(f, "pending"),
            RunStatus::Running => write!(f, "running"),
            RunStatus::Succeeded => write!(f, "succeeded"),
            RunStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Request to (re)build the searchable corpus of one project.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtractRequest {
    /// Falls back to the configured catalog project when absent.
    #[serde(default)]
    pub project_id: Option<String>,

    /// Re-embed every column instead of reusing unchanged vectors.
    #[serde(default)]
    pub force_refresh: bool,
}

/// One extraction invocation and its progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionRun {
    pub run_id: String,
    pub project_id: String,
    pub force_refresh: bool,
    pub status: RunStatus,
    /// Generation written by this run; same value as `run_id`.
    pub generation_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub datasets_processed: u64,
    pub tables_processed: u64,
    pub records_processed: u64,
    pub records_reused: u64,
    pub records_skipped: u64,
    /// Kept on their previous vector after their batch failed to embed.
    #[serde(default)]
    pub records_stale: u64,
    pub error: Option<String>,
}

impl ExtractionRun {
    pub fn new(project_id: impl Into<String>, force_refresh: bool) -> Self {
        let run_id = Uuid::new_v4().to_string();
        Self {
            generation_id: run_id.clone(),
            run_id,
            project_id: project_id.into(),
            force_refresh,
            status: RunStatus::Pending,
            started_at: Utc::now(),
            finished_at: None,
            datasets_processed: 0,
            tables_processed: 0,
            records_processed: 0,
            records_reused: 0,
            records_skipped: 0,
            records_stale: 0,
            error: None,
        }
    }

    pub fn mark_running(&mut self) {
        self.status = RunStatus::Running;
    }

    pub fn mark_succeeded(&mut self) {
        self.status = RunStatus::Succeeded;
        self.finished_at = Some(Utc::now());
        self.error = None;
    }

    pub fn mark_failed(&mut self, error: impl Into<String>) {
        self.status = RunStatus::Failed;
        self.finished_at = Some(Utc::now());
        self.error = Some(error.into());
    }

    pub fn duration_ms(&self) -> Option<i64> {
        self.finished_at
            .map(|end| (end - self.started_at).num_milliseconds())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_run_is_pending() {
        let run = ExtractionRun::new("acme", false);
        assert_eq!(run.status, RunStatus::Pending);
        assert_eq!(run.run_id, run.generation_id);
        assert!(run.status.is_active());
        assert!(run.finished_at.is_none());
    }

    #[test]
    fn test_terminal_transitions() {
        let mut run = ExtractionRun::new("acme", true);
        run.mark_running();
        assert_eq!(run.status, RunStatus::Running);
        run.mark_failed("boom");
        assert!(run.status.is_terminal());
        assert_eq!(run.error.as_deref(), Some("boom"));
        assert!(run.duration_ms().is_some());
    }

    #[test]
    fn test_status_serializes_lowercase() {
        let json = serde_json::to_string(&RunStatus::Succeeded).unwrap();
        assert_eq!(json, "\"succeeded\"");
    }
}
