//! Tracked job model.
//!
//! A job is one dispatch to the external analysis engine, correlated with
//! queue items by `job_id`. The tracker enforces the lifecycle transition
//! table; this module defines the table itself.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// What initiated a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    FileChange,
    UserButton,
    AnalyzeAll,
    Scheduled,
    Retry,
    UserCorrection,
}

impl TriggerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FileChange => "file_change",
            Self::UserButton => "user_button",
            Self::AnalyzeAll => "analyze_all",
            Self::Scheduled => "scheduled",
            Self::Retry => "retry",
            Self::UserCorrection => "user_correction",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "file_change" => Some(Self::FileChange),
            "user_button" => Some(Self::UserButton),
            "analyze_all" => Some(Self::AnalyzeAll),
            "scheduled" => Some(Self::Scheduled),
            "retry" => Some(Self::Retry),
            "user_correction" => Some(Self::UserCorrection),
            _ => None,
        }
    }
}

/// Job lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Processing,
    Completed,
    Failed,
    Canceled,
    TimedOut,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
            Self::TimedOut => "timed_out",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(Self::Queued),
            "processing" => Some(Self::Processing),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "canceled" => Some(Self::Canceled),
            "timed_out" => Some(Self::TimedOut),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Canceled | Self::TimedOut
        )
    }

    /// Whether a normal update may move a job from `self` to `to`.
    ///
    /// Failed and TimedOut can re-enter Processing, but only through an
    /// explicit resume, which the tracker handles separately.
    pub fn can_transition(&self, to: JobStatus) -> bool {
        use JobStatus::*;
        match (self, to) {
            (Queued, Processing) | (Queued, Failed) | (Queued, Canceled) | (Queued, TimedOut) => {
                true
            }
            // Self-transition carries progress updates only.
            (Processing, Processing) => true,
            (Processing, Completed)
            | (Processing, Failed)
            | (Processing, Canceled)
            | (Processing, TimedOut) => true,
            _ => false,
        }
    }

    /// Whether an explicit resume may restart a job in this status.
    pub fn can_resume(&self) -> bool {
        matches!(self, Self::Failed | Self::TimedOut)
    }
}

/// Per-dispatch record surfaced through the status endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobInfo {
    pub job_id: String,
    pub deal_name: String,
    pub trigger_type: TriggerType,
    pub file_paths: Vec<PathBuf>,
    pub status: JobStatus,
    /// Completion fraction in [0, 1]. Monotone within a single run.
    pub progress: f64,
    pub current_step: String,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub errors: Vec<String>,
    /// Reference to the merged result payload, if completed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_ref: Option<serde_json::Value>,
    pub processed_documents: u32,
}

impl JobInfo {
    pub fn new(
        job_id: &str,
        deal_name: &str,
        trigger_type: TriggerType,
        file_paths: Vec<PathBuf>,
    ) -> Self {
        let now = Utc::now();
        Self {
            job_id: job_id.to_string(),
            deal_name: deal_name.to_string(),
            trigger_type,
            file_paths,
            status: JobStatus::Queued,
            progress: 0.0,
            current_step: String::new(),
            started_at: now,
            updated_at: now,
            completed_at: None,
            errors: Vec::new(),
            result_ref: None,
            processed_documents: 0,
        }
    }
}

/// Partial update applied through `JobTracker::update_job`.
#[derive(Debug, Clone, Default)]
pub struct JobUpdate {
    pub status: Option<JobStatus>,
    pub progress: Option<f64>,
    pub current_step: Option<String>,
    pub errors: Vec<String>,
    pub processed_documents: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trigger_type_roundtrip() {
        for t in [
            TriggerType::FileChange,
            TriggerType::UserButton,
            TriggerType::AnalyzeAll,
            TriggerType::Scheduled,
            TriggerType::Retry,
            TriggerType::UserCorrection,
        ] {
            assert_eq!(TriggerType::from_str(t.as_str()), Some(t));
        }
        assert_eq!(TriggerType::from_str("manual"), None);
    }

    #[test]
    fn test_transition_table_from_queued() {
        use JobStatus::*;
        assert!(Queued.can_transition(Processing));
        assert!(Queued.can_transition(Failed));
        assert!(Queued.can_transition(Canceled));
        assert!(Queued.can_transition(TimedOut));
        assert!(!Queued.can_transition(Completed));
        assert!(!Queued.can_transition(Queued));
    }

    #[test]
    fn test_transition_table_from_processing() {
        use JobStatus::*;
        assert!(Processing.can_transition(Processing));
        assert!(Processing.can_transition(Completed));
        assert!(Processing.can_transition(Failed));
        assert!(Processing.can_transition(Canceled));
        assert!(Processing.can_transition(TimedOut));
        assert!(!Processing.can_transition(Queued));
    }

    #[test]
    fn test_terminal_states_are_frozen() {
        use JobStatus::*;
        for from in [Completed, Canceled] {
            for to in [Queued, Processing, Completed, Failed, Canceled, TimedOut] {
                assert!(!from.can_transition(to), "{from:?} -> {to:?}");
            }
        }
        // Failed and TimedOut are frozen for normal updates too; resume is
        // the only way back.
        assert!(!Failed.can_transition(Processing));
        assert!(!TimedOut.can_transition(Processing));
        assert!(Failed.can_resume());
        assert!(TimedOut.can_resume());
        assert!(!Completed.can_resume());
    }

    #[test]
    fn test_timed_out_serializes_snake_case() {
        let json = serde_json::to_value(JobStatus::TimedOut).unwrap();
        assert_eq!(json, "timed_out");
    }

    #[test]
    fn test_new_job_defaults() {
        let job = JobInfo::new("j1", "D", TriggerType::UserButton, vec![]);
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.progress, 0.0);
        assert!(job.completed_at.is_none());
    }
}
