//! Job tracker.
//!
//! Authoritative status store for in-flight jobs. Every dispatch to the
//! analysis engine is tracked here by `job_id`; the webhook status endpoint
//! and the result consumer read and mutate jobs exclusively through this
//! type. Transitions follow a fixed table; anything else is rejected.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;

use crate::models::{JobInfo, JobStatus, JobUpdate, TriggerType};
use crate::persistence::{SnapshotStore, SnapshotError};

/// Snapshot file name under the state directory.
pub const JOBS_SNAPSHOT: &str = "jobs.json";

#[derive(Error, Debug)]
pub enum TrackerError {
    #[error("job not found: {0}")]
    NotFound(String),
    #[error("invalid transition for job {job_id}: {from:?} -> {to:?}")]
    InvalidTransition {
        job_id: String,
        from: JobStatus,
        to: JobStatus,
    },
    #[error("progress may not decrease for job {job_id}: {current} -> {requested}")]
    InvalidProgress {
        job_id: String,
        current: f64,
        requested: f64,
    },
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
}

pub type Result<T> = std::result::Result<T, TrackerError>;

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TrackerSnapshot {
    jobs: Vec<JobInfo>,
}

/// Authoritative job lifecycle store.
#[derive(Debug, Default)]
pub struct JobTracker {
    jobs: RwLock<HashMap<String, JobInfo>>,
}

impl JobTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restore tracked jobs from the snapshot store. Corrupt snapshots are
    /// logged and treated as first-run.
    pub async fn load_from(&self, store: &SnapshotStore) {
        let snapshot: TrackerSnapshot = crate::persistence::load_or_default(store, JOBS_SNAPSHOT);
        let mut jobs = self.jobs.write().await;
        for job in snapshot.jobs {
            jobs.insert(job.job_id.clone(), job);
        }
        tracing::info!(jobs = jobs.len(), "job tracker restored");
    }

    /// Write the current job map through the snapshot store.
    pub async fn persist(&self, store: &SnapshotStore) -> Result<()> {
        let jobs = self.jobs.read().await;
        let mut list: Vec<JobInfo> = jobs.values().cloned().collect();
        list.sort_by(|a, b| a.job_id.cmp(&b.job_id));
        store.save(JOBS_SNAPSHOT, &TrackerSnapshot { jobs: list })?;
        Ok(())
    }

    /// Register a new job in Queued status. Registering an id that already
    /// exists returns the existing record untouched.
    pub async fn create_job(
        &self,
        job_id: &str,
        deal_name: &str,
        trigger: TriggerType,
        file_paths: Vec<PathBuf>,
    ) -> JobInfo {
        let mut jobs = self.jobs.write().await;
        if let Some(existing) = jobs.get(job_id) {
            tracing::warn!(job_id, "create_job called for an existing job");
            return existing.clone();
        }
        let job = JobInfo::new(job_id, deal_name, trigger, file_paths);
        jobs.insert(job_id.to_string(), job.clone());
        job
    }

    /// Apply a partial update, enforcing the transition table and progress
    /// monotonicity.
    pub async fn update_job(&self, job_id: &str, update: JobUpdate) -> Result<JobInfo> {
        let now = chrono::Utc::now();
        let mut jobs = self.jobs.write().await;
        let job = jobs
            .get_mut(job_id)
            .ok_or_else(|| TrackerError::NotFound(job_id.to_string()))?;

        if let Some(status) = update.status {
            if !job.status.can_transition(status) {
                return Err(TrackerError::InvalidTransition {
                    job_id: job_id.to_string(),
                    from: job.status,
                    to: status,
                });
            }
        }
        if let Some(progress) = update.progress {
            let clamped = progress.clamp(0.0, 1.0);
            if clamped < job.progress {
                return Err(TrackerError::InvalidProgress {
                    job_id: job_id.to_string(),
                    current: job.progress,
                    requested: clamped,
                });
            }
        }

        if let Some(status) = update.status {
            job.status = status;
            if status.is_terminal() {
                job.completed_at = Some(now);
            }
        }
        if let Some(progress) = update.progress {
            job.progress = progress.clamp(0.0, 1.0);
        }
        if let Some(step) = update.current_step {
            job.current_step = step;
        }
        if let Some(count) = update.processed_documents {
            job.processed_documents = count;
        }
        job.errors.extend(update.errors);
        job.updated_at = now;
        Ok(job.clone())
    }

    /// Mark a job Completed with its result payload.
    pub async fn complete_job(
        &self,
        job_id: &str,
        result: serde_json::Value,
    ) -> Result<JobInfo> {
        let now = chrono::Utc::now();
        let mut jobs = self.jobs.write().await;
        let job = jobs
            .get_mut(job_id)
            .ok_or_else(|| TrackerError::NotFound(job_id.to_string()))?;
        if !job.status.can_transition(JobStatus::Completed) {
            return Err(TrackerError::InvalidTransition {
                job_id: job_id.to_string(),
                from: job.status,
                to: JobStatus::Completed,
            });
        }
        job.status = JobStatus::Completed;
        job.progress = 1.0;
        job.completed_at = Some(now);
        job.updated_at = now;
        job.result_ref = Some(result);
        Ok(job.clone())
    }

    /// Mark a job Failed, appending the error message.
    pub async fn fail_job(&self, job_id: &str, message: &str) -> Result<JobInfo> {
        let now = chrono::Utc::now();
        let mut jobs = self.jobs.write().await;
        let job = jobs
            .get_mut(job_id)
            .ok_or_else(|| TrackerError::NotFound(job_id.to_string()))?;
        if !job.status.can_transition(JobStatus::Failed) {
            return Err(TrackerError::InvalidTransition {
                job_id: job_id.to_string(),
                from: job.status,
                to: JobStatus::Failed,
            });
        }
        job.status = JobStatus::Failed;
        job.errors.push(message.to_string());
        job.completed_at = Some(now);
        job.updated_at = now;
        Ok(job.clone())
    }

    /// Restart a Failed or TimedOut job. Progress resets to zero; this is
    /// the only transition that may lower progress.
    pub async fn resume_job(&self, job_id: &str) -> Result<JobInfo> {
        let now = chrono::Utc::now();
        let mut jobs = self.jobs.write().await;
        let job = jobs
            .get_mut(job_id)
            .ok_or_else(|| TrackerError::NotFound(job_id.to_string()))?;
        if !job.status.can_resume() {
            return Err(TrackerError::InvalidTransition {
                job_id: job_id.to_string(),
                from: job.status,
                to: JobStatus::Processing,
            });
        }
        job.status = JobStatus::Processing;
        job.progress = 0.0;
        job.completed_at = None;
        job.updated_at = now;
        Ok(job.clone())
    }

    pub async fn get_job(&self, job_id: &str) -> Option<JobInfo> {
        self.jobs.read().await.get(job_id).cloned()
    }

    pub async fn jobs_by_status(&self, status: JobStatus) -> Vec<JobInfo> {
        let jobs = self.jobs.read().await;
        let mut list: Vec<JobInfo> = jobs
            .values()
            .filter(|j| j.status == status)
            .cloned()
            .collect();
        list.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        list
    }

    pub async fn job_count(&self) -> usize {
        self.jobs.read().await.len()
    }

    /// Verify internal invariants. Returns a description of the first
    /// violation found, if any.
    pub async fn is_healthy(&self) -> std::result::Result<(), String> {
        let jobs = self.jobs.read().await;
        for job in jobs.values() {
            if !(0.0..=1.0).contains(&job.progress) {
                return Err(format!(
                    "job {} progress {} outside [0, 1]",
                    job.job_id, job.progress
                ));
            }
            if job.status.is_terminal() && job.completed_at.is_none() {
                return Err(format!(
                    "job {} is {} without a completion time",
                    job.job_id,
                    job.status.as_str()
                ));
            }
            if job.status == JobStatus::Completed && job.progress < 1.0 {
                return Err(format!(
                    "job {} completed with progress {}",
                    job.job_id, job.progress
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    async fn tracker_with_job(status: JobStatus) -> JobTracker {
        let tracker = JobTracker::new();
        tracker
            .create_job("j1", "D", TriggerType::FileChange, vec![])
            .await;
        if status != JobStatus::Queued {
            tracker
                .update_job(
                    "j1",
                    JobUpdate {
                        status: Some(JobStatus::Processing),
                        ..Default::default()
                    },
                )
                .await
                .unwrap();
        }
        match status {
            JobStatus::Queued | JobStatus::Processing => {}
            JobStatus::Completed => {
                tracker
                    .complete_job("j1", serde_json::json!({}))
                    .await
                    .unwrap();
            }
            JobStatus::Failed => {
                tracker.fail_job("j1", "boom").await.unwrap();
            }
            other => {
                tracker
                    .update_job(
                        "j1",
                        JobUpdate {
                            status: Some(other),
                            ..Default::default()
                        },
                    )
                    .await
                    .unwrap();
            }
        }
        tracker
    }

    #[tokio::test]
    async fn test_create_job_initial_state() {
        let tracker = JobTracker::new();
        let job = tracker
            .create_job("j1", "D", TriggerType::UserButton, vec![PathBuf::from("/a")])
            .await;
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.progress, 0.0);
        assert_eq!(tracker.job_count().await, 1);
    }

    #[tokio::test]
    async fn test_create_job_existing_id_is_noop() {
        let tracker = JobTracker::new();
        tracker
            .create_job("j1", "D", TriggerType::UserButton, vec![])
            .await;
        tracker
            .update_job(
                "j1",
                JobUpdate {
                    status: Some(JobStatus::Processing),
                    progress: Some(0.5),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let again = tracker
            .create_job("j1", "Other", TriggerType::Scheduled, vec![])
            .await;
        assert_eq!(again.deal_name, "D");
        assert_eq!(again.progress, 0.5);
    }

    #[tokio::test]
    async fn test_update_unknown_job() {
        let tracker = JobTracker::new();
        let err = tracker
            .update_job("ghost", JobUpdate::default())
            .await
            .unwrap_err();
        assert!(matches!(err, TrackerError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_illegal_transition_rejected() {
        let tracker = tracker_with_job(JobStatus::Completed).await;
        let err = tracker
            .update_job(
                "j1",
                JobUpdate {
                    status: Some(JobStatus::Processing),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, TrackerError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_queued_to_completed_rejected() {
        let tracker = tracker_with_job(JobStatus::Queued).await;
        let err = tracker
            .complete_job("j1", serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, TrackerError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_progress_monotone() {
        let tracker = tracker_with_job(JobStatus::Processing).await;
        tracker
            .update_job(
                "j1",
                JobUpdate {
                    progress: Some(0.6),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let err = tracker
            .update_job(
                "j1",
                JobUpdate {
                    progress: Some(0.4),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, TrackerError::InvalidProgress { .. }));
    }

    #[tokio::test]
    async fn test_complete_sets_progress_and_time() {
        let tracker = tracker_with_job(JobStatus::Processing).await;
        let job = tracker
            .complete_job("j1", serde_json::json!({"fields": 12}))
            .await
            .unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.progress, 1.0);
        assert!(job.completed_at.is_some());
        assert!(job.result_ref.is_some());
    }

    #[tokio::test]
    async fn test_fail_appends_error() {
        let tracker = tracker_with_job(JobStatus::Processing).await;
        let job = tracker.fail_job("j1", "engine exploded").await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.errors, vec!["engine exploded".to_string()]);
        assert!(job.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_resume_resets_progress() {
        let tracker = tracker_with_job(JobStatus::Failed).await;
        let job = tracker.resume_job("j1").await.unwrap();
        assert_eq!(job.status, JobStatus::Processing);
        assert_eq!(job.progress, 0.0);
        assert!(job.completed_at.is_none());
    }

    #[tokio::test]
    async fn test_resume_rejects_completed() {
        let tracker = tracker_with_job(JobStatus::Completed).await;
        let err = tracker.resume_job("j1").await.unwrap_err();
        assert!(matches!(err, TrackerError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_resume_allows_timed_out() {
        let tracker = tracker_with_job(JobStatus::TimedOut).await;
        let job = tracker.resume_job("j1").await.unwrap();
        assert_eq!(job.status, JobStatus::Processing);
    }

    #[tokio::test]
    async fn test_jobs_by_status() {
        let tracker = JobTracker::new();
        tracker
            .create_job("j1", "D", TriggerType::FileChange, vec![])
            .await;
        tracker
            .create_job("j2", "D", TriggerType::FileChange, vec![])
            .await;
        tracker
            .update_job(
                "j2",
                JobUpdate {
                    status: Some(JobStatus::Processing),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let queued = tracker.jobs_by_status(JobStatus::Queued).await;
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].job_id, "j1");
    }

    #[tokio::test]
    async fn test_health_check_passes() {
        let tracker = tracker_with_job(JobStatus::Processing).await;
        assert!(tracker.is_healthy().await.is_ok());
    }

    #[tokio::test]
    async fn test_snapshot_roundtrip() {
        let dir = tempdir().unwrap();
        let store = SnapshotStore::new(dir.path());

        let tracker = tracker_with_job(JobStatus::Processing).await;
        tracker.persist(&store).await.unwrap();

        let restored = JobTracker::new();
        restored.load_from(&store).await;
        let job = restored.get_job("j1").await.unwrap();
        assert_eq!(job.status, JobStatus::Processing);
    }
}
