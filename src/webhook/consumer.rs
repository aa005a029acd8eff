//! Buffered result consumer.
//!
//! Inbound result payloads land in a bounded channel (capacity 100) and a
//! single consumer task drains it. Overflow drops the payload with a warn
//! log; the engine redelivers on its own retry schedule, and merges are
//! idempotent on `job_id`, so at-least-once delivery is preserved without
//! backpressure into the HTTP handler.
//!
//! Routing order per payload: job tracker update, queue mirror update,
//! history row on completion, then a notification through the pluggable
//! `ResultNotifier`.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::payload::{ResultPayload, ResultStatus};
use crate::models::{JobInfo, JobStatus, JobUpdate, ProcessingHistory, ProcessingState, TriggerType};
use crate::queue::QueueManager;
use crate::tracker::JobTracker;

/// Result buffer capacity. Results beyond this are dropped, not queued.
pub const RESULT_CHANNEL_CAPACITY: usize = 100;

/// Receives routed result events. The consumer never constructs its
/// notifier; callers decide where completion and failure events go.
#[async_trait::async_trait]
pub trait ResultNotifier: Send + Sync {
    async fn notify_job_completed(&self, job: &JobInfo, payload: &ResultPayload);
    async fn notify_job_failed(&self, job: &JobInfo, payload: &ResultPayload);
}

/// Notifier that writes structured log events.
#[derive(Debug, Default)]
pub struct TracingResultNotifier;

#[async_trait::async_trait]
impl ResultNotifier for TracingResultNotifier {
    async fn notify_job_completed(&self, job: &JobInfo, payload: &ResultPayload) {
        tracing::info!(
            job = %job.job_id,
            deal = %job.deal_name,
            confidence = payload.average_confidence,
            documents = payload.processed_documents,
            "job completed notification"
        );
    }

    async fn notify_job_failed(&self, job: &JobInfo, payload: &ResultPayload) {
        tracing::warn!(
            job = %job.job_id,
            deal = %job.deal_name,
            error = job.errors.last().map(String::as_str).unwrap_or(""),
            status = payload.status.as_str(),
            "job failed notification"
        );
    }
}

pub fn result_channel() -> (mpsc::Sender<ResultPayload>, mpsc::Receiver<ResultPayload>) {
    mpsc::channel(RESULT_CHANNEL_CAPACITY)
}

/// Spawn the consumer task. It exits when every sender is dropped.
pub fn spawn_consumer(
    tracker: Arc<JobTracker>,
    queue: Arc<QueueManager>,
    notifier: Arc<dyn ResultNotifier>,
    mut rx: mpsc::Receiver<ResultPayload>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(payload) = rx.recv().await {
            process_result(&tracker, &queue, notifier.as_ref(), payload).await;
        }
        tracing::debug!("result consumer drained");
    })
}

/// Apply one validated result payload: job tracker first, then the queue
/// mirror and history, then a notification. Duplicate terminal results
/// are ignored.
pub async fn process_result(
    tracker: &JobTracker,
    queue: &QueueManager,
    notifier: &dyn ResultNotifier,
    payload: ResultPayload,
) {
    let job_id = payload.job_id.clone();

    match tracker.get_job(&job_id).await {
        Some(job) if job.status.is_terminal() && payload.status.is_terminal() => {
            tracing::info!(
                job = %job_id,
                status = payload.status.as_str(),
                "duplicate terminal result ignored"
            );
            return;
        }
        Some(_) => {}
        None => {
            tracing::warn!(job = %job_id, "result for untracked job, registering");
            tracker
                .create_job(&job_id, &payload.deal_name, TriggerType::FileChange, vec![])
                .await;
        }
    }

    // Queued jobs move to Processing before any terminal transition; the
    // transition table has no Queued -> Completed edge.
    if let Some(job) = tracker.get_job(&job_id).await {
        if job.status == JobStatus::Queued {
            if let Err(e) = tracker
                .update_job(
                    &job_id,
                    JobUpdate {
                        status: Some(JobStatus::Processing),
                        ..Default::default()
                    },
                )
                .await
            {
                tracing::warn!(job = %job_id, error = %e, "could not move job to processing");
            }
        }
    }

    match payload.status {
        ResultStatus::InProgress => {
            let update = JobUpdate {
                progress: Some(payload.progress()),
                current_step: Some("engine-processing".to_string()),
                processed_documents: Some(payload.processed_documents),
                ..Default::default()
            };
            if let Err(e) = tracker.update_job(&job_id, update).await {
                tracing::warn!(job = %job_id, error = %e, "progress update rejected");
            }
        }
        ResultStatus::Completed | ResultStatus::PartialSuccess => {
            if payload.status == ResultStatus::PartialSuccess {
                let errors = payload.errors.clone().unwrap_or_default();
                if !errors.is_empty() {
                    let _ = tracker
                        .update_job(
                            &job_id,
                            JobUpdate {
                                errors,
                                ..Default::default()
                            },
                        )
                        .await;
                }
            }
            let result_ref = payload
                .results
                .clone()
                .unwrap_or_else(|| serde_json::to_value(&payload).unwrap_or_default());
            let job = match tracker.complete_job(&job_id, result_ref).await {
                Ok(job) => job,
                Err(e) => {
                    tracing::warn!(job = %job_id, error = %e, "completion rejected");
                    return;
                }
            };

            if let Err(e) = queue.synchronize_workflow_state(&job_id, "completed").await {
                tracing::debug!(job = %job_id, error = %e, "no queue item for completed job");
            }
            record_completion(queue, &payload).await;
            notifier.notify_job_completed(&job, &payload).await;
        }
        ResultStatus::Failed => {
            let message = payload
                .errors
                .as_ref()
                .and_then(|errors| errors.last().cloned())
                .unwrap_or_else(|| "analysis engine reported failure".to_string());
            let job = match tracker.fail_job(&job_id, &message).await {
                Ok(job) => job,
                Err(e) => {
                    tracing::warn!(job = %job_id, error = %e, "failure update rejected");
                    return;
                }
            };
            if let Err(e) = queue.synchronize_workflow_state(&job_id, "failed").await {
                tracing::debug!(job = %job_id, error = %e, "no queue item for failed job");
            }
            notifier.notify_job_failed(&job, &payload).await;
        }
    }
}

/// Append a history row and mark updated templates in the deal mirror.
async fn record_completion(queue: &QueueManager, payload: &ResultPayload) {
    let document_path = payload
        .results
        .as_ref()
        .and_then(|r| r.get("documentPath"))
        .and_then(|p| p.as_str())
        .unwrap_or("")
        .to_string();
    let fields_extracted = payload
        .results
        .as_ref()
        .and_then(|r| r.get("fieldsExtracted"))
        .and_then(|f| f.as_u64())
        .unwrap_or(0) as u32;
    let templates = payload.updated_templates();

    let mut record = ProcessingHistory::new(
        &payload.deal_name,
        &document_path,
        payload.workflow_type.as_str(),
        payload.results.clone().unwrap_or(serde_json::Value::Null),
    );
    record.status = payload.status.as_str().to_string();
    record.end_time = Some(Utc::now());
    record.confidence_score = payload.average_confidence.clamp(0.0, 1.0);
    record.fields_extracted = fields_extracted;
    record.templates_used = templates.clone();
    queue.append_history(record).await;

    for template in templates {
        let path = queue.deals_dir.join(&payload.deal_name).join(&template);
        queue
            .mark_mirror_file(
                &payload.deal_name,
                &path,
                ProcessingState::Completed,
                None,
            )
            .await;
    }
}
