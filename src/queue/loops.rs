//! Background loops: dispatch, health, persistence, cleanup.
//!
//! Each loop wakes on its own interval, checks the shared shutdown signal
//! at the iteration boundary, and writes a heartbeat consumed by stats.
//! Loop bodies are plain async functions over the manager so tests drive
//! single ticks directly. A failing iteration is logged and counted; loops
//! never take the process down.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::QueueManager;
use crate::models::{ProcessingState, QueueItem, QueueItemStatus};

/// Hands dispatched items to the outbound webhook client. Tests substitute
/// fakes; the queue never constructs its collaborator itself.
#[async_trait::async_trait]
pub trait Dispatcher: Send + Sync {
    async fn dispatch(&self, item: &QueueItem) -> anyhow::Result<()>;
}

/// Cadence of the dispatch scan. Dispatch also runs opportunistically
/// whenever a prior tick made progress.
const DISPATCH_INTERVAL: Duration = Duration::from_millis(500);

pub(super) fn spawn_all(
    qm: Arc<QueueManager>,
    dispatcher: Arc<dyn Dispatcher>,
    shutdown: watch::Receiver<bool>,
) -> Vec<JoinHandle<()>> {
    let mut handles = Vec::new();

    {
        let qm = qm.clone();
        let mut shutdown = shutdown.clone();
        handles.push(tokio::spawn(async move {
            let mut tick = tokio::time::interval(DISPATCH_INTERVAL);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        qm.dispatch_tick(dispatcher.as_ref()).await;
                        qm.beat("dispatch").await;
                    }
                    _ = shutdown.changed() => break,
                }
            }
        }));
    }

    {
        let qm = qm.clone();
        let mut shutdown = shutdown.clone();
        let interval = Duration::from_secs(qm.config.health_check_interval_secs.max(1));
        handles.push(tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        qm.health_tick().await;
                        qm.beat("health").await;
                    }
                    _ = shutdown.changed() => break,
                }
            }
        }));
    }

    {
        let qm = qm.clone();
        let mut shutdown = shutdown.clone();
        let interval = Duration::from_secs(qm.config.persistence_interval_secs.max(1));
        handles.push(tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        if let Err(e) = qm.persist().await {
                            qm.record_loop_error("persistence", &e);
                        }
                        qm.beat("persistence").await;
                    }
                    _ = shutdown.changed() => break,
                }
            }
        }));
    }

    {
        let qm = qm.clone();
        let mut shutdown = shutdown.clone();
        let interval = Duration::from_secs(qm.config.cleanup_interval_secs.max(1));
        handles.push(tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        qm.cleanup_tick().await;
                        qm.beat("cleanup").await;
                    }
                    _ = shutdown.changed() => break,
                }
            }
        }));
    }

    handles
}

impl QueueManager {
    /// One dispatch pass: pop head items whose dependencies hold until the
    /// concurrency bound is reached, handing each to the dispatcher.
    pub async fn dispatch_tick(&self, dispatcher: &dyn Dispatcher) {
        loop {
            if self.processing_count.load(Ordering::SeqCst) >= self.config.max_concurrent_jobs {
                return;
            }
            let Some(item) = self.claim_next_dispatchable().await else {
                return;
            };

            match dispatcher.dispatch(&item).await {
                Ok(()) => {
                    self.mark_mirror_file(
                        &item.deal_name,
                        &item.document_path,
                        ProcessingState::Processing,
                        Some(&item.id),
                    )
                    .await;
                    tracing::debug!(item = %item.id, job = %item.job_id, "item dispatched");
                }
                Err(e) => {
                    self.handle_dispatch_failure(&item.id, &e.to_string()).await;
                }
            }
        }
    }

    /// Claim the head Pending (or due Retrying) item whose dependencies
    /// are satisfied, marking it Processing. Items with open dependencies
    /// park as Blocked and are reconsidered next tick.
    async fn claim_next_dispatchable(&self) -> Option<QueueItem> {
        let now = Utc::now();
        let retry_gate = self.retry_not_before.lock().await;
        let mut state = self.state.write().await;

        // Unblock items whose dependencies resolved since the last pass.
        let statuses: std::collections::HashMap<String, QueueItemStatus> = state
            .items
            .iter()
            .map(|i| (i.id.clone(), i.status))
            .collect();
        let dep_completed = |dep: &str| {
            // A dependency that left the queue was completed and cleaned up.
            statuses
                .get(dep)
                .map_or(true, |s| *s == QueueItemStatus::Completed)
        };
        let dep_doomed = |dep: &str| {
            statuses.get(dep).map_or(false, |s| {
                matches!(s, QueueItemStatus::Failed | QueueItemStatus::Canceled)
            })
        };

        let mut claimed = None;
        for item in state.items.iter_mut() {
            let due = match item.status {
                QueueItemStatus::Pending | QueueItemStatus::Blocked => true,
                QueueItemStatus::Retrying => retry_gate
                    .get(&item.id)
                    .map_or(true, |not_before| Instant::now() >= *not_before),
                _ => false,
            };
            if !due {
                continue;
            }
            if item.dependencies.iter().any(|d| dep_doomed(d)) {
                // Dependency failed for good; this item can never run.
                item.mark_failed("dependency", "dependency failed or was canceled", now);
                continue;
            }
            if !item.dependencies.iter().all(|d| dep_completed(d)) {
                if item.status != QueueItemStatus::Blocked {
                    item.status = QueueItemStatus::Blocked;
                }
                continue;
            }
            item.mark_processing(now);
            claimed = Some(item.clone());
            break;
        }

        if claimed.is_some() {
            self.processing_count.fetch_add(1, Ordering::SeqCst);
        }
        claimed
    }

    async fn handle_dispatch_failure(&self, item_id: &str, message: &str) {
        let now = Utc::now();
        // Lock order everywhere is retry gate, then queue state.
        let mut retry_gate = self.retry_not_before.lock().await;
        let mut state = self.state.write().await;
        let Some(item) = state.items.iter_mut().find(|i| i.id == item_id) else {
            return;
        };

        self.processing_count.fetch_sub(1, Ordering::SeqCst);
        if item.retry_count < self.config.max_retry_attempts {
            item.retry_count += 1;
            item.status = QueueItemStatus::Retrying;
            let backoff = dispatch_backoff(
                item.retry_count,
                self.config.retry_backoff_multiplier,
                self.config.max_retry_backoff_secs,
            );
            retry_gate.insert(item.id.clone(), Instant::now() + backoff);
            tracing::warn!(
                item = %item.id,
                attempt = item.retry_count,
                backoff_secs = backoff.as_secs(),
                error = message,
                "dispatch failed, will retry"
            );
        } else {
            item.mark_failed("dispatch", message, now);
            tracing::error!(item = %item.id, error = message, "dispatch retries exhausted");
        }
    }

    /// One health pass: fail items stuck in Processing past the timeout
    /// and Pending items older than the queue timeout.
    pub async fn health_tick(&self) {
        let now = Utc::now();
        let processing_timeout = chrono::Duration::from_std(self.config.processing_timeout())
            .unwrap_or_else(|_| chrono::Duration::seconds(i64::MAX / 2));
        let queue_timeout = chrono::Duration::from_std(self.config.queue_timeout())
            .unwrap_or_else(|_| chrono::Duration::seconds(i64::MAX / 2));

        let mut timed_out = Vec::new();
        {
            let mut state = self.state.write().await;
            for item in state.items.iter_mut() {
                match item.status {
                    QueueItemStatus::Processing => {
                        let started = item.processing_started.unwrap_or(item.queued_at);
                        if now - started > processing_timeout {
                            item.mark_failed("timeout", "processing exceeded configured timeout", now);
                            self.processing_count.fetch_sub(1, Ordering::SeqCst);
                            timed_out.push((
                                item.deal_name.clone(),
                                item.document_path.clone(),
                                item.id.clone(),
                            ));
                        }
                    }
                    QueueItemStatus::Pending => {
                        if now - item.queued_at > queue_timeout {
                            item.mark_failed("queue_timeout", "item expired before dispatch", now);
                        }
                    }
                    _ => {}
                }
            }
        }

        for (deal, path, id) in timed_out {
            tracing::warn!(item = %id, deal, "processing timeout");
            self.mark_mirror_file(&deal, &path, ProcessingState::Failed, Some(&id))
                .await;
        }
    }

    /// One cleanup pass: drop Completed/Failed items past the TTL and trim
    /// history beyond the retention window.
    pub async fn cleanup_tick(&self) {
        let now = Utc::now();
        let ttl = chrono::Duration::from_std(self.config.completed_item_ttl())
            .unwrap_or_else(|_| chrono::Duration::seconds(i64::MAX / 2));
        let history_cutoff = now - chrono::Duration::days(self.config.max_history_days);

        let mut state = self.state.write().await;
        let before = state.items.len();
        state.items.retain(|item| {
            let expired = matches!(
                item.status,
                QueueItemStatus::Completed | QueueItemStatus::Failed
            ) && item
                .processing_ended
                .map_or(false, |ended| now - ended > ttl);
            !expired
        });
        let removed = before - state.items.len();

        let history_before = state.history.len();
        state.history.retain(|h| h.start_time >= history_cutoff);
        let trimmed = history_before - state.history.len();

        if removed > 0 || trimmed > 0 {
            tracing::info!(removed, trimmed, "cleanup pass");
        }
    }
}

fn dispatch_backoff(attempt: u32, multiplier: f64, max_secs: u64) -> Duration {
    let secs = multiplier.powi(attempt.saturating_sub(1) as i32);
    Duration::from_secs_f64(secs.min(max_secs as f64))
}
