//! Queue inspection: filtered queries, statistics, processing history.

use std::collections::BTreeMap;
use std::sync::atomic::Ordering;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::QueueManager;
use crate::models::{Priority, ProcessingHistory, QueueItem, QueueItemStatus};

/// Sort key for queue queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortBy {
    #[default]
    QueuedAt,
    Priority,
    Status,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

/// Filter and paging for `query_queue`. The default query returns every
/// item in queue order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QueueQuery {
    pub deal_name: Option<String>,
    pub status: Option<QueueItemStatus>,
    pub priority: Option<Priority>,
    pub limit: Option<usize>,
    pub offset: usize,
    pub sort_by: SortBy,
    pub sort_order: SortOrder,
    pub from_time: Option<DateTime<Utc>>,
    pub to_time: Option<DateTime<Utc>>,
}

/// Aggregate queue health surfaced through stats and the CLI.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub total_items: u64,
    pub status_counts: BTreeMap<String, u64>,
    pub priority_counts: BTreeMap<String, u64>,
    pub processing_count: u64,
    pub average_wait_secs: f64,
    pub average_processing_secs: f64,
    /// Items completed in the last hour.
    pub throughput_last_hour: u64,
    pub loop_errors: u64,
    pub history_records: u64,
    /// Last heartbeat per background loop, absent until a loop has run.
    pub loop_heartbeats: BTreeMap<String, DateTime<Utc>>,
    pub last_updated: DateTime<Utc>,
}

impl QueueManager {
    /// Query queue items with filtering, sorting and paging.
    pub async fn query_queue(&self, query: &QueueQuery) -> Vec<QueueItem> {
        let state = self.state.read().await;
        let mut items: Vec<QueueItem> = state
            .items
            .iter()
            .filter(|item| {
                query
                    .deal_name
                    .as_deref()
                    .map_or(true, |deal| item.deal_name == deal)
                    && query.status.map_or(true, |s| item.status == s)
                    && query.priority.map_or(true, |p| item.priority == p)
                    && query.from_time.map_or(true, |t| item.queued_at >= t)
                    && query.to_time.map_or(true, |t| item.queued_at <= t)
            })
            .cloned()
            .collect();
        drop(state);

        match query.sort_by {
            // The backing vec is already in (priority, queued_at) order;
            // QueuedAt re-sorts by time alone.
            SortBy::QueuedAt => items.sort_by_key(|i| i.queued_at),
            SortBy::Priority => { /* queue order */ }
            SortBy::Status => items.sort_by_key(|i| i.status.as_str()),
        }
        if query.sort_order == SortOrder::Desc {
            items.reverse();
        }

        items
            .into_iter()
            .skip(query.offset)
            .take(query.limit.unwrap_or(usize::MAX))
            .collect()
    }

    /// Current aggregate statistics.
    pub async fn queue_status(&self) -> QueueStats {
        let state = self.state.read().await;
        let now = Utc::now();

        let mut status_counts: BTreeMap<String, u64> = BTreeMap::new();
        let mut priority_counts: BTreeMap<String, u64> = BTreeMap::new();
        let mut wait_total = 0u64;
        let mut wait_samples = 0u64;
        let mut processing_total = 0u64;
        let mut processing_samples = 0u64;
        let mut throughput = 0u64;

        for item in &state.items {
            *status_counts.entry(item.status.as_str().to_string()).or_default() += 1;
            *priority_counts
                .entry(item.priority.as_str().to_string())
                .or_default() += 1;
            if let Some(wait) = item.wait_secs() {
                wait_total += wait;
                wait_samples += 1;
            }
            if let Some(duration) = item.actual_duration_secs {
                processing_total += duration;
                processing_samples += 1;
            }
            if item.status == QueueItemStatus::Completed {
                if let Some(ended) = item.processing_ended {
                    if now - ended <= chrono::Duration::hours(1) {
                        throughput += 1;
                    }
                }
            }
        }

        QueueStats {
            total_items: state.items.len() as u64,
            status_counts,
            priority_counts,
            processing_count: self.processing_count.load(Ordering::SeqCst) as u64,
            average_wait_secs: if wait_samples > 0 {
                wait_total as f64 / wait_samples as f64
            } else {
                0.0
            },
            average_processing_secs: if processing_samples > 0 {
                processing_total as f64 / processing_samples as f64
            } else {
                0.0
            },
            throughput_last_hour: throughput,
            loop_errors: self.loop_errors.load(Ordering::Relaxed),
            history_records: state.history.len() as u64,
            loop_heartbeats: self
                .heartbeats
                .read()
                .await
                .iter()
                .map(|(name, at)| (name.to_string(), *at))
                .collect(),
            last_updated: now,
        }
    }

    /// Append a minimal history record for a processed document.
    pub async fn record_processing_history(
        &self,
        deal_name: &str,
        document_path: &str,
        processing_type: &str,
        results: serde_json::Value,
    ) -> ProcessingHistory {
        let record = ProcessingHistory::new(deal_name, document_path, processing_type, results);
        self.append_history(record.clone()).await;
        record
    }

    /// Append a fully populated history record.
    pub async fn append_history(&self, record: ProcessingHistory) {
        let mut state = self.state.write().await;
        state.history.push(record);
    }

    /// Most recent history for a deal, newest first.
    pub async fn processing_history(&self, deal_name: &str, limit: usize) -> Vec<ProcessingHistory> {
        let state = self.state.read().await;
        let mut records: Vec<ProcessingHistory> = state
            .history
            .iter()
            .filter(|h| h.deal_name == deal_name)
            .cloned()
            .collect();
        records.sort_by(|a, b| b.start_time.cmp(&a.start_time));
        records.truncate(limit);
        records
    }
}
