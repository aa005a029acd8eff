//! Queue item model.
//!
//! A queue item tracks one document awaiting or undergoing analysis. Items
//! are keyed by a stable `id`; the separate `job_id` correlates the item
//! with the dispatch sent to the external analysis engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Dispatch priority. Lower value dispatches first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    High,
    Normal,
    Low,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Normal => "normal",
            Self::Low => "low",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "high" => Some(Self::High),
            "normal" => Some(Self::Normal),
            "low" => Some(Self::Low),
            _ => None,
        }
    }

    /// Numeric rank used for queue ordering and the dispatch wire format.
    pub fn rank(&self) -> u8 {
        match self {
            Self::High => 1,
            Self::Normal => 2,
            Self::Low => 3,
        }
    }

    pub fn from_rank(rank: u8) -> Option<Self> {
        match rank {
            1 => Some(Self::High),
            2 => Some(Self::Normal),
            3 => Some(Self::Low),
            _ => None,
        }
    }
}

/// Lifecycle status of a queue item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueItemStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Canceled,
    Retrying,
    Blocked,
}

impl QueueItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
            Self::Retrying => "retrying",
            Self::Blocked => "blocked",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "processing" => Some(Self::Processing),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "canceled" => Some(Self::Canceled),
            "retrying" => Some(Self::Retrying),
            "blocked" => Some(Self::Blocked),
            _ => None,
        }
    }

    /// Terminal states set `processing_ended` and are never left.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Canceled)
    }

    /// States that count toward the per-(deal, path) duplicate check.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, Self::Pending | Self::Processing | Self::Retrying)
    }
}

/// Last error recorded against a queue item.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueItemError {
    /// Machine-readable kind, e.g. "timeout", "dispatch", "engine".
    pub error_type: String,
    pub message: String,
    pub occurred_at: DateTime<Utc>,
}

/// One document awaiting or undergoing processing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueItem {
    /// Stable item identifier.
    pub id: String,
    /// Correlates this item with its dispatch to the analysis engine.
    pub job_id: String,
    pub deal_name: String,
    pub document_path: PathBuf,
    pub document_name: String,
    pub priority: Priority,
    pub queued_at: DateTime<Utc>,
    /// Set on the first transition into Processing, never cleared.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processing_started: Option<DateTime<Utc>>,
    /// Set when the item reaches a terminal status.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processing_ended: Option<DateTime<Utc>>,
    pub status: QueueItemStatus,
    /// Caller-supplied opaque metadata, passed through to dispatch.
    pub metadata: serde_json::Value,
    /// Item ids this item must wait for before dispatch.
    #[serde(default)]
    pub dependencies: Vec<String>,
    pub retry_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<QueueItemError>,
    /// Expected processing time in seconds, if known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_duration_secs: Option<u64>,
    /// Observed processing time in seconds, set on terminal transition.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actual_duration_secs: Option<u64>,
}

impl QueueItem {
    /// Create a fresh pending item with new item and job ids.
    pub fn new(
        deal_name: &str,
        document_path: PathBuf,
        document_name: &str,
        priority: Priority,
        metadata: serde_json::Value,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            job_id: uuid::Uuid::new_v4().to_string(),
            deal_name: deal_name.to_string(),
            document_path,
            document_name: document_name.to_string(),
            priority,
            queued_at: Utc::now(),
            processing_started: None,
            processing_ended: None,
            status: QueueItemStatus::Pending,
            metadata,
            dependencies: Vec::new(),
            retry_count: 0,
            last_error: None,
            estimated_duration_secs: None,
            actual_duration_secs: None,
        }
    }

    /// Transition into Processing, stamping the start time once.
    pub fn mark_processing(&mut self, now: DateTime<Utc>) {
        self.status = QueueItemStatus::Processing;
        if self.processing_started.is_none() {
            self.processing_started = Some(now);
        }
    }

    /// Transition into a terminal status, stamping end time and duration.
    pub fn mark_terminal(&mut self, status: QueueItemStatus, now: DateTime<Utc>) {
        debug_assert!(status.is_terminal());
        self.status = status;
        self.processing_ended = Some(now);
        if let Some(started) = self.processing_started {
            let secs = (now - started).num_seconds().max(0) as u64;
            self.actual_duration_secs = Some(secs);
        }
    }

    /// Record a failure with a machine-readable error type.
    pub fn mark_failed(&mut self, error_type: &str, message: &str, now: DateTime<Utc>) {
        self.last_error = Some(QueueItemError {
            error_type: error_type.to_string(),
            message: message.to_string(),
            occurred_at: now,
        });
        self.mark_terminal(QueueItemStatus::Failed, now);
    }

    /// Wait spent in queue before processing started, in seconds.
    pub fn wait_secs(&self) -> Option<u64> {
        self.processing_started
            .map(|started| (started - self.queued_at).num_seconds().max(0) as u64)
    }
}
