//! Wire payloads exchanged with the external analysis engine.
//!
//! Outbound dispatches and inbound results are camelCase JSON. Unknown
//! fields on inbound results are preserved verbatim so newer engines can
//! ship extra data through to storage without a core upgrade.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::models::{QueueItem, TriggerType, WorkflowType};

use super::DispatchError;

/// Outbound dispatch request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchPayload {
    pub deal_name: String,
    pub file_paths: Vec<String>,
    pub trigger_type: TriggerType,
    pub workflow_type: WorkflowType,
    pub job_id: String,
    /// Numeric priority, 1 (high) through 3 (low).
    pub priority: u8,
    /// Unix milliseconds.
    pub timestamp: i64,
    pub retry_count: u32,
    pub max_retries: u32,
    pub timeout_seconds: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processing_config: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub callback_config: Option<serde_json::Value>,
}

impl DispatchPayload {
    /// Build a document-analysis dispatch for a queue item.
    pub fn for_item(item: &QueueItem, timeout_seconds: u64, max_retries: u32) -> Self {
        Self {
            deal_name: item.deal_name.clone(),
            file_paths: vec![item.document_path.to_string_lossy().into_owned()],
            trigger_type: TriggerType::FileChange,
            workflow_type: WorkflowType::DocumentAnalysis,
            job_id: item.job_id.clone(),
            priority: item.priority.rank(),
            timestamp: chrono::Utc::now().timestamp_millis(),
            retry_count: item.retry_count,
            max_retries,
            timeout_seconds,
            processing_config: (!item.metadata.is_null()
                && item.metadata != serde_json::json!({}))
            .then(|| item.metadata.clone()),
            callback_config: None,
        }
    }

    /// Check field ranges before the payload goes on the wire.
    pub fn validate(&self) -> Result<(), DispatchError> {
        if self.deal_name.is_empty() {
            return Err(DispatchError::Validation("dealName is empty".to_string()));
        }
        if self.job_id.is_empty() {
            return Err(DispatchError::Validation("jobId is empty".to_string()));
        }
        if self.file_paths.is_empty() {
            return Err(DispatchError::Validation(
                "filePaths must contain at least one path".to_string(),
            ));
        }
        if !(1..=3).contains(&self.priority) {
            return Err(DispatchError::Validation(format!(
                "priority {} outside 1..=3",
                self.priority
            )));
        }
        if self.max_retries > 10 {
            return Err(DispatchError::Validation(format!(
                "maxRetries {} outside 0..=10",
                self.max_retries
            )));
        }
        if !(1..=3600).contains(&self.timeout_seconds) {
            return Err(DispatchError::Validation(format!(
                "timeoutSeconds {} outside 1..=3600",
                self.timeout_seconds
            )));
        }
        Ok(())
    }
}

/// Result status reported by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    Completed,
    Failed,
    PartialSuccess,
    InProgress,
}

impl ResultStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::PartialSuccess => "partial_success",
            Self::InProgress => "in_progress",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::InProgress)
    }
}

/// Inbound result payload posted to `/webhook/results`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultPayload {
    pub job_id: String,
    pub deal_name: String,
    pub workflow_type: WorkflowType,
    pub status: ResultStatus,
    #[serde(default)]
    pub processed_documents: u32,
    #[serde(default)]
    pub total_documents: u32,
    #[serde(default)]
    pub average_confidence: f64,
    #[serde(default)]
    pub processing_time_ms: u64,
    /// Unix milliseconds.
    #[serde(default)]
    pub start_time: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<i64>,
    /// Detailed engine results, stored verbatim.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub results: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub errors: Option<Vec<String>>,
    #[serde(default)]
    pub timestamp: i64,
    /// Fields this version does not know about, carried through to
    /// downstream storage untouched.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl ResultPayload {
    pub fn validate(&self) -> Result<(), DispatchError> {
        if self.job_id.is_empty() {
            return Err(DispatchError::Validation("jobId is empty".to_string()));
        }
        if self.deal_name.is_empty() {
            return Err(DispatchError::Validation("dealName is empty".to_string()));
        }
        if !(0.0..=1.0).contains(&self.average_confidence) {
            return Err(DispatchError::Validation(format!(
                "averageConfidence {} outside [0, 1]",
                self.average_confidence
            )));
        }
        Ok(())
    }

    /// Completion fraction derived from document counts.
    pub fn progress(&self) -> f64 {
        if self.status.is_terminal() {
            return 1.0;
        }
        if self.total_documents == 0 {
            return 0.0;
        }
        (self.processed_documents as f64 / self.total_documents as f64).clamp(0.0, 1.0)
    }

    /// Template paths the engine reports as updated, if any.
    pub fn updated_templates(&self) -> Vec<String> {
        self.results
            .as_ref()
            .and_then(|r| r.get("templatesUpdated"))
            .and_then(|t| t.as_array())
            .map(|paths| {
                paths
                    .iter()
                    .filter_map(|p| p.as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default()
    }
}
