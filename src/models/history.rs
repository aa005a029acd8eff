//! Processing history model.
//!
//! Append-only log of completed document processing, retained for a bounded
//! number of days. Consumers (correction learning, trend analysis) read
//! these records; the core only appends and trims.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Immutable post-completion log entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingHistory {
    pub id: String,
    pub deal_name: String,
    pub document_path: String,
    /// What kind of processing produced this record, e.g. "document-analysis".
    pub processing_type: String,
    pub start_time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    pub status: String,
    /// Engine results, stored verbatim.
    pub results: serde_json::Value,
    #[serde(default)]
    pub templates_used: Vec<String>,
    pub fields_extracted: u32,
    /// Average extraction confidence in [0, 1].
    pub confidence_score: f64,
    pub user_corrections: u32,
    pub version: u32,
}

impl ProcessingHistory {
    pub fn new(
        deal_name: &str,
        document_path: &str,
        processing_type: &str,
        results: serde_json::Value,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            deal_name: deal_name.to_string(),
            document_path: document_path.to_string(),
            processing_type: processing_type.to_string(),
            start_time: Utc::now(),
            end_time: None,
            status: "completed".to_string(),
            results,
            templates_used: Vec::new(),
            fields_extracted: 0,
            confidence_score: 0.0,
            user_corrections: 0,
            version: 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_record_defaults() {
        let record = ProcessingHistory::new(
            "D",
            "/deals/D/cim.pdf",
            "document-analysis",
            serde_json::json!({"fields": 3}),
        );
        assert_eq!(record.version, 1);
        assert_eq!(record.status, "completed");
        assert_eq!(record.confidence_score, 0.0);
        assert!(record.end_time.is_none());
    }

    #[test]
    fn test_serialization_keys() {
        let record = ProcessingHistory::new("D", "p", "t", serde_json::Value::Null);
        let json = serde_json::to_value(&record).unwrap();
        assert!(json.get("dealName").is_some());
        assert!(json.get("processingType").is_some());
        assert!(json.get("confidenceScore").is_some());
    }
}
