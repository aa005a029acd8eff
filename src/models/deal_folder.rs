//! Deal-folder mirror model.
//!
//! The mirror is the core's observed view of a deal's on-disk files. It is
//! reconciled against the filesystem by the queue manager; the filesystem
//! itself is never authored here. File entries reference queue items by id
//! only, keeping the ownership graph acyclic.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Synchronization state of a mirrored deal folder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Synced,
    Syncing,
    OutOfSync,
    Error,
    Conflict,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Synced => "synced",
            Self::Syncing => "syncing",
            Self::OutOfSync => "out_of_sync",
            Self::Error => "error",
            Self::Conflict => "conflict",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "synced" => Some(Self::Synced),
            "syncing" => Some(Self::Syncing),
            "out_of_sync" => Some(Self::OutOfSync),
            "error" => Some(Self::Error),
            "conflict" => Some(Self::Conflict),
            _ => None,
        }
    }
}

/// Processing state recorded against a mirrored file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingState {
    Unprocessed,
    Queued,
    Processing,
    Completed,
    Failed,
}

impl ProcessingState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unprocessed => "unprocessed",
            Self::Queued => "queued",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "unprocessed" => Some(Self::Unprocessed),
            "queued" => Some(Self::Queued),
            "processing" => Some(Self::Processing),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Observed state of a single file in a deal folder.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileEntry {
    pub modified_at: DateTime<Utc>,
    pub size: u64,
    /// SHA-256 of file content, hex-encoded.
    pub checksum: String,
    pub processing_state: ProcessingState,
    /// Id of the queue item processing this file, if one exists.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_item_id: Option<String>,
}

/// Error recorded during a folder walk.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncError {
    pub path: String,
    pub message: String,
    pub occurred_at: DateTime<Utc>,
}

/// Per-deal observed-filesystem snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DealFolderMirror {
    pub deal_name: String,
    pub folder_path: PathBuf,
    pub last_synced: DateTime<Utc>,
    pub sync_status: SyncStatus,
    pub file_count: u64,
    pub processed_files: u64,
    /// Relative file path (within the deal folder) to observed state.
    /// BTreeMap keeps snapshot serialization deterministic.
    #[serde(default)]
    pub file_structure: BTreeMap<String, FileEntry>,
    #[serde(default)]
    pub conflict_files: Vec<String>,
    #[serde(default)]
    pub sync_errors: Vec<SyncError>,
}

impl DealFolderMirror {
    pub fn new(deal_name: &str, folder_path: PathBuf) -> Self {
        Self {
            deal_name: deal_name.to_string(),
            folder_path,
            last_synced: Utc::now(),
            sync_status: SyncStatus::OutOfSync,
            file_count: 0,
            processed_files: 0,
            file_structure: BTreeMap::new(),
            conflict_files: Vec::new(),
            sync_errors: Vec::new(),
        }
    }

    /// Set the processing state for a file, creating no entry if the file
    /// is not mirrored yet. Returns whether an entry was updated.
    pub fn set_processing_state(
        &mut self,
        relative_path: &str,
        state: ProcessingState,
        queue_item_id: Option<&str>,
    ) -> bool {
        match self.file_structure.get_mut(relative_path) {
            Some(entry) => {
                entry.processing_state = state;
                if let Some(id) = queue_item_id {
                    entry.queue_item_id = Some(id.to_string());
                }
                self.processed_files = self
                    .file_structure
                    .values()
                    .filter(|e| e.processing_state == ProcessingState::Completed)
                    .count() as u64;
                true
            }
            None => false,
        }
    }

    /// Record a walk error and flag the mirror.
    pub fn record_sync_error(&mut self, path: &str, message: &str) {
        self.sync_errors.push(SyncError {
            path: path.to_string(),
            message: message.to_string(),
            occurred_at: Utc::now(),
        });
        self.sync_status = SyncStatus::Error;
    }
}
