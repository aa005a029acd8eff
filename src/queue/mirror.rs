//! Deal-folder mirror maintenance.
//!
//! The mirror reconciles observed filesystem state into the per-deal
//! `DealFolderMirror`. Walks happen without the mirror lock held; only the
//! final reconciliation takes the write side, so dispatch never waits on a
//! slow directory tree.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

use super::QueueManager;
use crate::models::{DealFolderMirror, FileEntry, ProcessingState, SyncStatus};

/// Hex SHA-256 of a file's content.
pub(crate) fn file_checksum(path: &Path) -> std::io::Result<String> {
    let content = fs::read(path)?;
    let mut hasher = Sha256::new();
    hasher.update(&content);
    Ok(hex::encode(hasher.finalize()))
}

/// Mirror key for a document: path relative to the deal folder when the
/// document lives inside it, the full path otherwise.
fn mirror_key(deal_folder: &Path, document_path: &Path) -> String {
    document_path
        .strip_prefix(deal_folder)
        .unwrap_or(document_path)
        .to_string_lossy()
        .into_owned()
}

fn observed_entry(path: &Path) -> std::io::Result<FileEntry> {
    let meta = fs::metadata(path)?;
    let modified_at: DateTime<Utc> = meta.modified().map(DateTime::from).unwrap_or_else(|_| Utc::now());
    Ok(FileEntry {
        modified_at,
        size: meta.len(),
        checksum: file_checksum(path)?,
        processing_state: ProcessingState::Unprocessed,
        queue_item_id: None,
    })
}

/// Recursively collect regular files under `root`, recording unreadable
/// subtrees instead of aborting the walk.
fn collect_files(
    root: &Path,
    dir: &Path,
    out: &mut Vec<(String, FileEntry)>,
    errors: &mut Vec<(String, String)>,
) {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            errors.push((dir.display().to_string(), e.to_string()));
            return;
        }
    };
    for entry in entries {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                errors.push((dir.display().to_string(), e.to_string()));
                continue;
            }
        };
        let path = entry.path();
        if path.is_dir() {
            collect_files(root, &path, out, errors);
        } else {
            match observed_entry(&path) {
                Ok(observed) => out.push((mirror_key(root, &path), observed)),
                Err(e) => errors.push((path.display().to_string(), e.to_string())),
            }
        }
    }
}

impl QueueManager {
    /// Current mirror for a deal, if one exists.
    pub async fn deal_mirror(&self, deal_name: &str) -> Option<DealFolderMirror> {
        self.mirrors.read().await.get(deal_name).cloned()
    }

    /// Walk a deal folder and reconcile the mirror against what is on
    /// disk: new files are added, vanished files removed, checksums
    /// refreshed. Walk errors are recorded on the mirror rather than
    /// returned.
    pub async fn sync_deal_folder(&self, deal_name: &str) -> DealFolderMirror {
        let folder = self.deals_dir.join(deal_name);

        {
            let mut mirrors = self.mirrors.write().await;
            let mirror = mirrors
                .entry(deal_name.to_string())
                .or_insert_with(|| DealFolderMirror::new(deal_name, folder.clone()));
            mirror.sync_status = SyncStatus::Syncing;
        }

        // Walk outside the lock.
        let mut observed = Vec::new();
        let mut errors = Vec::new();
        if folder.is_dir() {
            collect_files(&folder, &folder, &mut observed, &mut errors);
        } else {
            errors.push((
                folder.display().to_string(),
                "deal folder does not exist".to_string(),
            ));
        }

        let mut mirrors = self.mirrors.write().await;
        let mirror = mirrors
            .entry(deal_name.to_string())
            .or_insert_with(|| DealFolderMirror::new(deal_name, folder.clone()));

        let mut fresh = std::collections::BTreeMap::new();
        for (key, mut entry) in observed {
            if let Some(previous) = mirror.file_structure.get(&key) {
                // Processing bookkeeping survives a re-walk; content state
                // is refreshed from disk.
                entry.processing_state = previous.processing_state;
                entry.queue_item_id = previous.queue_item_id.clone();
            }
            fresh.insert(key, entry);
        }
        mirror.file_structure = fresh;
        mirror.file_count = mirror.file_structure.len() as u64;
        mirror.processed_files = mirror
            .file_structure
            .values()
            .filter(|e| e.processing_state == ProcessingState::Completed)
            .count() as u64;
        mirror.last_synced = Utc::now();

        if errors.is_empty() {
            mirror.sync_status = SyncStatus::Synced;
        } else {
            for (path, message) in &errors {
                tracing::warn!(deal = deal_name, path, message, "deal folder sync error");
                mirror.record_sync_error(path, message);
            }
        }
        mirror.clone()
    }

    /// Set the processing state for one document in a deal's mirror,
    /// creating the mirror and the file entry as needed.
    pub(crate) async fn mark_mirror_file(
        &self,
        deal_name: &str,
        document_path: &Path,
        state: ProcessingState,
        queue_item_id: Option<&str>,
    ) {
        let folder: PathBuf = self.deals_dir.join(deal_name);
        let key = mirror_key(&folder, document_path);

        let mut mirrors = self.mirrors.write().await;
        let mirror = mirrors
            .entry(deal_name.to_string())
            .or_insert_with(|| DealFolderMirror::new(deal_name, folder.clone()));

        if !mirror.file_structure.contains_key(&key) {
            match observed_entry(document_path) {
                Ok(entry) => {
                    mirror.file_structure.insert(key.clone(), entry);
                    mirror.file_count = mirror.file_structure.len() as u64;
                }
                Err(e) => {
                    tracing::debug!(
                        deal = deal_name,
                        path = %document_path.display(),
                        error = %e,
                        "document not observable for mirror entry"
                    );
                    return;
                }
            }
        }
        mirror.set_processing_state(&key, state, queue_item_id);
    }
}
