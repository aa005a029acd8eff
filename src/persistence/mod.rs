//! Atomic JSON snapshot store.
//!
//! All durable state (queue, jobs, workflow recovery) is written through
//! this store. A snapshot is a single JSON object carrying `version`,
//! `timestamp` and `checksum` fields alongside the payload; writes go to a
//! `.tmp` sibling, fsync, then rename, so a crash mid-write leaves the
//! previous snapshot intact. The store is stateless and synchronous;
//! persistence cadence is the caller's concern.

use std::fs;
use std::io::Write;
use std::path::PathBuf;

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Current snapshot schema version. Readers accept this version exactly;
/// older versions go through explicit migration functions when they exist.
pub const SNAPSHOT_VERSION: &str = "1";

#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("snapshot I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("snapshot serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("corrupt snapshot: {0}")]
    Corrupt(String),
}

pub type Result<T> = std::result::Result<T, SnapshotError>;

/// Durable snapshot writer/reader rooted at a state directory.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    state_dir: PathBuf,
}

impl SnapshotStore {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
        }
    }

    pub fn path_for(&self, name: &str) -> PathBuf {
        self.state_dir.join(name)
    }

    /// Write a snapshot atomically.
    ///
    /// The payload must serialize to a JSON object; its fields land at the
    /// top level of the snapshot next to `version`, `timestamp` and
    /// `checksum`. The checksum covers the canonical serialization of the
    /// payload fields only.
    pub fn save<T: Serialize>(&self, name: &str, data: &T) -> Result<()> {
        let value = serde_json::to_value(data)?;
        let body = match value {
            serde_json::Value::Object(map) => map,
            other => {
                let mut map = serde_json::Map::new();
                map.insert("data".to_string(), other);
                map
            }
        };
        let checksum = checksum_of(&body)?;

        let mut envelope = serde_json::Map::new();
        envelope.insert("version".to_string(), SNAPSHOT_VERSION.into());
        envelope.insert(
            "timestamp".to_string(),
            Utc::now().timestamp_millis().into(),
        );
        envelope.insert("checksum".to_string(), checksum.into());
        for (key, val) in body {
            envelope.insert(key, val);
        }

        fs::create_dir_all(&self.state_dir)?;
        let path = self.path_for(name);
        let tmp_path = path.with_file_name(format!("{name}.tmp"));
        let bytes = serde_json::to_vec_pretty(&serde_json::Value::Object(envelope))?;

        let mut file = fs::File::create(&tmp_path)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
        fs::rename(&tmp_path, &path)?;

        tracing::debug!(snapshot = name, bytes = bytes.len(), "snapshot written");
        Ok(())
    }

    /// Read a snapshot back. A missing file is not an error; first-run
    /// callers get `None` and start empty.
    pub fn load<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>> {
        let path = self.path_for(name);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let value: serde_json::Value = serde_json::from_slice(&bytes)
            .map_err(|e| SnapshotError::Corrupt(format!("{name}: invalid JSON: {e}")))?;
        let serde_json::Value::Object(mut map) = value else {
            return Err(SnapshotError::Corrupt(format!(
                "{name}: snapshot is not a JSON object"
            )));
        };

        let version = map
            .remove("version")
            .and_then(|v| v.as_str().map(String::from))
            .ok_or_else(|| SnapshotError::Corrupt(format!("{name}: missing version")))?;
        if version != SNAPSHOT_VERSION {
            return Err(SnapshotError::Corrupt(format!(
                "{name}: unsupported snapshot version {version:?}"
            )));
        }
        map.remove("timestamp");
        let expected = map
            .remove("checksum")
            .and_then(|v| v.as_str().map(String::from))
            .ok_or_else(|| SnapshotError::Corrupt(format!("{name}: missing checksum")))?;

        let actual = checksum_of(&map)?;
        if actual != expected {
            return Err(SnapshotError::Corrupt(format!(
                "{name}: checksum mismatch (expected {expected}, computed {actual})"
            )));
        }

        let data = serde_json::from_value(serde_json::Value::Object(map))
            .map_err(|e| SnapshotError::Corrupt(format!("{name}: payload decode: {e}")))?;
        Ok(Some(data))
    }
}

/// Hex SHA-256 over the canonical serialization of the payload fields.
/// serde_json's object map is ordered, so serialization is deterministic.
fn checksum_of(body: &serde_json::Map<String, serde_json::Value>) -> Result<String> {
    let canonical = serde_json::to_vec(body)?;
    let mut hasher = Sha256::new();
    hasher.update(&canonical);
    Ok(hex::encode(hasher.finalize()))
}

/// Load a snapshot, treating corruption as first-run with a warning.
///
/// Background state must never prevent startup; a snapshot that fails to
/// decode is logged and abandoned.
pub fn load_or_default<T: DeserializeOwned + Default>(store: &SnapshotStore, name: &str) -> T {
    match store.load(name) {
        Ok(Some(data)) => data,
        Ok(None) => T::default(),
        Err(e) => {
            tracing::warn!(snapshot = name, error = %e, "discarding unreadable snapshot");
            T::default()
        }
    }
}
