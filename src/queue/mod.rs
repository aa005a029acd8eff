//! Queue manager.
//!
//! Ordered, priority-respecting queue of document work, the per-deal
//! folder mirror, and the bounded processing-history log. The queue slice,
//! mirror map and history are owned exclusively by this component; the
//! webhook gateway and CLI mutate them only through the public operations
//! here.
//!
//! Queue order is total: `(priority rank ascending, queued_at ascending)`.
//! New items are inserted at the first position preserving that order, so
//! dispatch always pops from the head and no re-sort ever happens.

mod enqueue;
mod loops;
mod mirror;
mod query;

pub use loops::Dispatcher;
pub use query::{QueueQuery, QueueStats, SortBy, SortOrder};

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::config::QueueConfig;
use crate::models::{DealFolderMirror, ProcessingHistory, QueueItem};
use crate::persistence::{SnapshotError, SnapshotStore};

/// Snapshot file name under the state directory.
pub const QUEUE_SNAPSHOT: &str = "queue.json";

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("document does not exist: {0}")]
    MissingFile(PathBuf),
    #[error("document already queued for deal {deal}: {path}")]
    Duplicate { deal: String, path: PathBuf },
    #[error("invalid deal name: {0}")]
    DealRejected(String),
    #[error("no queue item for job id {0}")]
    JobUnknown(String),
    #[error("unknown external workflow state: {0}")]
    UnknownState(String),
    #[error("queue manager already running")]
    AlreadyRunning,
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
}

pub type Result<T> = std::result::Result<T, QueueError>;

/// State guarded by the queue lock: the ordered queue and the history log.
/// The mirror map has its own lock so long filesystem walks never block
/// dispatch.
#[derive(Debug, Default)]
pub(crate) struct QueueState {
    pub items: Vec<QueueItem>,
    pub history: Vec<ProcessingHistory>,
}

impl QueueState {
    /// Insert preserving `(priority, queued_at)` order.
    pub fn insert_ordered(&mut self, item: QueueItem) {
        let key = (item.priority.rank(), item.queued_at);
        let pos = self
            .items
            .iter()
            .position(|existing| (existing.priority.rank(), existing.queued_at) > key)
            .unwrap_or(self.items.len());
        self.items.insert(pos, item);
    }
}

/// Durable snapshot of the queue manager.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueueSnapshot {
    queue: Vec<QueueItem>,
    deal_folders: BTreeMap<String, DealFolderMirror>,
    history: Vec<ProcessingHistory>,
    configuration: QueueConfig,
}

/// Handles for the running background loops.
struct RunningLoops {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

/// Ordered work queue with deal-folder mirror and processing history.
pub struct QueueManager {
    pub(crate) config: QueueConfig,
    pub(crate) deals_dir: PathBuf,
    pub(crate) store: SnapshotStore,
    pub(crate) state: RwLock<QueueState>,
    pub(crate) mirrors: RwLock<HashMap<String, DealFolderMirror>>,
    /// Items currently in Processing, bounded by `max_concurrent_jobs`.
    pub(crate) processing_count: AtomicUsize,
    /// Failures observed inside background loops. Loops never crash.
    pub(crate) loop_errors: AtomicU64,
    /// In-memory dispatch backoff: item id to earliest next attempt.
    pub(crate) retry_not_before: Mutex<HashMap<String, Instant>>,
    /// Loop heartbeats surfaced through stats and health.
    pub(crate) heartbeats: RwLock<HashMap<&'static str, DateTime<Utc>>>,
    running: Mutex<Option<RunningLoops>>,
}

impl QueueManager {
    pub fn new(config: QueueConfig, deals_dir: PathBuf, store: SnapshotStore) -> Self {
        Self {
            config,
            deals_dir,
            store,
            state: RwLock::new(QueueState::default()),
            mirrors: RwLock::new(HashMap::new()),
            processing_count: AtomicUsize::new(0),
            loop_errors: AtomicU64::new(0),
            retry_not_before: Mutex::new(HashMap::new()),
            heartbeats: RwLock::new(HashMap::new()),
            running: Mutex::new(None),
        }
    }

    /// Restore queue, mirrors and history from the snapshot store. Corrupt
    /// snapshots are logged and treated as first-run. Items left in
    /// Processing by a crash are requeued as Pending.
    pub async fn load_from_store(&self) {
        let snapshot: QueueSnapshot = crate::persistence::load_or_default(&self.store, QUEUE_SNAPSHOT);

        let mut state = self.state.write().await;
        state.history = snapshot.history;
        state.items.clear();
        for mut item in snapshot.queue {
            if item.status == crate::models::QueueItemStatus::Processing {
                tracing::warn!(item = %item.id, "requeueing item interrupted mid-processing");
                item.status = crate::models::QueueItemStatus::Pending;
            }
            state.insert_ordered(item);
        }
        drop(state);

        let mut mirrors = self.mirrors.write().await;
        *mirrors = snapshot.deal_folders.into_iter().collect();
    }

    /// Write the full queue state through the snapshot store.
    pub async fn persist(&self) -> Result<()> {
        let state = self.state.read().await;
        let mirrors = self.mirrors.read().await;
        let snapshot = QueueSnapshot {
            queue: state.items.clone(),
            deal_folders: mirrors
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            history: state.history.clone(),
            configuration: self.config.clone(),
        };
        drop(state);
        drop(mirrors);
        self.store.save(QUEUE_SNAPSHOT, &snapshot)?;
        Ok(())
    }

    /// Start the dispatch, health, persistence and cleanup loops.
    pub async fn start(self: &Arc<Self>, dispatcher: Arc<dyn Dispatcher>) -> Result<()> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(QueueError::AlreadyRunning);
        }
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handles = loops::spawn_all(self.clone(), dispatcher, shutdown_rx);
        *running = Some(RunningLoops {
            shutdown: shutdown_tx,
            handles,
        });
        tracing::info!("queue manager started");
        Ok(())
    }

    /// Stop all loops and write a final snapshot. Idempotent.
    pub async fn stop(&self) -> Result<()> {
        let Some(loops) = self.running.lock().await.take() else {
            return Ok(());
        };
        let _ = loops.shutdown.send(true);
        for handle in loops.handles {
            let _ = handle.await;
        }
        self.persist().await?;
        tracing::info!("queue manager stopped");
        Ok(())
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    /// Verify internal invariants. Returns a description of the first
    /// violation found, if any.
    pub async fn is_healthy(&self) -> std::result::Result<(), String> {
        let state = self.state.read().await;

        let mut in_flight: HashMap<(&str, &std::path::Path), u32> = HashMap::new();
        for item in &state.items {
            if item.status.is_in_flight() {
                *in_flight
                    .entry((item.deal_name.as_str(), item.document_path.as_path()))
                    .or_default() += 1;
            }
            if item.status == crate::models::QueueItemStatus::Processing
                && item.processing_started.is_none()
            {
                return Err(format!("item {} processing without a start time", item.id));
            }
            if item.status.is_terminal() && item.processing_ended.is_none() {
                return Err(format!("item {} terminal without an end time", item.id));
            }
            if item.retry_count > self.config.max_retry_attempts {
                return Err(format!(
                    "item {} exceeded retry bound: {}",
                    item.id, item.retry_count
                ));
            }
        }
        if let Some(((deal, path), count)) = in_flight.iter().find(|(_, c)| **c > 1) {
            return Err(format!(
                "{count} in-flight items for deal {deal} path {}",
                path.display()
            ));
        }

        let known_ids: std::collections::HashSet<&str> = state
            .items
            .iter()
            .map(|i| i.id.as_str())
            .chain(state.history.iter().map(|h| h.id.as_str()))
            .collect();
        let mirrors = self.mirrors.read().await;
        for mirror in mirrors.values() {
            for (path, entry) in &mirror.file_structure {
                if let Some(id) = &entry.queue_item_id {
                    if !known_ids.contains(id.as_str()) {
                        return Err(format!(
                            "mirror {} file {path} references unknown item {id}",
                            mirror.deal_name
                        ));
                    }
                }
            }
        }
        Ok(())
    }

    pub(crate) fn record_loop_error(&self, loop_name: &str, error: &dyn std::fmt::Display) {
        self.loop_errors.fetch_add(1, Ordering::Relaxed);
        tracing::error!(loop_name, %error, "background loop iteration failed");
    }

    pub(crate) async fn beat(&self, loop_name: &'static str) {
        self.heartbeats.write().await.insert(loop_name, Utc::now());
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Priority, QueueItemStatus};
    use tempfile::tempdir;
    use test_support::{enqueue, manager};

    struct NullDispatcher;

    #[async_trait::async_trait]
    impl Dispatcher for NullDispatcher {
        async fn dispatch(&self, _item: &QueueItem) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_start_twice_rejected() {
        let dir = tempdir().unwrap();
        let (qm, _) = manager(dir.path()).await;
        qm.start(Arc::new(NullDispatcher)).await.unwrap();
        let err = qm.start(Arc::new(NullDispatcher)).await.unwrap_err();
        assert!(matches!(err, QueueError::AlreadyRunning));
        qm.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let dir = tempdir().unwrap();
        let (qm, _) = manager(dir.path()).await;
        qm.stop().await.unwrap();
        qm.start(Arc::new(NullDispatcher)).await.unwrap();
        qm.stop().await.unwrap();
        qm.stop().await.unwrap();
        assert!(!qm.is_running().await);
    }

    #[tokio::test]
    async fn test_stop_writes_final_snapshot() {
        let dir = tempdir().unwrap();
        let (qm, deals_dir) = manager(dir.path()).await;
        qm.start(Arc::new(NullDispatcher)).await.unwrap();
        enqueue(&qm, &deals_dir, "D", "a.pdf", Priority::Normal).await;
        qm.stop().await.unwrap();
        assert!(qm.store.path_for(QUEUE_SNAPSHOT).exists());
    }

    #[tokio::test]
    async fn test_snapshot_roundtrip_requeues_processing() {
        let dir = tempdir().unwrap();
        let (qm, deals_dir) = manager(dir.path()).await;
        let item = enqueue(&qm, &deals_dir, "D", "a.pdf", Priority::Normal).await;

        {
            let mut state = qm.state.write().await;
            let stored = state.items.iter_mut().find(|i| i.id == item.id).unwrap();
            stored.mark_processing(Utc::now());
        }
        qm.persist().await.unwrap();

        let (restored, _) = manager(dir.path()).await;
        restored.load_from_store().await;
        let state = restored.state.read().await;
        assert_eq!(state.items.len(), 1);
        assert_eq!(state.items[0].status, QueueItemStatus::Pending);
    }

    #[tokio::test]
    async fn test_insert_ordered_property() {
        // Invariant: any enqueue sequence leaves the queue ordered by
        // (priority rank, queued_at).
        let dir = tempdir().unwrap();
        let (qm, deals_dir) = manager(dir.path()).await;
        let priorities = [
            Priority::Low,
            Priority::High,
            Priority::Normal,
            Priority::High,
            Priority::Low,
            Priority::Normal,
        ];
        for (i, priority) in priorities.iter().enumerate() {
            enqueue(&qm, &deals_dir, "D", &format!("doc{i}.pdf"), *priority).await;
        }

        let state = qm.state.read().await;
        let keys: Vec<(u8, DateTime<Utc>)> = state
            .items
            .iter()
            .map(|i| (i.priority.rank(), i.queued_at))
            .collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
    }

    #[tokio::test]
    async fn test_health_detects_retry_violation() {
        let dir = tempdir().unwrap();
        let (qm, deals_dir) = manager(dir.path()).await;
        let item = enqueue(&qm, &deals_dir, "D", "a.pdf", Priority::Normal).await;
        {
            let mut state = qm.state.write().await;
            let stored = state.items.iter_mut().find(|i| i.id == item.id).unwrap();
            stored.retry_count = 99;
        }
        assert!(qm.is_healthy().await.is_err());
    }

    #[tokio::test]
    async fn test_health_ok_on_fresh_queue() {
        let dir = tempdir().unwrap();
        let (qm, _) = manager(dir.path()).await;
        assert!(qm.is_healthy().await.is_ok());
    }
}
