//! Workflow recovery service.
//!
//! Executes multi-step workflows with contracted retry, recovery,
//! partial-result and resume behavior. The service owns the executions map
//! exclusively; step work is delegated to a caller-supplied `StepExecutor`
//! and failures are reported through a pluggable `Notifier`. The service
//! never constructs either collaborator itself.

mod backoff;
mod classify;
mod execute;

pub use backoff::RetryPolicy;
pub use classify::{classify_severity, error_type_of, is_non_retryable};

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{watch, Mutex, RwLock};

use crate::config::RecoveryConfig;
use crate::models::{
    ErrorLogEntry, ExecutionStatus, WorkflowExecution, WorkflowStep, WorkflowType,
};
use crate::persistence::{SnapshotError, SnapshotStore};

/// Snapshot file name under the state directory.
pub const RECOVERY_SNAPSHOT: &str = "workflow_recovery.json";

#[derive(Error, Debug)]
pub enum RecoveryError {
    #[error("execution not found: {0}")]
    NotFound(String),
    #[error("invalid workflow: {0}")]
    Validation(String),
    #[error("step {step} depends on unknown step {dependency}")]
    DependencyUnmet { step: String, dependency: String },
    #[error("execution canceled by shutdown")]
    Canceled,
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
}

pub type Result<T> = std::result::Result<T, RecoveryError>;

/// Performs one step's work. Implemented outside the core; the service
/// only drives attempts, classification and recovery.
#[async_trait::async_trait]
pub trait StepExecutor: Send + Sync {
    /// Run one step; the returned value becomes the step's partial result.
    async fn execute_step(
        &self,
        execution: &WorkflowExecution,
        step: &WorkflowStep,
    ) -> anyhow::Result<serde_json::Value>;

    /// Check a step before its first attempt.
    fn validate_step(&self, step: &WorkflowStep) -> anyhow::Result<()> {
        let _ = step;
        Ok(())
    }

    /// Undo a step's effects after a critical failure.
    async fn rollback_step(
        &self,
        execution: &WorkflowExecution,
        step: &WorkflowStep,
    ) -> anyhow::Result<()>;
}

/// Receives recovery events. The default implementation logs.
#[async_trait::async_trait]
pub trait Notifier: Send + Sync {
    async fn notify_error(&self, execution: &WorkflowExecution, entry: &ErrorLogEntry);
    async fn notify_critical_failure(&self, execution: &WorkflowExecution, entry: &ErrorLogEntry);
    async fn notify_recovery_success(&self, execution: &WorkflowExecution);
}

/// Notifier that writes structured log events.
#[derive(Debug, Default)]
pub struct TracingNotifier;

#[async_trait::async_trait]
impl Notifier for TracingNotifier {
    async fn notify_error(&self, execution: &WorkflowExecution, entry: &ErrorLogEntry) {
        tracing::warn!(
            execution = %execution.id,
            step = %entry.step_id,
            severity = entry.severity.as_str(),
            error = %entry.message,
            "workflow step error"
        );
    }

    async fn notify_critical_failure(&self, execution: &WorkflowExecution, entry: &ErrorLogEntry) {
        tracing::error!(
            execution = %execution.id,
            step = %entry.step_id,
            error = %entry.message,
            "critical workflow failure"
        );
    }

    async fn notify_recovery_success(&self, execution: &WorkflowExecution) {
        tracing::info!(execution = %execution.id, "workflow recovered");
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RecoverySnapshot {
    executions: Vec<WorkflowExecution>,
}

/// Supervises workflow executions.
pub struct RecoveryService {
    pub(crate) config: RecoveryConfig,
    pub(crate) policy: RetryPolicy,
    pub(crate) notifier: Arc<dyn Notifier>,
    store: SnapshotStore,
    executions: RwLock<HashMap<String, Arc<Mutex<WorkflowExecution>>>>,
    shutdown_tx: watch::Sender<bool>,
    pub(crate) shutdown_rx: watch::Receiver<bool>,
}

impl RecoveryService {
    pub fn new(config: RecoveryConfig, store: SnapshotStore, notifier: Arc<dyn Notifier>) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            policy: RetryPolicy::from_config(&config),
            config,
            notifier,
            store,
            executions: RwLock::new(HashMap::new()),
            shutdown_tx,
            shutdown_rx,
        }
    }

    /// Register a new execution. Step ids must be unique and dependencies
    /// must reference steps in the same workflow.
    pub async fn create_execution(
        &self,
        workflow_type: WorkflowType,
        deal_id: &str,
        document_id: &str,
        steps: Vec<WorkflowStep>,
    ) -> Result<WorkflowExecution> {
        if steps.is_empty() {
            return Err(RecoveryError::Validation("workflow has no steps".to_string()));
        }
        let mut seen: HashSet<&str> = HashSet::new();
        for step in &steps {
            if !seen.insert(step.id.as_str()) {
                return Err(RecoveryError::Validation(format!(
                    "duplicate step id: {}",
                    step.id
                )));
            }
        }
        for step in &steps {
            for dep in &step.dependencies {
                if !seen.contains(dep.as_str()) {
                    return Err(RecoveryError::DependencyUnmet {
                        step: step.id.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }

        let execution = WorkflowExecution::new(workflow_type, deal_id, document_id, steps);
        self.executions
            .write()
            .await
            .insert(execution.id.clone(), Arc::new(Mutex::new(execution.clone())));
        tracing::info!(
            execution = %execution.id,
            workflow = workflow_type.as_str(),
            deal = deal_id,
            "execution created"
        );
        Ok(execution)
    }

    pub(crate) async fn execution_handle(
        &self,
        execution_id: &str,
    ) -> Result<Arc<Mutex<WorkflowExecution>>> {
        self.executions
            .read()
            .await
            .get(execution_id)
            .cloned()
            .ok_or_else(|| RecoveryError::NotFound(execution_id.to_string()))
    }

    pub async fn get_execution(&self, execution_id: &str) -> Option<WorkflowExecution> {
        let handle = self.executions.read().await.get(execution_id).cloned()?;
        let execution = handle.lock().await;
        Some(execution.clone())
    }

    pub async fn executions_by_status(&self, status: ExecutionStatus) -> Vec<WorkflowExecution> {
        let handles: Vec<Arc<Mutex<WorkflowExecution>>> =
            self.executions.read().await.values().cloned().collect();
        let mut matching = Vec::new();
        for handle in handles {
            let execution = handle.lock().await;
            if execution.status == status {
                matching.push(execution.clone());
            }
        }
        matching.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        matching
    }

    /// Drop terminal executions older than the retention window. Returns
    /// how many were removed.
    pub async fn cleanup_old_executions(&self) -> usize {
        let cutoff =
            chrono::Utc::now() - chrono::Duration::days(self.config.error_log_retention_days);
        let mut executions = self.executions.write().await;
        let mut expired = Vec::new();
        for (id, handle) in executions.iter() {
            let execution = handle.lock().await;
            if execution.status.is_terminal() && execution.updated_at < cutoff {
                expired.push(id.clone());
            }
        }
        for id in &expired {
            executions.remove(id);
        }
        if !expired.is_empty() {
            tracing::info!(removed = expired.len(), "old executions cleaned up");
        }
        expired.len()
    }

    /// Error counts by error type across every execution's audit log.
    pub async fn error_statistics(&self) -> BTreeMap<String, u64> {
        let handles: Vec<Arc<Mutex<WorkflowExecution>>> =
            self.executions.read().await.values().cloned().collect();
        let mut stats: BTreeMap<String, u64> = BTreeMap::new();
        for handle in handles {
            let execution = handle.lock().await;
            for entry in &execution.error_log {
                if entry.error_type != "step_success" {
                    *stats.entry(entry.error_type.clone()).or_default() += 1;
                }
            }
        }
        stats
    }

    /// Cancel all in-flight executions. Steps observe cancellation at the
    /// next attempt boundary.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Write all executions through the snapshot store.
    pub async fn persist(&self) -> Result<()> {
        let handles: Vec<Arc<Mutex<WorkflowExecution>>> =
            self.executions.read().await.values().cloned().collect();
        let mut list = Vec::with_capacity(handles.len());
        for handle in handles {
            list.push(handle.lock().await.clone());
        }
        list.sort_by(|a, b| a.id.cmp(&b.id));
        self.store
            .save(RECOVERY_SNAPSHOT, &RecoverySnapshot { executions: list })?;
        Ok(())
    }

    /// Restore executions from the snapshot store. Executions caught
    /// mid-run by a crash come back Paused so a resume can pick them up.
    pub async fn load_from_store(&self) {
        let snapshot: RecoverySnapshot =
            crate::persistence::load_or_default(&self.store, RECOVERY_SNAPSHOT);
        let mut executions = self.executions.write().await;
        for mut execution in snapshot.executions {
            if matches!(
                execution.status,
                ExecutionStatus::Running | ExecutionStatus::Resumed
            ) {
                execution.status = ExecutionStatus::Paused;
            }
            executions.insert(execution.id.clone(), Arc::new(Mutex::new(execution)));
        }
        tracing::info!(executions = executions.len(), "recovery service restored");
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    /// Notifier that counts invocations.
    #[derive(Default)]
    pub struct CountingNotifier {
        pub errors: AtomicUsize,
        pub criticals: AtomicUsize,
        pub recoveries: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl Notifier for CountingNotifier {
        async fn notify_error(&self, _execution: &WorkflowExecution, _entry: &ErrorLogEntry) {
            self.errors.fetch_add(1, Ordering::SeqCst);
        }

        async fn notify_critical_failure(
            &self,
            _execution: &WorkflowExecution,
            _entry: &ErrorLogEntry,
        ) {
            self.criticals.fetch_add(1, Ordering::SeqCst);
        }

        async fn notify_recovery_success(&self, _execution: &WorkflowExecution) {
            self.recoveries.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Service with fast, deterministic retry timing.
    pub fn service(dir: &TempDir) -> (Arc<RecoveryService>, Arc<CountingNotifier>) {
        let config = RecoveryConfig {
            initial_delay_ms: 1,
            max_delay_ms: 10,
            backoff_factor: 2.0,
            max_retries: 3,
            jitter: false,
            ..Default::default()
        };
        service_with_config(dir, config)
    }

    pub fn service_with_config(
        dir: &TempDir,
        config: RecoveryConfig,
    ) -> (Arc<RecoveryService>, Arc<CountingNotifier>) {
        let notifier = Arc::new(CountingNotifier::default());
        let store = SnapshotStore::new(dir.path().join("state"));
        let service = Arc::new(RecoveryService::new(config, store, notifier.clone()));
        (service, notifier)
    }
}
