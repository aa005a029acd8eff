//! Workflow execution and resume.
//!
//! Steps run strictly sequentially by index. Each failed attempt is
//! classified by severity and retryability, then a recovery strategy is
//! selected in fixed order: Rollback for critical failures on steps that
//! can roll back, Skip for high-severity failures on skippable steps,
//! Retry while attempts remain, Fallback when step metadata opts in, and
//! ManualIntervention as the floor.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex;

use super::{classify, RecoveryError, RecoveryService, Result, StepExecutor};
use crate::models::{
    ErrorLogEntry, ErrorSeverity, ExecutionStatus, RecoveryStrategy, StepStatus,
    WorkflowExecution, WorkflowStep,
};

/// Fallback variants attempted in order when a step opts into fallback
/// recovery. The variant name is handed to the executor through step
/// metadata under `fallback_variant`.
const FALLBACK_VARIANTS: [&str; 3] = [
    "use_cached_result",
    "use_default_values",
    "simplified_processing",
];

/// Outcome of driving one step to a terminal state.
enum StepOutcome {
    Completed,
    Skipped,
    RolledBack,
    Manual,
}

impl RecoveryService {
    /// Run an execution from its current position until every step is
    /// terminal or an unrecoverable failure occurs.
    pub async fn execute_workflow(
        &self,
        execution_id: &str,
        executor: &dyn StepExecutor,
    ) -> Result<WorkflowExecution> {
        let handle = self.execution_handle(execution_id).await?;
        self.run_to_completion(handle, executor, false).await
    }

    /// Resume a Paused or Failed execution: Failed steps reset to Pending
    /// with a fresh retry budget, then the run continues from the earliest
    /// non-terminal step. Resuming a Completed execution is a no-op.
    pub async fn resume_workflow(
        &self,
        execution_id: &str,
        executor: &dyn StepExecutor,
    ) -> Result<WorkflowExecution> {
        let handle = self.execution_handle(execution_id).await?;
        {
            let mut execution = handle.lock().await;
            if execution.status == ExecutionStatus::Completed {
                return Ok(execution.clone());
            }
            for step in execution.steps.iter_mut() {
                if step.status == StepStatus::Failed || step.status == StepStatus::Running {
                    step.status = StepStatus::Pending;
                    step.retry_count = 0;
                }
            }
            if let Some(idx) = execution.next_open_step() {
                execution.current_step_index = idx;
            }
            execution.status = ExecutionStatus::Resumed;
            execution.updated_at = Utc::now();
        }
        self.run_to_completion(handle, executor, true).await
    }

    async fn run_to_completion(
        &self,
        handle: Arc<Mutex<WorkflowExecution>>,
        executor: &dyn StepExecutor,
        resumed: bool,
    ) -> Result<WorkflowExecution> {
        {
            let mut execution = handle.lock().await;
            if execution.status.is_terminal() {
                return Ok(execution.clone());
            }
            if !resumed {
                execution.status = ExecutionStatus::Running;
            }
            execution.updated_at = Utc::now();
        }

        // Set when a step that cannot be skipped is forced out by a failed
        // dependency; the execution then fails even if later steps pass.
        let mut forced_failure = false;

        loop {
            let step_index = {
                let mut execution = handle.lock().await;
                let Some(idx) = execution.next_open_step() else {
                    break;
                };
                execution.current_step_index = idx;
                let step = execution.steps[idx].clone();

                if execution.dependencies_blocked(&step) {
                    execution.steps[idx].status = StepStatus::Skipped;
                    if !step.can_skip {
                        forced_failure = true;
                    }
                    push_entry(
                        &mut execution,
                        &step.id,
                        "skip",
                        "skipped: dependency failed or was rolled back",
                        ErrorSeverity::Low,
                        serde_json::json!({"reason": "dependency"}),
                        None,
                        true,
                        Some("dependents of a failed step are not executed"),
                    );
                    continue;
                }
                if !execution.dependencies_satisfied(&step) {
                    // A dependency on a later step can never be met under
                    // sequential execution.
                    execution.steps[idx].status = StepStatus::Failed;
                    forced_failure = true;
                    push_entry(
                        &mut execution,
                        &step.id,
                        "dependency_unmet",
                        "dependency not in a satisfiable state",
                        ErrorSeverity::Medium,
                        serde_json::json!({"dependencies": step.dependencies}),
                        None,
                        false,
                        None,
                    );
                    continue;
                }

                execution.steps[idx].status = StepStatus::Running;
                idx
            };

            match self.run_step(&handle, executor, step_index).await? {
                StepOutcome::Completed | StepOutcome::Skipped => continue,
                StepOutcome::RolledBack => {
                    let mut execution = handle.lock().await;
                    execution.status = ExecutionStatus::Failed;
                    execution.updated_at = Utc::now();
                    return Ok(execution.clone());
                }
                StepOutcome::Manual => {
                    let mut execution = handle.lock().await;
                    execution.status = ExecutionStatus::Paused;
                    execution.updated_at = Utc::now();
                    return Ok(execution.clone());
                }
            }
        }

        let mut execution = handle.lock().await;
        execution.status = if !forced_failure && execution.all_steps_succeeded() {
            ExecutionStatus::Completed
        } else {
            ExecutionStatus::Failed
        };
        execution.updated_at = Utc::now();
        if resumed && execution.status == ExecutionStatus::Completed {
            self.notifier.notify_recovery_success(&execution).await;
        }
        Ok(execution.clone())
    }

    /// Drive one step to a terminal status through retries and recovery.
    async fn run_step(
        &self,
        handle: &Arc<Mutex<WorkflowExecution>>,
        executor: &dyn StepExecutor,
        idx: usize,
    ) -> Result<StepOutcome> {
        let (snapshot, step) = {
            let execution = handle.lock().await;
            (execution.clone(), execution.steps[idx].clone())
        };

        if let Err(e) = executor.validate_step(&step) {
            // Validation failures never consume the retry budget.
            let message = format!("validation: {e}");
            return self
                .recover(handle, executor, idx, &snapshot, &step, &message)
                .await;
        }

        let max_retries = step.max_retries.min(self.policy.max_retries);
        let mut retry = step.retry_count;
        let mut cancel = self.shutdown_rx.clone();

        loop {
            if *cancel.borrow() {
                return self.handle_cancellation(handle, idx).await;
            }
            if retry > 0 {
                let delay = self.policy.delay(retry);
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.changed() => {
                        return self.handle_cancellation(handle, idx).await;
                    }
                }
            }

            let result = match step.timeout_secs {
                Some(secs) => {
                    match tokio::time::timeout(
                        std::time::Duration::from_secs(secs),
                        executor.execute_step(&snapshot, &step),
                    )
                    .await
                    {
                        Ok(result) => result,
                        Err(_) => Err(anyhow::anyhow!("timeout: step exceeded {secs}s")),
                    }
                }
                None => executor.execute_step(&snapshot, &step).await,
            };

            match result {
                Ok(value) => {
                    let mut execution = handle.lock().await;
                    execution.steps[idx].status = StepStatus::Completed;
                    self.checkpoint(&mut execution, &step.id, value);
                    push_entry(
                        &mut execution,
                        &step.id,
                        "step_success",
                        "step completed",
                        ErrorSeverity::Low,
                        serde_json::json!({"attempt": retry + 1}),
                        None,
                        true,
                        None,
                    );
                    execution.updated_at = Utc::now();
                    return Ok(StepOutcome::Completed);
                }
                Err(e) => {
                    let message = e.to_string();
                    let severity = classify::classify_severity(&message);
                    let non_retryable = classify::is_non_retryable(&message);

                    let entry = {
                        let mut execution = handle.lock().await;
                        execution.steps[idx].retry_count = retry;
                        let stack_trace = (severity == ErrorSeverity::Critical)
                            .then(|| format!("{e:?}"));
                        push_entry(
                            &mut execution,
                            &step.id,
                            classify::error_type_of(&message),
                            &message,
                            severity,
                            serde_json::json!({
                                "attempt": retry + 1,
                                "stepName": step.name,
                            }),
                            stack_trace,
                            false,
                            None,
                        );
                        execution.error_log.last().cloned()
                    };
                    if let Some(entry) = entry {
                        if severity >= self.config.notification_threshold {
                            self.notifier.notify_error(&snapshot, &entry).await;
                        }
                        if severity == ErrorSeverity::Critical {
                            self.notifier.notify_critical_failure(&snapshot, &entry).await;
                        }
                    }

                    // Critical and non-retryable errors go straight to
                    // strategy selection; everything else retries first.
                    let may_retry =
                        !non_retryable && severity < ErrorSeverity::Critical && retry < max_retries;
                    if may_retry {
                        retry += 1;
                        let mut execution = handle.lock().await;
                        execution.steps[idx].retry_count = retry;
                        execution.total_retries += 1;
                        execution.recovery_strategy = Some(RecoveryStrategy::Retry);
                        continue;
                    }

                    return self
                        .recover(handle, executor, idx, &snapshot, &step, &message)
                        .await;
                }
            }
        }
    }

    /// Strategy selection after retries are exhausted or bypassed.
    #[allow(clippy::too_many_arguments)]
    async fn recover(
        &self,
        handle: &Arc<Mutex<WorkflowExecution>>,
        executor: &dyn StepExecutor,
        idx: usize,
        snapshot: &WorkflowExecution,
        step: &WorkflowStep,
        message: &str,
    ) -> Result<StepOutcome> {
        let severity = classify::classify_severity(message);

        if severity == ErrorSeverity::Critical && step.can_rollback {
            let rollback_result = executor.rollback_step(snapshot, step).await;
            let mut execution = handle.lock().await;
            execution.steps[idx].status = StepStatus::RolledBack;
            execution.recovery_strategy = Some(RecoveryStrategy::Rollback);
            match rollback_result {
                Ok(()) => push_entry(
                    &mut execution,
                    &step.id,
                    "rollback",
                    message,
                    severity,
                    serde_json::json!({"stepName": step.name}),
                    None,
                    true,
                    Some("step rolled back"),
                ),
                Err(e) => push_entry(
                    &mut execution,
                    &step.id,
                    "rollback",
                    &format!("rollback failed: {e}"),
                    ErrorSeverity::Critical,
                    serde_json::json!({"stepName": step.name}),
                    Some(format!("{e:?}")),
                    false,
                    None,
                ),
            }
            return Ok(StepOutcome::RolledBack);
        }

        if severity == ErrorSeverity::High && step.can_skip {
            let mut execution = handle.lock().await;
            execution.steps[idx].status = StepStatus::Skipped;
            execution.recovery_strategy = Some(RecoveryStrategy::Skip);
            let key = WorkflowExecution::partial_result_key(&step.id);
            execution
                .partial_results
                .entry(key)
                .or_insert_with(|| serde_json::json!("skipped"));
            push_entry(
                &mut execution,
                &step.id,
                "skip",
                message,
                severity,
                serde_json::json!({"stepName": step.name}),
                None,
                true,
                Some("step skipped"),
            );
            return Ok(StepOutcome::Skipped);
        }

        // Retryable low/medium errors only reach here with the budget
        // spent, so the Retry row of the strategy table never re-fires.

        if step.has_fallback() {
            for variant in FALLBACK_VARIANTS {
                let mut fallback_step = step.clone();
                if let Some(meta) = fallback_step.metadata.as_object_mut() {
                    meta.insert("fallback_variant".to_string(), variant.into());
                }
                match executor.execute_step(snapshot, &fallback_step).await {
                    Ok(value) => {
                        let mut execution = handle.lock().await;
                        execution.steps[idx].status = StepStatus::Completed;
                        execution.recovery_strategy = Some(RecoveryStrategy::Fallback);
                        self.checkpoint(&mut execution, &step.id, value);
                        push_entry(
                            &mut execution,
                            &step.id,
                            "fallback",
                            message,
                            severity,
                            serde_json::json!({"variant": variant}),
                            None,
                            true,
                            Some("fallback succeeded"),
                        );
                        return Ok(StepOutcome::Completed);
                    }
                    Err(e) => {
                        tracing::debug!(
                            step = %step.id,
                            variant,
                            error = %e,
                            "fallback variant failed"
                        );
                    }
                }
            }
        }

        let mut execution = handle.lock().await;
        execution.steps[idx].status = StepStatus::Failed;
        execution.recovery_strategy = Some(RecoveryStrategy::ManualIntervention);
        push_entry(
            &mut execution,
            &step.id,
            "manual_intervention",
            message,
            severity,
            serde_json::json!({"stepName": step.name}),
            None,
            false,
            Some("paused for manual intervention"),
        );
        if let Some(entry) = execution.error_log.last().cloned() {
            self.notifier.notify_error(&execution, &entry).await;
        }
        Ok(StepOutcome::Manual)
    }

    async fn handle_cancellation(
        &self,
        handle: &Arc<Mutex<WorkflowExecution>>,
        idx: usize,
    ) -> Result<StepOutcome> {
        let mut execution = handle.lock().await;
        // The step goes back to Pending so a later resume can rerun it.
        execution.steps[idx].status = StepStatus::Pending;
        execution.status = ExecutionStatus::Paused;
        execution.updated_at = Utc::now();
        let step_id = execution.steps[idx].id.clone();
        push_entry(
            &mut execution,
            &step_id,
            "canceled",
            "execution canceled by shutdown",
            ErrorSeverity::Low,
            serde_json::json!({}),
            None,
            false,
            None,
        );
        Err(RecoveryError::Canceled)
    }

    /// Write a step's partial result. The first write wins; a checkpoint
    /// is never overwritten.
    fn checkpoint(
        &self,
        execution: &mut WorkflowExecution,
        step_id: &str,
        value: serde_json::Value,
    ) {
        if !self.config.enable_partial_results {
            return;
        }
        let key = WorkflowExecution::partial_result_key(step_id);
        execution.partial_results.entry(key).or_insert(value);
    }
}

#[allow(clippy::too_many_arguments)]
fn push_entry(
    execution: &mut WorkflowExecution,
    step_id: &str,
    error_type: &str,
    message: &str,
    severity: ErrorSeverity,
    context: serde_json::Value,
    stack_trace: Option<String>,
    resolved: bool,
    resolution: Option<&str>,
) {
    execution.error_log.push(ErrorLogEntry {
        timestamp: Utc::now(),
        step_id: step_id.to_string(),
        error_type: error_type.to_string(),
        message: message.to_string(),
        severity,
        context,
        stack_trace,
        resolved,
        resolution: resolution.map(String::from),
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::WorkflowType;
    use crate::recovery::test_support::service;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;
    use tempfile::tempdir;

    /// Executor scripted by step id: fails a step a fixed number of times
    /// (or always), optionally succeeding fallbacks.
    #[derive(Default)]
    struct ScriptedExecutor {
        attempts: std::sync::Mutex<std::collections::HashMap<String, usize>>,
        fail_with: std::collections::HashMap<String, String>,
        succeed_after: std::collections::HashMap<String, usize>,
        fallback_succeeds: bool,
        rollbacks: AtomicUsize,
    }

    impl ScriptedExecutor {
        fn failing(step_id: &str, message: &str) -> Self {
            let mut executor = Self::default();
            executor
                .fail_with
                .insert(step_id.to_string(), message.to_string());
            executor
        }

        fn attempts_for(&self, step_id: &str) -> usize {
            *self.attempts.lock().unwrap().get(step_id).unwrap_or(&0)
        }
    }

    #[async_trait::async_trait]
    impl StepExecutor for ScriptedExecutor {
        async fn execute_step(
            &self,
            _execution: &WorkflowExecution,
            step: &WorkflowStep,
        ) -> anyhow::Result<serde_json::Value> {
            if step.metadata.get("fallback_variant").is_some() {
                if self.fallback_succeeds {
                    return Ok(serde_json::json!({"fallback": true}));
                }
                anyhow::bail!("fallback unavailable");
            }

            let attempt = {
                let mut attempts = self.attempts.lock().unwrap();
                let counter = attempts.entry(step.id.clone()).or_insert(0);
                *counter += 1;
                *counter
            };
            if let Some(threshold) = self.succeed_after.get(&step.id) {
                if attempt > *threshold {
                    return Ok(serde_json::json!({"attempt": attempt}));
                }
            }
            if let Some(message) = self.fail_with.get(&step.id) {
                anyhow::bail!("{}", message.clone());
            }
            Ok(serde_json::json!({"attempt": attempt}))
        }

        async fn rollback_step(
            &self,
            _execution: &WorkflowExecution,
            _step: &WorkflowStep,
        ) -> anyhow::Result<()> {
            self.rollbacks.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    async fn one_step_execution(
        service: &RecoveryService,
        configure: impl FnOnce(&mut WorkflowStep),
    ) -> WorkflowExecution {
        let mut step = WorkflowStep::new("work", "Do the work");
        configure(&mut step);
        service
            .create_execution(WorkflowType::DocumentAnalysis, "deal-1", "doc-1", vec![step])
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_happy_path_completes_with_partial_results() {
        let dir = tempdir().unwrap();
        let (service, _) = service(&dir);
        let execution = one_step_execution(&service, |_| {}).await;
        let executor = ScriptedExecutor::default();

        let done = service
            .execute_workflow(&execution.id, &executor)
            .await
            .unwrap();
        assert_eq!(done.status, ExecutionStatus::Completed);
        assert_eq!(done.steps[0].status, StepStatus::Completed);
        assert!(done.partial_results.contains_key("step_work_result"));
    }

    #[tokio::test]
    async fn test_exponential_backoff_scenario() {
        // InitialDelay=10ms, factor=2, MaxRetries=3, jitter off: a step
        // failing with a network error is attempted 4 times and the
        // cumulative wait is at least 10+20+40 ms.
        let dir = tempdir().unwrap();
        let config = crate::config::RecoveryConfig {
            initial_delay_ms: 10,
            max_delay_ms: 100,
            backoff_factor: 2.0,
            max_retries: 3,
            jitter: false,
            ..Default::default()
        };
        let (service, _) = crate::recovery::test_support::service_with_config(&dir, config);
        let execution = one_step_execution(&service, |step| {
            step.max_retries = 3;
        })
        .await;
        let executor = ScriptedExecutor::failing("work", "network: temporary failure");

        let started = Instant::now();
        let done = service
            .execute_workflow(&execution.id, &executor)
            .await
            .unwrap();
        let elapsed = started.elapsed();

        assert_eq!(executor.attempts_for("work"), 4);
        assert!(
            elapsed >= std::time::Duration::from_millis(70),
            "cumulative backoff too short: {elapsed:?}"
        );
        assert_eq!(done.status, ExecutionStatus::Paused);
        assert_eq!(done.total_retries, 3);
    }

    #[tokio::test]
    async fn test_retry_budget_bounds_attempts() {
        // Total attempts never exceed 1 + max_retries.
        let dir = tempdir().unwrap();
        let (service, _) = service(&dir);
        let execution = one_step_execution(&service, |step| {
            step.max_retries = 2;
        })
        .await;
        let executor = ScriptedExecutor::failing("work", "flaky");

        service
            .execute_workflow(&execution.id, &executor)
            .await
            .unwrap();
        assert_eq!(executor.attempts_for("work"), 3);
    }

    #[tokio::test]
    async fn test_retry_then_success() {
        let dir = tempdir().unwrap();
        let (service, _) = service(&dir);
        let execution = one_step_execution(&service, |step| {
            step.max_retries = 3;
        })
        .await;
        let mut executor = ScriptedExecutor::failing("work", "network glitch");
        executor.succeed_after.insert("work".to_string(), 2);

        let done = service
            .execute_workflow(&execution.id, &executor)
            .await
            .unwrap();
        assert_eq!(done.status, ExecutionStatus::Completed);
        assert_eq!(executor.attempts_for("work"), 3);
        assert_eq!(done.steps[0].retry_count, 2);
    }

    #[tokio::test]
    async fn test_skip_recovery_scenario() {
        // High-severity failure on a skippable step: step Skipped, partial
        // result "skipped", execution proceeds.
        let dir = tempdir().unwrap();
        let (service, _) = service(&dir);
        let mut first = WorkflowStep::new("flaky", "Flaky step");
        first.can_skip = true;
        first.max_retries = 0;
        let second = WorkflowStep::new("rest", "Rest of the work");
        let execution = service
            .create_execution(
                WorkflowType::DocumentAnalysis,
                "d",
                "doc",
                vec![first, second],
            )
            .await
            .unwrap();
        let executor = ScriptedExecutor::failing("flaky", "timeout: network unreachable");

        let done = service
            .execute_workflow(&execution.id, &executor)
            .await
            .unwrap();
        assert_eq!(done.steps[0].status, StepStatus::Skipped);
        assert_eq!(
            done.partial_results.get("step_flaky_result"),
            Some(&serde_json::json!("skipped"))
        );
        assert_eq!(done.steps[1].status, StepStatus::Completed);
        assert_eq!(done.status, ExecutionStatus::Completed);
    }

    #[tokio::test]
    async fn test_rollback_on_critical_scenario() {
        // Critical failure on a rollback-capable step: RollbackStep invoked
        // exactly once, step RolledBack, execution Failed, critical
        // notification fired exactly once.
        let dir = tempdir().unwrap();
        let (service, notifier) = service(&dir);
        let execution = one_step_execution(&service, |step| {
            step.can_rollback = true;
        })
        .await;
        let executor = ScriptedExecutor::failing("work", "critical: system failure");

        let done = service
            .execute_workflow(&execution.id, &executor)
            .await
            .unwrap();
        assert_eq!(executor.rollbacks.load(Ordering::SeqCst), 1);
        assert_eq!(executor.attempts_for("work"), 1);
        assert_eq!(done.steps[0].status, StepStatus::RolledBack);
        assert_eq!(done.status, ExecutionStatus::Failed);
        assert_eq!(done.recovery_strategy, Some(RecoveryStrategy::Rollback));
        assert_eq!(notifier.criticals.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_critical_without_rollback_pauses() {
        let dir = tempdir().unwrap();
        let (service, _) = service(&dir);
        let execution = one_step_execution(&service, |_| {}).await;
        let executor = ScriptedExecutor::failing("work", "fatal: broken");

        let done = service
            .execute_workflow(&execution.id, &executor)
            .await
            .unwrap();
        assert_eq!(executor.attempts_for("work"), 1);
        assert_eq!(done.status, ExecutionStatus::Paused);
        assert_eq!(
            done.recovery_strategy,
            Some(RecoveryStrategy::ManualIntervention)
        );
    }

    #[tokio::test]
    async fn test_non_retryable_bypasses_retry() {
        let dir = tempdir().unwrap();
        let (service, _) = service(&dir);
        let execution = one_step_execution(&service, |step| {
            step.max_retries = 5;
        })
        .await;
        let executor = ScriptedExecutor::failing("work", "forbidden by policy");

        let done = service
            .execute_workflow(&execution.id, &executor)
            .await
            .unwrap();
        assert_eq!(executor.attempts_for("work"), 1);
        assert_eq!(done.status, ExecutionStatus::Paused);
    }

    #[tokio::test]
    async fn test_fallback_recovers_step() {
        let dir = tempdir().unwrap();
        let (service, _) = service(&dir);
        let execution = one_step_execution(&service, |step| {
            step.max_retries = 0;
            step.metadata = serde_json::json!({"fallback": true});
        })
        .await;
        let mut executor = ScriptedExecutor::failing("work", "mysterious breakage");
        executor.fallback_succeeds = true;

        let done = service
            .execute_workflow(&execution.id, &executor)
            .await
            .unwrap();
        assert_eq!(done.steps[0].status, StepStatus::Completed);
        assert_eq!(done.status, ExecutionStatus::Completed);
        assert_eq!(done.recovery_strategy, Some(RecoveryStrategy::Fallback));
        assert_eq!(
            done.partial_results.get("step_work_result"),
            Some(&serde_json::json!({"fallback": true}))
        );
    }

    #[tokio::test]
    async fn test_fallback_exhausted_goes_manual() {
        let dir = tempdir().unwrap();
        let (service, _) = service(&dir);
        let execution = one_step_execution(&service, |step| {
            step.max_retries = 0;
            step.metadata = serde_json::json!({"fallback": true});
        })
        .await;
        let executor = ScriptedExecutor::failing("work", "mysterious breakage");

        let done = service
            .execute_workflow(&execution.id, &executor)
            .await
            .unwrap();
        assert_eq!(done.status, ExecutionStatus::Paused);
        assert_eq!(
            done.recovery_strategy,
            Some(RecoveryStrategy::ManualIntervention)
        );
    }

    #[tokio::test]
    async fn test_resume_is_noop_on_completed() {
        let dir = tempdir().unwrap();
        let (service, _) = service(&dir);
        let execution = one_step_execution(&service, |_| {}).await;
        let executor = ScriptedExecutor::default();
        let done = service
            .execute_workflow(&execution.id, &executor)
            .await
            .unwrap();
        assert_eq!(done.status, ExecutionStatus::Completed);

        let resumed = service
            .resume_workflow(&execution.id, &executor)
            .await
            .unwrap();
        assert_eq!(resumed.status, ExecutionStatus::Completed);
        // No step ran again.
        assert_eq!(executor.attempts_for("work"), 1);
    }

    #[tokio::test]
    async fn test_resume_resets_failed_steps_and_succeeds() {
        let dir = tempdir().unwrap();
        let (service, notifier) = service(&dir);
        let mut first = WorkflowStep::new("a", "A");
        first.max_retries = 0;
        let second = WorkflowStep::new("b", "B");
        let execution = service
            .create_execution(WorkflowType::DocumentAnalysis, "d", "doc", vec![first, second])
            .await
            .unwrap();

        let failing = ScriptedExecutor::failing("a", "glitch");
        let paused = service
            .execute_workflow(&execution.id, &failing)
            .await
            .unwrap();
        assert_eq!(paused.status, ExecutionStatus::Paused);
        assert_eq!(paused.steps[0].status, StepStatus::Failed);

        // Resume with a healthy executor: the failed step reruns with a
        // fresh retry budget and the workflow completes.
        let healthy = ScriptedExecutor::default();
        let done = service
            .resume_workflow(&execution.id, &healthy)
            .await
            .unwrap();
        assert_eq!(done.status, ExecutionStatus::Completed);
        assert_eq!(done.steps[0].status, StepStatus::Completed);
        assert_eq!(done.steps[0].retry_count, 0);
        assert_eq!(done.steps[1].status, StepStatus::Completed);
        assert_eq!(notifier.recoveries.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_resume_preserves_partial_results() {
        let dir = tempdir().unwrap();
        let (service, _) = service(&dir);
        let first = WorkflowStep::new("a", "A");
        let mut second = WorkflowStep::new("b", "B");
        second.max_retries = 0;
        let execution = service
            .create_execution(WorkflowType::DocumentAnalysis, "d", "doc", vec![first, second])
            .await
            .unwrap();

        let failing = ScriptedExecutor::failing("b", "glitch");
        service
            .execute_workflow(&execution.id, &failing)
            .await
            .unwrap();
        let checkpoint = service
            .get_execution(&execution.id)
            .await
            .unwrap()
            .partial_results
            .get("step_a_result")
            .cloned()
            .unwrap();

        let healthy = ScriptedExecutor::default();
        let done = service
            .resume_workflow(&execution.id, &healthy)
            .await
            .unwrap();
        // Step a did not rerun and its checkpoint is unchanged.
        assert_eq!(healthy.attempts_for("a"), 0);
        assert_eq!(
            done.partial_results.get("step_a_result"),
            Some(&checkpoint)
        );
    }

    #[tokio::test]
    async fn test_completed_execution_steps_all_terminal() {
        // For any completed execution, every step is Completed or Skipped.
        let dir = tempdir().unwrap();
        let (service, _) = service(&dir);
        let mut flaky = WorkflowStep::new("flaky", "Flaky");
        flaky.can_skip = true;
        flaky.max_retries = 0;
        let solid = WorkflowStep::new("solid", "Solid");
        let execution = service
            .create_execution(WorkflowType::DocumentAnalysis, "d", "doc", vec![flaky, solid])
            .await
            .unwrap();
        let executor = ScriptedExecutor::failing("flaky", "network down");

        let done = service
            .execute_workflow(&execution.id, &executor)
            .await
            .unwrap();
        assert_eq!(done.status, ExecutionStatus::Completed);
        assert!(done
            .steps
            .iter()
            .all(|s| matches!(s.status, StepStatus::Completed | StepStatus::Skipped)));
    }

    #[tokio::test]
    async fn test_dependents_of_failed_step_are_skipped() {
        let dir = tempdir().unwrap();
        let (service, _) = service(&dir);
        let mut first = WorkflowStep::new("a", "A");
        first.max_retries = 0;
        first.can_rollback = true;
        let mut second = WorkflowStep::new("b", "B");
        second.dependencies = vec!["a".to_string()];
        let mut third = WorkflowStep::new("c", "C");
        third.dependencies = vec!["a".to_string()];
        third.can_skip = true;
        let execution = service
            .create_execution(
                WorkflowType::DocumentAnalysis,
                "d",
                "doc",
                vec![first, second, third],
            )
            .await
            .unwrap();

        // Critical failure rolls back step a; b and c are dependents.
        let executor = ScriptedExecutor::failing("a", "critical: corrupted state");
        let done = service
            .execute_workflow(&execution.id, &executor)
            .await
            .unwrap();
        assert_eq!(done.steps[0].status, StepStatus::RolledBack);
        assert_eq!(done.status, ExecutionStatus::Failed);
        // Execution failed at the rollback; dependents were never run.
        assert_eq!(executor.attempts_for("b"), 0);
        assert_eq!(executor.attempts_for("c"), 0);
    }

    #[tokio::test]
    async fn test_skipped_dependency_satisfies_dependents() {
        // A Skipped step counts as a satisfied dependency.
        let dir = tempdir().unwrap();
        let (service, _) = service(&dir);
        let mut first = WorkflowStep::new("a", "A");
        first.max_retries = 0;
        first.can_skip = true;
        let mut second = WorkflowStep::new("b", "B");
        second.dependencies = vec!["a".to_string()];

        let execution = service
            .create_execution(WorkflowType::DocumentAnalysis, "d", "doc", vec![first, second])
            .await
            .unwrap();

        // Step a fails with a high-severity error and is skipped, which
        // still satisfies b's dependency; b then completes.
        let executor = ScriptedExecutor::failing("a", "network fault");
        let done = service
            .execute_workflow(&execution.id, &executor)
            .await
            .unwrap();
        assert_eq!(done.steps[0].status, StepStatus::Skipped);
        assert_eq!(done.steps[1].status, StepStatus::Completed);
        assert_eq!(done.status, ExecutionStatus::Completed);
    }

    #[tokio::test]
    async fn test_error_statistics() {
        let dir = tempdir().unwrap();
        let (service, _) = service(&dir);
        let execution = one_step_execution(&service, |step| {
            step.max_retries = 2;
        })
        .await;
        let executor = ScriptedExecutor::failing("work", "network: flappy");
        service
            .execute_workflow(&execution.id, &executor)
            .await
            .unwrap();

        let stats = service.error_statistics().await;
        assert_eq!(stats.get("network"), Some(&3));
        assert!(stats.contains_key("manual_intervention"));
    }

    #[tokio::test]
    async fn test_notify_error_respects_threshold() {
        let dir = tempdir().unwrap();
        let (service, notifier) = service(&dir);
        let execution = one_step_execution(&service, |step| {
            step.max_retries = 0;
        })
        .await;
        // Low severity, below the default High threshold.
        let executor = ScriptedExecutor::failing("work", "just weird");
        service
            .execute_workflow(&execution.id, &executor)
            .await
            .unwrap();
        // The only notify_error call comes from the manual-intervention
        // floor, not the per-attempt path.
        assert_eq!(notifier.errors.load(Ordering::SeqCst), 1);
        assert_eq!(notifier.criticals.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_shutdown_cancels_execution() {
        let dir = tempdir().unwrap();
        let (service, _) = service(&dir);
        let execution = one_step_execution(&service, |step| {
            step.max_retries = 0;
        })
        .await;
        service.shutdown();

        let executor = ScriptedExecutor::default();
        let err = service
            .execute_workflow(&execution.id, &executor)
            .await
            .unwrap_err();
        assert!(matches!(err, RecoveryError::Canceled));

        let paused = service.get_execution(&execution.id).await.unwrap();
        assert_eq!(paused.status, ExecutionStatus::Paused);
        assert_eq!(paused.steps[0].status, StepStatus::Pending);
        assert_eq!(executor.attempts_for("work"), 0);
    }
}
