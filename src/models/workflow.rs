//! Workflow execution model.
//!
//! An execution is an ordered list of steps run by the recovery service.
//! Step execution is strictly sequential by index; parallel steps are not
//! supported. Partial results checkpoint completed steps so a resumed
//! execution never repeats finished work.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::Priority;

/// Kind of workflow dispatched to or run by the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WorkflowType {
    DocumentAnalysis,
    ErrorHandling,
    UserCorrections,
    Cleanup,
    BatchProcessing,
    HealthCheck,
}

impl WorkflowType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DocumentAnalysis => "document-analysis",
            Self::ErrorHandling => "error-handling",
            Self::UserCorrections => "user-corrections",
            Self::Cleanup => "cleanup",
            Self::BatchProcessing => "batch-processing",
            Self::HealthCheck => "health-check",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "document-analysis" => Some(Self::DocumentAnalysis),
            "error-handling" => Some(Self::ErrorHandling),
            "user-corrections" => Some(Self::UserCorrections),
            "cleanup" => Some(Self::Cleanup),
            "batch-processing" => Some(Self::BatchProcessing),
            "health-check" => Some(Self::HealthCheck),
            _ => None,
        }
    }
}

/// Overall state of a workflow execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Paused,
    Resumed,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Paused => "paused",
            Self::Resumed => "resumed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "paused" => Some(Self::Paused),
            "resumed" => Some(Self::Resumed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// State of a single step within an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
    RolledBack,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::RolledBack => "rolled_back",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "skipped" => Some(Self::Skipped),
            "rolled_back" => Some(Self::RolledBack),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Skipped | Self::RolledBack
        )
    }

    /// A dependency in this state lets dependents run.
    pub fn satisfies_dependency(&self) -> bool {
        matches!(self, Self::Completed | Self::Skipped)
    }

    /// A dependency in this state forces dependents to be skipped.
    pub fn blocks_dependents(&self) -> bool {
        matches!(self, Self::Failed | Self::RolledBack)
    }
}

/// Severity of a step error, ordered Low < Medium < High < Critical.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl ErrorSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "low" => Some(Self::Low),
            "medium" => Some(Self::Medium),
            "high" => Some(Self::High),
            "critical" => Some(Self::Critical),
            _ => None,
        }
    }
}

/// Action selected after a step failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStrategy {
    Retry,
    Skip,
    Rollback,
    Fallback,
    ManualIntervention,
}

impl RecoveryStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Retry => "retry",
            Self::Skip => "skip",
            Self::Rollback => "rollback",
            Self::Fallback => "fallback",
            Self::ManualIntervention => "manual_intervention",
        }
    }
}

/// One entry in an execution's audit log.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorLogEntry {
    pub timestamp: DateTime<Utc>,
    pub step_id: String,
    /// Machine-readable kind, e.g. "timeout", "step_success", "rollback".
    pub error_type: String,
    pub message: String,
    pub severity: ErrorSeverity,
    pub context: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack_trace: Option<String>,
    pub resolved: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolution: Option<String>,
}

/// A single unit of work within an execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowStep {
    pub id: String,
    pub name: String,
    pub status: StepStatus,
    pub max_retries: u32,
    pub retry_count: u32,
    /// Step ids that must be Completed or Skipped before this step runs.
    #[serde(default)]
    pub dependencies: Vec<String>,
    pub can_skip: bool,
    pub can_rollback: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rollback_data: Option<serde_json::Value>,
    pub metadata: serde_json::Value,
}

impl WorkflowStep {
    pub fn new(id: &str, name: &str) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            status: StepStatus::Pending,
            max_retries: 3,
            retry_count: 0,
            dependencies: Vec::new(),
            can_skip: false,
            can_rollback: false,
            timeout_secs: None,
            rollback_data: None,
            metadata: serde_json::json!({}),
        }
    }

    /// Whether step metadata opts into fallback recovery.
    pub fn has_fallback(&self) -> bool {
        self.metadata.get("fallback").is_some()
    }
}

/// An internal multi-step pipeline supervised by the recovery service.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowExecution {
    pub id: String,
    pub workflow_type: WorkflowType,
    pub deal_id: String,
    pub document_id: String,
    pub status: ExecutionStatus,
    pub steps: Vec<WorkflowStep>,
    /// Index of the next non-terminal step.
    pub current_step_index: usize,
    pub total_retries: u32,
    /// Checkpointed values keyed `step_<id>_result`; written once on step
    /// completion and never modified.
    #[serde(default)]
    pub partial_results: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub error_log: Vec<ErrorLogEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recovery_strategy: Option<RecoveryStrategy>,
    pub priority: Priority,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowExecution {
    pub fn new(
        workflow_type: WorkflowType,
        deal_id: &str,
        document_id: &str,
        steps: Vec<WorkflowStep>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            workflow_type,
            deal_id: deal_id.to_string(),
            document_id: document_id.to_string(),
            status: ExecutionStatus::Pending,
            steps,
            current_step_index: 0,
            total_retries: 0,
            partial_results: BTreeMap::new(),
            error_log: Vec::new(),
            recovery_strategy: None,
            priority: Priority::Normal,
            started_at: now,
            updated_at: now,
        }
    }

    /// Checkpoint key for a step's partial result.
    pub fn partial_result_key(step_id: &str) -> String {
        format!("step_{step_id}_result")
    }

    /// Whether every dependency of `step` is Completed or Skipped.
    pub fn dependencies_satisfied(&self, step: &WorkflowStep) -> bool {
        step.dependencies.iter().all(|dep_id| {
            self.steps
                .iter()
                .find(|s| &s.id == dep_id)
                .map(|s| s.status.satisfies_dependency())
                .unwrap_or(false)
        })
    }

    /// Whether any dependency of `step` failed or was rolled back.
    pub fn dependencies_blocked(&self, step: &WorkflowStep) -> bool {
        step.dependencies.iter().any(|dep_id| {
            self.steps
                .iter()
                .find(|s| &s.id == dep_id)
                .map(|s| s.status.blocks_dependents())
                .unwrap_or(false)
        })
    }

    /// Index of the earliest non-terminal step, if any remain.
    pub fn next_open_step(&self) -> Option<usize> {
        self.steps.iter().position(|s| !s.status.is_terminal())
    }

    /// An execution succeeds when every step is Completed or Skipped.
    pub fn all_steps_succeeded(&self) -> bool {
        self.steps
            .iter()
            .all(|s| matches!(s.status, StepStatus::Completed | StepStatus::Skipped))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_step_execution() -> WorkflowExecution {
        let extract = WorkflowStep::new("extract", "Extract fields");
        let mut merge = WorkflowStep::new("merge", "Merge into template");
        merge.dependencies = vec!["extract".to_string()];
        WorkflowExecution::new(WorkflowType::DocumentAnalysis, "deal-1", "doc-1", vec![extract, merge])
    }

    #[test]
    fn test_workflow_type_wire_format() {
        assert_eq!(
            serde_json::to_value(WorkflowType::DocumentAnalysis).unwrap(),
            "document-analysis"
        );
        assert_eq!(
            WorkflowType::from_str("batch-processing"),
            Some(WorkflowType::BatchProcessing)
        );
        assert_eq!(WorkflowType::from_str("document_analysis"), None);
    }

    #[test]
    fn test_severity_ordering() {
        assert!(ErrorSeverity::Low < ErrorSeverity::Medium);
        assert!(ErrorSeverity::Medium < ErrorSeverity::High);
        assert!(ErrorSeverity::High < ErrorSeverity::Critical);
    }

    #[test]
    fn test_step_terminal_states() {
        assert!(StepStatus::Completed.is_terminal());
        assert!(StepStatus::Skipped.is_terminal());
        assert!(StepStatus::RolledBack.is_terminal());
        assert!(!StepStatus::Running.is_terminal());
        assert!(!StepStatus::Pending.is_terminal());
    }

    #[test]
    fn test_dependency_predicates() {
        assert!(StepStatus::Completed.satisfies_dependency());
        assert!(StepStatus::Skipped.satisfies_dependency());
        assert!(!StepStatus::Failed.satisfies_dependency());
        assert!(StepStatus::Failed.blocks_dependents());
        assert!(StepStatus::RolledBack.blocks_dependents());
        assert!(!StepStatus::Pending.blocks_dependents());
    }

    #[test]
    fn test_dependencies_satisfied() {
        let mut execution = two_step_execution();
        let merge = execution.steps[1].clone();
        assert!(!execution.dependencies_satisfied(&merge));

        execution.steps[0].status = StepStatus::Completed;
        assert!(execution.dependencies_satisfied(&merge));

        execution.steps[0].status = StepStatus::Skipped;
        assert!(execution.dependencies_satisfied(&merge));
    }

    #[test]
    fn test_unknown_dependency_never_satisfied() {
        let mut execution = two_step_execution();
        execution.steps[1].dependencies = vec!["ghost".to_string()];
        let merge = execution.steps[1].clone();
        assert!(!execution.dependencies_satisfied(&merge));
    }

    #[test]
    fn test_dependencies_blocked() {
        let mut execution = two_step_execution();
        execution.steps[0].status = StepStatus::Failed;
        let merge = execution.steps[1].clone();
        assert!(execution.dependencies_blocked(&merge));
    }

    #[test]
    fn test_next_open_step() {
        let mut execution = two_step_execution();
        assert_eq!(execution.next_open_step(), Some(0));
        execution.steps[0].status = StepStatus::Completed;
        assert_eq!(execution.next_open_step(), Some(1));
        execution.steps[1].status = StepStatus::Skipped;
        assert_eq!(execution.next_open_step(), None);
    }

    #[test]
    fn test_all_steps_succeeded() {
        let mut execution = two_step_execution();
        execution.steps[0].status = StepStatus::Completed;
        execution.steps[1].status = StepStatus::Skipped;
        assert!(execution.all_steps_succeeded());

        execution.steps[1].status = StepStatus::RolledBack;
        assert!(!execution.all_steps_succeeded());
    }

    #[test]
    fn test_partial_result_key() {
        assert_eq!(
            WorkflowExecution::partial_result_key("extract"),
            "step_extract_result"
        );
    }

    #[test]
    fn test_has_fallback() {
        let mut step = WorkflowStep::new("s", "S");
        assert!(!step.has_fallback());
        step.metadata = serde_json::json!({"fallback": true});
        assert!(step.has_fallback());
    }
}
