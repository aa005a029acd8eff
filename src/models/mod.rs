//! Shared data model for the processing core.
//!
//! Queue items, deal-folder mirrors, processing history, tracked jobs and
//! workflow executions are all plain serde types. Components own their
//! slices of this model exclusively; everything here is data plus
//! constructors and state helpers, not behavior.

mod deal_folder;
mod history;
mod job;
mod queue_item;
mod workflow;

pub use deal_folder::{DealFolderMirror, FileEntry, ProcessingState, SyncError, SyncStatus};
pub use history::ProcessingHistory;
pub use job::{JobInfo, JobStatus, JobUpdate, TriggerType};
pub use queue_item::{Priority, QueueItem, QueueItemError, QueueItemStatus};
pub use workflow::{
    ErrorLogEntry, ErrorSeverity, ExecutionStatus, RecoveryStrategy, StepStatus,
    WorkflowExecution, WorkflowStep, WorkflowType,
};
