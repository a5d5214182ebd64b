//! Wire model for remote task state.
//!
//! Contract:
//! - `TaskStatus` is the lightweight high-frequency record, `TaskInfo` the
//!   heavyweight superset;
//! - `version` is a per-task counter the worker bumps on every change and is
//!   only comparable while `task_instance_id` is unchanged;
//! - a terminal [`TaskState`] is absorbing on the coordinator side.

use std::fmt;

use dfq_common::{NodeId, QueryId, StageId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::source::{Lifespan, PlanNodeId};

/// Task identifier: one (stage, worker-partition) instance of query execution.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId {
    /// Query this task belongs to.
    pub query_id: QueryId,
    /// Stage within the query DAG.
    pub stage_id: StageId,
    /// Partition of the stage assigned to this task.
    pub partition: u32,
    /// Attempt number for retries of the same partition.
    pub attempt: u32,
}

impl TaskId {
    /// Build a task id from its components.
    pub fn new(query_id: impl Into<String>, stage_id: u32, partition: u32, attempt: u32) -> Self {
        Self {
            query_id: QueryId(query_id.into()),
            stage_id: StageId(stage_id),
            partition,
            attempt,
        }
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{}.{}",
            self.query_id, self.stage_id, self.partition, self.attempt
        )
    }
}

/// Task lifecycle states reported by workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    /// Task is created but no drivers are running.
    Planned,
    /// At least one driver is running or runnable.
    Running,
    /// All drivers completed and all output was consumed.
    Finished,
    /// Task was canceled by a coordinator request.
    Canceled,
    /// Task was aborted by a coordinator request.
    Aborted,
    /// Task execution failed.
    Failed,
}

impl TaskState {
    /// Whether the state is terminal (absorbing).
    pub fn is_done(self) -> bool {
        matches!(
            self,
            Self::Finished | Self::Canceled | Self::Aborted | Self::Failed
        )
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Planned => "PLANNED",
            Self::Running => "RUNNING",
            Self::Finished => "FINISHED",
            Self::Canceled => "CANCELED",
            Self::Aborted => "ABORTED",
            Self::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

/// Failure classification carried in [`TaskStatus::failures`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Worker lost the task (instance id changed) or replied with a
    /// regressed status version.
    RemoteTaskMismatch,
    /// Worker RPCs failed beyond the tolerated error window, or the RPC
    /// client refused to accept work.
    RemoteTaskError,
    /// Coordinator-requested cancellation.
    UserCanceled,
    /// Planner/coordinator-injected failure.
    Internal,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::RemoteTaskMismatch => "REMOTE_TASK_MISMATCH",
            Self::RemoteTaskError => "REMOTE_TASK_ERROR",
            Self::UserCanceled => "USER_CANCELED",
            Self::Internal => "INTERNAL",
        };
        f.write_str(s)
    }
}

/// One failure entry reported for a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionFailureInfo {
    /// Failure classification.
    pub error_code: ErrorCode,
    /// Human-readable cause.
    pub message: String,
}

/// Lightweight task status record exchanged on the high-frequency poll path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStatus {
    /// Task this status describes.
    pub task_id: TaskId,
    /// Worker-assigned fencing token; changes when the worker lost the task.
    pub task_instance_id: String,
    /// Monotonic per-instance status version.
    pub version: u64,
    /// Current lifecycle state.
    pub state: TaskState,
    /// Worker-side URI of the task resource.
    pub self_uri: String,
    /// Worker node the task runs on.
    pub node_id: NodeId,
    /// Driver groups that finished processing.
    pub completed_driver_groups: BTreeSet<Lifespan>,
    /// Failures accumulated so far; non-empty when `state` is FAILED.
    pub failures: Vec<ExecutionFailureInfo>,
    /// Drivers queued on the worker.
    pub queued_partitioned_drivers: u32,
    /// Drivers currently running on the worker.
    pub running_partitioned_drivers: u32,
    /// Whether the output buffer is over the utilization threshold.
    pub output_buffer_overutilized: bool,
    /// Bytes physically written by the task.
    pub physical_written_bytes: u64,
    /// User memory reserved by the task.
    pub memory_reservation_bytes: u64,
    /// System memory reserved by the task.
    pub system_memory_reservation_bytes: u64,
    /// Full collection cycles observed on the worker.
    pub full_gc_count: u64,
    /// Time spent in full collections, in milliseconds.
    pub full_gc_time_ms: u64,
}

impl TaskStatus {
    /// Bootstrap status used before the first worker contact. The empty
    /// instance id marks the value as unfenced; the first observed worker
    /// instance id is adopted without a mismatch.
    pub fn initial(task_id: TaskId, self_uri: impl Into<String>, node_id: NodeId) -> Self {
        Self {
            task_id,
            task_instance_id: String::new(),
            version: 0,
            state: TaskState::Planned,
            self_uri: self_uri.into(),
            node_id,
            completed_driver_groups: BTreeSet::new(),
            failures: Vec::new(),
            queued_partitioned_drivers: 0,
            running_partitioned_drivers: 0,
            output_buffer_overutilized: false,
            physical_written_bytes: 0,
            memory_reservation_bytes: 0,
            system_memory_reservation_bytes: 0,
            full_gc_count: 0,
            full_gc_time_ms: 0,
        }
    }

    /// Synthesize a FAILED status one version past `current`, carrying an
    /// additional failure entry. Used for coordinator-side failure injection
    /// where no worker reply will arrive.
    pub fn fail_with(current: &TaskStatus, error_code: ErrorCode, message: impl Into<String>) -> Self {
        let mut failures = current.failures.clone();
        failures.push(ExecutionFailureInfo {
            error_code,
            message: message.into(),
        });
        Self {
            version: current.version + 1,
            state: TaskState::Failed,
            failures,
            ..current.clone()
        }
    }

    /// Synthesize a terminal status one version past `current` without a
    /// failure entry (graceful cancel/abort fallback).
    pub fn terminal_with(current: &TaskStatus, state: TaskState) -> Self {
        Self {
            version: current.version + 1,
            state,
            ..current.clone()
        }
    }
}

/// Cumulative task execution statistics (opaque worker bookkeeping).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStats {
    /// Wall-clock lifetime of the task.
    pub elapsed_ms: u64,
    /// Time spent queued before the first driver started.
    pub queued_ms: u64,
    /// Total drivers created.
    pub total_drivers: u64,
    /// Drivers that finished.
    pub completed_drivers: u64,
    /// Raw input rows consumed.
    pub raw_input_rows: u64,
    /// Raw input bytes consumed.
    pub raw_input_bytes: u64,
    /// Output rows produced.
    pub output_rows: u64,
    /// Output bytes produced.
    pub output_bytes: u64,
}

/// Output buffer utilization summary reported by the worker.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputBufferInfo {
    /// Buffer lifecycle state as reported by the worker.
    pub state: String,
    /// Bytes currently buffered.
    pub total_buffered_bytes: u64,
    /// Rows currently buffered.
    pub total_buffered_rows: u64,
    /// Rows handed to consumers so far.
    pub total_rows_sent: u64,
}

/// Heavyweight task record: status plus bookkeeping fetched on the
/// low-frequency path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskInfo {
    /// Embedded status snapshot.
    pub task_status: TaskStatus,
    /// Last worker heartbeat, unix milliseconds.
    pub last_heartbeat_ms: u64,
    /// Output buffer summary.
    pub output_buffers: OutputBufferInfo,
    /// Source plan nodes the worker has seen the no-more-splits marker for.
    pub no_more_splits: BTreeSet<PlanNodeId>,
    /// Cumulative execution statistics.
    pub stats: TaskStats,
    /// Whether the worker still needs the plan fragment.
    pub needs_plan: bool,
}

impl TaskInfo {
    /// Initial info wrapping a bootstrap status; the fragment has not been
    /// delivered yet.
    pub fn initial(task_status: TaskStatus) -> Self {
        Self {
            task_status,
            last_heartbeat_ms: 0,
            output_buffers: OutputBufferInfo::default(),
            no_more_splits: BTreeSet::new(),
            stats: TaskStats::default(),
            needs_plan: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_are_done() {
        assert!(!TaskState::Planned.is_done());
        assert!(!TaskState::Running.is_done());
        assert!(TaskState::Finished.is_done());
        assert!(TaskState::Canceled.is_done());
        assert!(TaskState::Aborted.is_done());
        assert!(TaskState::Failed.is_done());
    }

    #[test]
    fn fail_with_bumps_version_and_appends() {
        let initial = TaskStatus::initial(
            TaskId::new("q", 1, 2, 0),
            "http://worker/v1/task/n/q.1.2.0",
            dfq_common::NodeId("n".to_string()),
        );
        let failed = TaskStatus::fail_with(&initial, ErrorCode::RemoteTaskError, "boom");
        assert_eq!(failed.version, initial.version + 1);
        assert_eq!(failed.state, TaskState::Failed);
        assert_eq!(failed.failures.len(), 1);
        assert_eq!(failed.failures[0].error_code, ErrorCode::RemoteTaskError);
        assert_eq!(failed.task_instance_id, initial.task_instance_id);
    }

    #[test]
    fn task_id_display_is_dotted() {
        let id = TaskId::new("20260801_000123_00042_abcde", 3, 7, 1);
        assert_eq!(id.to_string(), "20260801_000123_00042_abcde.3.7.1");
    }
}
