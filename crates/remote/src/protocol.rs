//! Coordinator-to-worker update request payload.

use serde::{Deserialize, Serialize};

use crate::buffers::OutputBuffers;
use crate::source::{PlanNodeId, TaskSource};

/// Session context forwarded to the worker with every update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRepresentation {
    /// Query the session belongs to.
    pub query_id: String,
    /// Submitting user.
    pub user: String,
    /// Optional client-provided source tag.
    pub source: Option<String>,
}

impl SessionRepresentation {
    /// Minimal session for a query/user pair.
    pub fn new(query_id: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            query_id: query_id.into(),
            user: user.into(),
            source: None,
        }
    }
}

/// Plan fragment shipped to the worker until it acknowledges installation.
/// The plan payload is opaque to the controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanFragment {
    /// Fragment id within the query plan.
    pub fragment_id: u32,
    /// Root node of the fragment.
    pub root_node_id: PlanNodeId,
    /// Serialized fragment body, passed through verbatim.
    pub plan_json: serde_json::Value,
}

/// Create-or-update request body for `POST {task_uri}`.
///
/// The worker applies sources idempotently under split sequence ids, so a
/// request observed twice is harmless; the controller still sends each
/// split at most once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskUpdateRequest {
    /// Session context.
    pub session: SessionRepresentation,
    /// Fragment, present only until the worker echoes `needs_plan = false`.
    pub fragment: Option<PlanFragment>,
    /// New splits and completion markers per source plan node.
    pub sources: Vec<TaskSource>,
    /// Latest output buffer descriptor.
    pub output_buffers: OutputBuffers,
    /// Total partition count for partitioned stages.
    pub total_partitions: Option<u32>,
}
