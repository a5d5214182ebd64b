//! Split assignment model.
//!
//! Contract:
//! - sequence ids are assigned by the handle at enqueue time and are
//!   strictly increasing within one task;
//! - two sources for the same plan node merge by set-union of splits (keyed
//!   by sequence id) and lifespans;
//! - `no_more_splits` flags are monotonic: once true, never false again.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Source plan node identifier within a fragment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PlanNodeId(pub String);

impl PlanNodeId {
    /// Build a plan node id from any string-like value.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl std::fmt::Display for PlanNodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Scheduling group for splits that must be processed together.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Lifespan {
    /// Splits processed by task-wide drivers.
    TaskWide,
    /// Splits pinned to one driver group.
    Group(u32),
}

/// Opaque connector split payload. The controller never inspects the
/// descriptor; it is round-tripped to the worker as-is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Split {
    /// Connector that produced the split.
    pub connector_id: String,
    /// Scheduling group the split belongs to.
    pub lifespan: Lifespan,
    /// Connector-specific descriptor (file range, shard, ...).
    pub descriptor: serde_json::Value,
}

impl Split {
    /// Build a task-wide split with an opaque descriptor.
    pub fn new(connector_id: impl Into<String>, descriptor: serde_json::Value) -> Self {
        Self {
            connector_id: connector_id.into(),
            lifespan: Lifespan::TaskWide,
            descriptor,
        }
    }

    /// Pin the split to a driver group.
    pub fn with_lifespan(mut self, lifespan: Lifespan) -> Self {
        self.lifespan = lifespan;
        self
    }
}

/// A split with its controller-assigned delivery sequence id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledSplit {
    /// Unique-within-task delivery sequence id; the worker deduplicates on it.
    pub sequence_id: i64,
    /// Scheduling group, copied from the split at enqueue time.
    pub lifespan: Lifespan,
    /// The connector split.
    pub split: Split,
}

/// Per-source-plan-node bag of splits and completion markers, as shipped in
/// a task update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSource {
    /// Source plan node the splits feed.
    pub plan_node_id: PlanNodeId,
    /// Splits to deliver; set semantics under `sequence_id`.
    pub splits: Vec<ScheduledSplit>,
    /// Driver groups that will receive no further splits.
    pub no_more_splits_for_lifespan: BTreeSet<Lifespan>,
    /// Whether the source will receive no further splits at all.
    pub no_more_splits: bool,
}

impl TaskSource {
    /// Empty source for a plan node.
    pub fn new(plan_node_id: PlanNodeId) -> Self {
        Self {
            plan_node_id,
            splits: Vec::new(),
            no_more_splits_for_lifespan: BTreeSet::new(),
            no_more_splits: false,
        }
    }

    /// Merge another delivery for the same plan node: union of splits by
    /// sequence id, union of lifespan markers, monotonic `no_more_splits`.
    pub fn merge(&mut self, other: &TaskSource) {
        debug_assert_eq!(self.plan_node_id, other.plan_node_id);
        for split in &other.splits {
            if !self.splits.iter().any(|s| s.sequence_id == split.sequence_id) {
                self.splits.push(split.clone());
            }
        }
        self.splits.sort_by_key(|s| s.sequence_id);
        self.no_more_splits_for_lifespan
            .extend(other.no_more_splits_for_lifespan.iter().copied());
        self.no_more_splits |= other.no_more_splits;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scheduled(seq: i64) -> ScheduledSplit {
        ScheduledSplit {
            sequence_id: seq,
            lifespan: Lifespan::TaskWide,
            split: Split::new("test", serde_json::json!({ "path": format!("f{seq}") })),
        }
    }

    #[test]
    fn merge_unions_splits_by_sequence_id() {
        let node = PlanNodeId::new("scan");
        let mut a = TaskSource::new(node.clone());
        a.splits.push(scheduled(1));
        a.splits.push(scheduled(2));

        let mut b = TaskSource::new(node);
        b.splits.push(scheduled(2));
        b.splits.push(scheduled(3));

        a.merge(&b);
        let ids: Vec<i64> = a.splits.iter().map(|s| s.sequence_id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn merge_keeps_no_more_splits_monotonic() {
        let node = PlanNodeId::new("scan");
        let mut a = TaskSource::new(node.clone());
        a.no_more_splits = true;
        a.no_more_splits_for_lifespan.insert(Lifespan::Group(3));

        let b = TaskSource::new(node);
        a.merge(&b);

        assert!(a.no_more_splits);
        assert!(a.no_more_splits_for_lifespan.contains(&Lifespan::Group(3)));
    }

    #[test]
    fn merge_accumulates_lifespan_markers() {
        let node = PlanNodeId::new("scan");
        let mut a = TaskSource::new(node.clone());
        a.no_more_splits_for_lifespan.insert(Lifespan::Group(1));

        let mut b = TaskSource::new(node);
        b.no_more_splits_for_lifespan.insert(Lifespan::Group(2));
        b.no_more_splits_for_lifespan.insert(Lifespan::TaskWide);

        a.merge(&b);
        assert_eq!(a.no_more_splits_for_lifespan.len(), 3);
    }
}
