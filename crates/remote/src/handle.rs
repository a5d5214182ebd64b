//! Remote task handle: the coordinator-side authority for one task.
//!
//! Responsibilities:
//! - own local intent: staged splits, no-more-splits markers, output-buffer
//!   descriptor, fragment delivery, termination requests;
//! - own the authoritative client-side `TaskStatus`/`TaskInfo` snapshots;
//! - apply every incoming status through one rule: instance fencing first,
//!   then version monotonicity, then publish;
//! - orchestrate the status/info/update loops and wind them down once a
//!   terminal state is reached.
//!
//! Locking discipline:
//! - one coarse critical section guards all intent and the published
//!   snapshots; mutations compute what changed under the lock, release, then
//!   notify listeners and kick loops;
//! - the listener list is guarded separately so listeners can be added
//!   during notification; listeners never run under either lock;
//! - no RPC is ever issued while a lock is held.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use dfq_common::{CommunicationConfig, MetricsRegistry, RemoteTaskConfig};
use tokio::sync::{watch, Notify};
use tracing::{debug, info, warn};

use crate::backoff::Clock;
use crate::buffers::OutputBuffers;
use crate::codec::CodecSet;
use crate::info_fetcher::TaskInfoFetcher;
use crate::protocol::{PlanFragment, SessionRepresentation, TaskUpdateRequest};
use crate::rpc::RpcClient;
use crate::source::{Lifespan, PlanNodeId, ScheduledSplit, Split, TaskSource};
use crate::status_fetcher::TaskStatusFetcher;
use crate::task::{ErrorCode, TaskId, TaskInfo, TaskState, TaskStatus};
use crate::update_sender::TaskUpdateSender;

/// State change callback registered via
/// [`RemoteTaskHandle::add_state_change_listener`].
pub type StateChangeListener = Arc<dyn Fn(TaskState) + Send + Sync>;

/// Requested terminate flavor; maps onto `DELETE ?abort={false|true}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CleanupKind {
    Cancel,
    Abort,
}

/// How an incoming status was handled by the update rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StatusApplied {
    /// Published as the latest snapshot.
    Applied,
    /// Dropped: the handle is already terminal.
    Ignored,
    /// Rejected as a protocol violation; the handle is now FAILED.
    Rejected,
}

struct HandleState {
    task_status: TaskStatus,
    task_info: TaskInfo,
    fragment: Option<PlanFragment>,
    send_plan: bool,
    pending_splits: BTreeMap<PlanNodeId, Vec<ScheduledSplit>>,
    no_more_splits: BTreeSet<PlanNodeId>,
    no_more_splits_for_lifespan: BTreeSet<(PlanNodeId, Lifespan)>,
    acked_no_more_splits: BTreeSet<PlanNodeId>,
    acked_lifespans: BTreeSet<(PlanNodeId, Lifespan)>,
    output_buffers: OutputBuffers,
    next_split_sequence_id: i64,
    pending_update_count: u64,
    sent_update_count: u64,
    cleanup: Option<CleanupKind>,
    cleanup_taken: bool,
    worker_unreachable: bool,
    final_info_applied: bool,
}

/// Everything the factory wires into a handle.
pub(crate) struct HandleParams {
    pub(crate) task_id: TaskId,
    pub(crate) task_uri: String,
    pub(crate) session: SessionRepresentation,
    pub(crate) fragment: PlanFragment,
    pub(crate) output_buffers: OutputBuffers,
    pub(crate) total_partitions: Option<u32>,
    pub(crate) initial_status: TaskStatus,
    pub(crate) rpc: Arc<dyn RpcClient>,
    pub(crate) codecs: CodecSet,
    pub(crate) config: RemoteTaskConfig,
    pub(crate) comm: CommunicationConfig,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) metrics: MetricsRegistry,
    pub(crate) stop_rx: watch::Receiver<bool>,
}

/// A multipart snapshot handed to the update sender; everything in it is
/// considered sent the moment it is taken.
pub(crate) struct UpdateSnapshot {
    pub(crate) request: TaskUpdateRequest,
    pub(crate) dispatched_count: u64,
    pub(crate) delivered_no_more_splits: Vec<PlanNodeId>,
    pub(crate) delivered_lifespans: Vec<(PlanNodeId, Lifespan)>,
}

/// Coordinator-side facade for one remote task.
pub struct RemoteTaskHandle {
    task_id: TaskId,
    task_uri: String,
    session: SessionRepresentation,
    total_partitions: Option<u32>,
    initial_instance_id: String,
    state: Mutex<HandleState>,
    listeners: Mutex<Vec<StateChangeListener>>,
    state_tx: watch::Sender<TaskState>,
    update_notify: Notify,
    started: AtomicBool,
    rpc: Arc<dyn RpcClient>,
    codecs: CodecSet,
    config: RemoteTaskConfig,
    comm: CommunicationConfig,
    clock: Arc<dyn Clock>,
    metrics: MetricsRegistry,
    stop_rx: watch::Receiver<bool>,
}

impl RemoteTaskHandle {
    pub(crate) fn new(params: HandleParams) -> Self {
        let initial_status = params.initial_status;
        let initial_instance_id = initial_status.task_instance_id.clone();
        let (state_tx, _) = watch::channel(initial_status.state);
        let task_info = TaskInfo::initial(initial_status.clone());
        Self {
            task_id: params.task_id,
            task_uri: params.task_uri,
            session: params.session,
            total_partitions: params.total_partitions,
            initial_instance_id,
            state: Mutex::new(HandleState {
                task_status: initial_status,
                task_info,
                fragment: Some(params.fragment),
                send_plan: true,
                pending_splits: BTreeMap::new(),
                no_more_splits: BTreeSet::new(),
                no_more_splits_for_lifespan: BTreeSet::new(),
                acked_no_more_splits: BTreeSet::new(),
                acked_lifespans: BTreeSet::new(),
                output_buffers: params.output_buffers,
                next_split_sequence_id: 0,
                // One pending update from birth: the first POST creates the
                // task on the worker and carries the fragment.
                pending_update_count: 1,
                sent_update_count: 0,
                cleanup: None,
                cleanup_taken: false,
                worker_unreachable: false,
                final_info_applied: false,
            }),
            listeners: Mutex::new(Vec::new()),
            state_tx,
            update_notify: Notify::new(),
            started: AtomicBool::new(false),
            rpc: params.rpc,
            codecs: params.codecs,
            config: params.config,
            comm: params.comm,
            clock: params.clock,
            metrics: params.metrics,
            stop_rx: params.stop_rx,
        }
    }

    /// Task this handle drives.
    pub fn task_id(&self) -> &TaskId {
        &self.task_id
    }

    /// Worker-side task resource URI.
    pub fn task_uri(&self) -> &str {
        &self.task_uri
    }

    /// Launch the status, info, and update loops. Idempotent; a no-op once
    /// terminal.
    pub fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::AcqRel) {
            return;
        }
        if self.is_done() {
            return;
        }
        info!(task_id = %self.task_id, uri = %self.task_uri, "starting remote task");
        tokio::spawn(TaskStatusFetcher::new(Arc::clone(self)).run());
        tokio::spawn(TaskInfoFetcher::new(Arc::clone(self)).run());
        tokio::spawn(TaskUpdateSender::new(Arc::clone(self)).run());
    }

    /// Stage splits for delivery. Sequence ids are assigned here, in call
    /// order, so splits from an earlier call always precede a later call's.
    /// Silently ignored once terminal.
    pub fn add_splits(&self, splits_by_node: HashMap<PlanNodeId, Vec<Split>>) {
        // Deterministic enqueue order within one call.
        let by_node: BTreeMap<PlanNodeId, Vec<Split>> = splits_by_node.into_iter().collect();
        let mut wake = false;
        {
            let mut s = self.state.lock().unwrap();
            if s.task_status.state.is_done() {
                return;
            }
            for (node, splits) in by_node {
                if splits.is_empty() {
                    continue;
                }
                if s.no_more_splits.contains(&node) {
                    debug!(task_id = %self.task_id, node = %node, "dropping splits for completed source");
                    continue;
                }
                let mut scheduled = Vec::with_capacity(splits.len());
                for split in splits {
                    let sequence_id = s.next_split_sequence_id;
                    s.next_split_sequence_id += 1;
                    scheduled.push(ScheduledSplit {
                        sequence_id,
                        lifespan: split.lifespan,
                        split,
                    });
                }
                s.pending_splits.entry(node).or_default().extend(scheduled);
                wake = true;
            }
            if wake {
                s.pending_update_count += 1;
                self.publish_pending_splits_gauge(&s);
            }
        }
        if wake {
            self.update_notify.notify_one();
        }
    }

    /// Mark a source as complete. Monotonic and idempotent.
    pub fn no_more_splits(&self, plan_node_id: PlanNodeId) {
        let wake = {
            let mut s = self.state.lock().unwrap();
            if s.task_status.state.is_done() {
                false
            } else if s.no_more_splits.insert(plan_node_id) {
                s.pending_update_count += 1;
                true
            } else {
                false
            }
        };
        if wake {
            self.update_notify.notify_one();
        }
    }

    /// Mark one driver group of a source as complete. Monotonic and
    /// idempotent.
    pub fn no_more_splits_for_lifespan(&self, plan_node_id: PlanNodeId, lifespan: Lifespan) {
        let wake = {
            let mut s = self.state.lock().unwrap();
            if s.task_status.state.is_done() {
                false
            } else if s.no_more_splits_for_lifespan.insert((plan_node_id, lifespan)) {
                s.pending_update_count += 1;
                true
            } else {
                false
            }
        };
        if wake {
            self.update_notify.notify_one();
        }
    }

    /// Install a newer output-buffer descriptor; stale versions are
    /// discarded.
    pub fn set_output_buffers(&self, new_buffers: OutputBuffers) {
        let wake = {
            let mut s = self.state.lock().unwrap();
            if s.task_status.state.is_done() {
                false
            } else if new_buffers.is_newer_than(&s.output_buffers) {
                s.output_buffers = new_buffers;
                s.pending_update_count += 1;
                true
            } else {
                if new_buffers.version < s.output_buffers.version {
                    debug!(
                        task_id = %self.task_id,
                        stale = new_buffers.version,
                        current = s.output_buffers.version,
                        "discarding stale output buffer descriptor"
                    );
                }
                false
            }
        };
        if wake {
            self.update_notify.notify_one();
        }
    }

    /// Request graceful termination (`DELETE ?abort=false`). Non-blocking;
    /// the expected end state is CANCELED.
    pub fn cancel(&self) {
        let wake = {
            let mut s = self.state.lock().unwrap();
            if s.task_status.state.is_done() || s.cleanup.is_some() {
                false
            } else {
                s.cleanup = Some(CleanupKind::Cancel);
                true
            }
        };
        if wake {
            self.update_notify.notify_one();
        }
    }

    /// Request forceful termination (`DELETE ?abort=true`). Non-blocking;
    /// the expected end state is ABORTED. Upgrades a not-yet-dispatched
    /// cancel.
    pub fn abort(&self) {
        let wake = {
            let mut s = self.state.lock().unwrap();
            if s.task_status.state.is_done() || s.cleanup_taken {
                false
            } else {
                let changed = s.cleanup != Some(CleanupKind::Abort);
                s.cleanup = Some(CleanupKind::Abort);
                changed
            }
        };
        if wake {
            self.update_notify.notify_one();
        }
    }

    /// Coordinator-side failure injection: enters FAILED immediately without
    /// waiting for the worker, surfacing `cause` verbatim.
    pub fn fail(&self, cause: impl Into<String>) {
        self.fail_with(ErrorCode::Internal, cause);
    }

    /// Latest published status snapshot.
    pub fn task_status(&self) -> TaskStatus {
        self.state.lock().unwrap().task_status.clone()
    }

    /// Latest published info snapshot.
    pub fn task_info(&self) -> TaskInfo {
        self.state.lock().unwrap().task_info.clone()
    }

    /// Whether the published state is terminal.
    pub fn is_done(&self) -> bool {
        self.state.lock().unwrap().task_status.state.is_done()
    }

    /// Splits staged on this handle and not yet handed to the wire.
    pub fn pending_split_count(&self) -> usize {
        let s = self.state.lock().unwrap();
        s.pending_splits.values().map(Vec::len).sum()
    }

    /// Register a listener fired on every state transition. Listeners run
    /// outside the handle locks and must tolerate a terminal handle.
    pub fn add_state_change_listener(&self, listener: impl Fn(TaskState) + Send + Sync + 'static) {
        self.listeners.lock().unwrap().push(Arc::new(listener));
    }

    pub(crate) fn fail_with(&self, error_code: ErrorCode, message: impl Into<String>) {
        let message = message.into();
        let transition = {
            let mut s = self.state.lock().unwrap();
            if s.task_status.state.is_done() {
                // Terminal already established; late causes are logged, not
                // recorded, so the failure list identifies the root cause.
                debug!(
                    task_id = %self.task_id,
                    code = %error_code,
                    cause = %message,
                    "suppressing failure reported after terminal state"
                );
                None
            } else {
                let old = s.task_status.state;
                s.task_status = TaskStatus::fail_with(&s.task_status, error_code, message);
                s.task_info.task_status = s.task_status.clone();
                if error_code == ErrorCode::RemoteTaskError {
                    s.worker_unreachable = true;
                }
                if !s.worker_unreachable && s.cleanup.is_none() {
                    s.cleanup = Some(CleanupKind::Abort);
                }
                Some((old, TaskState::Failed))
            }
        };
        if let Some((old, new)) = transition {
            warn!(task_id = %self.task_id, code = %error_code, "remote task failed");
            self.publish_transition(old, new);
        }
    }

    /// The single update-application rule shared by all three loops.
    pub(crate) fn update_task_status(&self, new_status: TaskStatus) -> StatusApplied {
        enum Outcome {
            Ignored,
            Applied(TaskState, TaskState),
            Mismatch(String),
        }

        let outcome = {
            let mut s = self.state.lock().unwrap();
            let known = &s.task_status;
            if known.state.is_done() {
                Outcome::Ignored
            } else if new_status.task_instance_id != known.task_instance_id
                && known.task_instance_id != self.initial_instance_id
            {
                Outcome::Mismatch(format!(
                    "task instance id changed from {} to {}",
                    known.task_instance_id, new_status.task_instance_id
                ))
            } else if new_status.version < known.version {
                Outcome::Mismatch(format!(
                    "task status version regressed from {} to {}",
                    known.version, new_status.version
                ))
            } else {
                let old = known.state;
                let new = new_status.state;
                s.task_status = new_status.clone();
                s.task_info.task_status = new_status;
                Outcome::Applied(old, new)
            }
        };

        match outcome {
            Outcome::Ignored => StatusApplied::Ignored,
            Outcome::Applied(old, new) => {
                self.publish_transition(old, new);
                StatusApplied::Applied
            }
            Outcome::Mismatch(message) => {
                self.fail_with(ErrorCode::RemoteTaskMismatch, message);
                StatusApplied::Rejected
            }
        }
    }

    /// Apply a full info reply: its embedded status goes through the update
    /// rule; heavyweight fields are stored only when the status was
    /// accepted.
    pub(crate) fn update_task_info(&self, info: TaskInfo) {
        if self.update_task_status(info.task_status.clone()) != StatusApplied::Applied {
            return;
        }
        let mut s = self.state.lock().unwrap();
        if !info.needs_plan {
            s.send_plan = false;
        }
        s.task_info = TaskInfo {
            task_status: s.task_status.clone(),
            ..info
        };
    }

    /// Reconcile worker-side final bookkeeping after local terminal.
    /// Applied at most once; only the heavyweight fields are taken; the
    /// published status stays authoritative, so a terminal state can never
    /// be rewritten by a late reply.
    pub(crate) fn apply_final_task_info(&self, info: TaskInfo) {
        let mut s = self.state.lock().unwrap();
        if s.final_info_applied {
            return;
        }
        if !info.task_status.state.is_done() {
            return;
        }
        let known = &s.task_status;
        if info.task_status.task_instance_id != known.task_instance_id
            && known.task_instance_id != self.initial_instance_id
        {
            // The worker lost the task; its record describes a different
            // incarnation.
            return;
        }
        s.task_info = TaskInfo {
            task_status: known.clone(),
            ..info
        };
        s.final_info_applied = true;
        debug!(task_id = %self.task_id, "final task info reconciled");
    }

    /// Force a locally synthesized terminal state. Used when the worker
    /// never acknowledges a terminate request.
    pub(crate) fn force_terminal(&self, state: TaskState) {
        debug_assert!(state.is_done());
        let transition = {
            let mut s = self.state.lock().unwrap();
            if s.task_status.state.is_done() {
                None
            } else {
                let old = s.task_status.state;
                s.task_status = TaskStatus::terminal_with(&s.task_status, state);
                s.task_info.task_status = s.task_status.clone();
                Some((old, state))
            }
        };
        if let Some((old, new)) = transition {
            self.publish_transition(old, new);
        }
    }

    /// Whether the sender has undelivered intent.
    pub(crate) fn has_pending_update(&self) -> bool {
        let s = self.state.lock().unwrap();
        !s.task_status.state.is_done() && s.pending_update_count > s.sent_update_count
    }

    /// Hand the terminate request to the sender exactly once. Returns the
    /// abort flag for the DELETE.
    pub(crate) fn take_cleanup_request(&self) -> Option<bool> {
        let mut s = self.state.lock().unwrap();
        if s.cleanup_taken {
            return None;
        }
        let kind = s.cleanup?;
        s.cleanup_taken = true;
        Some(kind == CleanupKind::Abort)
    }

    /// Whether the worker is known unreachable (aged-out RPC failures or a
    /// refused client); suppresses the final fetch and the terminate call.
    pub(crate) fn worker_unreachable(&self) -> bool {
        self.state.lock().unwrap().worker_unreachable
    }

    /// Build the next update request. Splits drained here are considered
    /// sent and are never staged again, keeping every sequence id at most
    /// once on the wire.
    pub(crate) fn take_update_snapshot(&self) -> Option<UpdateSnapshot> {
        let mut s = self.state.lock().unwrap();
        if s.task_status.state.is_done() {
            return None;
        }
        if s.pending_update_count <= s.sent_update_count {
            return None;
        }
        let dispatched_count = s.pending_update_count;

        let mut nodes: BTreeSet<PlanNodeId> = s.pending_splits.keys().cloned().collect();
        for node in s.no_more_splits.difference(&s.acked_no_more_splits) {
            nodes.insert(node.clone());
        }
        for (node, _) in s
            .no_more_splits_for_lifespan
            .difference(&s.acked_lifespans)
        {
            nodes.insert(node.clone());
        }

        let mut sources = Vec::with_capacity(nodes.len());
        let mut delivered_no_more_splits = Vec::new();
        let mut delivered_lifespans = Vec::new();
        for node in nodes {
            let splits = s.pending_splits.remove(&node).unwrap_or_default();
            let lifespans: BTreeSet<Lifespan> = s
                .no_more_splits_for_lifespan
                .iter()
                .filter(|pair| pair.0 == node && !s.acked_lifespans.contains(pair))
                .map(|pair| pair.1)
                .collect();
            let no_more =
                s.no_more_splits.contains(&node) && !s.acked_no_more_splits.contains(&node);

            if no_more {
                delivered_no_more_splits.push(node.clone());
            }
            for lifespan in &lifespans {
                delivered_lifespans.push((node.clone(), *lifespan));
            }
            sources.push(TaskSource {
                plan_node_id: node,
                splits,
                no_more_splits_for_lifespan: lifespans,
                no_more_splits: no_more,
            });
        }

        let fragment = if s.send_plan { s.fragment.clone() } else { None };
        let request = TaskUpdateRequest {
            session: self.session.clone(),
            fragment,
            sources,
            output_buffers: s.output_buffers.clone(),
            total_partitions: self.total_partitions,
        };
        self.publish_pending_splits_gauge(&s);
        Some(UpdateSnapshot {
            request,
            dispatched_count,
            delivered_no_more_splits,
            delivered_lifespans,
        })
    }

    /// Acknowledge a delivered snapshot: advances the sent counter and marks
    /// the delivered completion markers so they are never re-sent.
    pub(crate) fn mark_update_delivered(&self, snapshot: &UpdateSnapshot) {
        let mut s = self.state.lock().unwrap();
        s.sent_update_count = s.sent_update_count.max(snapshot.dispatched_count);
        s.acked_no_more_splits
            .extend(snapshot.delivered_no_more_splits.iter().cloned());
        s.acked_lifespans
            .extend(snapshot.delivered_lifespans.iter().cloned());
    }

    pub(crate) fn rpc(&self) -> &Arc<dyn RpcClient> {
        &self.rpc
    }

    pub(crate) fn codecs(&self) -> &CodecSet {
        &self.codecs
    }

    pub(crate) fn config(&self) -> &RemoteTaskConfig {
        &self.config
    }

    pub(crate) fn comm(&self) -> &CommunicationConfig {
        &self.comm
    }

    pub(crate) fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub(crate) fn metrics(&self) -> &MetricsRegistry {
        &self.metrics
    }

    pub(crate) fn stop_watch(&self) -> watch::Receiver<bool> {
        self.stop_rx.clone()
    }

    pub(crate) fn state_watch(&self) -> watch::Receiver<TaskState> {
        self.state_tx.subscribe()
    }

    pub(crate) async fn update_notified(&self) {
        self.update_notify.notified().await;
    }

    fn publish_transition(&self, old: TaskState, new: TaskState) {
        if old == new {
            return;
        }
        // send_replace publishes even when no loop has subscribed yet.
        self.state_tx.send_replace(new);
        if new.is_done() {
            self.metrics.inc_task_terminal(&new.to_string());
            // Wake the sender so it can dispatch cleanup and exit.
            self.update_notify.notify_one();
        }
        let listeners: Vec<StateChangeListener> =
            self.listeners.lock().unwrap().iter().cloned().collect();
        for listener in listeners {
            listener(new);
        }
    }

    fn publish_pending_splits_gauge(&self, s: &HandleState) {
        let pending: usize = s.pending_splits.values().map(Vec::len).sum();
        self.metrics.set_task_pending_splits(
            &self.task_id.query_id.0,
            self.task_id.stage_id.0,
            pending as u64,
        );
    }
}

#[cfg(test)]
#[path = "handle_tests.rs"]
mod tests;
