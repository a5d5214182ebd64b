//! Single-in-flight intent publisher.
//!
//! The sender owns two jobs:
//! - `POST {task_uri}` with the drained intent snapshot whenever the dirty
//!   counter moved past the sent counter; the reply is a full `TaskInfo`
//!   and is applied through the handle's update rule;
//! - one final `DELETE {task_uri}?abort={bool}` once a terminate was
//!   requested or the handle failed, with bounded retries.
//!
//! Exactly one request is ever in flight, so split delivery order matches
//! enqueue order and the no-more-splits markers can never overtake the
//! splits they seal.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::backoff::{Backoff, RequestErrorTracker};
use crate::handle::{RemoteTaskHandle, UpdateSnapshot};
use crate::rpc::{RpcError, RpcMethod, RpcRequest};
use crate::task::{ErrorCode, TaskState};

pub(crate) struct TaskUpdateSender {
    handle: Arc<RemoteTaskHandle>,
    tracker: RequestErrorTracker,
}

impl TaskUpdateSender {
    pub(crate) fn new(handle: Arc<RemoteTaskHandle>) -> Self {
        let tracker = RequestErrorTracker::new(
            handle.task_id().clone(),
            "task update",
            Duration::from_millis(handle.config().max_error_duration_ms),
            Arc::clone(handle.clock()),
            handle.metrics().clone(),
        );
        Self { handle, tracker }
    }

    pub(crate) async fn run(mut self) {
        let mut stop = self.handle.stop_watch();
        let mut states = self.handle.state_watch();

        loop {
            if *stop.borrow() {
                break;
            }

            // Termination requests outrank pending intent.
            if let Some(abort) = self.handle.take_cleanup_request() {
                if !self.handle.worker_unreachable() && !self.handle.rpc().is_closed() {
                    self.send_terminate(abort).await;
                } else {
                    self.settle_locally(abort);
                }
                continue;
            }

            if self.handle.is_done() {
                break;
            }

            if self.handle.has_pending_update() {
                self.send_update(&mut stop).await;
                continue;
            }

            tokio::select! {
                _ = self.handle.update_notified() => {}
                _ = stop.changed() => {}
                _ = states.wait_for(|s| s.is_done()) => {}
            }
        }

        debug!(task_id = %self.handle.task_id(), "update sender exited");
    }

    async fn send_update(&mut self, stop: &mut tokio::sync::watch::Receiver<bool>) {
        let Some(snapshot) = self.handle.take_update_snapshot() else {
            return;
        };
        let body = match self.handle.codecs().encode_update_request(&snapshot.request) {
            Ok(body) => body,
            Err(e) => {
                self.handle
                    .fail_with(ErrorCode::Internal, format!("failed to encode task update: {e}"));
                return;
            }
        };

        let request = RpcRequest {
            method: RpcMethod::Post,
            uri: self.handle.task_uri().to_string(),
            headers: vec![],
            accept: self.handle.codecs().accept(),
            content_type: Some(self.handle.codecs().request_content_type()),
            body: Some(body),
            timeout: Duration::from_millis(self.handle.comm().request_grace_ms),
        };

        let started = Instant::now();
        let result = self.handle.rpc().request(request).await;
        let elapsed = started.elapsed().as_secs_f64();

        match result {
            Ok(response) => {
                let decoded = self
                    .handle
                    .codecs()
                    .decode_task_info(response.content_type.as_deref(), &response.body);
                match decoded {
                    Ok(info) => {
                        self.handle
                            .metrics()
                            .record_task_request("update", "ok", elapsed);
                        self.tracker.request_succeeded();
                        self.handle.mark_update_delivered(&snapshot);
                        self.handle.update_task_info(info);
                    }
                    Err(e) => {
                        self.handle
                            .metrics()
                            .record_task_request("update", "error", elapsed);
                        let err = RpcError::Transport(format!("malformed update reply: {e}"));
                        self.backoff_or_fail(&err, &snapshot, stop).await;
                    }
                }
            }
            Err(err) => {
                let outcome = if err.is_fatal() { "rejected" } else { "error" };
                self.handle
                    .metrics()
                    .record_task_request("update", outcome, elapsed);
                self.backoff_or_fail(&err, &snapshot, stop).await;
            }
        }
    }

    // Splits in a failed snapshot are gone by contract (at most once on the
    // wire); the markers and buffers it carried stay pending and ride the
    // next request.
    async fn backoff_or_fail(
        &mut self,
        err: &RpcError,
        snapshot: &UpdateSnapshot,
        stop: &mut tokio::sync::watch::Receiver<bool>,
    ) {
        if !snapshot.request.sources.is_empty() {
            debug!(
                task_id = %self.handle.task_id(),
                sources = snapshot.request.sources.len(),
                "task update failed; drained splits will not be re-sent"
            );
        }
        match self.tracker.request_failed(err) {
            Ok(delay) => {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = stop.changed() => {}
                }
            }
            Err(cause) => {
                self.handle.fail_with(ErrorCode::RemoteTaskError, cause);
            }
        }
    }

    async fn send_terminate(&mut self, abort: bool) {
        let uri = format!("{}?abort={}", self.handle.task_uri(), abort);
        let attempts = self.handle.comm().cleanup_retry_limit.max(1);
        let mut backoff = Backoff::new();

        for attempt in 1..=attempts {
            let request = RpcRequest {
                method: RpcMethod::Delete,
                uri: uri.clone(),
                headers: vec![],
                accept: self.handle.codecs().accept(),
                content_type: None,
                body: None,
                timeout: Duration::from_millis(self.handle.comm().request_grace_ms),
            };

            let started = Instant::now();
            match self.handle.rpc().request(request).await {
                Ok(response) => {
                    self.handle.metrics().record_task_request(
                        "delete",
                        "ok",
                        started.elapsed().as_secs_f64(),
                    );
                    match self
                        .handle
                        .codecs()
                        .decode_task_info(response.content_type.as_deref(), &response.body)
                    {
                        Ok(info) => self.handle.update_task_info(info),
                        Err(e) => {
                            debug!(task_id = %self.handle.task_id(), error = %e, "malformed terminate reply")
                        }
                    }
                    if !self.handle.is_done() {
                        // The worker acknowledged but reported a non-terminal
                        // state; settle locally.
                        self.settle_locally(abort);
                    }
                    return;
                }
                Err(RpcError::Closed) => break,
                Err(err) => {
                    self.handle.metrics().record_task_request(
                        "delete",
                        "error",
                        started.elapsed().as_secs_f64(),
                    );
                    warn!(
                        task_id = %self.handle.task_id(),
                        attempt,
                        error = %err,
                        "terminate request failed"
                    );
                    tokio::time::sleep(backoff.next_delay()).await;
                }
            }
        }

        warn!(
            task_id = %self.handle.task_id(),
            abort,
            "unable to terminate task on worker; settling locally"
        );
        self.settle_locally(abort);
    }

    fn settle_locally(&self, abort: bool) {
        let state = if abort {
            TaskState::Aborted
        } else {
            TaskState::Canceled
        };
        self.handle.force_terminal(state);
    }
}
