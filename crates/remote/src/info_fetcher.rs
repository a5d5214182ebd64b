//! Periodic full task info fetch loop.
//!
//! Runs at `info_update_interval` against `GET {task_uri}` with the same
//! long-poll headers as the status loop but a shorter hold. After the
//! handle turns terminal the loop performs exactly one reconciliation
//! fetch so the published `TaskInfo` reflects the worker-side final record,
//! unless the worker is known unreachable, in which case the locally
//! synthesized terminal info stands.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::backoff::RequestErrorTracker;
use crate::handle::RemoteTaskHandle;
use crate::rpc::{
    format_max_wait, RpcError, RpcMethod, RpcRequest, HEADER_CURRENT_STATE, HEADER_MAX_WAIT,
};
use crate::task::{ErrorCode, TaskInfo};

pub(crate) struct TaskInfoFetcher {
    handle: Arc<RemoteTaskHandle>,
    tracker: RequestErrorTracker,
}

impl TaskInfoFetcher {
    pub(crate) fn new(handle: Arc<RemoteTaskHandle>) -> Self {
        let tracker = RequestErrorTracker::new(
            handle.task_id().clone(),
            "info fetch",
            Duration::from_millis(handle.config().max_error_duration_ms),
            Arc::clone(handle.clock()),
            handle.metrics().clone(),
        );
        Self { handle, tracker }
    }

    pub(crate) async fn run(mut self) {
        let mut stop = self.handle.stop_watch();
        let mut states = self.handle.state_watch();
        let interval = Duration::from_millis(self.handle.config().info_update_interval_ms);

        loop {
            if *stop.borrow() {
                break;
            }
            if self.handle.is_done() {
                self.reconcile_final().await;
                break;
            }

            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = states.wait_for(|s| s.is_done()) => continue,
                _ = stop.changed() => continue,
            }
            if *stop.borrow() || self.handle.is_done() {
                continue;
            }

            match self.fetch().await {
                Ok(info) => {
                    self.tracker.request_succeeded();
                    self.handle.update_task_info(info);
                }
                Err(err) => match self.tracker.request_failed(&err) {
                    Ok(delay) => {
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            _ = stop.changed() => {}
                        }
                    }
                    Err(cause) => {
                        // Marks the worker unreachable; the loop top skips
                        // the reconciliation fetch on the way out.
                        self.handle.fail_with(ErrorCode::RemoteTaskError, cause);
                    }
                },
            }
        }

        debug!(task_id = %self.handle.task_id(), "info fetcher exited");
    }

    async fn fetch(&self) -> std::result::Result<TaskInfo, RpcError> {
        let current = self.handle.task_status();
        let max_wait = Duration::from_millis(self.handle.config().task_info_refresh_max_wait_ms);
        let grace = Duration::from_millis(self.handle.comm().request_grace_ms);
        let request = RpcRequest {
            method: RpcMethod::Get,
            uri: self.handle.task_uri().to_string(),
            headers: vec![
                (HEADER_CURRENT_STATE, current.state.to_string()),
                (HEADER_MAX_WAIT, format_max_wait(max_wait)),
            ],
            accept: self.handle.codecs().accept(),
            content_type: None,
            body: None,
            timeout: max_wait + grace,
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
                            .record_task_request("info", "ok", elapsed);
                        Ok(info)
                    }
                    Err(e) => {
                        self.handle
                            .metrics()
                            .record_task_request("info", "error", elapsed);
                        Err(RpcError::Transport(format!("malformed info reply: {e}")))
                    }
                }
            }
            Err(err) => {
                let outcome = if err.is_fatal() { "rejected" } else { "error" };
                self.handle
                    .metrics()
                    .record_task_request("info", outcome, elapsed);
                Err(err)
            }
        }
    }

    async fn reconcile_final(&self) {
        if self.handle.worker_unreachable() || self.handle.rpc().is_closed() {
            return;
        }
        match self.fetch().await {
            Ok(info) => self.handle.apply_final_task_info(info),
            Err(err) => {
                debug!(
                    task_id = %self.handle.task_id(),
                    error = %err,
                    "final task info fetch failed; keeping local terminal info"
                );
            }
        }
    }
}
