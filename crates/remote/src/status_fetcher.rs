//! Continuous task status long-poll loop.
//!
//! One request in flight at a time: `GET {task_uri}/status` carrying the
//! last known state and the max server-side hold. The worker replies early
//! when its state diverges, so the loop converges quickly without busy
//! polling. Replies feed the handle's update rule; transient failures back
//! off until the shared error window converts them into a terminal
//! remote-task error.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tracing::debug;

use crate::backoff::RequestErrorTracker;
use crate::handle::RemoteTaskHandle;
use crate::rpc::{
    format_max_wait, RpcError, RpcMethod, RpcRequest, HEADER_CURRENT_STATE, HEADER_MAX_WAIT,
};
use crate::task::ErrorCode;

pub(crate) struct TaskStatusFetcher {
    handle: Arc<RemoteTaskHandle>,
    tracker: RequestErrorTracker,
}

impl TaskStatusFetcher {
    pub(crate) fn new(handle: Arc<RemoteTaskHandle>) -> Self {
        let tracker = RequestErrorTracker::new(
            handle.task_id().clone(),
            "status fetch",
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
            if *stop.borrow() || self.handle.is_done() {
                break;
            }

            let current = self.handle.task_status();
            let max_wait = Duration::from_millis(self.handle.config().status_refresh_max_wait_ms);
            let grace = Duration::from_millis(self.handle.comm().request_grace_ms);
            let request = RpcRequest {
                method: RpcMethod::Get,
                uri: format!("{}/status", self.handle.task_uri()),
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
            // A terminal transition or stop abandons the in-flight long-poll.
            let reply = tokio::select! {
                reply = self.handle.rpc().request(request) => reply,
                _ = stop.changed() => break,
                _ = states.wait_for(|s| s.is_done()) => break,
            };
            let elapsed = started.elapsed().as_secs_f64();

            match reply {
                Ok(response) => {
                    let decoded = self
                        .handle
                        .codecs()
                        .decode_task_status(response.content_type.as_deref(), &response.body);
                    match decoded {
                        Ok(status) => {
                            self.handle
                                .metrics()
                                .record_task_request("status", "ok", elapsed);
                            self.tracker.request_succeeded();
                            self.handle.update_task_status(status);
                        }
                        Err(e) => {
                            let err = RpcError::Transport(format!("malformed status reply: {e}"));
                            self.handle
                                .metrics()
                                .record_task_request("status", "error", elapsed);
                            if !self.backoff_or_fail(&err, &mut stop).await {
                                break;
                            }
                        }
                    }
                }
                Err(err) => {
                    let outcome = if err.is_fatal() { "rejected" } else { "error" };
                    self.handle
                        .metrics()
                        .record_task_request("status", outcome, elapsed);
                    if !self.backoff_or_fail(&err, &mut stop).await {
                        break;
                    }
                }
            }
        }

        debug!(task_id = %self.handle.task_id(), "status fetcher exited");
    }

    // Returns false when the loop must exit.
    async fn backoff_or_fail(&mut self, err: &RpcError, stop: &mut watch::Receiver<bool>) -> bool {
        match self.tracker.request_failed(err) {
            Ok(delay) => {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => true,
                    _ = stop.changed() => false,
                }
            }
            Err(cause) => {
                self.handle.fail_with(ErrorCode::RemoteTaskError, cause);
                false
            }
        }
    }
}
