use serde::{Deserialize, Serialize};

use crate::{DfqError, Result};

/// Per-handle remote task controller knobs.
///
/// Timings are wall-clock milliseconds. The long-poll waits are advisory
/// values sent to the worker; the worker holds the request until its state
/// differs from the client-supplied one or the wait elapses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteTaskConfig {
    /// Max server-side hold for a task status long-poll.
    pub status_refresh_max_wait_ms: u64,
    /// Interval between full task info fetches.
    pub info_update_interval_ms: u64,
    /// Max server-side hold for a task info long-poll.
    pub task_info_refresh_max_wait_ms: u64,
    /// Wall-clock window during which transient RPC failures are tolerated
    /// before a task is failed with a remote-task error.
    pub max_error_duration_ms: u64,
    /// Emit per-request debug logs from the HTTP client.
    #[serde(default)]
    pub trace_http: bool,
}

impl Default for RemoteTaskConfig {
    fn default() -> Self {
        Self {
            status_refresh_max_wait_ms: 1_000,
            info_update_interval_ms: 3_000,
            task_info_refresh_max_wait_ms: 500,
            max_error_duration_ms: 300_000, // 5min
            trace_http: false,
        }
    }
}

impl RemoteTaskConfig {
    /// Validate timing knobs; zero windows make the retry loops spin or
    /// fail instantly and are rejected up front.
    pub fn validate(&self) -> Result<()> {
        if self.status_refresh_max_wait_ms == 0 {
            return Err(DfqError::InvalidConfig(
                "status_refresh_max_wait_ms must be non-zero".to_string(),
            ));
        }
        if self.info_update_interval_ms == 0 {
            return Err(DfqError::InvalidConfig(
                "info_update_interval_ms must be non-zero".to_string(),
            ));
        }
        if self.task_info_refresh_max_wait_ms == 0 {
            return Err(DfqError::InvalidConfig(
                "task_info_refresh_max_wait_ms must be non-zero".to_string(),
            ));
        }
        if self.max_error_duration_ms == 0 {
            return Err(DfqError::InvalidConfig(
                "max_error_duration_ms must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Coordinator-to-worker communication knobs shared by all handles of a factory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommunicationConfig {
    /// Client-side grace added on top of the advertised long-poll wait
    /// before a request is considered timed out.
    pub request_grace_ms: u64,
    /// Attempts for the final terminate call before giving up on the worker.
    pub cleanup_retry_limit: u32,
    /// Prefer the compact binary framing on the wire; replies in either
    /// framing are accepted regardless.
    pub prefer_binary_encoding: bool,
}

impl Default for CommunicationConfig {
    fn default() -> Self {
        Self {
            request_grace_ms: 5_000,
            cleanup_retry_limit: 3,
            prefer_binary_encoding: true,
        }
    }
}
