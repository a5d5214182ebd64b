//! Transient-failure tracking for the RPC loops.
//!
//! Each loop owns one [`RequestErrorTracker`]. Transient failures are
//! tolerated with exponential backoff for at most `max_error_duration`
//! measured from the last success; past the window (or on a fatal failure)
//! the tracker converts the error history into a remote-task error that
//! fails the task.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dfq_common::metrics::MetricsRegistry;
use tracing::warn;

use crate::rpc::RpcError;
use crate::task::TaskId;

/// Monotonic time source; injectable so backoff windows are testable.
pub trait Clock: Send + Sync {
    /// Current monotonic instant.
    fn now(&self) -> Instant;
}

/// Wall-clock backed [`Clock`].
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

const MIN_BACKOFF: Duration = Duration::from_millis(50);
const MAX_BACKOFF: Duration = Duration::from_secs(10);
const MAX_RECENT_ERRORS: usize = 8;

/// Exponential backoff with a cap; deterministic (no jitter) so the retry
/// cadence is reproducible in tests.
#[derive(Debug)]
pub struct Backoff {
    attempts: u32,
}

impl Backoff {
    /// Fresh backoff with no recorded attempts.
    pub fn new() -> Self {
        Self { attempts: 0 }
    }

    /// Delay before the next attempt; doubles per failure up to the cap.
    pub fn next_delay(&mut self) -> Duration {
        let exponent = self.attempts.min(16);
        self.attempts = self.attempts.saturating_add(1);
        let delay = MIN_BACKOFF.saturating_mul(2_u32.saturating_pow(exponent));
        delay.min(MAX_BACKOFF)
    }

    /// Forget all recorded attempts.
    pub fn reset(&mut self) {
        self.attempts = 0;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}

/// Outcome of [`RequestErrorTracker::request_failed`]: either retry after
/// the given delay, or give up with the accumulated cause.
pub type RetryDecision = std::result::Result<Duration, String>;

/// Per-loop failure window.
pub struct RequestErrorTracker {
    task_id: TaskId,
    action: &'static str,
    max_error_duration: Duration,
    clock: Arc<dyn Clock>,
    backoff: Backoff,
    last_success_at: Instant,
    recent_errors: VecDeque<String>,
    metrics: MetricsRegistry,
}

impl RequestErrorTracker {
    /// Tracker for one loop (`action` names it in logs and metrics).
    pub fn new(
        task_id: TaskId,
        action: &'static str,
        max_error_duration: Duration,
        clock: Arc<dyn Clock>,
        metrics: MetricsRegistry,
    ) -> Self {
        let now = clock.now();
        Self {
            task_id,
            action,
            max_error_duration,
            clock,
            backoff: Backoff::new(),
            last_success_at: now,
            recent_errors: VecDeque::new(),
            metrics,
        }
    }

    /// Record a success: resets the error window and backoff.
    pub fn request_succeeded(&mut self) {
        self.backoff.reset();
        self.last_success_at = self.clock.now();
        self.recent_errors.clear();
    }

    /// Record a failure. Returns the backoff delay to wait before retrying,
    /// or the terminal cause once the window is exhausted or the failure is
    /// fatal.
    pub fn request_failed(&mut self, error: &RpcError) -> RetryDecision {
        if error.is_fatal() {
            return Err(format!(
                "{} for task {} rejected: {error}",
                self.action, self.task_id
            ));
        }

        self.push_error(error);
        let since_success = self.clock.now().saturating_duration_since(self.last_success_at);
        if since_success >= self.max_error_duration {
            let history: Vec<String> = self.recent_errors.iter().cloned().collect();
            return Err(format!(
                "{} for task {} failed for {:?} (over the {:?} limit): [{}]",
                self.action,
                self.task_id,
                since_success,
                self.max_error_duration,
                history.join("; ")
            ));
        }

        let delay = self.backoff.next_delay();
        self.metrics.inc_task_retries(self.action);
        warn!(
            task_id = %self.task_id,
            action = self.action,
            retry_in_ms = delay.as_millis() as u64,
            error = %error,
            "transient rpc failure"
        );
        Ok(delay)
    }

    fn push_error(&mut self, error: &RpcError) {
        if self.recent_errors.len() == MAX_RECENT_ERRORS {
            self.recent_errors.pop_front();
        }
        self.recent_errors.push_back(error.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct FakeClock {
        now: Mutex<Instant>,
    }

    impl FakeClock {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                now: Mutex::new(Instant::now()),
            })
        }

        fn advance(&self, by: Duration) {
            let mut now = self.now.lock().unwrap();
            *now += by;
        }
    }

    impl Clock for FakeClock {
        fn now(&self) -> Instant {
            *self.now.lock().unwrap()
        }
    }

    fn tracker(clock: Arc<FakeClock>) -> RequestErrorTracker {
        RequestErrorTracker::new(
            TaskId::new("q", 1, 0, 0),
            "status",
            Duration::from_secs(30),
            clock,
            MetricsRegistry::new(),
        )
    }

    #[test]
    fn backoff_doubles_to_cap() {
        let mut backoff = Backoff::new();
        assert_eq!(backoff.next_delay(), Duration::from_millis(50));
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
        assert_eq!(backoff.next_delay(), Duration::from_millis(200));
        for _ in 0..20 {
            assert!(backoff.next_delay() <= Duration::from_secs(10));
        }
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(50));
    }

    #[test]
    fn transient_failures_retry_until_window_expires() {
        let clock = FakeClock::new();
        let mut tracker = tracker(clock.clone());

        let err = RpcError::Transport("connection reset".to_string());
        assert!(tracker.request_failed(&err).is_ok());
        clock.advance(Duration::from_secs(10));
        assert!(tracker.request_failed(&err).is_ok());

        clock.advance(Duration::from_secs(25));
        let cause = tracker.request_failed(&err).unwrap_err();
        assert!(cause.contains("status"));
        assert!(cause.contains("connection reset"));
    }

    #[test]
    fn success_resets_the_window() {
        let clock = FakeClock::new();
        let mut tracker = tracker(clock.clone());
        let err = RpcError::Timeout;

        assert!(tracker.request_failed(&err).is_ok());
        clock.advance(Duration::from_secs(29));
        tracker.request_succeeded();
        clock.advance(Duration::from_secs(29));
        assert!(tracker.request_failed(&err).is_ok());
    }

    #[test]
    fn fatal_failure_short_circuits() {
        let clock = FakeClock::new();
        let mut tracker = tracker(clock);
        let cause = tracker.request_failed(&RpcError::Closed).unwrap_err();
        assert!(cause.contains("rejected"));
    }
}
