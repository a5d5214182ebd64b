//! Controller metrics registry.
//!
//! The remote-task loops record request outcomes, retry counts, and terminal
//! transitions here; the registry is injected per factory with a process-wide
//! default for callers that do not care.

use std::sync::{Arc, OnceLock};

use prometheus::{
    CounterVec, Encoder, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};

/// Cloneable handle over the shared metric families.
#[derive(Clone, Debug)]
pub struct MetricsRegistry {
    inner: Arc<MetricsInner>,
}

#[derive(Debug)]
struct MetricsInner {
    registry: Registry,
    task_requests: CounterVec,
    task_request_seconds: HistogramVec,
    task_retries: CounterVec,
    task_terminal: CounterVec,
    task_pending_splits: GaugeVec,
}

impl MetricsRegistry {
    /// Create an empty registry with all controller metric families registered.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner::new()),
        }
    }

    /// Record one worker RPC with its action (`status`, `info`, `update`,
    /// `delete`), outcome (`ok`, `error`, `rejected`) and latency.
    pub fn record_task_request(&self, action: &str, outcome: &str, secs: f64) {
        self.inner
            .task_requests
            .with_label_values(&[action, outcome])
            .inc();
        self.inner
            .task_request_seconds
            .with_label_values(&[action])
            .observe(secs.max(0.0));
    }

    /// Record one scheduled retry for a loop action.
    pub fn inc_task_retries(&self, action: &str) {
        self.inner.task_retries.with_label_values(&[action]).inc();
    }

    /// Record a task reaching a terminal state.
    pub fn inc_task_terminal(&self, state: &str) {
        self.inner.task_terminal.with_label_values(&[state]).inc();
    }

    /// Publish the number of splits staged but not yet delivered for a task.
    pub fn set_task_pending_splits(&self, query_id: &str, stage_id: u32, pending: u64) {
        self.inner
            .task_pending_splits
            .with_label_values(&[query_id, &stage_id.to_string()])
            .set(pending as f64);
    }

    /// Render all families in the Prometheus text exposition format.
    pub fn render_prometheus(&self) -> String {
        let metric_families = self.inner.registry.gather();
        let mut out = Vec::new();
        let enc = TextEncoder::new();
        if enc.encode(&metric_families, &mut out).is_err() {
            return String::new();
        }
        String::from_utf8_lossy(&out).to_string()
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsInner {
    fn new() -> Self {
        let registry = Registry::new();

        let task_requests = counter_vec(
            &registry,
            "dfq_remote_task_requests_total",
            "Worker RPCs issued by the remote task controller",
            &["action", "outcome"],
        );
        let task_request_seconds = histogram_vec(
            &registry,
            "dfq_remote_task_request_seconds",
            "Worker RPC round-trip time",
            &["action"],
        );
        let task_retries = counter_vec(
            &registry,
            "dfq_remote_task_retries_total",
            "Transient-failure retries scheduled per loop",
            &["action"],
        );
        let task_terminal = counter_vec(
            &registry,
            "dfq_remote_task_terminal_total",
            "Remote tasks that reached a terminal state",
            &["state"],
        );
        let task_pending_splits = gauge_vec(
            &registry,
            "dfq_remote_task_pending_splits",
            "Splits staged on a handle and not yet delivered",
            &["query_id", "stage_id"],
        );

        Self {
            registry,
            task_requests,
            task_request_seconds,
            task_retries,
            task_terminal,
            task_pending_splits,
        }
    }
}

fn counter_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> CounterVec {
    let c = CounterVec::new(Opts::new(name, help), labels).expect("counter vec");
    registry
        .register(Box::new(c.clone()))
        .expect("register counter");
    c
}

fn gauge_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> GaugeVec {
    let g = GaugeVec::new(Opts::new(name, help), labels).expect("gauge vec");
    registry
        .register(Box::new(g.clone()))
        .expect("register gauge");
    g
}

fn histogram_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> HistogramVec {
    let h = HistogramVec::new(HistogramOpts::new(name, help), labels).expect("histogram vec");
    registry
        .register(Box::new(h.clone()))
        .expect("register histogram");
    h
}

static GLOBAL_METRICS: OnceLock<MetricsRegistry> = OnceLock::new();

/// Process-wide registry for callers that do not inject their own.
pub fn global_metrics() -> &'static MetricsRegistry {
    GLOBAL_METRICS.get_or_init(MetricsRegistry::new)
}
