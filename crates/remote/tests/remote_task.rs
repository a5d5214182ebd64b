//! End-to-end remote task controller tests against an in-process mock
//! worker speaking the task HTTP protocol.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use serde::Deserialize;
use tokio::sync::oneshot;

use dfq_common::{CommunicationConfig, MetricsRegistry, NodeId, RemoteTaskConfig};
use dfq_remote::codec::{CONTENT_TYPE_BINARY, CONTENT_TYPE_JSON};
use dfq_remote::rpc::{parse_max_wait, HEADER_MAX_WAIT};
use dfq_remote::{
    BinaryTaskCodec, CodecSet, ErrorCode, HttpRpcClient, JsonTaskCodec, Lifespan, OutputBuffers,
    PlanFragment, PlanNodeId, RemoteTaskFactory, RemoteTaskHandle, RpcClient,
    SessionRepresentation, Split, TaskCodec, TaskId, TaskInfo, TaskSource, TaskState, TaskStatus,
    TaskUpdateRequest,
};

const INITIAL_TASK_INSTANCE_ID: &str = "task-instance-id";
const NEW_TASK_INSTANCE_ID: &str = "task-instance-id-x";
const FAIL_TIMEOUT: Duration = Duration::from_secs(20);
const IDLE_TIMEOUT: Duration = Duration::from_millis(800);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FailureScenario {
    NoFailure,
    TaskMismatch,
    TaskMismatchWhenVersionIsHigh,
    RejectedExecution,
}

struct WorkerInner {
    scenario: FailureScenario,
    instance_id: String,
    version: u64,
    task_state: TaskState,
    status_fetches: u64,
    fragment_received: bool,
    initial_status: Option<TaskStatus>,
    sources: BTreeMap<PlanNodeId, TaskSource>,
    posted_updates: Vec<TaskUpdateRequest>,
    deletes: Vec<bool>,
    reply_binary: bool,
}

/// Worker-side task resource; the analog of the real worker's task endpoint
/// with scenario switches for failure injection.
#[derive(Clone)]
struct MockWorker {
    inner: Arc<Mutex<WorkerInner>>,
    last_activity: Arc<Mutex<Instant>>,
    rpc: Arc<Mutex<Option<Arc<dyn RpcClient>>>>,
}

impl MockWorker {
    fn new(scenario: FailureScenario) -> Self {
        Self {
            inner: Arc::new(Mutex::new(WorkerInner {
                scenario,
                instance_id: INITIAL_TASK_INSTANCE_ID.to_string(),
                version: 0,
                task_state: TaskState::Planned,
                status_fetches: 0,
                fragment_received: false,
                initial_status: None,
                sources: BTreeMap::new(),
                posted_updates: Vec::new(),
                deletes: Vec::new(),
                reply_binary: false,
            })),
            last_activity: Arc::new(Mutex::new(Instant::now())),
            rpc: Arc::new(Mutex::new(None)),
        }
    }

    fn set_initial_task_info(&self, info: TaskInfo) {
        let mut inner = self.inner.lock().unwrap();
        inner.task_state = info.task_status.state;
        inner.version = info.task_status.version;
        if inner.scenario == FailureScenario::TaskMismatchWhenVersionIsHigh {
            // Large enough that a reset-to-zero worker can never catch up.
            inner.version = 1_000_000;
        }
        inner.initial_status = Some(info.task_status);
    }

    fn set_rpc_client(&self, rpc: Arc<dyn RpcClient>) {
        *self.rpc.lock().unwrap() = Some(rpc);
    }

    fn set_reply_binary(&self, binary: bool) {
        self.inner.lock().unwrap().reply_binary = binary;
    }

    fn touch(&self) {
        *self.last_activity.lock().unwrap() = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_activity.lock().unwrap().elapsed()
    }

    fn source(&self, node: &PlanNodeId) -> Option<TaskSource> {
        self.inner.lock().unwrap().sources.get(node).cloned()
    }

    fn posted_updates(&self) -> Vec<TaskUpdateRequest> {
        self.inner.lock().unwrap().posted_updates.clone()
    }

    fn deletes(&self) -> Vec<bool> {
        self.inner.lock().unwrap().deletes.clone()
    }

    fn status_fetches(&self) -> u64 {
        self.inner.lock().unwrap().status_fetches
    }

    fn build_status(&self) -> Result<TaskStatus, StatusCode> {
        let mut inner = self.inner.lock().unwrap();
        inner.status_fetches += 1;
        match inner.scenario {
            FailureScenario::TaskMismatch | FailureScenario::TaskMismatchWhenVersionIsHigh => {
                // Simulate a worker restart at the 10th reply.
                if inner.status_fetches == 10 {
                    inner.instance_id = NEW_TASK_INSTANCE_ID.to_string();
                    inner.version = 0;
                }
            }
            FailureScenario::RejectedExecution => {
                if inner.status_fetches >= 10 {
                    if let Some(rpc) = self.rpc.lock().unwrap().as_ref() {
                        rpc.close();
                    }
                    return Err(StatusCode::INTERNAL_SERVER_ERROR);
                }
            }
            FailureScenario::NoFailure => {}
        }
        inner.version += 1;
        let template = inner
            .initial_status
            .clone()
            .expect("initial task info not set");
        Ok(TaskStatus {
            task_instance_id: inner.instance_id.clone(),
            version: inner.version,
            state: inner.task_state,
            ..template
        })
    }

    fn build_info(&self) -> Result<TaskInfo, StatusCode> {
        let status = self.build_status()?;
        let inner = self.inner.lock().unwrap();
        let no_more_splits = inner
            .sources
            .values()
            .filter(|s| s.no_more_splits)
            .map(|s| s.plan_node_id.clone())
            .collect();
        Ok(TaskInfo {
            task_status: status,
            last_heartbeat_ms: 1,
            output_buffers: Default::default(),
            no_more_splits,
            stats: Default::default(),
            needs_plan: !inner.fragment_received,
        })
    }

    fn status_response(&self, status: &TaskStatus) -> Response {
        let binary = self.inner.lock().unwrap().reply_binary;
        let (content_type, body) = if binary {
            (CONTENT_TYPE_BINARY, BinaryTaskCodec.encode_task_status(status))
        } else {
            (CONTENT_TYPE_JSON, JsonTaskCodec.encode_task_status(status))
        };
        ([(header::CONTENT_TYPE, content_type)], body.expect("encode status")).into_response()
    }

    fn info_response(&self, info: &TaskInfo) -> Response {
        let binary = self.inner.lock().unwrap().reply_binary;
        let (content_type, body) = if binary {
            (CONTENT_TYPE_BINARY, BinaryTaskCodec.encode_task_info(info))
        } else {
            (CONTENT_TYPE_JSON, JsonTaskCodec.encode_task_info(info))
        };
        ([(header::CONTENT_TYPE, content_type)], body.expect("encode info")).into_response()
    }
}

fn request_max_wait(headers: &HeaderMap) -> Duration {
    headers
        .get(HEADER_MAX_WAIT)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_max_wait)
        .unwrap_or(Duration::ZERO)
}

async fn get_status(State(worker): State<MockWorker>, headers: HeaderMap) -> Response {
    worker.touch();
    // Server-side hold; the mock has no state-change wakeup, so it holds the
    // full wait like the real worker does on a quiet task.
    tokio::time::sleep(request_max_wait(&headers).min(Duration::from_millis(50))).await;
    match worker.build_status() {
        Ok(status) => worker.status_response(&status),
        Err(code) => code.into_response(),
    }
}

async fn get_info(State(worker): State<MockWorker>, headers: HeaderMap) -> Response {
    worker.touch();
    tokio::time::sleep(request_max_wait(&headers).min(Duration::from_millis(50))).await;
    match worker.build_info() {
        Ok(info) => worker.info_response(&info),
        Err(code) => code.into_response(),
    }
}

async fn post_update(
    State(worker): State<MockWorker>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    worker.touch();
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or(CONTENT_TYPE_JSON);
    let decoded = if content_type.starts_with(CONTENT_TYPE_BINARY) {
        BinaryTaskCodec.decode_update_request(&body)
    } else {
        JsonTaskCodec.decode_update_request(&body)
    };
    let update = match decoded {
        Ok(update) => update,
        Err(_) => return StatusCode::BAD_REQUEST.into_response(),
    };

    {
        let mut inner = worker.inner.lock().unwrap();
        if update.fragment.is_some() {
            inner.fragment_received = true;
        }
        for source in &update.sources {
            inner
                .sources
                .entry(source.plan_node_id.clone())
                .and_modify(|existing| existing.merge(source))
                .or_insert_with(|| source.clone());
        }
        inner.posted_updates.push(update);
    }

    match worker.build_info() {
        Ok(info) => worker.info_response(&info),
        Err(code) => code.into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct AbortQuery {
    #[serde(default = "default_abort")]
    abort: bool,
}

fn default_abort() -> bool {
    true
}

async fn delete_task(State(worker): State<MockWorker>, Query(query): Query<AbortQuery>) -> Response {
    worker.touch();
    {
        let mut inner = worker.inner.lock().unwrap();
        inner.task_state = if query.abort {
            TaskState::Aborted
        } else {
            TaskState::Canceled
        };
        inner.deletes.push(query.abort);
    }
    match worker.build_info() {
        Ok(info) => worker.info_response(&info),
        Err(code) => code.into_response(),
    }
}

struct MockWorkerServer {
    worker: MockWorker,
    base_url: String,
    shutdown_tx: Option<oneshot::Sender<()>>,
    _task: tokio::task::JoinHandle<()>,
}

impl MockWorkerServer {
    async fn start(scenario: FailureScenario) -> Self {
        let worker = MockWorker::new(scenario);
        let app = Router::new()
            .route(
                "/v1/task/:node_id/:task_id",
                get(get_info).post(post_update).delete(delete_task),
            )
            .route("/v1/task/:node_id/:task_id/status", get(get_status))
            .with_state(worker.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock worker");
        let addr = listener.local_addr().expect("local addr");
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let server = axum::serve(listener, app).with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            });
            let _ = server.await;
        });

        Self {
            worker,
            base_url: format!("http://{addr}"),
            shutdown_tx: Some(shutdown_tx),
            _task: task,
        }
    }
}

impl Drop for MockWorkerServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

fn test_config() -> RemoteTaskConfig {
    RemoteTaskConfig {
        status_refresh_max_wait_ms: 25,
        info_update_interval_ms: 100,
        task_info_refresh_max_wait_ms: 25,
        max_error_duration_ms: 2_000,
        trace_http: false,
    }
}

fn test_factory() -> RemoteTaskFactory {
    let rpc: Arc<dyn RpcClient> = Arc::new(HttpRpcClient::new(false).expect("http client"));
    RemoteTaskFactory::new(
        test_config(),
        CommunicationConfig::default(),
        rpc,
        CodecSet::binary_preferred(),
        MetricsRegistry::new(),
    )
    .expect("factory")
}

fn scan_node() -> PlanNodeId {
    PlanNodeId::new("scan-0")
}

fn create_task(factory: &RemoteTaskFactory, base_url: &str) -> Arc<RemoteTaskHandle> {
    factory
        .create_remote_task(
            SessionRepresentation::new("q", "tester"),
            TaskId::new("q", 1, 2, 0),
            base_url,
            NodeId("worker-1".to_string()),
            PlanFragment {
                fragment_id: 1,
                root_node_id: scan_node(),
                plan_json: serde_json::json!({ "op": "scan", "table": "t" }),
            },
            HashMap::new(),
            OutputBuffers::initial().with_buffer("out-0", 0),
            Some(1),
        )
        .expect("create remote task")
}

async fn poll(mut condition: impl FnMut() -> bool) {
    let fail_at = Instant::now() + FAIL_TIMEOUT;
    while !condition() {
        assert!(
            Instant::now() < fail_at,
            "condition not reached within {FAIL_TIMEOUT:?}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn wait_until_idle(worker: &MockWorker) {
    let fail_at = Instant::now() + FAIL_TIMEOUT;
    loop {
        let idle = worker.idle_for();
        if idle >= IDLE_TIMEOUT {
            return;
        }
        assert!(Instant::now() < fail_at, "activity did not stop within {FAIL_TIMEOUT:?}");
        tokio::time::sleep(IDLE_TIMEOUT - idle).await;
    }
}

fn assert_sequence_ids_unique(updates: &[TaskUpdateRequest]) {
    let mut seen = std::collections::BTreeSet::new();
    for update in updates {
        for source in &update.sources {
            for split in &source.splits {
                assert!(
                    seen.insert(split.sequence_id),
                    "sequence id {} appeared in more than one update",
                    split.sequence_id
                );
            }
        }
    }
}

#[tokio::test]
async fn happy_path_delivers_intent_and_cancels() {
    let server = MockWorkerServer::start(FailureScenario::NoFailure).await;
    let factory = test_factory();
    let task = create_task(&factory, &server.base_url);
    server.worker.set_initial_task_info(task.task_info());
    task.start();

    let node = scan_node();
    let lifespan = Lifespan::Group(3);
    task.add_splits(HashMap::from([(
        node.clone(),
        vec![Split::new("test", serde_json::json!({ "path": "/t/p0" })).with_lifespan(lifespan)],
    )]));
    poll(|| {
        server
            .worker
            .source(&node)
            .map(|s| s.splits.len() == 1)
            .unwrap_or(false)
    })
    .await;

    task.no_more_splits_for_lifespan(node.clone(), lifespan);
    poll(|| {
        server
            .worker
            .source(&node)
            .map(|s| s.no_more_splits_for_lifespan.len() == 1)
            .unwrap_or(false)
    })
    .await;

    task.no_more_splits(node.clone());
    poll(|| {
        server
            .worker
            .source(&node)
            .map(|s| s.no_more_splits)
            .unwrap_or(false)
    })
    .await;

    task.cancel();
    poll(|| task.task_status().state.is_done()).await;
    poll(|| task.task_info().task_status.state.is_done()).await;

    assert_eq!(task.task_status().state, TaskState::Canceled);
    assert!(task.task_status().failures.is_empty());
    assert_eq!(server.worker.deletes(), vec![false]);
    assert_sequence_ids_unique(&server.worker.posted_updates());

    factory.stop();
}

#[tokio::test]
async fn binary_replies_are_accepted() {
    let server = MockWorkerServer::start(FailureScenario::NoFailure).await;
    server.worker.set_reply_binary(true);
    let factory = test_factory();
    let task = create_task(&factory, &server.base_url);
    server.worker.set_initial_task_info(task.task_info());
    task.start();

    let node = scan_node();
    task.add_splits(HashMap::from([(
        node.clone(),
        vec![Split::new("test", serde_json::json!({ "path": "/t/p0" }))],
    )]));
    poll(|| {
        server
            .worker
            .source(&node)
            .map(|s| s.splits.len() == 1)
            .unwrap_or(false)
    })
    .await;

    task.cancel();
    poll(|| task.task_status().state.is_done()).await;
    assert_eq!(task.task_status().state, TaskState::Canceled);

    factory.stop();
}

async fn run_failure_scenario(scenario: FailureScenario) -> (MockWorkerServer, Arc<RemoteTaskHandle>) {
    let server = MockWorkerServer::start(scenario).await;
    let factory = test_factory();
    if scenario == FailureScenario::RejectedExecution {
        server.worker.set_rpc_client(Arc::clone(factory.rpc_client()));
    }
    let task = create_task(&factory, &server.base_url);
    server.worker.set_initial_task_info(task.task_info());
    task.start();

    wait_until_idle(&server.worker).await;
    factory.stop();

    assert!(
        task.task_status().state.is_done(),
        "task status is not in a done state: {:?}",
        task.task_status()
    );
    (server, task)
}

#[tokio::test]
async fn worker_restart_fails_with_remote_task_mismatch() {
    let (_server, task) = run_failure_scenario(FailureScenario::TaskMismatch).await;

    let status = task.task_status();
    assert_eq!(status.state, TaskState::Failed);
    assert_eq!(status.failures.len(), 1);
    assert_eq!(status.failures[0].error_code, ErrorCode::RemoteTaskMismatch);
    assert!(task.task_info().task_status.state.is_done());
}

#[tokio::test]
async fn worker_restart_with_high_version_fails_with_mismatch() {
    let (_server, task) =
        run_failure_scenario(FailureScenario::TaskMismatchWhenVersionIsHigh).await;

    let status = task.task_status();
    assert_eq!(status.state, TaskState::Failed);
    assert_eq!(status.failures.len(), 1);
    assert_eq!(status.failures[0].error_code, ErrorCode::RemoteTaskMismatch);
    assert!(task.task_info().task_status.state.is_done());
}

#[tokio::test]
async fn rejected_execution_fails_with_remote_task_error() {
    let (_server, task) = run_failure_scenario(FailureScenario::RejectedExecution).await;

    let status = task.task_status();
    assert_eq!(status.state, TaskState::Failed);
    assert_eq!(status.failures.len(), 1);
    assert_eq!(status.failures[0].error_code, ErrorCode::RemoteTaskError);
}

#[tokio::test]
async fn idle_task_issues_no_updates() {
    let server = MockWorkerServer::start(FailureScenario::NoFailure).await;
    let factory = test_factory();
    let task = create_task(&factory, &server.base_url);
    server.worker.set_initial_task_info(task.task_info());
    task.start();

    // The creation update delivers the fragment, then intent is quiescent.
    poll(|| !server.worker.posted_updates().is_empty()).await;
    let posts_after_create = server.worker.posted_updates().len();
    let fetches_before = server.worker.status_fetches();

    tokio::time::sleep(Duration::from_millis(500)).await;

    assert_eq!(
        server.worker.posted_updates().len(),
        posts_after_create,
        "an idle task must not issue updates"
    );
    assert!(
        server.worker.status_fetches() > fetches_before,
        "long-polling must continue while idle"
    );
    assert!(!task.task_status().state.is_done());

    factory.stop();
}

#[tokio::test]
async fn late_replies_never_rewind_a_failed_task() {
    let server = MockWorkerServer::start(FailureScenario::NoFailure).await;
    let factory = test_factory();
    let task = create_task(&factory, &server.base_url);
    server.worker.set_initial_task_info(task.task_info());
    task.start();

    // Let a few status versions flow first.
    poll(|| server.worker.status_fetches() >= 3).await;
    task.fail("injected planner failure");
    let failed = task.task_status();
    assert_eq!(failed.state, TaskState::Failed);

    // Long-polls still in flight (and the final info fetch) keep returning
    // fresh worker state; none of it may surface.
    tokio::time::sleep(Duration::from_millis(400)).await;
    let status = task.task_status();
    assert_eq!(status.state, TaskState::Failed);
    assert!(status.version >= failed.version);
    assert_eq!(task.task_info().task_status.state, TaskState::Failed);

    factory.stop();
}

#[tokio::test]
async fn factory_stop_quiesces_all_loops() {
    let server = MockWorkerServer::start(FailureScenario::NoFailure).await;
    let factory = test_factory();
    let task = create_task(&factory, &server.base_url);
    server.worker.set_initial_task_info(task.task_info());
    task.start();

    poll(|| server.worker.status_fetches() >= 2).await;
    factory.stop();

    // Give in-flight exchanges a moment to resolve, then require silence.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let fetches = server.worker.status_fetches();
    let posts = server.worker.posted_updates().len();
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(server.worker.status_fetches(), fetches);
    assert_eq!(server.worker.posted_updates().len(), posts);

    // The task was never terminated by the worker; the handle simply stops
    // synchronizing.
    drop(task);
}

#[tokio::test]
async fn cancel_before_start_is_honored() {
    let server = MockWorkerServer::start(FailureScenario::NoFailure).await;
    let factory = test_factory();
    let task = create_task(&factory, &server.base_url);
    server.worker.set_initial_task_info(task.task_info());

    task.cancel();
    task.start();
    poll(|| task.task_status().state.is_done()).await;
    assert_eq!(task.task_status().state, TaskState::Canceled);

    factory.stop();
}
