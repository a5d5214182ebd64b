//! HTTP RPC client capability.
//!
//! The controller consumes an [`RpcClient`] rather than a concrete HTTP
//! stack so the loops can be exercised against in-process fakes. Failures
//! are data: an [`RpcError`] carries everything the retry classification
//! needs, and no control flow depends on panics or downcasting.
//!
//! Wire contract (rooted at `{worker_base}/v1/task/{node_id}`):
//! - `GET  {task_uri}/status`: long-poll for [`TaskStatus`](crate::task::TaskStatus)
//! - `GET  {task_uri}`: long-poll for [`TaskInfo`](crate::task::TaskInfo)
//! - `POST {task_uri}`: create-or-update, idempotent under split sequence ids
//! - `DELETE {task_uri}?abort={true|false}`: terminate
//!
//! Long-poll GETs MUST carry both [`HEADER_CURRENT_STATE`] and
//! [`HEADER_MAX_WAIT`]; the server holds the reply until its state differs
//! from the client-supplied one or the wait elapses.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dfq_common::{DfqError, Result};
use thiserror::Error;
use tracing::debug;

/// Header carrying the client's currently-known task state on long-polls.
pub const HEADER_CURRENT_STATE: &str = "X-Presto-Current-State";
/// Header carrying the client-supplied max server-side hold on long-polls.
pub const HEADER_MAX_WAIT: &str = "X-Presto-Max-Wait";

/// Wire encoding of a max-wait duration (integer milliseconds).
pub fn format_max_wait(wait: Duration) -> String {
    format!("{}ms", wait.as_millis())
}

/// Parse the wire encoding produced by [`format_max_wait`].
pub fn parse_max_wait(value: &str) -> Option<Duration> {
    value
        .trim()
        .strip_suffix("ms")
        .and_then(|n| n.trim().parse::<u64>().ok())
        .map(Duration::from_millis)
}

/// HTTP methods used by the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcMethod {
    /// Long-poll reads.
    Get,
    /// Create-or-update.
    Post,
    /// Terminate.
    Delete,
}

impl RpcMethod {
    fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Delete => "DELETE",
        }
    }
}

/// One outbound request.
#[derive(Debug, Clone)]
pub struct RpcRequest {
    /// HTTP method.
    pub method: RpcMethod,
    /// Fully-formed request URI including any query string.
    pub uri: String,
    /// Protocol headers (name, value).
    pub headers: Vec<(&'static str, String)>,
    /// Accepted reply content types, preferred first.
    pub accept: Vec<&'static str>,
    /// Request body content type, when a body is present.
    pub content_type: Option<&'static str>,
    /// Request body.
    pub body: Option<Vec<u8>>,
    /// Client-side deadline for the whole exchange.
    pub timeout: Duration,
}

/// One successful (2xx) reply.
#[derive(Debug, Clone)]
pub struct RpcResponse {
    /// HTTP status code.
    pub status: u16,
    /// Reply content type, verbatim.
    pub content_type: Option<String>,
    /// Reply body.
    pub body: Vec<u8>,
}

/// RPC failure as data; classified by the retry layer.
#[derive(Debug, Error)]
pub enum RpcError {
    /// The client refuses to accept work (shutdown). Fatal.
    #[error("rpc client is closed")]
    Closed,
    /// The exchange exceeded its client-side deadline. Transient.
    #[error("rpc request timed out")]
    Timeout,
    /// Connection/IO-level failure. Transient.
    #[error("rpc transport error: {0}")]
    Transport(String),
    /// Non-2xx reply. Transient; the worker may be restarting or shedding load.
    #[error("rpc status {status}: {body}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Truncated reply body for diagnostics.
        body: String,
    },
}

impl RpcError {
    /// Whether the failure can never succeed on retry.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Closed)
    }
}

/// Client capability the loops are written against.
#[async_trait]
pub trait RpcClient: Send + Sync {
    /// Issue one request; resolves when the reply body is fully read.
    async fn request(&self, request: RpcRequest) -> std::result::Result<RpcResponse, RpcError>;

    /// Whether [`close`](RpcClient::close) has been called.
    fn is_closed(&self) -> bool;

    /// Refuse all future work. In-flight requests may still complete.
    fn close(&self);
}

/// Production [`RpcClient`] over a shared `reqwest` connection pool.
pub struct HttpRpcClient {
    client: reqwest::Client,
    closed: AtomicBool,
    trace_http: bool,
}

impl HttpRpcClient {
    /// Build a client; `trace_http` enables per-request debug logging.
    pub fn new(trace_http: bool) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(2))
            .build()
            .map_err(|e| DfqError::Rpc(format!("failed to build http client: {e}")))?;
        Ok(Self {
            client,
            closed: AtomicBool::new(false),
            trace_http,
        })
    }
}

#[async_trait]
impl RpcClient for HttpRpcClient {
    async fn request(&self, request: RpcRequest) -> std::result::Result<RpcResponse, RpcError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(RpcError::Closed);
        }

        let mut builder = match request.method {
            RpcMethod::Get => self.client.get(&request.uri),
            RpcMethod::Post => self.client.post(&request.uri),
            RpcMethod::Delete => self.client.delete(&request.uri),
        }
        .timeout(request.timeout);

        if !request.accept.is_empty() {
            builder = builder.header(reqwest::header::ACCEPT, request.accept.join(", "));
        }
        if let Some(content_type) = request.content_type {
            builder = builder.header(reqwest::header::CONTENT_TYPE, content_type);
        }
        for (name, value) in &request.headers {
            builder = builder.header(*name, value);
        }
        if let Some(body) = request.body.clone() {
            builder = builder.body(body);
        }

        if self.trace_http {
            debug!(method = request.method.as_str(), uri = %request.uri, "http request");
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                RpcError::Timeout
            } else {
                RpcError::Transport(e.to_string())
            }
        })?;

        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response
            .bytes()
            .await
            .map_err(|e| RpcError::Transport(format!("reading reply body: {e}")))?
            .to_vec();

        if self.trace_http {
            debug!(
                method = request.method.as_str(),
                uri = %request.uri,
                status,
                bytes = body.len(),
                "http response"
            );
        }

        if (200..300).contains(&status) {
            Ok(RpcResponse {
                status,
                content_type,
                body,
            })
        } else {
            let body = String::from_utf8_lossy(&body).chars().take(256).collect();
            Err(RpcError::Status { status, body })
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}
