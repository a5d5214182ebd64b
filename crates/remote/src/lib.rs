//! Coordinator-side remote task controller.
//!
//! Architecture role:
//! - per-(stage, worker) task handles owning all client-side task intent:
//!   split assignment, input completion markers, output-buffer descriptors,
//!   and termination requests;
//! - three RPC loops per handle that keep coordinator and worker state
//!   converged: a status long-poll, a periodic full-info fetch, and a
//!   single-in-flight intent sender;
//! - worker restart detection (task instance fencing) and stale-version
//!   rejection, classified into recoverable retries vs. terminal failures.
//!
//! Key modules:
//! - [`task`] / [`source`] / [`buffers`] / [`protocol`]: the wire model
//! - [`codec`]: JSON and compact binary framings
//! - [`rpc`]: the HTTP client capability
//! - [`handle`]: the task handle and its update-application rule
//! - [`factory`]: handle creation and the shared stop switch
//!
//! Everything upstream of the handle (planning, split enumeration, buffer
//! management policy) and everything worker-side is out of scope; the
//! controller only synchronizes intent with observed worker state.

pub mod backoff;
pub mod buffers;
pub mod codec;
pub mod factory;
pub mod handle;
pub mod protocol;
pub mod rpc;
pub mod source;
pub mod task;

mod info_fetcher;
mod status_fetcher;
mod update_sender;

pub use buffers::OutputBuffers;
pub use codec::{BinaryTaskCodec, CodecSet, JsonTaskCodec, TaskCodec};
pub use factory::RemoteTaskFactory;
pub use handle::RemoteTaskHandle;
pub use protocol::{PlanFragment, SessionRepresentation, TaskUpdateRequest};
pub use rpc::{HttpRpcClient, RpcClient, RpcError, RpcMethod, RpcRequest, RpcResponse};
pub use source::{Lifespan, PlanNodeId, ScheduledSplit, Split, TaskSource};
pub use task::{
    ErrorCode, ExecutionFailureInfo, OutputBufferInfo, TaskId, TaskInfo, TaskState, TaskStats,
    TaskStatus,
};
