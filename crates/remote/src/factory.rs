//! Remote task factory.
//!
//! Holds the pieces every handle shares: the RPC client, the codec pair,
//! timing configuration, the metrics sink, and the stop switch. The factory
//! keeps no owning registry of handles; callers hold `Arc`s and the stop
//! switch reaches live handles through their subscribed watch receivers.

use std::collections::HashMap;
use std::sync::Arc;

use dfq_common::metrics::global_metrics;
use dfq_common::{
    CommunicationConfig, DfqError, MetricsRegistry, NodeId, RemoteTaskConfig, Result,
};
use tokio::sync::watch;
use tracing::info;
use url::Url;

use crate::backoff::{Clock, SystemClock};
use crate::buffers::OutputBuffers;
use crate::codec::CodecSet;
use crate::handle::{HandleParams, RemoteTaskHandle};
use crate::protocol::{PlanFragment, SessionRepresentation};
use crate::rpc::{HttpRpcClient, RpcClient};
use crate::source::{PlanNodeId, Split};
use crate::task::{TaskId, TaskStatus};

/// Creates [`RemoteTaskHandle`]s bound to one coordinator lifetime.
pub struct RemoteTaskFactory {
    config: RemoteTaskConfig,
    comm: CommunicationConfig,
    rpc: Arc<dyn RpcClient>,
    codecs: CodecSet,
    clock: Arc<dyn Clock>,
    metrics: MetricsRegistry,
    stop_tx: watch::Sender<bool>,
}

impl RemoteTaskFactory {
    /// Factory over an injected RPC client and codec pair.
    pub fn new(
        config: RemoteTaskConfig,
        comm: CommunicationConfig,
        rpc: Arc<dyn RpcClient>,
        codecs: CodecSet,
        metrics: MetricsRegistry,
    ) -> Result<Self> {
        config.validate()?;
        let (stop_tx, _) = watch::channel(false);
        Ok(Self {
            config,
            comm,
            rpc,
            codecs,
            clock: Arc::new(SystemClock),
            metrics,
            stop_tx,
        })
    }

    /// Factory over a fresh [`HttpRpcClient`], codecs per configuration, and
    /// the process-wide metrics registry.
    pub fn with_http_client(config: RemoteTaskConfig, comm: CommunicationConfig) -> Result<Self> {
        let rpc: Arc<dyn RpcClient> = Arc::new(HttpRpcClient::new(config.trace_http)?);
        let codecs = CodecSet::from_preference(comm.prefer_binary_encoding);
        Self::new(config, comm, rpc, codecs, global_metrics().clone())
    }

    /// The shared RPC client (exposed for harnesses that need to drive it).
    pub fn rpc_client(&self) -> &Arc<dyn RpcClient> {
        &self.rpc
    }

    /// Create a handle for one (stage, worker) task. The handle is inert
    /// until [`RemoteTaskHandle::start`] is called; `initial_splits` are
    /// staged for the first update.
    #[allow(clippy::too_many_arguments)]
    pub fn create_remote_task(
        &self,
        session: SessionRepresentation,
        task_id: TaskId,
        worker_base_uri: &str,
        node_id: NodeId,
        fragment: PlanFragment,
        initial_splits: HashMap<PlanNodeId, Vec<Split>>,
        output_buffers: OutputBuffers,
        total_partitions: Option<u32>,
    ) -> Result<Arc<RemoteTaskHandle>> {
        let base = Url::parse(worker_base_uri)
            .map_err(|e| DfqError::InvalidConfig(format!("invalid worker base uri: {e}")))?;
        let task_uri = format!(
            "{}/v1/task/{}/{}",
            base.as_str().trim_end_matches('/'),
            node_id,
            task_id
        );

        let initial_status = TaskStatus::initial(task_id.clone(), task_uri.clone(), node_id);
        let handle = Arc::new(RemoteTaskHandle::new(HandleParams {
            task_id,
            task_uri,
            session,
            fragment,
            output_buffers,
            total_partitions,
            initial_status,
            rpc: Arc::clone(&self.rpc),
            codecs: self.codecs.clone(),
            config: self.config.clone(),
            comm: self.comm.clone(),
            clock: Arc::clone(&self.clock),
            metrics: self.metrics.clone(),
            stop_rx: self.stop_tx.subscribe(),
        }));
        if !initial_splits.is_empty() {
            handle.add_splits(initial_splits);
        }
        Ok(handle)
    }

    /// Broadcast shutdown: every loop unwinds after its current exchange and
    /// the RPC client refuses further work.
    pub fn stop(&self) {
        info!("stopping remote task factory");
        self.stop_tx.send_replace(true);
        self.rpc.close();
    }
}

impl Drop for RemoteTaskFactory {
    fn drop(&mut self) {
        self.stop_tx.send_replace(true);
    }
}
