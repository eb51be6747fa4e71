use std::future::Future;
use std::sync::Arc;

use crate::common::rpc::{initiate_request, make_rpc_queue, RpcSender};
use crate::events::EventBus;
use crate::inventory::cache::InstanceCacheRef;
use crate::inventory::instance::InstanceId;
use crate::metrics::MetricsRegistry;
use crate::orchestrator::process::{
    node_orchestrator_process, OrchestratorCore, OrchestratorMessage,
};
use crate::orchestrator::StackMetadata;
use crate::scheduler::Scheduler;

/// RPC handle to the node orchestrator loop.
pub struct OrchestratorService {
    sender: RpcSender<OrchestratorMessage>,
}

impl OrchestratorService {
    pub fn provision(&self, instance_id: InstanceId) {
        let _ = self
            .sender
            .send(OrchestratorMessage::ProvisionNode(instance_id));
    }

    pub fn run_housekeeping(&self) {
        let _ = self.sender.send(OrchestratorMessage::RunHousekeeping);
    }

    /// Number of nodes the orchestrator currently tracks. `None` when the
    /// orchestrator loop has already ended.
    pub async fn node_count(&self) -> Option<usize> {
        initiate_request(|token| self.sender.send(OrchestratorMessage::NodeCount(token)))
            .await
            .ok()
    }

    pub fn quit(&self) {
        let _ = self.sender.send(OrchestratorMessage::Quit);
    }
}

/// Creates the node orchestrator, subscribed to the cluster event bus.
/// The returned future is the orchestrator loop and has to be awaited (or
/// spawned) to make the service operational.
pub fn create_node_orchestrator(
    scheduler: Arc<dyn Scheduler>,
    cache: InstanceCacheRef,
    metadata: Arc<dyn StackMetadata>,
    metrics: Arc<MetricsRegistry>,
    bus: &EventBus,
) -> (OrchestratorService, impl Future<Output = ()>) {
    let (event_tx, event_rx) = make_rpc_queue();
    bus.subscribe(event_tx);
    let (tx, rx) = make_rpc_queue();
    let core = Arc::new(OrchestratorCore::new(scheduler, cache, metadata, metrics));
    let process = node_orchestrator_process(core, event_rx, rx);
    (OrchestratorService { sender: tx }, process)
}
