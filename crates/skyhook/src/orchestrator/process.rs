use std::sync::{Arc, Mutex};

use tokio::task::JoinHandle;

use crate::common::rpc::{ResponseToken, RpcReceiver};
use crate::config::{get_housekeeping_interval, ORCHESTRATOR_WAIT_CAP};
use crate::events::ClusterEvent;
use crate::inventory::cache::InstanceCacheRef;
use crate::inventory::instance::{Instance, InstanceId, LifecycleState};
use crate::metrics::{
    MetricsRegistry, METRIC_NODES_ADDED, METRIC_NODES_BUSY, METRIC_NODES_DELETED,
    METRIC_NODES_READY, METRIC_PROVISION_DURATION,
};
use crate::orchestrator::node::NodeRegistry;
use crate::orchestrator::StackMetadata;
use crate::scheduler::{NodeInfo, Scheduler};
use crate::Map;

/// Node attribute that ties a scheduler node back to the cloud instance it
/// runs on. Set at registration and used by housekeeping to recognize
/// orchestrator-managed nodes; nodes without it are never touched.
pub const BACKING_INSTANCE_ATTRIBUTE: &str = "compute_node";

#[derive(Debug)]
pub enum OrchestratorMessage {
    /// Register a scheduler node for the given running instance.
    ProvisionNode(InstanceId),
    /// Run a housekeeping sweep immediately instead of waiting for the timer.
    RunHousekeeping,
    /// Number of nodes currently tracked in the local registry.
    NodeCount(ResponseToken<usize>),
    Quit,
}

pub struct OrchestratorCore {
    scheduler: Arc<dyn Scheduler>,
    cache: InstanceCacheRef,
    metadata: Arc<dyn StackMetadata>,
    metrics: Arc<MetricsRegistry>,
    registry: Mutex<NodeRegistry>,
}

impl OrchestratorCore {
    pub fn new(
        scheduler: Arc<dyn Scheduler>,
        cache: InstanceCacheRef,
        metadata: Arc<dyn StackMetadata>,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        Self {
            scheduler,
            cache,
            metadata,
            metrics,
            registry: Mutex::new(NodeRegistry::default()),
        }
    }

    fn registry(&self) -> std::sync::MutexGuard<'_, NodeRegistry> {
        self.registry.lock().expect("node registry poisoned")
    }
}

/// Reactive orchestrator loop. Provisioning requests arrive as monitor
/// events or RPC messages and are handled inline; housekeeping runs as a
/// spawned single-flight sweep so a slow scheduler CLI never stalls
/// provisioning.
pub async fn node_orchestrator_process(
    core: Arc<OrchestratorCore>,
    mut events: RpcReceiver<ClusterEvent>,
    mut receiver: RpcReceiver<OrchestratorMessage>,
) {
    let mut housekeeping = tokio::time::interval(get_housekeeping_interval());
    let mut sweep: Option<JoinHandle<()>> = None;
    let mut events_open = true;
    loop {
        tokio::select! {
            _ = housekeeping.tick() => {
                spawn_housekeeping(&core, &mut sweep);
            }
            event = events.recv(), if events_open => match event {
                Some(ClusterEvent::InstanceRunning(id)) => {
                    if let Err(error) = provision_node(&core, &id).await {
                        log::error!("Provisioning a node for instance {id} failed: {error:?}");
                    }
                }
                Some(ClusterEvent::InventoryRefreshed) => {
                    provision_missing_nodes(&core).await;
                }
                None => events_open = false,
            },
            message = receiver.recv() => match message {
                Some(OrchestratorMessage::ProvisionNode(id)) => {
                    if let Err(error) = provision_node(&core, &id).await {
                        log::error!("Provisioning a node for instance {id} failed: {error:?}");
                    }
                }
                Some(OrchestratorMessage::RunHousekeeping) => {
                    spawn_housekeeping(&core, &mut sweep);
                }
                Some(OrchestratorMessage::NodeCount(token)) => {
                    token.respond(core.registry().len());
                }
                Some(OrchestratorMessage::Quit) | None => break,
            }
        }
    }
    if let Some(task) = sweep {
        if !task.is_finished() {
            // Bounded wait; an unresponsive scheduler CLI must not block
            // shutdown indefinitely.
            let _ = tokio::time::timeout(ORCHESTRATOR_WAIT_CAP, task).await;
        }
    }
    log::debug!("Node orchestrator ended");
}

fn spawn_housekeeping(core: &Arc<OrchestratorCore>, sweep: &mut Option<JoinHandle<()>>) {
    if sweep.as_ref().map_or(false, |task| !task.is_finished()) {
        log::debug!("Housekeeping sweep is still in flight, skipping this round");
        return;
    }
    let core = core.clone();
    *sweep = Some(tokio::spawn(async move {
        run_housekeeping(&core).await;
    }));
}

/// Full rescan after a committed inventory refresh: every running compute
/// instance gets a node check. Catches instances whose running delta event
/// was lost (e.g. the orchestrator started after the instance came up).
pub(crate) async fn provision_missing_nodes(core: &Arc<OrchestratorCore>) {
    let ids: Vec<InstanceId> = core.cache.get().running_compute_ids().into_iter().collect();
    for id in ids {
        if let Err(error) = provision_node(core, &id).await {
            log::error!("Provisioning a node for instance {id} failed: {error:?}");
        }
    }
}

/// Registers a scheduler node for a running compute instance. Idempotent:
/// repeated requests for the same instance, and requests for nodes the
/// scheduler already knows, are no-ops.
pub(crate) async fn provision_node(
    core: &Arc<OrchestratorCore>,
    instance_id: &str,
) -> anyhow::Result<()> {
    let instance = match core.cache.get().get_instance(instance_id).cloned() {
        Some(instance) => instance,
        None => {
            log::warn!("Instance {instance_id} is not in the inventory, skipping provisioning");
            return Ok(());
        }
    };
    if !instance.is_compute() || instance.state != LifecycleState::Running {
        log::debug!("Instance {instance_id} is not a running compute instance, skipping");
        return Ok(());
    }

    let host = instance.hostname.clone();
    if core.registry().contains(&host) {
        log::debug!("Node {host} is already registered");
        return Ok(());
    }
    // Another actor (or a previous run) may have registered the node since
    // the last housekeeping sweep; the scheduler has the final word.
    if core.scheduler.get_node(&host).await?.is_some() {
        log::debug!("Node {host} already exists in the scheduler");
        core.registry().register(&host, instance.id.clone());
        return Ok(());
    }

    let parameters = match &instance.stack_id {
        Some(stack_id) => match core.metadata.stack_parameters(stack_id).await {
            Ok(parameters) => parameters,
            Err(error) => {
                log::warn!(
                    "Could not fetch stack parameters for {stack_id}, \
                     registering {host} without them: {error:?}"
                );
                Map::default()
            }
        },
        None => Map::default(),
    };
    let attributes = build_node_attributes(&instance, parameters);
    core.scheduler.create_node(&host, attributes).await?;
    core.registry().register(&host, instance.id.clone());
    core.metrics.increment(METRIC_NODES_ADDED);
    if let Some(launch_time) = instance.launch_time {
        if let Ok(lag) = launch_time.elapsed() {
            core.metrics.record_duration(METRIC_PROVISION_DURATION, lag);
        }
    }
    log::info!("Registered compute node {host} backed by instance {instance_id}");
    Ok(())
}

fn build_node_attributes(
    instance: &Instance,
    parameters: Map<String, String>,
) -> Map<String, String> {
    let mut attributes = Map::default();
    for (key, value) in parameters {
        attributes.insert(format!("resources_available.{key}"), value);
    }
    attributes.insert(
        format!("resources_available.{BACKING_INSTANCE_ATTRIBUTE}"),
        instance.id.clone(),
    );
    attributes.insert(
        "resources_available.instance_type".to_string(),
        instance.instance_type.clone(),
    );
    if let Some(queue) = &instance.queue {
        attributes.insert("queue".to_string(), queue.clone());
    }
    attributes
}

/// Deletes scheduler nodes whose backing instance is no longer alive in the
/// inventory. Only nodes carrying the backing-instance attribute are
/// considered; anything else in the scheduler is someone else's node. The
/// sweep does nothing until the inventory has committed at least once, so an
/// empty cache at startup cannot wipe a healthy cluster.
pub(crate) async fn run_housekeeping(core: &Arc<OrchestratorCore>) {
    if !core.cache.get().is_ready() {
        log::debug!("Inventory is not ready yet, skipping the housekeeping sweep");
        return;
    }
    let nodes = match core.scheduler.list_nodes().await {
        Ok(nodes) => nodes,
        Err(error) => {
            log::warn!("Could not list scheduler nodes for housekeeping: {error:?}");
            return;
        }
    };

    for node in nodes {
        let instance_id = match node.resources_available.get(BACKING_INSTANCE_ATTRIBUTE) {
            Some(id) => id.clone(),
            None => continue,
        };
        let alive = core
            .cache
            .get()
            .get_instance(&instance_id)
            .map_or(false, |instance| instance.state.is_alive());
        if alive {
            track_node_activity(core, &node, &instance_id);
            continue;
        }
        match core.scheduler.delete_node(&node.host).await {
            Ok(()) => {
                core.registry().remove(&node.host);
                core.metrics.increment(METRIC_NODES_DELETED);
                log::info!(
                    "Deleted stale compute node {} (instance {instance_id} is gone)",
                    node.host
                );
            }
            Err(error) => {
                log::warn!("Could not delete stale node {}: {error:?}", node.host);
            }
        }
    }
}

/// Folds one observed node into the registry and pushes ready/busy counters
/// on transitions. Nodes registered by someone else (an earlier run) are
/// adopted here.
fn track_node_activity(core: &OrchestratorCore, node: &NodeInfo, instance_id: &str) {
    let busy = node.states.iter().any(|state| state.is_busy());
    let previous = {
        let mut registry = core.registry();
        if !registry.contains(&node.host) {
            registry.register(&node.host, instance_id.to_string());
        }
        registry.update_busy(&node.host, busy)
    };
    match (previous, busy) {
        (Some(false), true) => core.metrics.increment(METRIC_NODES_BUSY),
        (Some(true), false) => core.metrics.increment(METRIC_NODES_READY),
        _ => {}
    }
}
