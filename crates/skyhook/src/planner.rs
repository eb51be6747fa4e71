//! Capacity planner: decides which queued jobs can start on idle capacity
//! right now and how much capacity the cloud should hold in total.
//!
//! Admission is strictly FIFO. The first job that does not fit into the
//! remaining idle capacity defers itself and every job behind it, even when
//! a later, smaller job would fit; jumping the queue would starve large
//! jobs forever.

use crate::inventory::instance::{Instance, LifecycleState};
use crate::scheduler::state::NodeState;
use crate::{Map, Set};

/// One queued job waiting for capacity, in submission order. `demand` is the
/// job's weighted capacity requirement (node count times the per-type
/// weight).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisioningJob {
    pub id: String,
    pub queue: String,
    pub demand: u64,
}

/// Weighted capacity split of the alive compute fleet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CapacityClassification {
    /// Capacity on nodes that are free and ready to take work.
    pub idle: u64,
    /// Capacity currently occupied by running jobs.
    pub busy: u64,
    /// Capacity that exists in the cloud but is not usable yet: instances
    /// still booting, or booted instances whose node has not joined the
    /// scheduler.
    pub pending: u64,
}

/// Classifies alive compute instances against the scheduler's node states.
/// `weights` maps an instance type to its capacity weight; unlisted types
/// weigh 1.
pub fn classify_capacity(
    instances: &[Instance],
    node_states: &Map<String, Set<NodeState>>,
    weights: &Map<String, u64>,
) -> CapacityClassification {
    let mut classification = CapacityClassification::default();
    for instance in instances {
        if !instance.is_compute() || !instance.state.is_alive() {
            continue;
        }
        let weight = weights.get(&instance.instance_type).copied().unwrap_or(1);
        if instance.state != LifecycleState::Running {
            classification.pending += weight;
            continue;
        }
        match node_states.get(&instance.hostname) {
            Some(states) if states.iter().any(|state| state.is_busy()) => {
                classification.busy += weight;
            }
            Some(states) if states.contains(&NodeState::Free) => {
                classification.idle += weight;
            }
            // Running instance whose node is absent, down or still joining.
            _ => classification.pending += weight,
        }
    }
    classification
}

/// Capacity numbers backing one planning round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapacityInfo {
    pub idle: u64,
    pub busy: u64,
    /// Capacity visible in the inventory but not usable yet.
    pub pending: u64,
    /// Capacity committed by earlier rounds, whether or not the inventory
    /// shows it yet.
    pub provisioned: u64,
    /// Total weighted demand of every waiting job.
    pub desired: u64,
    /// Capacity the cloud should hold beyond what is busy or idle. Never
    /// drops below what is already committed: in-flight capacity cannot
    /// be un-launched, and shrinking the target while instances are booting
    /// would make the next round tear them down mid-boot.
    pub target: u64,
    /// Human-readable account of the decision, for operator logs.
    pub rationale: String,
}

#[derive(Debug)]
pub struct CapacityPlan {
    /// Jobs that can start on idle capacity now, in submission order.
    pub admitted: Vec<ProvisioningJob>,
    /// Jobs waiting for the target capacity to materialize.
    pub deferred: Vec<ProvisioningJob>,
    pub info: CapacityInfo,
}

/// Plans one round: admits the longest prefix of `jobs` that fits into idle
/// capacity and computes the total capacity target for everything else.
///
/// `provisioned_capacity` is the capacity already requested for this group
/// in earlier rounds. It floors the target independently of the inventory's
/// `pending` classification, because freshly requested instances take time
/// to show up in the provider listing at all.
pub fn plan(
    jobs: Vec<ProvisioningJob>,
    capacity: CapacityClassification,
    provisioned_capacity: u64,
) -> CapacityPlan {
    let desired: u64 = jobs.iter().map(|job| job.demand).sum();

    let mut admitted = Vec::new();
    let mut deferred = Vec::new();
    let mut idle_left = capacity.idle;
    let mut admitting = true;
    for job in jobs {
        if admitting && job.demand <= idle_left {
            idle_left -= job.demand;
            admitted.push(job);
        } else {
            admitting = false;
            deferred.push(job);
        }
    }

    let committed = provisioned_capacity.max(capacity.pending);
    let target = committed.max(desired.saturating_sub(capacity.idle));
    let rationale = format!(
        "idle={} busy={} pending={} provisioned={} desired={} admitted={} deferred={} target={}",
        capacity.idle,
        capacity.busy,
        capacity.pending,
        provisioned_capacity,
        desired,
        admitted.len(),
        deferred.len(),
        target
    );
    log::debug!("Capacity plan: {rationale}");

    CapacityPlan {
        admitted,
        deferred,
        info: CapacityInfo {
            idle: capacity.idle,
            busy: capacity.busy,
            pending: capacity.pending,
            provisioned: provisioned_capacity,
            desired,
            target,
            rationale,
        },
    }
}
