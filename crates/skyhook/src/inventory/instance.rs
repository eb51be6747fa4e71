use std::time::SystemTime;

use serde::{Deserialize, Serialize};

pub type InstanceId = String;

/// Node-type tag of instances that back scheduler compute nodes; other node
/// types (login, management, ...) never participate in capacity accounting.
pub const COMPUTE_NODE_TYPE: &str = "compute";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LifecycleState {
    Pending,
    Running,
    ShuttingDown,
    Stopped,
    Terminated,
}

impl LifecycleState {
    /// Pending and running instances count towards provisioned capacity.
    pub fn is_alive(&self) -> bool {
        matches!(self, LifecycleState::Pending | LifecycleState::Running)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CapacityType {
    Spot,
    OnDemand,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Tenancy {
    Shared,
    Dedicated,
}

/// One cloud provider virtual machine, as reported by the inventory listing.
/// Owned exclusively by the instance cache and replaced wholesale on every
/// committed sync session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instance {
    pub id: InstanceId,
    pub hostname: String,
    pub instance_type: String,
    pub state: LifecycleState,
    pub capacity_type: CapacityType,
    pub tenancy: Tenancy,
    pub cluster: Option<String>,
    pub module: Option<String>,
    pub node_type: Option<String>,
    pub job_id: Option<String>,
    pub job_group: Option<String>,
    pub queue: Option<String>,
    /// Provisioning stack that created this instance; used to look up the
    /// job's original resource parameters when annotating nodes.
    pub stack_id: Option<String>,
    pub launch_time: Option<SystemTime>,
}

impl Instance {
    pub fn is_compute(&self) -> bool {
        self.node_type.as_deref() == Some(COMPUTE_NODE_TYPE)
    }
}

/// Read filter over the cache; an absent field imposes no constraint.
#[derive(Debug, Clone, Default)]
pub struct InstanceFilter {
    pub cluster: Option<String>,
    pub module: Option<String>,
    pub node_type: Option<String>,
    pub instance_type: Option<String>,
    pub state: Option<LifecycleState>,
    pub capacity_type: Option<CapacityType>,
    pub tenancy: Option<Tenancy>,
    pub job_id: Option<String>,
    pub job_group: Option<String>,
    pub queue: Option<String>,
}

impl InstanceFilter {
    pub fn matches(&self, instance: &Instance) -> bool {
        fn opt_eq(filter: &Option<String>, value: &Option<String>) -> bool {
            match filter {
                Some(wanted) => value.as_deref() == Some(wanted.as_str()),
                None => true,
            }
        }

        opt_eq(&self.cluster, &instance.cluster)
            && opt_eq(&self.module, &instance.module)
            && opt_eq(&self.node_type, &instance.node_type)
            && opt_eq(&self.job_id, &instance.job_id)
            && opt_eq(&self.job_group, &instance.job_group)
            && opt_eq(&self.queue, &instance.queue)
            && self
                .instance_type
                .as_deref()
                .map_or(true, |t| t == instance.instance_type)
            && self.state.map_or(true, |s| s == instance.state)
            && self
                .capacity_type
                .map_or(true, |c| c == instance.capacity_type)
            && self.tenancy.map_or(true, |t| t == instance.tenancy)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    pub fn instance(id: &str, state: LifecycleState) -> Instance {
        Instance {
            id: id.to_string(),
            hostname: format!("host-{id}"),
            instance_type: "c5.large".to_string(),
            state,
            capacity_type: CapacityType::OnDemand,
            tenancy: Tenancy::Shared,
            cluster: Some("cluster-a".to_string()),
            module: Some("hpc".to_string()),
            node_type: Some(COMPUTE_NODE_TYPE.to_string()),
            job_id: None,
            job_group: None,
            queue: None,
            stack_id: None,
            launch_time: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::instance;
    use super::*;

    #[test]
    fn test_empty_filter_matches_everything() {
        let filter = InstanceFilter::default();
        assert!(filter.matches(&instance("i-1", LifecycleState::Running)));
        assert!(filter.matches(&instance("i-2", LifecycleState::Terminated)));
    }

    #[test]
    fn test_filter_combination() {
        let mut subject = instance("i-1", LifecycleState::Running);
        subject.job_id = Some("job-7".to_string());

        let filter = InstanceFilter {
            cluster: Some("cluster-a".to_string()),
            state: Some(LifecycleState::Running),
            job_id: Some("job-7".to_string()),
            ..Default::default()
        };
        assert!(filter.matches(&subject));

        let other = InstanceFilter {
            capacity_type: Some(CapacityType::Spot),
            ..Default::default()
        };
        assert!(!other.matches(&subject));
    }
}
