use std::time::SystemTime;

use crate::inventory::instance::InstanceId;
use crate::{Map, Set};

/// One scheduler compute node registered by the orchestrator, keyed by its
/// scheduler hostname and tied to the cloud instance backing it.
#[derive(Debug, Clone)]
pub struct ComputeNode {
    pub host: String,
    pub instance_id: InstanceId,
    pub registered_at: SystemTime,
    /// Last busy observation from the housekeeping sweep; a freshly
    /// registered node is ready, not busy.
    pub busy: bool,
}

/// Orchestrator-local view of the nodes it has registered with the
/// scheduler. Purely bookkeeping; the scheduler itself stays the source of
/// truth and the registry is reconciled against it during housekeeping.
#[derive(Default)]
pub struct NodeRegistry {
    nodes: Map<String, ComputeNode>,
}

impl NodeRegistry {
    pub fn contains(&self, host: &str) -> bool {
        self.nodes.contains_key(host)
    }

    pub fn register(&mut self, host: &str, instance_id: InstanceId) {
        self.nodes.insert(
            host.to_string(),
            ComputeNode {
                host: host.to_string(),
                instance_id,
                registered_at: SystemTime::now(),
                busy: false,
            },
        );
    }

    /// Records the node's observed busy flag, returning the previous value
    /// when the node is known.
    pub fn update_busy(&mut self, host: &str, busy: bool) -> Option<bool> {
        self.nodes
            .get_mut(host)
            .map(|node| std::mem::replace(&mut node.busy, busy))
    }

    pub fn remove(&mut self, host: &str) -> Option<ComputeNode> {
        self.nodes.remove(host)
    }

    pub fn hosts(&self) -> Set<String> {
        self.nodes.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_reconcile() {
        let mut registry = NodeRegistry::default();
        registry.register("host-a", "i-0a".to_string());
        registry.register("host-b", "i-0b".to_string());
        assert!(registry.contains("host-a"));
        assert_eq!(registry.len(), 2);

        let removed = registry.remove("host-a").unwrap();
        assert_eq!(removed.instance_id, "i-0a");
        assert!(!registry.contains("host-a"));
        assert_eq!(registry.hosts().len(), 1);
    }

    #[test]
    fn test_update_busy_returns_previous_observation() {
        let mut registry = NodeRegistry::default();
        registry.register("host-a", "i-0a".to_string());
        assert_eq!(registry.update_busy("host-a", true), Some(false));
        assert_eq!(registry.update_busy("host-a", true), Some(true));
        assert_eq!(registry.update_busy("host-a", false), Some(true));
        assert_eq!(registry.update_busy("host-missing", true), None);
    }
}
