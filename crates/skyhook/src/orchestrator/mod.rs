//! Node orchestrator: turns running cloud instances into registered
//! scheduler compute nodes and garbage-collects nodes whose backing instance
//! has vanished. Reacts to instance monitor events and runs a periodic
//! housekeeping sweep as a safety net.

pub mod node;
pub mod process;
pub mod service;

use std::future::Future;
use std::pin::Pin;

use crate::Map;

pub use node::{ComputeNode, NodeRegistry};
pub use process::node_orchestrator_process;
pub use service::{create_node_orchestrator, OrchestratorService};

/// Lookup of the provisioning-stack parameters an instance was launched
/// with. Node registration annotates the scheduler node with these so that
/// jobs land on capacity that matches their original request.
pub trait StackMetadata: Send + Sync {
    fn stack_parameters(
        &self,
        stack_id: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Map<String, String>>> + Send>>;
}
