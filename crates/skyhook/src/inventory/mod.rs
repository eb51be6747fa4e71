//! Eventually-consistent cloud-instance inventory: the cache holds the last
//! committed view of provider instances, the monitor periodically replaces
//! that view through atomic full-refresh sync sessions and publishes
//! refresh/running events.

pub mod cache;
pub mod instance;
pub mod monitor;

pub use cache::{InstanceCacheRef, InstanceCounts, InstanceStateCache};
pub use instance::{CapacityType, Instance, InstanceFilter, InstanceId, LifecycleState, Tenancy};
pub use monitor::{
    create_instance_monitor, CloudInventory, InstanceMonitorService, InstancePage,
};
