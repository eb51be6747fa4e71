use std::sync::Mutex;

use crate::common::rpc::RpcSender;
use crate::inventory::instance::InstanceId;

/// Events published by the instance monitor and consumed by the node
/// orchestrator (and any other interested component).
#[derive(Debug, Clone)]
pub enum ClusterEvent {
    /// A full inventory refresh has been committed.
    InventoryRefreshed,
    /// A single instance was newly observed in the running state, published
    /// so that consumers can react without waiting for the next full scan.
    InstanceRunning(InstanceId),
}

/// Synchronous in-process publish/subscribe bus. Publishing pushes the event
/// into every subscriber's channel; a subscriber that went away is pruned on
/// the next publish.
#[derive(Default)]
pub struct EventBus {
    subscribers: Mutex<Vec<RpcSender<ClusterEvent>>>,
}

impl EventBus {
    pub fn subscribe(&self, sender: RpcSender<ClusterEvent>) {
        self.subscribers
            .lock()
            .expect("event bus poisoned")
            .push(sender);
    }

    pub fn publish(&self, event: ClusterEvent) {
        let mut subscribers = self.subscribers.lock().expect("event bus poisoned");
        subscribers.retain(|sender| match sender.send(event.clone()) {
            Ok(_) => true,
            Err(_) => {
                log::debug!("Removing disconnected event subscriber");
                false
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::rpc::make_rpc_queue;

    #[test]
    fn test_publish_fans_out_and_prunes() {
        let bus = EventBus::default();
        let (tx1, mut rx1) = make_rpc_queue();
        let (tx2, rx2) = make_rpc_queue();
        bus.subscribe(tx1);
        bus.subscribe(tx2);

        drop(rx2);
        bus.publish(ClusterEvent::InventoryRefreshed);
        assert!(matches!(
            rx1.try_recv().unwrap(),
            ClusterEvent::InventoryRefreshed
        ));
        assert_eq!(bus.subscribers.lock().unwrap().len(), 1);
    }
}
