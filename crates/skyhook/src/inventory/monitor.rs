use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::common::rpc::{make_rpc_queue, RpcReceiver, RpcSender};
use crate::config::get_inventory_refresh_interval;
use crate::events::{ClusterEvent, EventBus};
use crate::inventory::cache::InstanceCacheRef;
use crate::inventory::instance::{Instance, InstanceId};
use crate::Set;

pub type InventoryResult<T> = anyhow::Result<T>;

/// One page of the provider's paginated instance listing.
#[derive(Debug)]
pub struct InstancePage {
    pub instances: Vec<Instance>,
    pub next_page: Option<String>,
}

/// Cloud instance inventory collaborator (paginated listing API).
pub trait CloudInventory: Send + Sync {
    fn list_instances(
        &self,
        page_token: Option<String>,
    ) -> Pin<Box<dyn Future<Output = InventoryResult<InstancePage>> + Send>>;
}

#[derive(Debug)]
pub enum MonitorMessage {
    /// Run a refresh round immediately instead of waiting for the timer.
    Refresh,
    Quit,
}

pub struct InstanceMonitorService {
    sender: RpcSender<MonitorMessage>,
}

impl InstanceMonitorService {
    pub fn refresh(&self) {
        let _ = self.sender.send(MonitorMessage::Refresh);
    }

    pub fn quit(&self) {
        let _ = self.sender.send(MonitorMessage::Quit);
    }
}

pub fn create_instance_monitor(
    cache: InstanceCacheRef,
    inventory: Arc<dyn CloudInventory>,
    bus: Arc<EventBus>,
) -> (InstanceMonitorService, impl Future<Output = ()>) {
    let (tx, rx) = make_rpc_queue();
    let process = instance_monitor_process(cache, inventory, bus, rx);
    (InstanceMonitorService { sender: tx }, process)
}

/// Periodic poller that feeds full refreshes into the instance cache. One
/// listing page maps to one `sync()` call; the session commits only after
/// the last page was scanned and aborts when any page fails.
pub async fn instance_monitor_process(
    cache: InstanceCacheRef,
    inventory: Arc<dyn CloudInventory>,
    bus: Arc<EventBus>,
    mut receiver: RpcReceiver<MonitorMessage>,
) {
    let mut refresh_interval = tokio::time::interval(get_inventory_refresh_interval());
    loop {
        tokio::select! {
            _ = refresh_interval.tick() => {
                run_refresh(&cache, &*inventory, &bus).await;
            }
            msg = receiver.recv() => {
                match msg {
                    Some(MonitorMessage::Refresh) => {
                        run_refresh(&cache, &*inventory, &bus).await;
                    }
                    Some(MonitorMessage::Quit) | None => break,
                }
            }
        }
    }
    log::debug!("Instance monitor ended");
}

pub(crate) async fn run_refresh(
    cache: &InstanceCacheRef,
    inventory: &dyn CloudInventory,
    bus: &EventBus,
) {
    let running_before = cache.get().running_compute_ids();

    cache.get().sync_begin();
    let mut page_token = None;
    loop {
        match inventory.list_instances(page_token.take()).await {
            Ok(page) => {
                if let Err(error) = cache.get().sync(page.instances) {
                    log::error!("Instance sync failed: {error:?}");
                    cache.get().sync_abort();
                    return;
                }
                match page.next_page {
                    Some(token) => page_token = Some(token),
                    None => break,
                }
            }
            Err(error) => {
                // Transient listing failure; the next cycle retries with a
                // fresh session.
                log::warn!("Instance listing failed, aborting sync round: {error:?}");
                cache.get().sync_abort();
                return;
            }
        }
    }
    if let Err(error) = cache.get().sync_commit() {
        log::error!("Instance sync commit failed: {error:?}");
        return;
    }

    bus.publish(ClusterEvent::InventoryRefreshed);
    let running_after = cache.get().running_compute_ids();
    for id in newly_running(&running_before, &running_after) {
        bus.publish(ClusterEvent::InstanceRunning(id));
    }
}

fn newly_running(before: &Set<InstanceId>, after: &Set<InstanceId>) -> Vec<InstanceId> {
    after
        .iter()
        .filter(|id| !before.contains(*id))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::rpc::make_rpc_queue;
    use crate::inventory::instance::testing::instance;
    use crate::inventory::instance::{InstanceFilter, LifecycleState};
    use crate::metrics::{MetricsRegistry, METRIC_SYNC_FAILURES};
    use std::sync::Mutex;

    /// Inventory double serving a fixed sequence of pages per round.
    struct PagedInventory {
        rounds: Mutex<Vec<Vec<Vec<Instance>>>>,
        fail: Mutex<bool>,
    }

    impl PagedInventory {
        fn new(rounds: Vec<Vec<Vec<Instance>>>) -> Self {
            Self {
                rounds: Mutex::new(rounds),
                fail: Mutex::new(false),
            }
        }
    }

    impl CloudInventory for PagedInventory {
        fn list_instances(
            &self,
            page_token: Option<String>,
        ) -> Pin<Box<dyn Future<Output = InventoryResult<InstancePage>> + Send>> {
            if *self.fail.lock().unwrap() {
                return Box::pin(async { anyhow::bail!("throttled") });
            }
            let mut rounds = self.rounds.lock().unwrap();
            let round = rounds.first_mut().expect("no pages seeded");
            let index: usize = page_token.map(|t| t.parse().unwrap()).unwrap_or(0);
            let instances = round[index].clone();
            let next_page = if index + 1 < round.len() {
                Some((index + 1).to_string())
            } else {
                rounds.remove(0);
                None
            };
            Box::pin(async move {
                Ok(InstancePage {
                    instances,
                    next_page,
                })
            })
        }
    }

    fn setup(
        rounds: Vec<Vec<Vec<Instance>>>,
    ) -> (InstanceCacheRef, Arc<PagedInventory>, Arc<EventBus>, Arc<MetricsRegistry>) {
        let metrics = Arc::new(MetricsRegistry::default());
        let cache = InstanceCacheRef::new(metrics.clone());
        let inventory = Arc::new(PagedInventory::new(rounds));
        let bus = Arc::new(EventBus::default());
        (cache, inventory, bus, metrics)
    }

    #[tokio::test]
    async fn test_refresh_commits_pages_and_publishes_events() {
        let (cache, inventory, bus, _metrics) = setup(vec![vec![
            vec![instance("A", LifecycleState::Running)],
            vec![instance("B", LifecycleState::Pending)],
        ]]);
        let (tx, mut rx) = make_rpc_queue();
        bus.subscribe(tx);

        run_refresh(&cache, &*inventory, &bus).await;

        assert_eq!(cache.get_instances(&InstanceFilter::default()).len(), 2);
        assert!(matches!(
            rx.try_recv().unwrap(),
            ClusterEvent::InventoryRefreshed
        ));
        match rx.try_recv().unwrap() {
            ClusterEvent::InstanceRunning(id) => assert_eq!(id, "A"),
            other => panic!("unexpected event {other:?}"),
        }
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_running_delta_only_for_new_instances() {
        let (cache, inventory, bus, _metrics) = setup(vec![
            vec![vec![instance("A", LifecycleState::Running)]],
            vec![vec![
                instance("A", LifecycleState::Running),
                instance("B", LifecycleState::Running),
            ]],
        ]);
        run_refresh(&cache, &*inventory, &bus).await;

        let (tx, mut rx) = make_rpc_queue();
        bus.subscribe(tx);
        run_refresh(&cache, &*inventory, &bus).await;

        assert!(matches!(
            rx.try_recv().unwrap(),
            ClusterEvent::InventoryRefreshed
        ));
        match rx.try_recv().unwrap() {
            ClusterEvent::InstanceRunning(id) => assert_eq!(id, "B"),
            other => panic!("unexpected event {other:?}"),
        }
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_listing_failure_aborts_round() {
        let (cache, inventory, bus, metrics) =
            setup(vec![vec![vec![instance("A", LifecycleState::Running)]]]);
        run_refresh(&cache, &*inventory, &bus).await;

        *inventory.fail.lock().unwrap() = true;
        let (tx, mut rx) = make_rpc_queue();
        bus.subscribe(tx);
        run_refresh(&cache, &*inventory, &bus).await;

        // Old data survives, no events published, failure metric raised.
        assert_eq!(cache.get_instances(&InstanceFilter::default()).len(), 1);
        assert!(rx.try_recv().is_err());
        assert_eq!(metrics.counter_value(METRIC_SYNC_FAILURES), 1);
    }
}
