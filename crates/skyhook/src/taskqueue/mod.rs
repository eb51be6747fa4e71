//! At-least-once task execution over a durable, visibility-timeout-based
//! queue. A poll loop fetches message batches and dispatches them into a
//! dynamic worker pool with explicit backpressure; a separate enforcement
//! loop keeps the worker count between the configured bounds.

pub mod pool;
pub mod poller;
pub mod queue;
pub mod registry;

use std::sync::Arc;

use futures::FutureExt;
use std::future::Future;

use crate::common::rpc::{make_rpc_queue, RpcSender};
use crate::metrics::MetricsRegistry;
use crate::taskqueue::pool::{pool_enforcement_process, WorkerPool, WorkerPoolConfig};
use crate::taskqueue::poller::{task_poller_process, PollerMessage};
use crate::taskqueue::queue::DurableTaskQueue;
use crate::taskqueue::registry::TaskRegistry;

pub use pool::WorkItem;
pub use queue::{QueueMessage, TaskEnvelope};
pub use registry::{TaskError, TaskHandler};

pub struct TaskQueueService {
    pool: Arc<WorkerPool>,
    sender: RpcSender<PollerMessage>,
}

impl TaskQueueService {
    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    /// Stops the poller and the pool cooperatively; in-flight tasks finish.
    pub async fn quit(&self) {
        let _ = self.sender.send(PollerMessage::Quit);
        self.pool.stop().await;
    }
}

/// Creates the task-queue service: the worker pool plus the two background
/// loops (message poller and pool enforcement) that the caller must drive.
pub fn create_task_queue_service(
    config: WorkerPoolConfig,
    receive_batch_size: usize,
    queue: Arc<dyn DurableTaskQueue>,
    registry: Arc<TaskRegistry>,
    metrics: Arc<MetricsRegistry>,
) -> (TaskQueueService, impl Future<Output = ()>) {
    let pool = Arc::new(WorkerPool::new(config, queue.clone(), metrics));
    pool.start_min_workers();

    let (tx, rx) = make_rpc_queue();
    let poller = task_poller_process(queue, registry, pool.clone(), receive_batch_size, rx);
    let enforcement = pool_enforcement_process(pool.clone());
    let service = TaskQueueService { pool, sender: tx };
    (
        service,
        futures::future::join(poller, enforcement).map(|_| ()),
    )
}
