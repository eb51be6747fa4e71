use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::common::error::SkyhookError;
use crate::common::idcounter::IdCounter;
use crate::config::{
    clamp_with_warning, ABSOLUTE_MAX_WORKERS, ABSOLUTE_MIN_WORKERS, WORKER_POP_TIMEOUT,
};
use crate::metrics::{MetricsRegistry, METRIC_TASKS_COMPLETED, METRIC_TASKS_FAILED};
use crate::taskqueue::queue::{DurableTaskQueue, ReceiptHandle};
use crate::taskqueue::registry::{TaskError, TaskHandler};

#[derive(Debug, Clone, Copy)]
pub struct WorkerPoolConfig {
    pub min_workers: usize,
    pub max_workers: usize,
}

/// One resolved unit of work: the handler to run, its payload, and the
/// receipt handle used to acknowledge the backing queue message.
pub struct WorkItem {
    pub handler: Arc<dyn TaskHandler>,
    pub payload: serde_json::Value,
    pub receipt_handle: ReceiptHandle,
}

struct PoolCore {
    queued: VecDeque<WorkItem>,
    active: usize,
    stopped: bool,
}

struct PoolShared {
    core: Mutex<PoolCore>,
    notify: Notify,
}

struct WorkerHandle {
    id: u32,
    /// Set only by the worker itself.
    idle: Arc<AtomicBool>,
    /// Set only by the pool-management path.
    stop: Arc<AtomicBool>,
    join: JoinHandle<()>,
}

/// Dynamic pool of task workers over a shared internal queue.
///
/// `submit` never blocks: when `active + queued` reaches the maximum worker
/// count it returns a typed capacity-exceeded error so the caller can apply
/// backpressure. The enforcement cycle stops idle workers above the minimum
/// and starts new ones while queued demand exceeds idle supply.
pub struct WorkerPool {
    shared: Arc<PoolShared>,
    queue: Arc<dyn DurableTaskQueue>,
    metrics: Arc<MetricsRegistry>,
    min_workers: usize,
    max_workers: usize,
    /// Touched only by the management path (start/enforce/stop).
    workers: Mutex<PoolWorkers>,
}

#[derive(Default)]
struct PoolWorkers {
    handles: Vec<WorkerHandle>,
    id_counter: IdCounter,
}

impl WorkerPool {
    pub fn new(
        config: WorkerPoolConfig,
        queue: Arc<dyn DurableTaskQueue>,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        let min_workers = clamp_with_warning(
            "minimum worker count",
            config.min_workers,
            ABSOLUTE_MIN_WORKERS,
            ABSOLUTE_MAX_WORKERS,
        );
        let mut max_workers = clamp_with_warning(
            "maximum worker count",
            config.max_workers,
            ABSOLUTE_MIN_WORKERS,
            ABSOLUTE_MAX_WORKERS,
        );
        if max_workers < min_workers {
            log::warn!(
                "Maximum worker count {max_workers} is below the minimum {min_workers}, using {min_workers}"
            );
            max_workers = min_workers;
        }

        Self {
            shared: Arc::new(PoolShared {
                core: Mutex::new(PoolCore {
                    queued: VecDeque::new(),
                    active: 0,
                    stopped: false,
                }),
                notify: Notify::new(),
            }),
            queue,
            metrics,
            min_workers,
            max_workers,
            workers: Mutex::new(PoolWorkers::default()),
        }
    }

    /// Enqueues a work item or signals that the pool is at capacity.
    pub fn submit(&self, item: WorkItem) -> crate::Result<()> {
        let mut core = self.shared.core.lock().expect("pool state poisoned");
        if core.stopped {
            return Err(SkyhookError::GenericError(
                "worker pool is stopped".to_string(),
            ));
        }
        let (active, queued) = (core.active, core.queued.len());
        if active + queued >= self.max_workers {
            return Err(SkyhookError::CapacityExceeded {
                active,
                queued,
                max_workers: self.max_workers,
            });
        }
        core.queued.push_back(item);
        drop(core);
        self.shared.notify.notify_one();
        Ok(())
    }

    pub fn start_min_workers(&self) {
        let mut workers = self.workers.lock().expect("pool workers poisoned");
        while workers.handles.len() < self.min_workers {
            self.spawn_worker(&mut workers);
        }
    }

    /// One enforcement cycle: reap finished workers, stop idle workers above
    /// the minimum, then start new workers while queued demand exceeds idle
    /// supply. Waits for the stopped workers to exit so the pool size is
    /// exact when the cycle ends.
    pub async fn enforce(&self) {
        let stopping: Vec<JoinHandle<()>> = {
            let mut workers = self.workers.lock().expect("pool workers poisoned");
            workers.handles.retain(|worker| !worker.join.is_finished());

            let mut stopping = Vec::new();
            let mut excess = workers.handles.len().saturating_sub(self.min_workers);
            let mut index = 0;
            while index < workers.handles.len() {
                if excess > 0 && workers.handles[index].idle.load(Ordering::Relaxed) {
                    let worker = workers.handles.remove(index);
                    log::debug!("Stopping idle worker {}", worker.id);
                    worker.stop.store(true, Ordering::Relaxed);
                    stopping.push(worker.join);
                    excess -= 1;
                } else {
                    index += 1;
                }
            }

            let queued = self.shared.core.lock().expect("pool state poisoned").queued.len();
            let mut idle_supply = workers
                .handles
                .iter()
                .filter(|worker| worker.idle.load(Ordering::Relaxed))
                .count();
            while queued > idle_supply && workers.handles.len() < self.max_workers {
                self.spawn_worker(&mut workers);
                idle_supply += 1;
            }
            stopping
        };

        if !stopping.is_empty() {
            self.shared.notify.notify_waiters();
            for join in stopping {
                let _ = join.await;
            }
        }
    }

    /// Cooperative shutdown: running tasks finish, queued-but-unstarted
    /// messages stay unacknowledged and will redeliver elsewhere.
    pub async fn stop(&self) {
        self.shared.core.lock().expect("pool state poisoned").stopped = true;
        let handles: Vec<WorkerHandle> = {
            let mut workers = self.workers.lock().expect("pool workers poisoned");
            workers.handles.drain(..).collect()
        };
        for worker in &handles {
            worker.stop.store(true, Ordering::Relaxed);
        }
        self.shared.notify.notify_waiters();
        for worker in handles {
            let _ = worker.join.await;
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.core.lock().expect("pool state poisoned").stopped
    }

    pub fn worker_count(&self) -> usize {
        self.workers.lock().expect("pool workers poisoned").handles.len()
    }

    pub fn idle_worker_count(&self) -> usize {
        self.workers
            .lock()
            .expect("pool workers poisoned")
            .handles
            .iter()
            .filter(|worker| worker.idle.load(Ordering::Relaxed))
            .count()
    }

    /// Returns `(active, queued)`.
    pub fn load(&self) -> (usize, usize) {
        let core = self.shared.core.lock().expect("pool state poisoned");
        (core.active, core.queued.len())
    }

    fn spawn_worker(&self, workers: &mut PoolWorkers) {
        let id = workers.id_counter.increment();
        let idle = Arc::new(AtomicBool::new(true));
        let stop = Arc::new(AtomicBool::new(false));
        let join = tokio::spawn(worker_loop(
            id,
            self.shared.clone(),
            self.queue.clone(),
            self.metrics.clone(),
            idle.clone(),
            stop.clone(),
        ));
        log::debug!("Started worker {id}");
        workers.handles.push(WorkerHandle {
            id,
            idle,
            stop,
            join,
        });
    }
}

async fn worker_loop(
    id: u32,
    shared: Arc<PoolShared>,
    queue: Arc<dyn DurableTaskQueue>,
    metrics: Arc<MetricsRegistry>,
    idle: Arc<AtomicBool>,
    stop: Arc<AtomicBool>,
) {
    loop {
        if stop.load(Ordering::Relaxed) {
            break;
        }
        let item = {
            let mut core = shared.core.lock().expect("pool state poisoned");
            match core.queued.pop_front() {
                Some(item) => {
                    core.active += 1;
                    Some(item)
                }
                None => {
                    if core.stopped {
                        break;
                    }
                    None
                }
            }
        };

        let Some(item) = item else {
            idle.store(true, Ordering::Relaxed);
            let _ = tokio::time::timeout(WORKER_POP_TIMEOUT, shared.notify.notified()).await;
            continue;
        };

        idle.store(false, Ordering::Relaxed);
        let receipt = item.receipt_handle.clone();
        let result = item.handler.run(item.payload).await;
        match result {
            Ok(()) => {
                acknowledge(&*queue, receipt, &metrics).await;
            }
            Err(TaskError::IdempotentConflict(reason)) => {
                log::debug!("Task already applied ({reason}), acknowledging message");
                acknowledge(&*queue, receipt, &metrics).await;
            }
            Err(TaskError::Failed(error)) => {
                // Leave the message untouched; it redelivers after its
                // visibility timeout.
                log::error!("Task execution failed on worker {id}: {error:?}");
                metrics.increment(METRIC_TASKS_FAILED);
            }
        }
        shared.core.lock().expect("pool state poisoned").active -= 1;
        idle.store(true, Ordering::Relaxed);
    }
    log::debug!("Worker {id} stopped");
}

async fn acknowledge(
    queue: &dyn DurableTaskQueue,
    receipt: ReceiptHandle,
    metrics: &MetricsRegistry,
) {
    if let Err(error) = queue.delete(receipt).await {
        log::warn!("Could not delete acknowledged message: {error:?}");
    }
    metrics.increment(METRIC_TASKS_COMPLETED);
}

/// Periodically enforces the pool size bounds until the pool is stopped.
pub async fn pool_enforcement_process(pool: Arc<WorkerPool>) {
    let mut interval = tokio::time::interval(crate::config::get_pool_enforcement_interval());
    loop {
        interval.tick().await;
        if pool.is_stopped() {
            break;
        }
        pool.enforce().await;
    }
    log::debug!("Pool enforcement loop ended");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::taskqueue::queue::testing::InMemoryQueue;
    use std::future::Future;
    use std::pin::Pin;
    use std::time::{Duration, Instant};

    struct OkHandler;
    impl TaskHandler for OkHandler {
        fn run(
            &self,
            _payload: serde_json::Value,
        ) -> Pin<Box<dyn Future<Output = Result<(), TaskError>> + Send>> {
            Box::pin(async { Ok(()) })
        }
    }

    struct FailHandler;
    impl TaskHandler for FailHandler {
        fn run(
            &self,
            _payload: serde_json::Value,
        ) -> Pin<Box<dyn Future<Output = Result<(), TaskError>> + Send>> {
            Box::pin(async { Err(TaskError::Failed(anyhow::anyhow!("boom"))) })
        }
    }

    struct ConflictHandler;
    impl TaskHandler for ConflictHandler {
        fn run(
            &self,
            _payload: serde_json::Value,
        ) -> Pin<Box<dyn Future<Output = Result<(), TaskError>> + Send>> {
            Box::pin(async { Err(TaskError::IdempotentConflict("node exists".to_string())) })
        }
    }

    fn item(handler: Arc<dyn TaskHandler>, receipt: &str) -> WorkItem {
        WorkItem {
            handler,
            payload: serde_json::Value::Null,
            receipt_handle: receipt.to_string(),
        }
    }

    fn pool(min: usize, max: usize) -> (Arc<WorkerPool>, Arc<InMemoryQueue>) {
        let queue = Arc::new(InMemoryQueue::default());
        let pool = WorkerPool::new(
            WorkerPoolConfig {
                min_workers: min,
                max_workers: max,
            },
            queue.clone(),
            Arc::new(MetricsRegistry::default()),
        );
        (Arc::new(pool), queue)
    }

    async fn wait_until(pool: &WorkerPool, predicate: impl Fn(&WorkerPool) -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !predicate(pool) {
            assert!(Instant::now() < deadline, "condition not reached in time");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[tokio::test]
    async fn test_submit_backpressure() {
        // Workers are intentionally not started: queued items stay queued.
        let (pool, _queue) = pool(1, 2);
        pool.submit(item(Arc::new(OkHandler), "r1")).unwrap();
        pool.submit(item(Arc::new(OkHandler), "r2")).unwrap();
        let result = pool.submit(item(Arc::new(OkHandler), "r3"));
        assert!(matches!(
            result,
            Err(SkyhookError::CapacityExceeded {
                active: 0,
                queued: 2,
                max_workers: 2,
            })
        ));
    }

    #[tokio::test]
    async fn test_success_and_conflict_acknowledge_failure_does_not() {
        let (pool, queue) = pool(1, 4);
        pool.start_min_workers();
        pool.submit(item(Arc::new(OkHandler), "ok")).unwrap();
        pool.submit(item(Arc::new(ConflictHandler), "conflict"))
            .unwrap();
        pool.submit(item(Arc::new(FailHandler), "failed")).unwrap();
        wait_until(&pool, |p| p.load() == (0, 0)).await;
        pool.stop().await;

        assert!(queue.was_deleted("ok"));
        assert!(queue.was_deleted("conflict"));
        assert!(!queue.was_deleted("failed"));
    }

    #[tokio::test]
    async fn test_enforcement_scales_up_on_queued_demand() {
        let (pool, _queue) = pool(1, 4);
        pool.start_min_workers();
        assert_eq!(pool.worker_count(), 1);
        for i in 0..3 {
            pool.submit(item(Arc::new(OkHandler), &format!("r{i}")))
                .unwrap();
        }
        pool.enforce().await;
        assert!(pool.worker_count() > 1);
        wait_until(&pool, |p| p.load() == (0, 0)).await;
        pool.stop().await;
    }

    #[tokio::test]
    async fn test_idle_workers_reclaimed_to_minimum() {
        let (pool, _queue) = pool(1, 4);
        pool.start_min_workers();
        for i in 0..4 {
            pool.submit(item(Arc::new(OkHandler), &format!("r{i}")))
                .unwrap();
        }
        pool.enforce().await;
        wait_until(&pool, |p| p.load() == (0, 0)).await;
        // Workers flip their idle flag after finishing; wait for that too.
        wait_until(&pool, |p| p.idle_worker_count() == p.worker_count()).await;

        pool.enforce().await;
        assert_eq!(pool.worker_count(), 1);
        pool.stop().await;
    }

    #[tokio::test]
    async fn test_config_clamping_never_fails() {
        let queue = Arc::new(InMemoryQueue::default());
        let pool = WorkerPool::new(
            WorkerPoolConfig {
                min_workers: 0,
                max_workers: 100_000,
            },
            queue,
            Arc::new(MetricsRegistry::default()),
        );
        assert_eq!(pool.min_workers, ABSOLUTE_MIN_WORKERS);
        assert_eq!(pool.max_workers, ABSOLUTE_MAX_WORKERS);
    }
}
