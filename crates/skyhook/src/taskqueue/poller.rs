use std::sync::Arc;

use crate::common::error::SkyhookError;
use crate::common::rpc::RpcReceiver;
use crate::config::{
    clamp_with_warning, get_backpressure_backoff, MAX_RECEIVE_BATCH, MAX_VISIBILITY_BATCH,
};
use crate::taskqueue::pool::{WorkItem, WorkerPool};
use crate::taskqueue::queue::{DurableTaskQueue, QueueMessage, TaskEnvelope};
use crate::taskqueue::registry::TaskRegistry;

#[derive(Debug)]
pub enum PollerMessage {
    Quit,
}

/// The message poll loop: long-polls the durable queue, resolves each
/// message through the task registry and dispatches it into the worker pool.
/// When the pool signals capacity exceeded, the unprocessed remainder of the
/// batch has its visibility reset so other consumers can retry it sooner,
/// and the poller backs off for a fixed interval.
pub async fn task_poller_process(
    queue: Arc<dyn DurableTaskQueue>,
    registry: Arc<TaskRegistry>,
    pool: Arc<WorkerPool>,
    batch_size: usize,
    mut receiver: RpcReceiver<PollerMessage>,
) {
    let batch_size = clamp_with_warning("receive batch size", batch_size, 1, MAX_RECEIVE_BATCH);

    loop {
        tokio::select! {
            msg = receiver.recv() => {
                match msg {
                    Some(PollerMessage::Quit) | None => break,
                }
            }
            result = queue.receive(batch_size) => {
                match result {
                    Ok(messages) => {
                        let backpressured = dispatch_batch(&*queue, &registry, &pool, messages).await;
                        if backpressured {
                            tokio::time::sleep(get_backpressure_backoff()).await;
                        }
                    }
                    Err(error) => {
                        // Transient infra error; retried on the next cycle.
                        log::warn!("Failed to receive task messages: {error:?}");
                        tokio::time::sleep(get_backpressure_backoff()).await;
                    }
                }
            }
        }
    }
    log::debug!("Task poller ended");
}

/// Dispatches one received batch. Returns true if the pool ran out of
/// capacity and the caller should back off.
pub(crate) async fn dispatch_batch(
    queue: &dyn DurableTaskQueue,
    registry: &TaskRegistry,
    pool: &WorkerPool,
    messages: Vec<QueueMessage>,
) -> bool {
    let mut iter = messages.into_iter();
    while let Some(message) = iter.next() {
        let envelope: TaskEnvelope = match serde_json::from_str(&message.body) {
            Ok(envelope) => envelope,
            Err(error) => {
                log::error!(
                    "Malformed task message {}: {error:?}",
                    message.message_id
                );
                continue;
            }
        };

        let Some(handler) = registry.get(&envelope.name) else {
            // The message is not deleted here, so it will redeliver after
            // each visibility timeout expiry.
            log::error!(
                "Received task with unknown name {} (message {})",
                envelope.name,
                message.message_id
            );
            continue;
        };

        let item = WorkItem {
            handler,
            payload: envelope.payload,
            receipt_handle: message.receipt_handle.clone(),
        };
        match pool.submit(item) {
            Ok(()) => {}
            Err(SkyhookError::CapacityExceeded {
                active,
                queued,
                max_workers,
            }) => {
                log::debug!(
                    "Worker pool at capacity ({active} active, {queued} queued, max {max_workers}); \
returning the rest of the batch"
                );
                let mut receipts = vec![message.receipt_handle];
                receipts.extend(iter.map(|m| m.receipt_handle));
                for chunk in receipts.chunks(MAX_VISIBILITY_BATCH) {
                    if let Err(error) = queue.reset_visibility_batch(chunk.to_vec()).await {
                        log::warn!("Could not reset message visibility: {error:?}");
                    }
                }
                return true;
            }
            Err(error) => {
                log::error!("Could not dispatch task {}: {error:?}", envelope.name);
            }
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::MetricsRegistry;
    use crate::taskqueue::pool::WorkerPoolConfig;
    use crate::taskqueue::queue::testing::InMemoryQueue;
    use crate::taskqueue::registry::{TaskError, TaskHandler};
    use std::future::Future;
    use std::pin::Pin;

    struct OkHandler;
    impl TaskHandler for OkHandler {
        fn run(
            &self,
            _payload: serde_json::Value,
        ) -> Pin<Box<dyn Future<Output = Result<(), TaskError>> + Send>> {
            Box::pin(async { Ok(()) })
        }
    }

    fn setup(max_workers: usize) -> (Arc<InMemoryQueue>, TaskRegistry, WorkerPool) {
        let queue = Arc::new(InMemoryQueue::default());
        let mut registry = TaskRegistry::new();
        registry
            .register("create_node", Arc::new(OkHandler))
            .unwrap();
        let pool = WorkerPool::new(
            WorkerPoolConfig {
                min_workers: 1,
                max_workers,
            },
            queue.clone(),
            Arc::new(MetricsRegistry::default()),
        );
        (queue, registry, pool)
    }

    fn envelope_body(name: &str) -> String {
        serde_json::to_string(&TaskEnvelope {
            name: name.to_string(),
            payload: serde_json::json!({}),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_unknown_task_name_leaves_message_undelivered() {
        let (queue, registry, pool) = setup(4);
        queue.seed(&[("m1", &envelope_body("no_such_task"))]);
        let messages = queue.receive(10).await.unwrap();

        let backpressured = dispatch_batch(&*queue, &registry, &pool, messages).await;
        assert!(!backpressured);
        // Unknown names are only logged; the message must stay in flight so
        // it redelivers after its visibility timeout.
        assert!(!queue.was_deleted("receipt-m1"));
        assert_eq!(pool.load(), (0, 0));
    }

    #[tokio::test]
    async fn test_capacity_exceeded_resets_rest_of_batch() {
        // Workers are not started, so submitted items stay queued and the
        // second message trips the capacity check.
        let (queue, registry, pool) = setup(1);
        let body = envelope_body("create_node");
        queue.seed(&[("m1", &body), ("m2", &body), ("m3", &body)]);
        let messages = queue.receive(10).await.unwrap();

        let backpressured = dispatch_batch(&*queue, &registry, &pool, messages).await;
        assert!(backpressured);
        assert_eq!(pool.load(), (0, 1));

        let resets = queue.visibility_resets.lock().unwrap();
        assert_eq!(resets.len(), 1);
        assert_eq!(
            resets[0],
            vec!["receipt-m2".to_string(), "receipt-m3".to_string()]
        );
    }

    #[tokio::test]
    async fn test_malformed_message_is_skipped() {
        let (queue, registry, pool) = setup(4);
        queue.seed(&[("bad", "{not json"), ("good", &envelope_body("create_node"))]);
        let messages = queue.receive(10).await.unwrap();

        let backpressured = dispatch_batch(&*queue, &registry, &pool, messages).await;
        assert!(!backpressured);
        assert!(!queue.was_deleted("receipt-bad"));
        assert_eq!(pool.load(), (0, 1));
    }
}
