use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};

pub type QueueResult<T> = anyhow::Result<T>;
pub type ReceiptHandle = String;

/// JSON envelope carried in every queue message body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEnvelope {
    pub name: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// One message received from the durable queue. The receipt handle is the
/// acknowledgement token; the message redelivers after its visibility
/// timeout unless it is deleted through that handle.
#[derive(Debug, Clone)]
pub struct QueueMessage {
    pub message_id: String,
    pub receipt_handle: ReceiptHandle,
    pub body: String,
    pub group_id: Option<String>,
}

/// Durable FIFO task queue collaborator. Messages within the same group id
/// are delivered in order; across groups there is no ordering guarantee.
pub trait DurableTaskQueue: Send + Sync {
    /// Long-poll receive of up to `max_messages` messages.
    fn receive(
        &self,
        max_messages: usize,
    ) -> Pin<Box<dyn Future<Output = QueueResult<Vec<QueueMessage>>> + Send>>;

    /// Acknowledges a message; it will not be delivered again.
    fn delete(
        &self,
        receipt: ReceiptHandle,
    ) -> Pin<Box<dyn Future<Output = QueueResult<()>> + Send>>;

    /// Resets the visibility timeout of the given messages to zero so other
    /// consumers can pick them up immediately. Callers keep each batch at or
    /// below the service batch-API limit.
    fn reset_visibility_batch(
        &self,
        receipts: Vec<ReceiptHandle>,
    ) -> Pin<Box<dyn Future<Output = QueueResult<()>> + Send>>;

    /// Enqueues a task for some consumer, deduplicated by `dedupe_id`.
    fn send(
        &self,
        envelope: TaskEnvelope,
        group_id: String,
        dedupe_id: String,
    ) -> Pin<Box<dyn Future<Output = QueueResult<()>> + Send>>;
}
