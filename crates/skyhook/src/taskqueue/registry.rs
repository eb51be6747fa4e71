use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::common::error::SkyhookError;
use crate::Map;

/// Outcome classification for a task execution. An idempotent conflict means
/// the work was already done by an earlier delivery; the message is
/// acknowledged just like a success.
#[derive(Debug)]
pub enum TaskError {
    IdempotentConflict(String),
    Failed(anyhow::Error),
}

impl From<anyhow::Error> for TaskError {
    fn from(error: anyhow::Error) -> Self {
        TaskError::Failed(error)
    }
}

pub trait TaskHandler: Send + Sync {
    fn run(
        &self,
        payload: serde_json::Value,
    ) -> Pin<Box<dyn Future<Output = Result<(), TaskError>> + Send>>;
}

/// Closed dispatch table from task name to handler, built at construction.
/// Lookup of an unknown name returns `None`; the poller decides what to do
/// with the inbound message in that case.
#[derive(Default)]
pub struct TaskRegistry {
    handlers: Map<&'static str, Arc<dyn TaskHandler>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        name: &'static str,
        handler: Arc<dyn TaskHandler>,
    ) -> crate::Result<()> {
        if self.handlers.insert(name, handler).is_some() {
            return Err(SkyhookError::ContractViolation(format!(
                "task handler {name} registered twice"
            )));
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(name).cloned()
    }

    pub fn task_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.handlers.keys().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopHandler;
    impl TaskHandler for NoopHandler {
        fn run(
            &self,
            _payload: serde_json::Value,
        ) -> Pin<Box<dyn Future<Output = Result<(), TaskError>> + Send>> {
            Box::pin(async { Ok(()) })
        }
    }

    #[test]
    fn test_duplicate_registration_is_rejected() {
        let mut registry = TaskRegistry::new();
        registry.register("sync_nodes", Arc::new(NoopHandler)).unwrap();
        let result = registry.register("sync_nodes", Arc::new(NoopHandler));
        assert!(matches!(
            result,
            Err(SkyhookError::ContractViolation(_))
        ));
    }
}
