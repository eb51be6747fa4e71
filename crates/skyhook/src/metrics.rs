use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::Map;

/// Receives metric pushes on state transitions. Implementations must not
/// block the caller; anything slow belongs behind a channel on the sink side.
pub trait MetricsSink: Send + Sync {
    fn push_counter(&self, name: &str, value: u64);
    fn push_timer(&self, name: &str, duration: Duration);
}

#[derive(Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn increment(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn add(&self, value: u64) -> u64 {
        self.0.fetch_add(value, Ordering::Relaxed) + value
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Registry of named counters and timers, owned by the service that created
/// it. Counters are created on first use under the registry lock; the
/// returned handles can be cloned out and updated without locking.
pub struct MetricsRegistry {
    counters: Mutex<Map<String, Arc<Counter>>>,
    sink: Option<Arc<dyn MetricsSink>>,
}

impl MetricsRegistry {
    pub fn new(sink: Option<Arc<dyn MetricsSink>>) -> Self {
        Self {
            counters: Mutex::new(Map::default()),
            sink,
        }
    }

    pub fn counter(&self, name: &str) -> Arc<Counter> {
        let mut counters = self.counters.lock().expect("metrics registry poisoned");
        if let Some(counter) = counters.get(name) {
            return counter.clone();
        }
        let counter = Arc::new(Counter::default());
        counters.insert(name.to_string(), counter.clone());
        counter
    }

    /// Increments a counter and forwards the new value to the sink.
    pub fn increment(&self, name: &str) {
        let value = self.counter(name).increment();
        if let Some(sink) = &self.sink {
            sink.push_counter(name, value);
        }
    }

    pub fn record_duration(&self, name: &str, duration: Duration) {
        if let Some(sink) = &self.sink {
            sink.push_timer(name, duration);
        }
    }

    pub fn counter_value(&self, name: &str) -> u64 {
        self.counter(name).get()
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new(None)
    }
}

// Counter and timer names pushed by the core components.
pub const METRIC_SYNC_FAILURES: &str = "instance_sync_failures";
pub const METRIC_NODES_ADDED: &str = "nodes_added";
pub const METRIC_NODES_DELETED: &str = "nodes_deleted";
pub const METRIC_NODES_READY: &str = "nodes_ready";
pub const METRIC_NODES_BUSY: &str = "nodes_busy";
pub const METRIC_PROVISION_DURATION: &str = "node_provision_duration";
pub const METRIC_TASKS_COMPLETED: &str = "tasks_completed";
pub const METRIC_TASKS_FAILED: &str = "tasks_failed";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_or_create_returns_same_counter() {
        let registry = MetricsRegistry::default();
        let a = registry.counter("nodes_added");
        let b = registry.counter("nodes_added");
        a.increment();
        assert_eq!(b.get(), 1);
    }

    #[test]
    fn test_increment_reaches_sink() {
        struct Recorder(Mutex<Vec<(String, u64)>>);
        impl MetricsSink for Recorder {
            fn push_counter(&self, name: &str, value: u64) {
                self.0.lock().unwrap().push((name.to_string(), value));
            }
            fn push_timer(&self, _name: &str, _duration: Duration) {}
        }

        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        let registry = MetricsRegistry::new(Some(recorder.clone()));
        registry.increment("nodes_added");
        registry.increment("nodes_added");
        let pushes = recorder.0.lock().unwrap();
        assert_eq!(&*pushes, &[("nodes_added".to_string(), 1), ("nodes_added".to_string(), 2)]);
    }
}
