use std::sync::{Arc, Mutex, MutexGuard};

use crate::common::error::SkyhookError;
use crate::inventory::instance::{Instance, InstanceFilter, InstanceId};
use crate::metrics::{MetricsRegistry, METRIC_SYNC_FAILURES};
use crate::{Map, Set};

/// Per-association counts of alive (pending/running) compute instances,
/// recomputed at every sync commit. Read by the capacity planner and the
/// external job provisioner.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstanceCounts {
    pub by_job: Map<String, u64>,
    pub by_job_group: Map<String, u64>,
    pub by_queue: Map<String, u64>,
}

struct SyncSession {
    /// Keys present in the cache when the session began.
    existing: Set<InstanceId>,
    /// Keys upserted during this session.
    touched: Set<InstanceId>,
}

/// Eventually-consistent inventory of cloud instances.
///
/// A sync session replaces the whole key set atomically at commit: every key
/// not touched during the session is deleted, so the post-commit key set is
/// exactly the union of ids passed to `sync()` within the session. Readers
/// are never blocked by an in-flight session and may observe a mix of old
/// and new entries until the commit lands.
pub struct InstanceStateCache {
    instances: Map<InstanceId, Instance>,
    session: Option<SyncSession>,
    ready: bool,
    counts: InstanceCounts,
    metrics: Arc<MetricsRegistry>,
}

impl InstanceStateCache {
    pub fn new(metrics: Arc<MetricsRegistry>) -> Self {
        Self {
            instances: Map::default(),
            session: None,
            ready: false,
            counts: InstanceCounts::default(),
            metrics,
        }
    }

    /// Opens a sync session, snapshotting the existing key set. An already
    /// open session is discarded with a warning; its partial writes stay in
    /// the cache until this session's commit removes the untouched ones.
    pub fn sync_begin(&mut self) {
        if self.session.is_some() {
            log::warn!("Instance sync session was already open, discarding the stale session");
        }
        self.session = Some(SyncSession {
            existing: self.instances.keys().cloned().collect(),
            touched: Set::default(),
        });
    }

    /// Upserts one page of the provider listing into the cache. Within a
    /// session the last writer per instance id wins.
    pub fn sync(&mut self, instances: Vec<Instance>) -> crate::Result<()> {
        let session = self.session.as_mut().ok_or_else(|| {
            SkyhookError::ContractViolation("sync() called without an open session".to_string())
        })?;
        for instance in instances {
            session.touched.insert(instance.id.clone());
            self.instances.insert(instance.id.clone(), instance);
        }
        Ok(())
    }

    /// Commits the session: deletes every key not touched this session,
    /// marks the cache ready and recomputes the derived counts. A session
    /// with zero pages commits validly and empties the cache.
    pub fn sync_commit(&mut self) -> crate::Result<()> {
        let session = self.session.take().ok_or_else(|| {
            SkyhookError::ContractViolation(
                "sync_commit() called without an open session".to_string(),
            )
        })?;
        let removed: Vec<InstanceId> = session
            .existing
            .iter()
            .filter(|id| !session.touched.contains(*id))
            .cloned()
            .collect();
        for id in &removed {
            self.instances.remove(id);
        }
        if !removed.is_empty() {
            log::debug!("Sync commit removed {} vanished instance(s)", removed.len());
        }
        self.ready = true;
        self.recompute_counts();
        Ok(())
    }

    /// Discards the session. Readiness and previously committed data are
    /// left untouched; partial upserts from this session remain until the
    /// next successful commit replaces them.
    pub fn sync_abort(&mut self) {
        if self.session.take().is_some() {
            self.metrics.increment(METRIC_SYNC_FAILURES);
        }
    }

    /// True once at least one sync session has committed.
    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn get_instances(&self, filter: &InstanceFilter) -> Vec<Instance> {
        self.instances
            .values()
            .filter(|instance| filter.matches(instance))
            .cloned()
            .collect()
    }

    pub fn get_instance(&self, id: &str) -> Option<&Instance> {
        self.instances.get(id)
    }

    pub fn counts(&self) -> &InstanceCounts {
        &self.counts
    }

    /// Ids of compute instances currently in the running state.
    pub fn running_compute_ids(&self) -> Set<InstanceId> {
        self.instances
            .values()
            .filter(|i| i.is_compute() && i.state == crate::inventory::LifecycleState::Running)
            .map(|i| i.id.clone())
            .collect()
    }

    fn recompute_counts(&mut self) {
        let mut counts = InstanceCounts::default();
        for instance in self.instances.values() {
            if !instance.is_compute() || !instance.state.is_alive() {
                continue;
            }
            if let Some(job) = &instance.job_id {
                *counts.by_job.entry(job.clone()).or_default() += 1;
            }
            if let Some(group) = &instance.job_group {
                *counts.by_job_group.entry(group.clone()).or_default() += 1;
            }
            if let Some(queue) = &instance.queue {
                *counts.by_queue.entry(queue.clone()).or_default() += 1;
            }
        }
        self.counts = counts;
    }
}

/// Shared handle to the cache. The monitor mutates it through sync sessions;
/// every other component only reads. Lock hold times are single calls, so an
/// in-flight session never blocks readers for the session's duration.
#[derive(Clone)]
pub struct InstanceCacheRef(Arc<Mutex<InstanceStateCache>>);

impl InstanceCacheRef {
    pub fn new(metrics: Arc<MetricsRegistry>) -> Self {
        Self(Arc::new(Mutex::new(InstanceStateCache::new(metrics))))
    }

    pub fn get(&self) -> MutexGuard<'_, InstanceStateCache> {
        self.0.lock().expect("instance cache poisoned")
    }

    pub fn get_instances(&self, filter: &InstanceFilter) -> Vec<Instance> {
        self.get().get_instances(filter)
    }

    pub fn counts(&self) -> InstanceCounts {
        self.get().counts().clone()
    }
}
