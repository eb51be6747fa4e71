//! Bridge between the canonical job/node/queue model and an external
//! CLI-driven batch scheduler. The `Scheduler` trait is the seam; `pbs` is
//! the concrete backend talking to PBS commands through subprocesses.

pub mod pbs;
pub mod state;

use std::future::Future;
use std::pin::Pin;
use std::time::SystemTime;

use crate::scheduler::state::NodeState;
use crate::{Map, Set};

pub type AdapterResult<T> = anyhow::Result<T>;
pub type SchedulerJobId = String;

/// Bulk job queries are fetched in pages of this many job ids.
pub const JOB_QUERY_PAGE_SIZE: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Queued,
    Provisioning,
    Running,
    Finished,
}

/// Canonical view of one scheduler job.
#[derive(Debug, Clone)]
pub struct SchedulerJob {
    pub id: SchedulerJobId,
    pub name: String,
    pub owner: String,
    pub queue: String,
    pub state: JobState,
    pub node_count: u64,
    pub resources: Map<String, String>,
    pub submitted_at: Option<SystemTime>,
}

/// Canonical view of one scheduler compute node.
#[derive(Debug, Clone)]
pub struct NodeInfo {
    pub host: String,
    pub states: Set<NodeState>,
    pub resources_available: Map<String, String>,
    pub resources_assigned: Map<String, String>,
    pub jobs: Vec<SchedulerJobId>,
}

/// External batch scheduler, driven through CLI subprocess invocations.
/// Calls block (logically) for the full duration of the external command.
pub trait Scheduler: Send + Sync {
    /// Queries one page of job ids (at most [`JOB_QUERY_PAGE_SIZE`]).
    /// Finished and unknown ids are recovered per the backend's exit-code
    /// semantics; only genuinely unexpected failures surface as errors.
    fn query_job_page(
        &self,
        ids: &[SchedulerJobId],
    ) -> Pin<Box<dyn Future<Output = AdapterResult<Vec<SchedulerJob>>> + Send>>;

    /// All jobs belonging to an owner, resolved through the backend's
    /// columnar owner listing followed by a structured per-id re-query.
    fn jobs_for_owner(
        &self,
        owner: &str,
    ) -> Pin<Box<dyn Future<Output = AdapterResult<Vec<SchedulerJob>>> + Send>>;

    /// All jobs currently in the given queue.
    fn queue_jobs(
        &self,
        queue: &str,
    ) -> Pin<Box<dyn Future<Output = AdapterResult<Vec<SchedulerJob>>> + Send>>;

    fn get_node(
        &self,
        host: &str,
    ) -> Pin<Box<dyn Future<Output = AdapterResult<Option<NodeInfo>>> + Send>>;

    fn list_nodes(
        &self,
    ) -> Pin<Box<dyn Future<Output = AdapterResult<Vec<NodeInfo>>> + Send>>;

    fn create_node(
        &self,
        host: &str,
        attributes: Map<String, String>,
    ) -> Pin<Box<dyn Future<Output = AdapterResult<()>> + Send>>;

    fn delete_node(
        &self,
        host: &str,
    ) -> Pin<Box<dyn Future<Output = AdapterResult<()>> + Send>>;
}

/// Lazy bulk job query: yields one page of results at a time without ever
/// materializing the full result set. A failed page does not advance the
/// cursor, so the caller can retry the same chunk.
pub struct JobQueryStream<'a> {
    scheduler: &'a dyn Scheduler,
    ids: Vec<SchedulerJobId>,
    cursor: usize,
}

impl<'a> JobQueryStream<'a> {
    pub fn new(scheduler: &'a dyn Scheduler, ids: Vec<SchedulerJobId>) -> Self {
        Self {
            scheduler,
            ids,
            cursor: 0,
        }
    }

    pub async fn next_page(&mut self) -> Option<AdapterResult<Vec<SchedulerJob>>> {
        if self.cursor >= self.ids.len() {
            return None;
        }
        let end = (self.cursor + JOB_QUERY_PAGE_SIZE).min(self.ids.len());
        let chunk = &self.ids[self.cursor..end];
        match self.scheduler.query_job_page(chunk).await {
            Ok(jobs) => {
                self.cursor = end;
                Some(Ok(jobs))
            }
            Err(error) => Some(Err(error)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Scheduler double that records the page sizes it was asked for and can
    /// fail the next query on demand.
    #[derive(Default)]
    struct PageRecorder {
        pages: Mutex<Vec<usize>>,
        fail_next: Mutex<bool>,
    }

    impl Scheduler for PageRecorder {
        fn query_job_page(
            &self,
            ids: &[SchedulerJobId],
        ) -> Pin<Box<dyn Future<Output = AdapterResult<Vec<SchedulerJob>>> + Send>> {
            if std::mem::take(&mut *self.fail_next.lock().unwrap()) {
                return Box::pin(async { anyhow::bail!("scheduler race") });
            }
            self.pages.lock().unwrap().push(ids.len());
            let jobs = ids
                .iter()
                .map(|id| SchedulerJob {
                    id: id.clone(),
                    name: "job".to_string(),
                    owner: "user".to_string(),
                    queue: "normal".to_string(),
                    state: JobState::Queued,
                    node_count: 1,
                    resources: Map::default(),
                    submitted_at: None,
                })
                .collect();
            Box::pin(async move { Ok(jobs) })
        }

        fn jobs_for_owner(
            &self,
            _owner: &str,
        ) -> Pin<Box<dyn Future<Output = AdapterResult<Vec<SchedulerJob>>> + Send>> {
            unimplemented!()
        }

        fn queue_jobs(
            &self,
            _queue: &str,
        ) -> Pin<Box<dyn Future<Output = AdapterResult<Vec<SchedulerJob>>> + Send>> {
            unimplemented!()
        }

        fn get_node(
            &self,
            _host: &str,
        ) -> Pin<Box<dyn Future<Output = AdapterResult<Option<NodeInfo>>> + Send>> {
            unimplemented!()
        }

        fn list_nodes(
            &self,
        ) -> Pin<Box<dyn Future<Output = AdapterResult<Vec<NodeInfo>>> + Send>> {
            unimplemented!()
        }

        fn create_node(
            &self,
            _host: &str,
            _attributes: Map<String, String>,
        ) -> Pin<Box<dyn Future<Output = AdapterResult<()>> + Send>> {
            unimplemented!()
        }

        fn delete_node(
            &self,
            _host: &str,
        ) -> Pin<Box<dyn Future<Output = AdapterResult<()>> + Send>> {
            unimplemented!()
        }
    }

    #[tokio::test]
    async fn test_stream_pages_in_chunks_of_100() {
        let scheduler = PageRecorder::default();
        let ids: Vec<SchedulerJobId> = (0..250).map(|i| format!("{i}.server")).collect();
        let mut stream = JobQueryStream::new(&scheduler, ids);

        let mut total = 0;
        while let Some(page) = stream.next_page().await {
            total += page.unwrap().len();
        }
        assert_eq!(total, 250);
        assert_eq!(&*scheduler.pages.lock().unwrap(), &[100, 100, 50]);
    }

    #[tokio::test]
    async fn test_failed_page_is_restartable() {
        let scheduler = PageRecorder::default();
        let ids: Vec<SchedulerJobId> = (0..150).map(|i| format!("{i}.server")).collect();
        let mut stream = JobQueryStream::new(&scheduler, ids);

        assert_eq!(stream.next_page().await.unwrap().unwrap().len(), 100);
        *scheduler.fail_next.lock().unwrap() = true;
        assert!(stream.next_page().await.unwrap().is_err());
        // The cursor did not advance; the same chunk is fetched again.
        assert_eq!(stream.next_page().await.unwrap().unwrap().len(), 50);
        assert!(stream.next_page().await.is_none());
    }
}
