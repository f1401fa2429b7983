use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info};

use flowci_core::config::EngineConfig;
use flowci_core::error::{FlowError, Result};
use flowci_core::event::EventBus;
use flowci_core::node::{root_path, NodeTree};
use flowci_core::traits::{JobSnapshot, JobStore, PipelineService};
use flowci_core::types::{Job, JobEvent, JobFilter, JobId, NodeResult};
use flowci_dispatch::CommandDispatcher;

use crate::lanes::JobLanes;

/// Owns the job lifecycle: creation, lookups, and the per-job serialization
/// every callback runs under.
pub struct JobOrchestrator {
    pub(crate) store: Arc<dyn JobStore>,
    pipelines: Arc<dyn PipelineService>,
    pub(crate) dispatcher: CommandDispatcher,
    pub(crate) event_bus: Arc<EventBus>,
    pub(crate) lanes: JobLanes,
    retry_attempts: u32,
    retry_delay: Duration,
}

impl JobOrchestrator {
    pub fn new(
        store: Arc<dyn JobStore>,
        pipelines: Arc<dyn PipelineService>,
        dispatcher: CommandDispatcher,
        event_bus: Arc<EventBus>,
        engine: &EngineConfig,
    ) -> Self {
        Self {
            store,
            pipelines,
            dispatcher,
            event_bus,
            lanes: JobLanes::new(),
            retry_attempts: engine.retry_find_attempts.max(1),
            retry_delay: engine.retry_find_delay(),
        }
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    /// Create a job for the pipeline at `path` and request its session.
    ///
    /// The session request goes out first, while the new job's lane is held,
    /// so its callback cannot observe the job before it is stored. If the
    /// request fails nothing is persisted.
    pub async fn create_job(&self, path: &str) -> Result<Job> {
        let root = root_path(path);
        if root.is_empty() {
            return Err(FlowError::IllegalParameter("Path is required".into()));
        }

        let spec = self
            .pipelines
            .find(root)
            .await?
            .ok_or_else(|| FlowError::NotFound(format!("Path does not exist: {}", root)))?;

        let definition = self
            .pipelines
            .definition(root)
            .await?
            .filter(|content| !content.trim().is_empty())
            .ok_or_else(|| {
                FlowError::NotFound(format!("Pipeline definition not found for: {}", root))
            })?;

        let tree = NodeTree::build(spec.clone())?;
        let root_node = tree.node(tree.root());
        let mut job = Job::new(&root_node.path, &root_node.name);
        let results: Vec<NodeResult> = tree
            .iter()
            .map(|(_, node)| NodeResult::pending(&job.id, &node.path, &node.name))
            .collect();

        let _lane = self.lanes.acquire(&job.id).await;
        self.dispatcher.create_session(&mut job).await?;

        let snapshot = JobSnapshot {
            definition,
            root: spec,
        };
        let job = self
            .store
            .create_job(&job, &snapshot, &results)
            .await
            .map_err(|e| {
                error!(
                    job_id = %job.id,
                    session_cmd_id = ?job.cmd_id,
                    error = %e,
                    "Failed to store job, its session will be released on callback"
                );
                e
            })?;

        info!(
            job_id = %job.id,
            flow = %job.node_name,
            number = job.number,
            nodes = results.len(),
            "Job created"
        );
        self.event_bus.publish(JobEvent::JobCreated {
            job_id: job.id.clone(),
            node_name: job.node_name.clone(),
            number: job.number,
        });
        Ok(job)
    }

    pub async fn find(&self, id: &JobId) -> Result<Job> {
        self.store
            .find_job(id)
            .await?
            .ok_or_else(|| FlowError::NotFound(format!("Job not found: {}", id)))
    }

    pub async fn find_by_number(&self, flow_name: &str, number: i64) -> Result<Job> {
        self.store
            .find_job_by_number(flow_name, number)
            .await?
            .ok_or_else(|| {
                FlowError::NotFound(format!("Job not found: {} #{}", flow_name, number))
            })
    }

    /// `flow_names` selects the latest job of each flow; `flow_name` all jobs
    /// of one flow; neither selects everything.
    pub async fn list_jobs(
        &self,
        flow_name: Option<String>,
        flow_names: Option<Vec<String>>,
    ) -> Result<Vec<Job>> {
        self.store
            .list_jobs(JobFilter::from_params(flow_name, flow_names))
            .await
    }

    pub async fn update(&self, job: &Job) -> Result<()> {
        let _lane = self.lanes.acquire(&job.id).await;
        self.store.update_job(job).await
    }

    /// Node results of a job, in tree order.
    pub async fn node_results(&self, id: &JobId) -> Result<Vec<NodeResult>> {
        self.find(id).await?;
        self.store.load_results(id).await
    }

    /// Look a job up, retrying while it may not be visible yet.
    ///
    /// Only the RUN_SHELL callback path uses this; everything else fails fast.
    pub async fn retry_find_job(&self, id: &JobId) -> Result<Option<Job>> {
        for attempt in 1..=self.retry_attempts {
            if let Some(job) = self.store.find_job(id).await? {
                return Ok(Some(job));
            }
            if attempt < self.retry_attempts {
                debug!(job_id = %id, attempt, "Job not visible yet, retrying");
                tokio::time::sleep(self.retry_delay).await;
            }
        }
        Ok(None)
    }
}
