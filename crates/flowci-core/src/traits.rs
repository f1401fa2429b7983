use futures::future::BoxFuture;

use crate::cmd::{Cmd, CmdInfo};
use crate::error::Result;
use crate::node::NodeSpec;
use crate::types::{Job, JobFilter, JobId, NodeResult};

/// Pipeline definition snapshot taken when a job is created.
#[derive(Debug, Clone, PartialEq)]
pub struct JobSnapshot {
    /// Raw definition content as provided by the pipeline service.
    pub definition: String,
    /// The node tree the job executes.
    pub root: NodeSpec,
}

/// Persistence for jobs, their node results and pipeline snapshots.
pub trait JobStore: Send + Sync + 'static {
    /// Persist a new job with its snapshot and initial node results in one
    /// transaction. Assigns the build number and returns the stored job.
    fn create_job(
        &self,
        job: &Job,
        snapshot: &JobSnapshot,
        results: &[NodeResult],
    ) -> BoxFuture<'_, Result<Job>>;

    /// Look up a job by id.
    fn find_job(&self, id: &JobId) -> BoxFuture<'_, Result<Option<Job>>>;

    /// Look up a job by flow name and build number.
    fn find_job_by_number(&self, node_name: &str, number: i64)
        -> BoxFuture<'_, Result<Option<Job>>>;

    /// List jobs, newest first.
    fn list_jobs(&self, filter: JobFilter) -> BoxFuture<'_, Result<Vec<Job>>>;

    /// Overwrite a job row.
    fn update_job(&self, job: &Job) -> BoxFuture<'_, Result<()>>;

    /// Load the pipeline snapshot of a job.
    fn load_snapshot(&self, id: &JobId) -> BoxFuture<'_, Result<Option<JobSnapshot>>>;

    /// Load every node result of a job.
    fn load_results(&self, id: &JobId) -> BoxFuture<'_, Result<Vec<NodeResult>>>;

    /// Load one node result.
    fn find_result(&self, id: &JobId, path: &str) -> BoxFuture<'_, Result<Option<NodeResult>>>;

    /// Write a job and a batch of its node results in one transaction.
    fn save_state(&self, job: &Job, results: &[NodeResult]) -> BoxFuture<'_, Result<()>>;
}

/// Resolves pipeline definitions by path.
pub trait PipelineService: Send + Sync + 'static {
    /// The root node stored at `path`, if any.
    fn find(&self, path: &str) -> BoxFuture<'_, Result<Option<NodeSpec>>>;

    /// Raw definition content for the root at `path`.
    fn definition(&self, path: &str) -> BoxFuture<'_, Result<Option<String>>>;
}

/// Submits commands to the agent side.
pub trait CommandTransport: Send + Sync + 'static {
    /// POST a command to `url`. `Ok(None)` means the endpoint accepted the
    /// request but returned no command.
    fn post(&self, url: &str, info: &CmdInfo) -> BoxFuture<'_, Result<Option<Cmd>>>;
}
