use std::collections::{BTreeSet, HashMap};

use flowci_core::error::{FlowError, Result};
use flowci_core::event::EventBus;
use flowci_core::node::{NodeIdx, NodeTree};
use flowci_core::traits::JobStore;
use flowci_core::types::{Job, JobEvent, JobId, NodeResult};

/// Working copy of one job for the duration of a job-mutating sequence.
///
/// Loaded once under the job's lane; every read during propagation sees the
/// writes made earlier in the same sequence. Nothing reaches the store until
/// [`JobTx::commit`], which writes the job and every touched result together
/// and then publishes the events gathered along the way.
pub struct JobTx {
    pub job: Job,
    pub tree: NodeTree,
    results: HashMap<String, NodeResult>,
    touched: BTreeSet<String>,
    events: Vec<JobEvent>,
}

impl JobTx {
    pub async fn load(store: &dyn JobStore, job: Job) -> Result<Self> {
        let snapshot = store
            .load_snapshot(&job.id)
            .await?
            .ok_or_else(|| FlowError::NotFound(format!("No node tree stored for job {}", job.id)))?;
        let tree = NodeTree::build(snapshot.root)?;

        let results = store
            .load_results(&job.id)
            .await?
            .into_iter()
            .map(|r| (r.path.clone(), r))
            .collect();

        Ok(Self {
            job,
            tree,
            results,
            touched: BTreeSet::new(),
            events: Vec::new(),
        })
    }

    /// Load by id, failing with `NotFound` when the job does not exist.
    pub async fn load_by_id(store: &dyn JobStore, job_id: &JobId) -> Result<Self> {
        let job = store
            .find_job(job_id)
            .await?
            .ok_or_else(|| FlowError::NotFound(format!("Job not found: {}", job_id)))?;
        Self::load(store, job).await
    }

    pub fn result(&self, idx: NodeIdx) -> Result<&NodeResult> {
        let path = &self.tree.node(idx).path;
        self.results
            .get(path)
            .ok_or_else(|| missing_result(&self.job.id, path))
    }

    /// Mutable access; the result is written back on commit.
    pub fn result_mut(&mut self, idx: NodeIdx) -> Result<&mut NodeResult> {
        let path = self.tree.node(idx).path.clone();
        match self.results.get_mut(&path) {
            Some(result) => {
                self.touched.insert(path);
                Ok(result)
            }
            None => Err(missing_result(&self.job.id, &path)),
        }
    }

    pub fn touched(&self) -> usize {
        self.touched.len()
    }

    /// Queue an event for publication once the commit succeeds.
    pub fn emit(&mut self, event: JobEvent) {
        self.events.push(event);
    }

    /// Persist the job and all touched results in one store transaction.
    pub async fn commit(self, store: &dyn JobStore, event_bus: &EventBus) -> Result<Job> {
        let mut touched: Vec<NodeResult> = Vec::with_capacity(self.touched.len());
        let mut results = self.results;
        for path in &self.touched {
            if let Some(result) = results.remove(path) {
                touched.push(result);
            }
        }
        store.save_state(&self.job, &touched).await?;
        for event in self.events {
            event_bus.publish(event);
        }
        Ok(self.job)
    }
}

fn missing_result(job_id: &JobId, path: &str) -> FlowError {
    FlowError::NotFound(format!("No result for node {} of job {}", path, job_id))
}
