use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use flowci_core::types::JobId;

/// Per-job lanes ensuring serial execution of job-mutating sequences.
///
/// Work on different jobs proceeds concurrently; two sequences touching the
/// same job queue up behind one another. Idle lanes are dropped from the map.
#[derive(Default)]
pub struct JobLanes {
    lanes: Mutex<HashMap<JobId, Arc<AsyncMutex<()>>>>,
}

/// Exclusive hold on one job's lane. Released on drop.
pub struct LaneGuard<'a> {
    held: Option<OwnedMutexGuard<()>>,
    lane: Arc<AsyncMutex<()>>,
    job_id: JobId,
    owner: &'a JobLanes,
}

impl JobLanes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `job_id`'s lane.
    pub async fn acquire(&self, job_id: &JobId) -> LaneGuard<'_> {
        let lane = {
            let mut lanes = self.lanes.lock().unwrap_or_else(|e| e.into_inner());
            lanes
                .entry(job_id.clone())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        let held = lane.clone().lock_owned().await;
        LaneGuard {
            held: Some(held),
            lane,
            job_id: job_id.clone(),
            owner: self,
        }
    }

    /// Number of lanes currently held or waited on.
    pub fn active(&self) -> usize {
        self.lanes.lock().map(|l| l.len()).unwrap_or(0)
    }
}

impl Drop for LaneGuard<'_> {
    fn drop(&mut self) {
        drop(self.held.take());
        let mut lanes = self.owner.lanes.lock().unwrap_or_else(|e| e.into_inner());
        // One reference in the map, one here. Anyone else cloned it under the
        // map lock and is still waiting.
        if Arc::strong_count(&self.lane) <= 2 {
            lanes.remove(&self.job_id);
        }
    }
}
