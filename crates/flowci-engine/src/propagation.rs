//! Status propagation through a job's node tree.
//!
//! A callback updates one step; from there the new status climbs towards the
//! root as long as the position of each node says the parent is affected.
//! Everything happens on the callback's [`JobTx`], under the job's lane.

use chrono::Utc;
use tracing::{debug, info, warn};

use flowci_core::cmd::Cmd;
use flowci_core::error::Result;
use flowci_core::node::NodeIdx;
use flowci_core::types::{Job, JobEvent, NodeStatus};
use flowci_dispatch::DispatchOutcome;

use crate::orchestrator::JobOrchestrator;
use crate::status::node_status_for;
use crate::tx::JobTx;

/// Where the walk goes after updating a node.
#[derive(Debug, PartialEq, Eq)]
enum Step {
    /// Apply the same status to this ancestor.
    Parent(NodeIdx),
    /// Stop climbing and dispatch this sibling.
    Advance(NodeIdx),
    Stop,
}

impl JobOrchestrator {
    /// Apply `cmd` to the node at `idx` and propagate the mapped status.
    ///
    /// Returns true when the job reached a terminal state. The caller releases
    /// the session once the transaction is committed.
    pub(crate) async fn update_node_status(
        &self,
        tx: &mut JobTx,
        idx: NodeIdx,
        cmd: &Cmd,
    ) -> Result<bool> {
        let status = node_status_for(cmd);
        let mut updated = Vec::new();
        let mut advance = None;
        let mut current = Some(idx);

        while let Some(idx) = current.take() {
            let existing = tx.result(idx)?.status;
            if !status.advances_from(existing) {
                debug!(
                    job_id = %tx.job.id,
                    path = %tx.tree.node(idx).path,
                    from = %existing,
                    to = %status,
                    "Propagation stopped at settled node"
                );
                break;
            }

            apply_cmd(tx, idx, status, cmd)?;
            updated.push(idx);

            match next_step(tx, idx, status) {
                Step::Parent(parent) => current = Some(parent),
                Step::Advance(sibling) => advance = Some(sibling),
                Step::Stop => {}
            }
        }

        if let Some(sibling) = advance {
            self.run_node(tx, sibling).await?;
        }

        let mut finished = false;
        for idx in updated {
            tx.emit(JobEvent::NodeStatusChanged {
                job_id: tx.job.id.clone(),
                path: tx.tree.node(idx).path.clone(),
                status,
            });
            finished |= self.update_job_status(tx, idx)?;
        }
        Ok(finished)
    }

    /// Fold a node's result into the job.
    ///
    /// Steps contribute their outputs. The root flow sets the job's exit code
    /// and status. Returns true when the job has just reached a terminal state.
    fn update_job_status(&self, tx: &mut JobTx, idx: NodeIdx) -> Result<bool> {
        let node = tx.tree.node(idx);
        let now = Utc::now();

        if node.is_runnable() {
            // Keys already on the job keep their value.
            let outputs = tx.result(idx)?.outputs.clone();
            if !outputs.is_empty() {
                for (key, value) in outputs {
                    tx.job.outputs.entry(key).or_insert(value);
                }
                tx.job.updated_at = now;
            }
            return Ok(false);
        }

        // Nested flows only track their own result.
        if node.parent.is_some() {
            return Ok(false);
        }

        let result = tx.result(idx)?;
        let exit_code = result.exit_code;
        let status = match result.status {
            NodeStatus::Timeout => NodeStatus::Failure,
            other => other,
        };

        if !status.advances_from(tx.job.status) {
            return Ok(false);
        }

        if exit_code.is_some() {
            tx.job.exit_code = exit_code;
        }
        tx.job.updated_at = now;
        if tx.job.status != status {
            info!(job_id = %tx.job.id, from = %tx.job.status, to = %status, "Job status changed");
            tx.emit(JobEvent::JobStatusChanged {
                job_id: tx.job.id.clone(),
                status,
            });
        }
        tx.job.status = status;
        Ok(status.is_terminal())
    }

    /// Dispatch the first runnable node at or after `start`, recording the
    /// outcome on its result.
    pub(crate) async fn run_node(&self, tx: &mut JobTx, start: NodeIdx) -> Result<()> {
        let Some((idx, outcome)) = self.dispatcher.run(&tx.tree, start, &tx.job).await else {
            warn!(
                job_id = %tx.job.id,
                path = %tx.tree.node(start).path,
                "No runnable node left to dispatch"
            );
            return Ok(());
        };

        let job_id = tx.job.id.clone();
        let path = tx.tree.node(idx).path.clone();
        let result = tx.result_mut(idx)?;
        result.updated_at = Utc::now();

        let event = match outcome {
            DispatchOutcome::Sent { cmd_id } => {
                result.cmd_id = cmd_id.clone();
                JobEvent::NodeDispatched {
                    job_id,
                    path,
                    cmd_id: cmd_id.unwrap_or_default(),
                }
            }
            DispatchOutcome::Failed { reason } => {
                result.status = NodeStatus::DispatchFailed;
                JobEvent::DispatchFailed {
                    job_id,
                    path,
                    reason,
                }
            }
        };
        tx.emit(event);
        Ok(())
    }

    /// Tear down the session of a job whose terminal state is committed.
    pub(crate) async fn release_session(&self, job: &Job) {
        let outcome = self.dispatcher.delete_session(job).await;
        if outcome.is_sent() {
            self.event_bus.publish(JobEvent::SessionDeleted {
                job_id: job.id.clone(),
                session_id: job.session_id.clone(),
            });
        }
    }
}

/// Copy the command's status and result onto the node.
fn apply_cmd(tx: &mut JobTx, idx: NodeIdx, status: NodeStatus, cmd: &Cmd) -> Result<()> {
    let runnable = tx.tree.node(idx).is_runnable();
    let result = tx.result_mut(idx)?;
    result.status = status;
    result.updated_at = Utc::now();

    let Some(outcome) = &cmd.cmd_result else {
        return Ok(());
    };

    result.exit_code = outcome.exit_value;
    if runnable {
        result.duration = outcome.duration;
        result.outputs = outcome.output.clone();
        result.log_paths = cmd.log_paths.clone();
    }

    if status.is_terminal() {
        result.finish_time = outcome.finish_time.or(cmd.finished_date);
        if runnable && outcome.start_time.is_some() {
            result.start_time = outcome.start_time;
        }
    } else if outcome.start_time.is_some() {
        result.start_time = outcome.start_time;
    }
    Ok(())
}

fn next_step(tx: &JobTx, idx: NodeIdx, status: NodeStatus) -> Step {
    let node = tx.tree.node(idx);
    let Some(parent) = node.parent else {
        return Step::Stop;
    };
    let next = tx.tree.next(idx);

    match status {
        NodeStatus::Success => match next {
            Some(sibling) => Step::Advance(sibling),
            None => Step::Parent(parent),
        },
        NodeStatus::Failure | NodeStatus::Timeout => match next {
            Some(sibling) if node.allows_failure() => Step::Advance(sibling),
            _ => Step::Parent(parent),
        },
        // A first child starting up marks its flow as started.
        _ => match tx.tree.prev(idx) {
            None => Step::Parent(parent),
            Some(_) => Step::Stop,
        },
    }
}
