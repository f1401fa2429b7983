use std::sync::Arc;

use chrono::Utc;
use tracing::{error, info, warn};

use flowci_core::cmd::{Cmd, CmdStatus, CmdType};
use flowci_core::error::{FlowError, Result};
use flowci_core::types::{JobEvent, JobId, NodeStatus};
use flowci_dispatch::webhook::{parse_job_identifier, NodeHookIdentifier};

use crate::orchestrator::JobOrchestrator;
use crate::status::node_status_for;
use crate::tx::JobTx;

/// What a callback did to the job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackOutcome {
    Applied,
    /// Accepted but changed nothing: stale, duplicate, or a failed session.
    Ignored,
}

/// Entry point for agent callbacks posted to the webhook.
#[derive(Clone)]
pub struct CallbackRouter {
    orchestrator: Arc<JobOrchestrator>,
}

impl CallbackRouter {
    pub fn new(orchestrator: Arc<JobOrchestrator>) -> Self {
        Self { orchestrator }
    }

    pub fn orchestrator(&self) -> &Arc<JobOrchestrator> {
        &self.orchestrator
    }

    /// Route a callback by command type.
    ///
    /// CREATE_SESSION carries the raw job id as identifier; RUN_SHELL carries
    /// the JSON node identifier.
    pub async fn callback(&self, identifier: &str, cmd: Cmd) -> Result<CallbackOutcome> {
        match cmd.cmd_type {
            CmdType::CreateSession => {
                let job_id = parse_job_identifier(identifier)?;
                self.orchestrator.session_callback(&job_id, &cmd).await
            }
            CmdType::RunShell => {
                let target = NodeHookIdentifier::parse(identifier)?;
                self.orchestrator
                    .node_callback(&target.job_id(), &target.path, &cmd)
                    .await
            }
            other => {
                warn!(cmd_type = %other, identifier = %identifier, "Unrecognized callback");
                Err(FlowError::UnknownCommandType(other.to_string()))
            }
        }
    }
}

impl JobOrchestrator {
    /// Session ready: record it and start the first runnable node.
    pub async fn session_callback(&self, job_id: &JobId, cmd: &Cmd) -> Result<CallbackOutcome> {
        let _lane = self.lanes.acquire(job_id).await;

        let Some(job) = self.store.find_job(job_id).await? else {
            error!(job_id = %job_id, "Session callback for unknown job");
            // The job failed to store after its session was requested.
            if let (CmdStatus::Sent, Some(session_id)) = (cmd.status, cmd.session_id.as_deref()) {
                self.dispatcher
                    .delete_orphan_session(job_id, session_id)
                    .await;
            }
            return Err(FlowError::NotFound(format!("Job not found: {}", job_id)));
        };

        if cmd.status != CmdStatus::Sent {
            warn!(job_id = %job_id, cmd_status = %cmd.status, "Session was not created");
            self.event_bus.publish(JobEvent::SessionFailed {
                job_id: job_id.clone(),
                cmd_status: cmd.status.to_string(),
            });
            return Ok(CallbackOutcome::Ignored);
        }

        if job.session_id.is_some() || job.status != NodeStatus::Enqueue {
            warn!(job_id = %job_id, status = %job.status, "Duplicate session callback ignored");
            return Ok(CallbackOutcome::Ignored);
        }

        let session_id = cmd.session_id.clone().ok_or_else(|| {
            FlowError::IllegalParameter(format!("Session callback for job {} has no session id", job_id))
        })?;

        let mut tx = JobTx::load(self.store.as_ref(), job).await?;
        tx.job.session_id = Some(session_id.clone());
        tx.job.updated_at = Utc::now();
        info!(job_id = %job_id, session_id = %session_id, "Session ready");
        tx.emit(JobEvent::SessionReady {
            job_id: job_id.clone(),
            session_id,
        });

        let root = tx.tree.root();
        if let Some(first) = tx.tree.first_child(root) {
            self.run_node(&mut tx, first).await?;
        }

        tx.commit(self.store.as_ref(), &self.event_bus).await?;
        Ok(CallbackOutcome::Applied)
    }

    /// Progress report for one step.
    ///
    /// Callbacks that would move the node backwards, or past a status it has
    /// already settled on, are ignored.
    pub async fn node_callback(
        &self,
        job_id: &JobId,
        path: &str,
        cmd: &Cmd,
    ) -> Result<CallbackOutcome> {
        if self.retry_find_job(job_id).await?.is_none() {
            error!(job_id = %job_id, path = %path, "Node callback for unknown job");
            return Err(FlowError::NotFound(format!("Job not found: {}", job_id)));
        }

        let _lane = self.lanes.acquire(job_id).await;
        let mut tx = JobTx::load_by_id(self.store.as_ref(), job_id).await?;

        let idx = tx.tree.find(path).ok_or_else(|| {
            FlowError::NotFound(format!("Node {} not found in job {}", path, job_id))
        })?;
        if !tx.tree.node(idx).is_runnable() {
            return Err(FlowError::IllegalParameter(format!(
                "Node {} is a flow and cannot run commands",
                path
            )));
        }

        let status = node_status_for(cmd);
        let current = tx.result(idx)?.status;
        if !status.advances_from(current) {
            info!(
                job_id = %job_id,
                path = %path,
                current = %current,
                incoming = %status,
                "Stale callback ignored"
            );
            return Ok(CallbackOutcome::Ignored);
        }

        let finished = self.update_node_status(&mut tx, idx, cmd).await?;
        let job = tx.commit(self.store.as_ref(), &self.event_bus).await?;
        if finished {
            self.release_session(&job).await;
        }
        Ok(CallbackOutcome::Applied)
    }
}
