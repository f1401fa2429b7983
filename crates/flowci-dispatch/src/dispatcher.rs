use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};

use flowci_core::cmd::{Cmd, CmdInfo, CmdType};
use flowci_core::config::AppConfig;
use flowci_core::error::{FlowError, Result};
use flowci_core::node::{NodeIdx, NodeTree};
use flowci_core::traits::CommandTransport;
use flowci_core::types::{Job, JobId, NodeStatus};

use crate::webhook;

/// Only env vars with this prefix come back as step outputs.
pub const OUTPUT_ENV_FILTER: &str = "FLOW_";

/// Query appended to the queue endpoint for session commands.
const QUEUE_PARAMS: &str = "priority=1&retry=5";

/// Result of handing a command to the agent side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Accepted; carries the agent's command id when it returned one.
    Sent { cmd_id: Option<String> },
    /// Not delivered. The node stays where it was until someone acts on it.
    Failed { reason: String },
}

impl DispatchOutcome {
    fn from_post(result: Result<Option<Cmd>>) -> Self {
        match result {
            Ok(Some(cmd)) => DispatchOutcome::Sent { cmd_id: cmd.id },
            Ok(None) => DispatchOutcome::Failed {
                reason: "endpoint returned no command".to_string(),
            },
            Err(e) => DispatchOutcome::Failed {
                reason: e.to_string(),
            },
        }
    }

    pub fn is_sent(&self) -> bool {
        matches!(self, DispatchOutcome::Sent { .. })
    }
}

/// Builds agent commands and submits them, directly or through the queue.
pub struct CommandDispatcher {
    domain: String,
    zone: String,
    cmd_url: String,
    queue_url: String,
    transport: Arc<dyn CommandTransport>,
}

impl CommandDispatcher {
    pub fn new(
        domain: impl Into<String>,
        zone: impl Into<String>,
        cmd_url: impl Into<String>,
        queue_url: impl Into<String>,
        transport: Arc<dyn CommandTransport>,
    ) -> Self {
        Self {
            domain: domain.into(),
            zone: zone.into(),
            cmd_url: cmd_url.into(),
            queue_url: queue_url.into(),
            transport,
        }
    }

    pub fn from_config(config: &AppConfig, transport: Arc<dyn CommandTransport>) -> Self {
        Self::new(
            config.domain.clone(),
            config.platform.zone.clone(),
            config.platform.cmd.url.clone(),
            config.platform.queue.url.clone(),
            transport,
        )
    }

    fn queue_endpoint(&self) -> String {
        let sep = if self.queue_url.contains('?') { '&' } else { '?' };
        format!("{}{}{}", self.queue_url, sep, QUEUE_PARAMS)
    }

    async fn send_to_queue(&self, info: &CmdInfo) -> Result<Option<Cmd>> {
        let url = self.queue_endpoint();
        self.transport.post(&url, info).await
    }

    /// Ask the agent side for a new session for `job`. On success the job is
    /// marked ENQUEUE and carries the session command id.
    pub async fn create_session(&self, job: &mut Job) -> Result<()> {
        let mut info = CmdInfo::new(&self.zone, CmdType::CreateSession, None);
        info.webhook = Some(webhook::job_hook(&self.domain, &job.id));
        info!(job_id = %job.id, "Requesting session");

        let cmd = self.send_to_queue(&info).await?.ok_or_else(|| {
            FlowError::Dispatch(format!(
                "Queue returned no command for session of job {}",
                job.id
            ))
        })?;

        job.status = NodeStatus::Enqueue;
        job.cmd_id = cmd.id;
        job.updated_at = Utc::now();
        Ok(())
    }

    /// Release the job's session. Failures are logged, never raised.
    pub async fn delete_session(&self, job: &Job) -> DispatchOutcome {
        self.send_delete(&job.id, job.session_id.clone()).await
    }

    /// Release a session the agent opened for a job that was never stored.
    pub async fn delete_orphan_session(&self, job_id: &JobId, session_id: &str) -> DispatchOutcome {
        warn!(job_id = %job_id, session_id = %session_id, "Releasing orphaned session");
        self.send_delete(job_id, Some(session_id.to_string())).await
    }

    async fn send_delete(&self, job_id: &JobId, session_id: Option<String>) -> DispatchOutcome {
        let mut info = CmdInfo::new(&self.zone, CmdType::DeleteSession, None);
        info!(job_id = %job_id, session_id = ?session_id, "Deleting session");
        info.session_id = session_id;

        let outcome = DispatchOutcome::from_post(self.send_to_queue(&info).await);
        if let DispatchOutcome::Failed { reason } = &outcome {
            warn!(job_id = %job_id, reason = %reason, "Session delete failed");
        }
        outcome
    }

    /// Dispatch the first runnable node at or after `start`.
    ///
    /// Flows are walked through in order until a step is found. Returns the
    /// step that was targeted with its outcome, or `None` when the walk runs
    /// off the end of the tree.
    pub async fn run(
        &self,
        tree: &NodeTree,
        start: NodeIdx,
        job: &Job,
    ) -> Option<(NodeIdx, DispatchOutcome)> {
        let idx = tree.first_runnable(Some(start))?;
        let node = tree.node(idx);

        let hook = match webhook::node_hook(&self.domain, &node.path, &job.id) {
            Ok(hook) => hook,
            Err(e) => {
                return Some((
                    idx,
                    DispatchOutcome::Failed {
                        reason: e.to_string(),
                    },
                ))
            }
        };

        let mut info = CmdInfo::new(&self.zone, CmdType::RunShell, node.script.clone());
        info.inputs = tree.merged_envs(idx);
        info.webhook = Some(hook);
        info.output_env_filter = Some(OUTPUT_ENV_FILTER.to_string());
        info.session_id = job.session_id.clone();

        info!(job_id = %job.id, path = %node.path, step = %node.name, "Running step");

        let outcome = DispatchOutcome::from_post(self.transport.post(&self.cmd_url, &info).await);
        if let DispatchOutcome::Failed { reason } = &outcome {
            warn!(job_id = %job.id, path = %node.path, reason = %reason, "Step dispatch failed");
        }
        Some((idx, outcome))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowci_core::node::NodeSpec;
    use flowci_test_utils::MockTransport;

    fn dispatcher(transport: Arc<MockTransport>) -> CommandDispatcher {
        CommandDispatcher::new(
            "http://ci.local",
            "zone-a",
            "http://cc.local/cmd/send",
            "http://cc.local/cmd/queue/send",
            transport,
        )
    }

    fn tree() -> NodeTree {
        NodeTree::build(
            NodeSpec::flow("flow1")
                .with_env("FLOW_BRANCH", "main")
                .with_env("SHARED", "flow")
                .with_child(NodeSpec::flow("prepare").with_child(
                    NodeSpec::step("checkout", "git clone").with_env("SHARED", "step"),
                ))
                .with_child(NodeSpec::step("build", "make")),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn create_session_goes_through_queue() {
        let transport = Arc::new(MockTransport::new());
        let d = dispatcher(transport.clone());
        let mut job = Job::new("flow1", "flow1");

        d.create_session(&mut job).await.unwrap();

        assert_eq!(job.status, NodeStatus::Enqueue);
        assert!(job.cmd_id.is_some());
        let sent = transport.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(
            sent[0].url,
            "http://cc.local/cmd/queue/send?priority=1&retry=5"
        );
        assert_eq!(sent[0].info.cmd_type, CmdType::CreateSession);
        assert_eq!(
            sent[0].info.webhook.as_deref(),
            Some(format!("http://ci.local/hooks/cmd?identifier={}", job.id).as_str())
        );
        assert_eq!(sent[0].info.zone, "zone-a");
    }

    #[tokio::test]
    async fn create_session_failure_is_an_error() {
        let transport = Arc::new(MockTransport::new());
        transport.fail_next(1);
        let d = dispatcher(transport);
        let mut job = Job::new("flow1", "flow1");

        let err = d.create_session(&mut job).await.unwrap_err();
        assert!(matches!(err, FlowError::Dispatch(_)));
        assert_eq!(job.status, NodeStatus::Pending);
    }

    #[tokio::test]
    async fn delete_session_swallows_failure() {
        let transport = Arc::new(MockTransport::new());
        transport.fail_next(1);
        let d = dispatcher(transport.clone());
        let mut job = Job::new("flow1", "flow1");
        job.session_id = Some("s-1".into());

        let outcome = d.delete_session(&job).await;
        assert!(!outcome.is_sent());
        assert_eq!(transport.sent()[0].info.session_id.as_deref(), Some("s-1"));
        assert_eq!(transport.sent()[0].info.cmd_type, CmdType::DeleteSession);
    }

    #[tokio::test]
    async fn orphan_session_delete_goes_through_queue() {
        let transport = Arc::new(MockTransport::new());
        let d = dispatcher(transport.clone());

        let outcome = d
            .delete_orphan_session(&JobId::from_string("gone"), "s-9")
            .await;
        assert!(outcome.is_sent());

        let sent = transport.sent_of_type(CmdType::DeleteSession);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].info.session_id.as_deref(), Some("s-9"));
        assert!(sent[0].url.ends_with("?priority=1&retry=5"));
    }

    #[tokio::test]
    async fn run_walks_into_flows_and_merges_envs() {
        let transport = Arc::new(MockTransport::new());
        let d = dispatcher(transport.clone());
        let tree = tree();
        let mut job = Job::new("flow1", "flow1");
        job.session_id = Some("s-1".into());

        let prepare = tree.find("flow1/prepare").unwrap();
        let (idx, outcome) = d.run(&tree, prepare, &job).await.unwrap();

        assert_eq!(tree.node(idx).path, "flow1/prepare/checkout");
        assert!(outcome.is_sent());

        let sent = transport.sent();
        let info = &sent[0].info;
        assert_eq!(sent[0].url, "http://cc.local/cmd/send");
        assert_eq!(info.cmd_type, CmdType::RunShell);
        assert_eq!(info.cmd.as_deref(), Some("git clone"));
        assert_eq!(info.inputs["SHARED"], "step");
        assert_eq!(info.inputs["FLOW_BRANCH"], "main");
        assert_eq!(info.output_env_filter.as_deref(), Some("FLOW_"));
        assert_eq!(info.session_id.as_deref(), Some("s-1"));

        let identifier = transport.node_identifier(0).unwrap();
        assert_eq!(identifier.path, "flow1/prepare/checkout");
        assert_eq!(identifier.job_id, job.id.0);
    }

    #[tokio::test]
    async fn run_reports_failure_outcome() {
        let transport = Arc::new(MockTransport::new());
        transport.fail_next(1);
        let d = dispatcher(transport);
        let tree = tree();
        let job = Job::new("flow1", "flow1");

        let build = tree.find("flow1/build").unwrap();
        let (idx, outcome) = d.run(&tree, build, &job).await.unwrap();
        assert_eq!(idx, build);
        assert!(matches!(outcome, DispatchOutcome::Failed { .. }));
    }

    #[tokio::test]
    async fn run_from_a_step_targets_that_step() {
        let transport = Arc::new(MockTransport::new());
        let d = dispatcher(transport.clone());
        let tree = tree();
        let job = Job::new("flow1", "flow1");

        let build = tree.find("flow1/build").unwrap();
        let (idx, _) = d.run(&tree, build, &job).await.unwrap();
        assert_eq!(idx, build);
        assert_eq!(transport.run_paths(), vec!["flow1/build".to_string()]);
    }
}
