use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::FlowError;

/// Environment-variable style key/value map (step outputs, envs).
pub type EnvMap = BTreeMap<String, String>;

/// Unique job identifier.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct JobId(pub String);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn from_string(s: &str) -> Self {
        Self(s.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Status shared by node results and jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeStatus {
    Pending,
    Enqueue,
    Running,
    Success,
    Failure,
    Timeout,
    /// The run command for this node could not be delivered to the agent.
    DispatchFailed,
}

/// Progress level of each status. Callbacks may only move a node to an equal
/// or higher level; the three terminal outcomes share the top level.
const STATUS_LEVELS: [(NodeStatus, u8); 7] = [
    (NodeStatus::Pending, 0),
    (NodeStatus::Enqueue, 1),
    (NodeStatus::DispatchFailed, 1),
    (NodeStatus::Running, 2),
    (NodeStatus::Success, 3),
    (NodeStatus::Failure, 3),
    (NodeStatus::Timeout, 3),
];

impl NodeStatus {
    pub fn level(self) -> u8 {
        STATUS_LEVELS
            .iter()
            .find(|(status, _)| *status == self)
            .map(|(_, level)| *level)
            .unwrap_or(0)
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            NodeStatus::Success | NodeStatus::Failure | NodeStatus::Timeout
        )
    }

    pub fn is_failure(self) -> bool {
        matches!(self, NodeStatus::Failure | NodeStatus::Timeout)
    }

    /// Whether moving from `current` to `self` is a forward step.
    ///
    /// Lower levels never apply. A terminal status is final, so a second
    /// terminal status at the same level (a duplicate or contradicting
    /// callback) is rejected as well.
    pub fn advances_from(self, current: NodeStatus) -> bool {
        let (from, to) = (current.level(), self.level());
        to > from || (to == from && !current.is_terminal())
    }

    pub fn as_str(self) -> &'static str {
        match self {
            NodeStatus::Pending => "PENDING",
            NodeStatus::Enqueue => "ENQUEUE",
            NodeStatus::Running => "RUNNING",
            NodeStatus::Success => "SUCCESS",
            NodeStatus::Failure => "FAILURE",
            NodeStatus::Timeout => "TIMEOUT",
            NodeStatus::DispatchFailed => "DISPATCH_FAILED",
        }
    }
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeStatus {
    type Err = FlowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(NodeStatus::Pending),
            "ENQUEUE" => Ok(NodeStatus::Enqueue),
            "RUNNING" => Ok(NodeStatus::Running),
            "SUCCESS" => Ok(NodeStatus::Success),
            "FAILURE" => Ok(NodeStatus::Failure),
            "TIMEOUT" => Ok(NodeStatus::Timeout),
            "DISPATCH_FAILED" => Ok(NodeStatus::DispatchFailed),
            other => Err(FlowError::Database(format!("Unknown node status: {}", other))),
        }
    }
}

/// One execution of a pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: JobId,
    pub node_path: String,
    pub node_name: String,
    /// Build number, monotonic per `node_name`. Assigned by the store.
    pub number: i64,
    pub status: NodeStatus,
    pub session_id: Option<String>,
    pub cmd_id: Option<String>,
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub outputs: EnvMap,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn new(node_path: impl Into<String>, node_name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            node_path: node_path.into(),
            node_name: node_name.into(),
            number: 0,
            status: NodeStatus::Pending,
            session_id: None,
            cmd_id: None,
            exit_code: None,
            outputs: EnvMap::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Per-(job, node path) execution record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeResult {
    pub job_id: JobId,
    pub path: String,
    pub name: String,
    pub status: NodeStatus,
    pub cmd_id: Option<String>,
    pub exit_code: Option<i32>,
    /// Execution time reported by the agent, in seconds.
    pub duration: Option<i64>,
    #[serde(default)]
    pub outputs: EnvMap,
    #[serde(default)]
    pub log_paths: Vec<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub finish_time: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl NodeResult {
    pub fn pending(job_id: &JobId, path: impl Into<String>, name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            job_id: job_id.clone(),
            path: path.into(),
            name: name.into(),
            status: NodeStatus::Pending,
            cmd_id: None,
            exit_code: None,
            duration: None,
            outputs: EnvMap::new(),
            log_paths: Vec::new(),
            start_time: None,
            finish_time: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Selection for job listings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobFilter {
    /// Every job.
    All,
    /// All jobs of one flow.
    Flow(String),
    /// The most recent job of each named flow.
    Latest(Vec<String>),
}

impl JobFilter {
    /// `flow_names` wins over `flow_name` when both are given.
    pub fn from_params(flow_name: Option<String>, flow_names: Option<Vec<String>>) -> Self {
        match (flow_name, flow_names) {
            (_, Some(names)) => JobFilter::Latest(names),
            (Some(name), None) => JobFilter::Flow(name),
            (None, None) => JobFilter::All,
        }
    }
}

/// Events emitted while jobs progress.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobEvent {
    JobCreated {
        job_id: JobId,
        node_name: String,
        number: i64,
    },
    SessionReady {
        job_id: JobId,
        session_id: String,
    },
    SessionFailed {
        job_id: JobId,
        cmd_status: String,
    },
    NodeDispatched {
        job_id: JobId,
        path: String,
        cmd_id: String,
    },
    DispatchFailed {
        job_id: JobId,
        path: String,
        reason: String,
    },
    NodeStatusChanged {
        job_id: JobId,
        path: String,
        status: NodeStatus,
    },
    JobStatusChanged {
        job_id: JobId,
        status: NodeStatus,
    },
    SessionDeleted {
        job_id: JobId,
        session_id: Option<String>,
    },
}

impl JobEvent {
    pub fn job_id(&self) -> &JobId {
        match self {
            JobEvent::JobCreated { job_id, .. }
            | JobEvent::SessionReady { job_id, .. }
            | JobEvent::SessionFailed { job_id, .. }
            | JobEvent::NodeDispatched { job_id, .. }
            | JobEvent::DispatchFailed { job_id, .. }
            | JobEvent::NodeStatusChanged { job_id, .. }
            | JobEvent::JobStatusChanged { job_id, .. }
            | JobEvent::SessionDeleted { job_id, .. } => job_id,
        }
    }
}
