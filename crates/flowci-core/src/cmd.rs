//! Wire shapes of the remote command agent protocol.
//!
//! `CmdInfo` is what we submit; `Cmd` is what the agent returns on submit and
//! posts back to the webhook as the command progresses.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::EnvMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CmdType {
    RunShell,
    CreateSession,
    DeleteSession,
    Kill,
    Stop,
    Shutdown,
    SystemInfo,
}

impl std::fmt::Display for CmdType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CmdType::RunShell => "RUN_SHELL",
            CmdType::CreateSession => "CREATE_SESSION",
            CmdType::DeleteSession => "DELETE_SESSION",
            CmdType::Kill => "KILL",
            CmdType::Stop => "STOP",
            CmdType::Shutdown => "SHUTDOWN",
            CmdType::SystemInfo => "SYSTEM_INFO",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CmdStatus {
    Pending,
    Sent,
    Running,
    Executed,
    Logged,
    Killed,
    Exception,
    Rejected,
    Stopped,
    TimeoutKill,
}

impl std::fmt::Display for CmdStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CmdStatus::Pending => "PENDING",
            CmdStatus::Sent => "SENT",
            CmdStatus::Running => "RUNNING",
            CmdStatus::Executed => "EXECUTED",
            CmdStatus::Logged => "LOGGED",
            CmdStatus::Killed => "KILLED",
            CmdStatus::Exception => "EXCEPTION",
            CmdStatus::Rejected => "REJECTED",
            CmdStatus::Stopped => "STOPPED",
            CmdStatus::TimeoutKill => "TIMEOUT_KILL",
        };
        f.write_str(s)
    }
}

/// Outcome of a command, present once the agent has finished it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CmdResult {
    #[serde(default)]
    pub exit_value: Option<i32>,
    /// Seconds.
    #[serde(default)]
    pub duration: Option<i64>,
    #[serde(default)]
    pub output: EnvMap,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finish_time: Option<DateTime<Utc>>,
}

/// Outbound command request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CmdInfo {
    pub zone: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    #[serde(rename = "type")]
    pub cmd_type: CmdType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cmd: Option<String>,
    #[serde(default, skip_serializing_if = "EnvMap::is_empty")]
    pub inputs: EnvMap,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook: Option<String>,
    /// Only env vars with this prefix are reported back as outputs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_env_filter: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl CmdInfo {
    pub fn new(zone: impl Into<String>, cmd_type: CmdType, cmd: Option<String>) -> Self {
        Self {
            zone: zone.into(),
            agent: None,
            cmd_type,
            cmd,
            inputs: EnvMap::new(),
            webhook: None,
            output_env_filter: None,
            session_id: None,
        }
    }
}

/// A command as known to the agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cmd {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub cmd_type: CmdType,
    pub status: CmdStatus,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub cmd_result: Option<CmdResult>,
    #[serde(default)]
    pub log_paths: Vec<String>,
    #[serde(default)]
    pub finished_date: Option<DateTime<Utc>>,
}

impl Cmd {
    pub fn new(cmd_type: CmdType, status: CmdStatus) -> Self {
        Self {
            id: None,
            cmd_type,
            status,
            session_id: None,
            cmd_result: None,
            log_paths: vec![],
            finished_date: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_result(mut self, result: CmdResult) -> Self {
        self.cmd_result = Some(result);
        self
    }

    pub fn with_log_paths(mut self, log_paths: Vec<String>) -> Self {
        self.log_paths = log_paths;
        self
    }
}
