//! Shared test utilities, mocks, and fixtures for flowci crates.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use chrono::{TimeZone, Utc};
use futures::future::BoxFuture;
use serde::Deserialize;

use flowci_core::cmd::{Cmd, CmdInfo, CmdResult, CmdStatus, CmdType};
use flowci_core::error::{FlowError, Result};
use flowci_core::node::{root_path, NodeSpec};
use flowci_core::traits::{CommandTransport, PipelineService};
use flowci_core::types::EnvMap;

/// A command captured by [`MockTransport`].
#[derive(Debug, Clone)]
pub struct SentCommand {
    pub url: String,
    pub info: CmdInfo,
    /// Id handed back to the caller, `None` if the post was failed.
    pub cmd_id: Option<String>,
}

/// Decoded identifier of a node-level webhook.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HookTarget {
    pub path: String,
    pub job_id: String,
}

/// Command transport that records every post and answers with a PENDING
/// command carrying a sequential id (`cmd-1`, `cmd-2`, ...).
#[derive(Default)]
pub struct MockTransport {
    sent: Mutex<Vec<SentCommand>>,
    counter: AtomicUsize,
    failures: AtomicUsize,
    empty: AtomicUsize,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` posts with a dispatch error.
    pub fn fail_next(&self, n: usize) {
        self.failures.store(n, Ordering::SeqCst);
    }

    /// Answer the next `n` posts with an empty body.
    pub fn empty_next(&self, n: usize) {
        self.empty.store(n, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<SentCommand> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn sent_of_type(&self, cmd_type: CmdType) -> Vec<SentCommand> {
        self.sent()
            .into_iter()
            .filter(|c| c.info.cmd_type == cmd_type)
            .collect()
    }

    /// Node paths of every RUN_SHELL command, in dispatch order.
    pub fn run_paths(&self) -> Vec<String> {
        self.sent_of_type(CmdType::RunShell)
            .iter()
            .filter_map(|c| c.info.webhook.as_deref().and_then(decode_hook))
            .map(|t| t.path)
            .collect()
    }

    /// Decoded webhook identifier of the `index`-th posted command.
    pub fn node_identifier(&self, index: usize) -> Option<HookTarget> {
        self.sent()
            .get(index)
            .and_then(|c| c.info.webhook.as_deref().and_then(decode_hook))
    }

    /// Command id assigned to the last RUN_SHELL for `path`.
    pub fn cmd_id_for(&self, path: &str) -> Option<String> {
        self.sent_of_type(CmdType::RunShell)
            .into_iter()
            .rev()
            .find(|c| {
                c.info
                    .webhook
                    .as_deref()
                    .and_then(decode_hook)
                    .is_some_and(|t| t.path == path)
            })
            .and_then(|c| c.cmd_id)
    }

    fn take(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl CommandTransport for MockTransport {
    fn post(&self, url: &str, info: &CmdInfo) -> BoxFuture<'_, Result<Option<Cmd>>> {
        let url = url.to_string();
        let info = info.clone();

        Box::pin(async move {
            let (result, cmd_id) = if Self::take(&self.failures) {
                (Err(FlowError::Dispatch("connection refused".into())), None)
            } else if Self::take(&self.empty) {
                (Ok(None), None)
            } else {
                let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
                let id = format!("cmd-{}", n);
                let cmd = Cmd::new(info.cmd_type, CmdStatus::Pending).with_id(&id);
                (Ok(Some(cmd)), Some(id))
            };

            if let Ok(mut sent) = self.sent.lock() {
                sent.push(SentCommand { url, info, cmd_id });
            }
            result
        })
    }
}

/// Extract and decode the JSON identifier from a node webhook URL.
pub fn decode_hook(url: &str) -> Option<HookTarget> {
    let encoded = url.split("identifier=").nth(1)?;
    let decoded = urlencoding::decode(encoded).ok()?;
    serde_json::from_str(&decoded).ok()
}

/// Raw identifier carried by a webhook URL.
pub fn hook_identifier(url: &str) -> Option<String> {
    let encoded = url.split("identifier=").nth(1)?;
    urlencoding::decode(encoded).ok().map(|s| s.into_owned())
}

/// In-memory pipeline service.
#[derive(Default)]
pub struct StaticPipelines {
    pipelines: Mutex<HashMap<String, (NodeSpec, String)>>,
}

impl StaticPipelines {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a root node with a generated definition text.
    pub fn with(self, spec: NodeSpec) -> Self {
        let definition = format!("# pipeline {}\n", spec.name);
        self.insert(spec, definition);
        self
    }

    pub fn insert(&self, spec: NodeSpec, definition: impl Into<String>) {
        if let Ok(mut map) = self.pipelines.lock() {
            map.insert(spec.name.clone(), (spec, definition.into()));
        }
    }
}

impl PipelineService for StaticPipelines {
    fn find(&self, path: &str) -> BoxFuture<'_, Result<Option<NodeSpec>>> {
        let root = root_path(path).to_string();
        Box::pin(async move {
            Ok(self
                .pipelines
                .lock()
                .ok()
                .and_then(|m| m.get(&root).map(|(spec, _)| spec.clone())))
        })
    }

    fn definition(&self, path: &str) -> BoxFuture<'_, Result<Option<String>>> {
        let root = root_path(path).to_string();
        Box::pin(async move {
            Ok(self
                .pipelines
                .lock()
                .ok()
                .and_then(|m| m.get(&root).map(|(_, def)| def.clone())))
        })
    }
}

// ── Fixtures ────────────────────────────────────────────────────

/// `flow1` with `step1` and `step2`; `step1` optionally allows failure.
pub fn two_step_flow(step1_allows_failure: bool) -> NodeSpec {
    let mut step1 = NodeSpec::step("step1", "echo step1");
    step1.allow_failure = step1_allows_failure;
    NodeSpec::flow("flow1")
        .with_env("FLOW_WORKSPACE", "/tmp/flow1")
        .with_child(step1)
        .with_child(NodeSpec::step("step2", "echo step2"))
}

/// Linear flow `abc` with steps A, B, C; B optionally allows failure.
pub fn abc_flow(b_allows_failure: bool) -> NodeSpec {
    let mut b = NodeSpec::step("B", "exit 1");
    b.allow_failure = b_allows_failure;
    NodeSpec::flow("abc")
        .with_child(NodeSpec::step("A", "echo A"))
        .with_child(b)
        .with_child(NodeSpec::step("C", "echo C"))
}

/// Session-ready callback payload.
pub fn session_sent(session_id: &str) -> Cmd {
    Cmd::new(CmdType::CreateSession, CmdStatus::Sent).with_session(session_id)
}

/// RUN_SHELL callback with a given status and no result.
pub fn run_status(status: CmdStatus) -> Cmd {
    Cmd::new(CmdType::RunShell, status)
}

/// Terminal RUN_SHELL callback (`LOGGED`) with exit value and outputs.
pub fn run_logged(exit_value: i32, outputs: &[(&str, &str)]) -> Cmd {
    let output: EnvMap = outputs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    let start = Utc.with_ymd_and_hms(2017, 6, 1, 10, 0, 0).single();
    let finish = Utc.with_ymd_and_hms(2017, 6, 1, 10, 0, 3).single();
    Cmd::new(CmdType::RunShell, CmdStatus::Logged)
        .with_result(CmdResult {
            exit_value: Some(exit_value),
            duration: Some(3),
            output,
            start_time: start,
            finish_time: finish,
        })
        .with_log_paths(vec!["/logs/step.log".to_string()])
}
