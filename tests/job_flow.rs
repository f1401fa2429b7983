use std::sync::Arc;

use flowci_core::cmd::{Cmd, CmdStatus, CmdType};
use flowci_core::config::EngineConfig;
use flowci_core::event::EventBus;
use flowci_core::traits::JobStore;
use flowci_core::types::{JobEvent, JobId, NodeStatus};
use flowci_dispatch::CommandDispatcher;
use flowci_engine::{CallbackRouter, JobOrchestrator};
use flowci_store::{FilePipelines, SqliteStore};
use flowci_test_utils::{hook_identifier, run_logged, run_status, session_sent, MockTransport};

const FLOW1: &str = r#"
name = "flow1"
kind = "flow"

[envs]
FLOW_WORKSPACE = "/tmp/flow1"

[[children]]
name = "step1"
script = "echo step1"

[[children]]
name = "step2"
script = "echo step2"
"#;

const ABC: &str = r#"
name = "abc"
kind = "flow"

[[children]]
name = "A"
script = "echo A"

[[children]]
name = "B"
script = "exit 1"
allow_failure = ALLOW_B

[[children]]
name = "C"
script = "echo C"
"#;

struct Env {
    _dir: tempfile::TempDir,
    store: Arc<SqliteStore>,
    transport: Arc<MockTransport>,
    orchestrator: Arc<JobOrchestrator>,
    router: CallbackRouter,
}

impl Env {
    fn new(step1_allows_failure: bool, b_allows_failure: bool) -> Self {
        let dir = tempfile::tempdir().expect("temp dir");
        let flow1 = if step1_allows_failure {
            FLOW1.replacen("script = \"echo step1\"", "script = \"echo step1\"\nallow_failure = true", 1)
        } else {
            FLOW1.to_string()
        };
        std::fs::write(dir.path().join("flow1.toml"), flow1).expect("write flow1");
        std::fs::write(
            dir.path().join("abc.toml"),
            ABC.replace("ALLOW_B", &b_allows_failure.to_string()),
        )
        .expect("write abc");

        let store = Arc::new(SqliteStore::in_memory().expect("store"));
        let transport = Arc::new(MockTransport::new());
        let dispatcher = CommandDispatcher::new(
            "http://ci.local",
            "default",
            "http://cc.local/cmd/send",
            "http://cc.local/cmd/queue/send",
            transport.clone(),
        );
        let orchestrator = Arc::new(JobOrchestrator::new(
            store.clone(),
            Arc::new(FilePipelines::new(dir.path())),
            dispatcher,
            Arc::new(EventBus::default()),
            &EngineConfig {
                retry_find_attempts: 2,
                retry_find_delay_ms: 10,
            },
        ));
        let router = CallbackRouter::new(orchestrator.clone());

        Self {
            _dir: dir,
            store,
            transport,
            orchestrator,
            router,
        }
    }

    async fn start(&self, path: &str) -> JobId {
        let job = self.orchestrator.create_job(path).await.expect("create job");
        self.router
            .callback(job.id.as_str(), session_sent("session-1"))
            .await
            .expect("session callback");
        job.id
    }

    /// Webhook identifier of the latest RUN_SHELL sent for `path`.
    fn hook(&self, path: &str) -> String {
        self.transport
            .sent_of_type(CmdType::RunShell)
            .iter()
            .rev()
            .filter_map(|c| c.info.webhook.as_deref().and_then(hook_identifier))
            .find(|id| id.contains(&format!("\"path\":\"{}\"", path)))
            .unwrap_or_else(|| panic!("{} was never dispatched", path))
    }

    async fn report(&self, path: &str, cmd: Cmd) {
        self.router
            .callback(&self.hook(path), cmd)
            .await
            .expect("node callback");
    }

    async fn status(&self, id: &JobId, path: &str) -> NodeStatus {
        self.store
            .find_result(id, path)
            .await
            .unwrap()
            .unwrap()
            .status
    }

    async fn job_status(&self, id: &JobId) -> NodeStatus {
        self.orchestrator.find(id).await.unwrap().status
    }

    fn deletes(&self) -> usize {
        self.transport.sent_of_type(CmdType::DeleteSession).len()
    }
}

#[tokio::test]
async fn new_job_has_one_pending_result_per_node() {
    let env = Env::new(false, false);
    let job = env.orchestrator.create_job("abc").await.unwrap();

    let results = env.orchestrator.node_results(&job.id).await.unwrap();
    assert_eq!(results.len(), 3 + 1);
    assert!(results.iter().all(|r| r.status == NodeStatus::Pending));
    assert_eq!(job.status, NodeStatus::Enqueue);
}

#[tokio::test]
async fn failing_step_stops_the_flow() {
    let env = Env::new(false, false);
    let id = env.start("flow1").await;

    env.report("flow1/step1", run_logged(1, &[])).await;

    assert_eq!(env.status(&id, "flow1/step1").await, NodeStatus::Failure);
    assert_eq!(env.status(&id, "flow1/step2").await, NodeStatus::Pending);
    assert_eq!(env.job_status(&id).await, NodeStatus::Failure);
    assert_eq!(env.transport.run_paths(), vec!["flow1/step1"]);
    assert_eq!(env.deletes(), 1);

    let delete = &env.transport.sent_of_type(CmdType::DeleteSession)[0];
    assert_eq!(delete.info.session_id.as_deref(), Some("session-1"));
}

#[tokio::test]
async fn allowed_failure_runs_the_next_step() {
    let env = Env::new(true, false);
    let id = env.start("flow1").await;

    env.report("flow1/step1", run_logged(1, &[])).await;

    assert_eq!(env.status(&id, "flow1/step1").await, NodeStatus::Failure);
    assert_eq!(env.transport.run_paths(), vec!["flow1/step1", "flow1/step2"]);
    assert!(!env.job_status(&id).await.is_terminal());
    assert_eq!(env.deletes(), 0);

    env.report("flow1/step2", run_logged(0, &[])).await;
    assert_eq!(env.job_status(&id).await, NodeStatus::Success);
    assert_eq!(env.deletes(), 1);
}

#[tokio::test]
async fn hard_failure_in_the_middle_skips_the_rest() {
    let env = Env::new(false, false);
    let id = env.start("abc").await;

    env.report("abc/A", run_logged(0, &[])).await;
    env.report("abc/B", run_logged(1, &[])).await;

    assert_eq!(env.transport.run_paths(), vec!["abc/A", "abc/B"]);
    assert_eq!(env.status(&id, "abc").await, NodeStatus::Failure);
    assert_eq!(env.status(&id, "abc/C").await, NodeStatus::Pending);
    assert_eq!(env.job_status(&id).await, NodeStatus::Failure);
}

#[tokio::test]
async fn allowed_failure_in_the_middle_lets_the_last_step_decide() {
    let env = Env::new(false, true);
    let id = env.start("abc").await;

    env.report("abc/A", run_logged(0, &[])).await;
    env.report("abc/B", run_logged(1, &[])).await;
    assert_eq!(env.transport.run_paths(), vec!["abc/A", "abc/B", "abc/C"]);

    env.report("abc/C", run_logged(0, &[])).await;
    assert_eq!(env.status(&id, "abc/B").await, NodeStatus::Failure);
    assert_eq!(env.status(&id, "abc").await, NodeStatus::Success);
    assert_eq!(env.job_status(&id).await, NodeStatus::Success);
}

#[tokio::test]
async fn last_step_success_completes_job_and_deletes_session_once() {
    let env = Env::new(false, false);
    let id = env.start("flow1").await;

    env.report("flow1/step1", run_status(CmdStatus::Running)).await;
    assert_eq!(env.status(&id, "flow1").await, NodeStatus::Running);
    assert_eq!(env.job_status(&id).await, NodeStatus::Running);

    env.report("flow1/step1", run_logged(0, &[])).await;
    env.report("flow1/step2", run_logged(0, &[])).await;
    // Redelivered final callback.
    env.report("flow1/step2", run_logged(0, &[])).await;

    assert_eq!(env.status(&id, "flow1").await, NodeStatus::Success);
    let job = env.orchestrator.find(&id).await.unwrap();
    assert_eq!(job.status, NodeStatus::Success);
    assert_eq!(job.exit_code, Some(0));
    assert_eq!(env.deletes(), 1);
}

#[tokio::test]
async fn outputs_survive_a_later_failure() {
    let env = Env::new(false, false);
    let id = env.start("abc").await;

    env.report("abc/A", run_logged(0, &[("FLOW_VERSION", "1.2.0")])).await;
    let job = env.orchestrator.find(&id).await.unwrap();
    assert_eq!(job.outputs["FLOW_VERSION"], "1.2.0");

    env.report("abc/B", run_logged(1, &[])).await;
    let job = env.orchestrator.find(&id).await.unwrap();
    assert_eq!(job.status, NodeStatus::Failure);
    assert_eq!(job.outputs["FLOW_VERSION"], "1.2.0");
}

#[tokio::test]
async fn out_of_order_callbacks_never_lower_a_status() {
    let orders: [&[CmdStatus]; 4] = [
        &[CmdStatus::Logged, CmdStatus::Running, CmdStatus::Pending],
        &[CmdStatus::Running, CmdStatus::Logged, CmdStatus::Sent],
        &[CmdStatus::Killed, CmdStatus::Logged, CmdStatus::Executed],
        &[CmdStatus::Pending, CmdStatus::Executed, CmdStatus::TimeoutKill],
    ];

    for order in orders {
        let env = Env::new(false, false);
        let id = env.start("abc").await;
        let mut level = 0;

        for status in order {
            let cmd = if *status == CmdStatus::Logged {
                run_logged(0, &[])
            } else {
                run_status(*status)
            };
            env.report("abc/A", cmd).await;

            let now = env.status(&id, "abc/A").await.level();
            assert!(now >= level, "{:?} regressed at {}", order, status);
            level = now;
        }
    }
}

#[tokio::test]
async fn contradicting_terminal_callbacks_keep_the_first() {
    let env = Env::new(false, false);
    let id = env.start("abc").await;

    env.report("abc/A", run_logged(0, &[])).await;
    env.report("abc/A", run_logged(1, &[])).await;
    assert_eq!(env.status(&id, "abc/A").await, NodeStatus::Success);

    env.report("abc/B", run_logged(1, &[])).await;
    env.report("abc/B", run_logged(0, &[])).await;
    assert_eq!(env.status(&id, "abc/B").await, NodeStatus::Failure);
    assert_eq!(env.transport.run_paths(), vec!["abc/A", "abc/B"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_duplicates_dispatch_the_next_step_once() {
    let env = Arc::new(Env::new(false, false));
    let id = env.start("abc").await;
    let hook = env.hook("abc/A");

    let mut handles = Vec::new();
    for _ in 0..8 {
        let env = env.clone();
        let hook = hook.clone();
        handles.push(tokio::spawn(async move {
            env.router.callback(&hook, run_logged(0, &[])).await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    assert_eq!(env.status(&id, "abc/A").await, NodeStatus::Success);
    assert_eq!(env.transport.run_paths(), vec!["abc/A", "abc/B"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_creation_assigns_unique_numbers() {
    let env = Arc::new(Env::new(false, false));

    let mut handles = Vec::new();
    for _ in 0..10 {
        let env = env.clone();
        handles.push(tokio::spawn(async move {
            env.orchestrator.create_job("flow1").await
        }));
    }
    let mut numbers = Vec::new();
    for handle in handles {
        numbers.push(handle.await.unwrap().unwrap().number);
    }
    numbers.sort_unstable();

    assert_eq!(numbers, (1..=10).collect::<Vec<i64>>());
    assert_eq!(env.transport.sent_of_type(CmdType::CreateSession).len(), 10);
}

#[tokio::test]
async fn events_follow_the_job() {
    let env = Env::new(false, false);
    let mut rx = env.orchestrator.event_bus().subscribe();
    let id = env.start("flow1").await;
    env.report("flow1/step1", run_logged(2, &[])).await;

    let mut kinds = Vec::new();
    while let Ok(event) = rx.try_recv() {
        assert_eq!(event.job_id(), &id);
        kinds.push(match event {
            JobEvent::JobCreated { .. } => "created",
            JobEvent::SessionReady { .. } => "session",
            JobEvent::NodeDispatched { .. } => "dispatched",
            JobEvent::NodeStatusChanged { .. } => "node",
            JobEvent::JobStatusChanged { .. } => "job",
            JobEvent::SessionDeleted { .. } => "deleted",
            JobEvent::SessionFailed { .. } | JobEvent::DispatchFailed { .. } => "failed",
        });
    }

    assert_eq!(kinds.first(), Some(&"created"));
    assert!(kinds.contains(&"session"));
    assert!(kinds.contains(&"dispatched"));
    assert!(kinds.contains(&"job"));
    assert_eq!(kinds.last(), Some(&"deleted"));
}

#[tokio::test]
async fn unknown_job_callback_is_rejected() {
    let env = Env::new(false, false);
    let cmd = Cmd::new(CmdType::RunShell, CmdStatus::Running);
    let err = env
        .router
        .callback(r#"{"path":"abc/A","jobId":"missing"}"#, cmd)
        .await
        .unwrap_err();
    assert!(err.is_client_error());
}
