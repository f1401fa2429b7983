use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;

use flowci_core::config::EngineConfig;
use flowci_core::error::{FlowError, Result};
use flowci_core::event::EventBus;
use flowci_core::node::NodeSpec;
use flowci_core::traits::{JobSnapshot, JobStore};
use flowci_core::types::{Job, JobFilter, JobId, NodeResult};
use flowci_dispatch::CommandDispatcher;
use flowci_store::SqliteStore;
use flowci_test_utils::{MockTransport, StaticPipelines};

use crate::{CallbackRouter, JobOrchestrator};

/// SQLite store whose writes can be made to fail.
pub(crate) struct FaultyStore {
    inner: Arc<SqliteStore>,
    fail_creates: AtomicBool,
    fail_saves: AtomicBool,
}

impl FaultyStore {
    pub fn fail_creates(&self, on: bool) {
        self.fail_creates.store(on, Ordering::SeqCst);
    }

    pub fn fail_saves(&self, on: bool) {
        self.fail_saves.store(on, Ordering::SeqCst);
    }

    fn refused<T: Send + 'static>() -> BoxFuture<'static, Result<T>> {
        Box::pin(async { Err(FlowError::Database("disk I/O error".into())) })
    }
}

impl JobStore for FaultyStore {
    fn create_job(
        &self,
        job: &Job,
        snapshot: &JobSnapshot,
        results: &[NodeResult],
    ) -> BoxFuture<'_, Result<Job>> {
        if self.fail_creates.load(Ordering::SeqCst) {
            return Self::refused();
        }
        self.inner.create_job(job, snapshot, results)
    }

    fn find_job(&self, id: &JobId) -> BoxFuture<'_, Result<Option<Job>>> {
        self.inner.find_job(id)
    }

    fn find_job_by_number(&self, node_name: &str, number: i64) -> BoxFuture<'_, Result<Option<Job>>> {
        self.inner.find_job_by_number(node_name, number)
    }

    fn list_jobs(&self, filter: JobFilter) -> BoxFuture<'_, Result<Vec<Job>>> {
        self.inner.list_jobs(filter)
    }

    fn update_job(&self, job: &Job) -> BoxFuture<'_, Result<()>> {
        self.inner.update_job(job)
    }

    fn load_snapshot(&self, id: &JobId) -> BoxFuture<'_, Result<Option<JobSnapshot>>> {
        self.inner.load_snapshot(id)
    }

    fn load_results(&self, id: &JobId) -> BoxFuture<'_, Result<Vec<NodeResult>>> {
        self.inner.load_results(id)
    }

    fn find_result(&self, id: &JobId, path: &str) -> BoxFuture<'_, Result<Option<NodeResult>>> {
        self.inner.find_result(id, path)
    }

    fn save_state(&self, job: &Job, results: &[NodeResult]) -> BoxFuture<'_, Result<()>> {
        if self.fail_saves.load(Ordering::SeqCst) {
            return Self::refused();
        }
        self.inner.save_state(job, results)
    }
}

/// Orchestrator wired to an in-memory store and a recording transport.
pub(crate) struct Harness {
    pub store: Arc<SqliteStore>,
    pub faults: Arc<FaultyStore>,
    pub pipelines: Arc<StaticPipelines>,
    pub transport: Arc<MockTransport>,
    pub orchestrator: Arc<JobOrchestrator>,
    pub router: CallbackRouter,
}

impl Harness {
    pub fn new(specs: Vec<NodeSpec>) -> Self {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let faults = Arc::new(FaultyStore {
            inner: store.clone(),
            fail_creates: AtomicBool::new(false),
            fail_saves: AtomicBool::new(false),
        });
        let pipelines = Arc::new(StaticPipelines::new());
        for spec in specs {
            let definition = format!("# {}\n", spec.name);
            pipelines.insert(spec, definition);
        }
        let transport = Arc::new(MockTransport::new());
        let dispatcher = CommandDispatcher::new(
            "http://ci.local",
            "default",
            "http://cc.local/cmd/send",
            "http://cc.local/cmd/queue/send",
            transport.clone(),
        );
        let engine = EngineConfig {
            retry_find_attempts: 3,
            retry_find_delay_ms: 50,
        };
        let orchestrator = Arc::new(JobOrchestrator::new(
            faults.clone(),
            pipelines.clone(),
            dispatcher,
            Arc::new(EventBus::default()),
            &engine,
        ));
        let router = CallbackRouter::new(orchestrator.clone());

        Self {
            store,
            faults,
            pipelines,
            transport,
            orchestrator,
            router,
        }
    }
}
