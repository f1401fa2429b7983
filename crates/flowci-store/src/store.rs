use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Transaction};
use tracing::{debug, warn};

use flowci_core::error::{FlowError, Result};
use flowci_core::node::NodeSpec;
use flowci_core::traits::{JobSnapshot, JobStore};
use flowci_core::types::{EnvMap, Job, JobFilter, JobId, NodeResult, NodeStatus};

/// Attempts at allocating a build number before giving up on a conflict.
const NUMBER_CONFLICT_RETRIES: usize = 3;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS jobs (
        id TEXT PRIMARY KEY,
        node_path TEXT NOT NULL,
        node_name TEXT NOT NULL,
        number INTEGER NOT NULL,
        status TEXT NOT NULL,
        session_id TEXT,
        cmd_id TEXT,
        exit_code INTEGER,
        outputs TEXT NOT NULL,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        UNIQUE(node_name, number)
    );

    CREATE TABLE IF NOT EXISTS job_nodes (
        job_id TEXT PRIMARY KEY REFERENCES jobs(id),
        definition TEXT NOT NULL,
        tree TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS node_results (
        job_id TEXT NOT NULL REFERENCES jobs(id),
        path TEXT NOT NULL,
        name TEXT NOT NULL,
        seq INTEGER NOT NULL,
        status TEXT NOT NULL,
        cmd_id TEXT,
        exit_code INTEGER,
        duration INTEGER,
        outputs TEXT NOT NULL,
        log_paths TEXT NOT NULL,
        start_time TEXT,
        finish_time TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        PRIMARY KEY (job_id, path)
    );";

const JOB_COLUMNS: &str = "id, node_path, node_name, number, status, session_id, cmd_id, \
                           exit_code, outputs, created_at, updated_at";

const RESULT_COLUMNS: &str = "job_id, path, name, status, cmd_id, exit_code, duration, \
                              outputs, log_paths, start_time, finish_time, created_at, updated_at";

/// SQLite-backed job store.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create a SQLite database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        // Create parent directories
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                FlowError::Database(format!("Failed to create db directory: {}", e))
            })?;
        }

        let conn = Connection::open(path).map_err(db_err)?;

        // Enable WAL mode for better concurrent performance
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;

        debug!(path = %path.display(), "SQLite store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|e| FlowError::Database(e.to_string()))
    }
}

fn db_err(e: rusqlite::Error) -> FlowError {
    FlowError::Database(e.to_string())
}

fn is_constraint_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _) if err.code == ErrorCode::ConstraintViolation
    )
}

fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| FlowError::Database(format!("Bad timestamp '{}': {}", s, e)))
}

fn parse_opt_ts(s: Option<String>) -> Result<Option<DateTime<Utc>>> {
    s.as_deref().map(parse_ts).transpose()
}

/// Column values of a `jobs` row before domain conversion.
struct JobRow {
    id: String,
    node_path: String,
    node_name: String,
    number: i64,
    status: String,
    session_id: Option<String>,
    cmd_id: Option<String>,
    exit_code: Option<i32>,
    outputs: String,
    created_at: String,
    updated_at: String,
}

impl JobRow {
    fn read(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            node_path: row.get(1)?,
            node_name: row.get(2)?,
            number: row.get(3)?,
            status: row.get(4)?,
            session_id: row.get(5)?,
            cmd_id: row.get(6)?,
            exit_code: row.get(7)?,
            outputs: row.get(8)?,
            created_at: row.get(9)?,
            updated_at: row.get(10)?,
        })
    }

    fn into_job(self) -> Result<Job> {
        Ok(Job {
            id: JobId(self.id),
            node_path: self.node_path,
            node_name: self.node_name,
            number: self.number,
            status: self.status.parse()?,
            session_id: self.session_id,
            cmd_id: self.cmd_id,
            exit_code: self.exit_code,
            outputs: serde_json::from_str(&self.outputs)?,
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
        })
    }
}

/// Column values of a `node_results` row before domain conversion.
struct ResultRow {
    job_id: String,
    path: String,
    name: String,
    status: String,
    cmd_id: Option<String>,
    exit_code: Option<i32>,
    duration: Option<i64>,
    outputs: String,
    log_paths: String,
    start_time: Option<String>,
    finish_time: Option<String>,
    created_at: String,
    updated_at: String,
}

impl ResultRow {
    fn read(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            job_id: row.get(0)?,
            path: row.get(1)?,
            name: row.get(2)?,
            status: row.get(3)?,
            cmd_id: row.get(4)?,
            exit_code: row.get(5)?,
            duration: row.get(6)?,
            outputs: row.get(7)?,
            log_paths: row.get(8)?,
            start_time: row.get(9)?,
            finish_time: row.get(10)?,
            created_at: row.get(11)?,
            updated_at: row.get(12)?,
        })
    }

    fn into_result(self) -> Result<NodeResult> {
        let outputs: EnvMap = serde_json::from_str(&self.outputs)?;
        let status: NodeStatus = self.status.parse()?;
        Ok(NodeResult {
            job_id: JobId(self.job_id),
            path: self.path,
            name: self.name,
            status,
            cmd_id: self.cmd_id,
            exit_code: self.exit_code,
            duration: self.duration,
            outputs,
            log_paths: serde_json::from_str(&self.log_paths)?,
            start_time: parse_opt_ts(self.start_time)?,
            finish_time: parse_opt_ts(self.finish_time)?,
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
        })
    }
}

fn write_job(tx: &Transaction<'_>, job: &Job) -> Result<usize> {
    let outputs = serde_json::to_string(&job.outputs)?;
    tx.execute(
        "UPDATE jobs SET status = ?2, session_id = ?3, cmd_id = ?4, exit_code = ?5,
                         outputs = ?6, updated_at = ?7
         WHERE id = ?1",
        params![
            job.id.0,
            job.status.as_str(),
            job.session_id,
            job.cmd_id,
            job.exit_code,
            outputs,
            ts(&job.updated_at),
        ],
    )
    .map_err(db_err)
}

fn write_result(tx: &Transaction<'_>, result: &NodeResult) -> Result<usize> {
    let outputs = serde_json::to_string(&result.outputs)?;
    let log_paths = serde_json::to_string(&result.log_paths)?;
    tx.execute(
        "UPDATE node_results SET status = ?3, cmd_id = ?4, exit_code = ?5, duration = ?6,
                                 outputs = ?7, log_paths = ?8, start_time = ?9,
                                 finish_time = ?10, updated_at = ?11
         WHERE job_id = ?1 AND path = ?2",
        params![
            result.job_id.0,
            result.path,
            result.status.as_str(),
            result.cmd_id,
            result.exit_code,
            result.duration,
            outputs,
            log_paths,
            result.start_time.as_ref().map(ts),
            result.finish_time.as_ref().map(ts),
            ts(&result.updated_at),
        ],
    )
    .map_err(db_err)
}

/// Insert a job with the next build number for its node name.
fn insert_job(
    conn: &mut Connection,
    job: &Job,
    snapshot: &JobSnapshot,
    results: &[NodeResult],
) -> std::result::Result<i64, InsertError> {
    let tx = conn.transaction()?;

    let number: i64 = tx.query_row(
        "SELECT COALESCE(MAX(number), 0) + 1 FROM jobs WHERE node_name = ?1",
        params![job.node_name],
        |row| row.get(0),
    )?;

    tx.execute(
        &format!(
            "INSERT INTO jobs ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            JOB_COLUMNS
        ),
        params![
            job.id.0,
            job.node_path,
            job.node_name,
            number,
            job.status.as_str(),
            job.session_id,
            job.cmd_id,
            job.exit_code,
            serde_json::to_string(&job.outputs)?,
            ts(&job.created_at),
            ts(&job.updated_at),
        ],
    )?;

    tx.execute(
        "INSERT INTO job_nodes (job_id, definition, tree) VALUES (?1, ?2, ?3)",
        params![
            job.id.0,
            snapshot.definition,
            serde_json::to_string(&snapshot.root)?
        ],
    )?;

    for (seq, result) in results.iter().enumerate() {
        tx.execute(
            "INSERT INTO node_results (job_id, path, name, seq, status, cmd_id, exit_code,
                                       duration, outputs, log_paths, start_time, finish_time,
                                       created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                result.job_id.0,
                result.path,
                result.name,
                seq as i64,
                result.status.as_str(),
                result.cmd_id,
                result.exit_code,
                result.duration,
                serde_json::to_string(&result.outputs)?,
                serde_json::to_string(&result.log_paths)?,
                result.start_time.as_ref().map(ts),
                result.finish_time.as_ref().map(ts),
                ts(&result.created_at),
                ts(&result.updated_at),
            ],
        )?;
    }

    tx.commit()?;
    Ok(number)
}

enum InsertError {
    Sql(rusqlite::Error),
    Json(serde_json::Error),
}

impl From<rusqlite::Error> for InsertError {
    fn from(e: rusqlite::Error) -> Self {
        InsertError::Sql(e)
    }
}

impl From<serde_json::Error> for InsertError {
    fn from(e: serde_json::Error) -> Self {
        InsertError::Json(e)
    }
}

impl JobStore for SqliteStore {
    fn create_job(
        &self,
        job: &Job,
        snapshot: &JobSnapshot,
        results: &[NodeResult],
    ) -> BoxFuture<'_, Result<Job>> {
        let mut job = job.clone();
        let snapshot = snapshot.clone();
        let results = results.to_vec();

        Box::pin(async move {
            let mut conn = self.lock()?;

            let mut attempt = 0;
            loop {
                attempt += 1;
                match insert_job(&mut conn, &job, &snapshot, &results) {
                    Ok(number) => {
                        job.number = number;
                        debug!(job_id = %job.id, node_name = %job.node_name, number, "Job stored");
                        return Ok(job);
                    }
                    // Another writer took this number; recompute and try again.
                    Err(InsertError::Sql(e))
                        if is_constraint_violation(&e) && attempt < NUMBER_CONFLICT_RETRIES =>
                    {
                        warn!(node_name = %job.node_name, attempt, "Build number conflict, retrying");
                    }
                    Err(InsertError::Sql(e)) => return Err(db_err(e)),
                    Err(InsertError::Json(e)) => return Err(e.into()),
                }
            }
        })
    }

    fn find_job(&self, id: &JobId) -> BoxFuture<'_, Result<Option<Job>>> {
        let id = id.0.clone();

        Box::pin(async move {
            let conn = self.lock()?;
            let row = conn
                .query_row(
                    &format!("SELECT {} FROM jobs WHERE id = ?1", JOB_COLUMNS),
                    params![id],
                    JobRow::read,
                )
                .optional()
                .map_err(db_err)?;
            row.map(JobRow::into_job).transpose()
        })
    }

    fn find_job_by_number(
        &self,
        node_name: &str,
        number: i64,
    ) -> BoxFuture<'_, Result<Option<Job>>> {
        let node_name = node_name.to_string();

        Box::pin(async move {
            let conn = self.lock()?;
            let row = conn
                .query_row(
                    &format!(
                        "SELECT {} FROM jobs WHERE node_name = ?1 AND number = ?2",
                        JOB_COLUMNS
                    ),
                    params![node_name, number],
                    JobRow::read,
                )
                .optional()
                .map_err(db_err)?;
            row.map(JobRow::into_job).transpose()
        })
    }

    fn list_jobs(&self, filter: JobFilter) -> BoxFuture<'_, Result<Vec<Job>>> {
        Box::pin(async move {
            let conn = self.lock()?;
            let mut jobs = Vec::new();

            match filter {
                JobFilter::All => {
                    let mut stmt = conn
                        .prepare(&format!(
                            "SELECT {} FROM jobs ORDER BY created_at DESC, number DESC",
                            JOB_COLUMNS
                        ))
                        .map_err(db_err)?;
                    let rows = stmt.query_map([], JobRow::read).map_err(db_err)?;
                    for row in rows {
                        jobs.push(row.map_err(db_err)?.into_job()?);
                    }
                }
                JobFilter::Flow(name) => {
                    let mut stmt = conn
                        .prepare(&format!(
                            "SELECT {} FROM jobs WHERE node_name = ?1 ORDER BY number DESC",
                            JOB_COLUMNS
                        ))
                        .map_err(db_err)?;
                    let rows = stmt.query_map(params![name], JobRow::read).map_err(db_err)?;
                    for row in rows {
                        jobs.push(row.map_err(db_err)?.into_job()?);
                    }
                }
                JobFilter::Latest(names) => {
                    let mut stmt = conn
                        .prepare(&format!(
                            "SELECT {} FROM jobs WHERE node_name = ?1
                             ORDER BY number DESC LIMIT 1",
                            JOB_COLUMNS
                        ))
                        .map_err(db_err)?;
                    for name in &names {
                        let row = stmt
                            .query_row(params![name], JobRow::read)
                            .optional()
                            .map_err(db_err)?;
                        if let Some(row) = row {
                            jobs.push(row.into_job()?);
                        }
                    }
                }
            }

            Ok(jobs)
        })
    }

    fn update_job(&self, job: &Job) -> BoxFuture<'_, Result<()>> {
        let job = job.clone();

        Box::pin(async move {
            let mut conn = self.lock()?;
            let tx = conn.transaction().map_err(db_err)?;
            if write_job(&tx, &job)? == 0 {
                return Err(FlowError::NotFound(format!("Job not found: {}", job.id)));
            }
            tx.commit().map_err(db_err)
        })
    }

    fn load_snapshot(&self, id: &JobId) -> BoxFuture<'_, Result<Option<JobSnapshot>>> {
        let id = id.0.clone();

        Box::pin(async move {
            let conn = self.lock()?;
            let row: Option<(String, String)> = conn
                .query_row(
                    "SELECT definition, tree FROM job_nodes WHERE job_id = ?1",
                    params![id],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()
                .map_err(db_err)?;

            match row {
                Some((definition, tree)) => {
                    let root: NodeSpec = serde_json::from_str(&tree)?;
                    Ok(Some(JobSnapshot { definition, root }))
                }
                None => Ok(None),
            }
        })
    }

    fn load_results(&self, id: &JobId) -> BoxFuture<'_, Result<Vec<NodeResult>>> {
        let id = id.0.clone();

        Box::pin(async move {
            let conn = self.lock()?;
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {} FROM node_results WHERE job_id = ?1 ORDER BY seq ASC",
                    RESULT_COLUMNS
                ))
                .map_err(db_err)?;
            let rows = stmt.query_map(params![id], ResultRow::read).map_err(db_err)?;

            let mut results = Vec::new();
            for row in rows {
                results.push(row.map_err(db_err)?.into_result()?);
            }
            Ok(results)
        })
    }

    fn find_result(&self, id: &JobId, path: &str) -> BoxFuture<'_, Result<Option<NodeResult>>> {
        let id = id.0.clone();
        let path = path.to_string();

        Box::pin(async move {
            let conn = self.lock()?;
            let row = conn
                .query_row(
                    &format!(
                        "SELECT {} FROM node_results WHERE job_id = ?1 AND path = ?2",
                        RESULT_COLUMNS
                    ),
                    params![id, path],
                    ResultRow::read,
                )
                .optional()
                .map_err(db_err)?;
            row.map(ResultRow::into_result).transpose()
        })
    }

    fn save_state(&self, job: &Job, results: &[NodeResult]) -> BoxFuture<'_, Result<()>> {
        let job = job.clone();
        let results = results.to_vec();

        Box::pin(async move {
            let mut conn = self.lock()?;
            let tx = conn.transaction().map_err(db_err)?;

            if write_job(&tx, &job)? == 0 {
                return Err(FlowError::NotFound(format!("Job not found: {}", job.id)));
            }
            for result in &results {
                if write_result(&tx, result)? == 0 {
                    return Err(FlowError::NotFound(format!(
                        "Node result not found: {} {}",
                        result.job_id, result.path
                    )));
                }
            }

            tx.commit().map_err(db_err)?;
            debug!(job_id = %job.id, results = results.len(), "Job state saved");
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowci_core::node::NodeTree;

    fn snapshot() -> JobSnapshot {
        JobSnapshot {
            definition: "flow1 definition".into(),
            root: NodeSpec::flow("flow1")
                .with_child(NodeSpec::step("step1", "echo 1"))
                .with_child(NodeSpec::step("step2", "echo 2")),
        }
    }

    fn new_job(snapshot: &JobSnapshot) -> (Job, Vec<NodeResult>) {
        let job = Job::new("flow1", "flow1");
        let tree = NodeTree::build(snapshot.root.clone()).unwrap();
        let results = tree
            .iter()
            .map(|(_, n)| NodeResult::pending(&job.id, &n.path, &n.name))
            .collect();
        (job, results)
    }

    #[tokio::test]
    async fn test_create_and_find() {
        let store = SqliteStore::in_memory().unwrap();
        let snap = snapshot();
        let (job, results) = new_job(&snap);

        let stored = store.create_job(&job, &snap, &results).await.unwrap();
        assert_eq!(stored.number, 1);

        let found = store.find_job(&job.id).await.unwrap().unwrap();
        assert_eq!(found.id, job.id);
        assert_eq!(found.status, NodeStatus::Pending);

        let loaded = store.load_results(&job.id).await.unwrap();
        let paths: Vec<&str> = loaded.iter().map(|r| r.path.as_str()).collect();
        assert_eq!(paths, vec!["flow1", "flow1/step1", "flow1/step2"]);

        let snap_back = store.load_snapshot(&job.id).await.unwrap().unwrap();
        assert_eq!(snap_back, snap);
    }

    #[tokio::test]
    async fn test_build_numbers_are_monotonic_per_name() {
        let store = SqliteStore::in_memory().unwrap();
        let snap = snapshot();

        for expected in 1..=3 {
            let (job, results) = new_job(&snap);
            let stored = store.create_job(&job, &snap, &results).await.unwrap();
            assert_eq!(stored.number, expected);
        }

        let other = Job::new("flow2", "flow2");
        let stored = store.create_job(&other, &snap, &[]).await.unwrap();
        assert_eq!(stored.number, 1);

        let third = store.find_job_by_number("flow1", 3).await.unwrap();
        assert!(third.is_some());
        assert!(store.find_job_by_number("flow1", 4).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_filters() {
        let store = SqliteStore::in_memory().unwrap();
        let snap = snapshot();
        for _ in 0..2 {
            let (job, results) = new_job(&snap);
            store.create_job(&job, &snap, &results).await.unwrap();
        }
        store
            .create_job(&Job::new("flow2", "flow2"), &snap, &[])
            .await
            .unwrap();

        assert_eq!(store.list_jobs(JobFilter::All).await.unwrap().len(), 3);

        let flow1 = store.list_jobs(JobFilter::Flow("flow1".into())).await.unwrap();
        assert_eq!(flow1.iter().map(|j| j.number).collect::<Vec<_>>(), vec![2, 1]);

        let latest = store
            .list_jobs(JobFilter::Latest(vec!["flow1".into(), "flow2".into(), "none".into()]))
            .await
            .unwrap();
        assert_eq!(latest.len(), 2);
        assert_eq!(latest[0].node_name, "flow1");
        assert_eq!(latest[0].number, 2);
        assert_eq!(latest[1].node_name, "flow2");
    }

    #[tokio::test]
    async fn test_save_state_is_atomic() {
        let store = SqliteStore::in_memory().unwrap();
        let snap = snapshot();
        let (job, results) = new_job(&snap);
        let mut job = store.create_job(&job, &snap, &results).await.unwrap();

        job.status = NodeStatus::Running;
        let mut step1 = results[1].clone();
        step1.status = NodeStatus::Success;
        step1.outputs.insert("FLOW_A".into(), "1".into());
        let mut missing = results[2].clone();
        missing.path = "flow1/ghost".into();

        // A bad row rolls the whole batch back.
        let err = store
            .save_state(&job, &[step1.clone(), missing])
            .await
            .unwrap_err();
        assert!(matches!(err, FlowError::NotFound(_)));
        let unchanged = store.find_job(&job.id).await.unwrap().unwrap();
        assert_eq!(unchanged.status, NodeStatus::Pending);

        store.save_state(&job, &[step1]).await.unwrap();
        let saved = store.find_result(&job.id, "flow1/step1").await.unwrap().unwrap();
        assert_eq!(saved.status, NodeStatus::Success);
        assert_eq!(saved.outputs["FLOW_A"], "1");
        let job_back = store.find_job(&job.id).await.unwrap().unwrap();
        assert_eq!(job_back.status, NodeStatus::Running);
    }

    #[tokio::test]
    async fn test_open_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("flowci.db");
        let store = SqliteStore::open(&path).unwrap();
        let snap = snapshot();
        let (job, results) = new_job(&snap);
        store.create_job(&job, &snap, &results).await.unwrap();
        drop(store);

        let reopened = SqliteStore::open(&path).unwrap();
        assert!(reopened.find_job(&job.id).await.unwrap().is_some());
    }
}
