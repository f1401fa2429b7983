use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;
use tracing::{debug, info};

use flowci_core::cmd::Cmd;
use flowci_core::error::FlowError;
use flowci_core::types::{Job, JobId, NodeResult};
use flowci_engine::CallbackOutcome;

use crate::error::ApiResult;
use crate::state::AppState;

// GET /api/health
pub async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

#[derive(Deserialize)]
pub struct CreateJobBody {
    #[serde(default)]
    pub path: String,
}

// POST /jobs
pub async fn create_job(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateJobBody>,
) -> ApiResult<Json<Job>> {
    info!(path = %body.path, "Job requested");
    let job = state.orchestrator.create_job(&body.path).await?;
    Ok(Json(job))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListQuery {
    pub flow_name: Option<String>,
    /// Comma separated.
    pub flow_names: Option<String>,
}

// GET /jobs?flowName=..&flowNames=a,b
pub async fn list_jobs(
    State(state): State<Arc<AppState>>,
    Query(q): Query<ListQuery>,
) -> ApiResult<Json<Vec<Job>>> {
    let flow_names = q.flow_names.map(|names| {
        names
            .split(',')
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .map(String::from)
            .collect::<Vec<_>>()
    });
    let jobs = state.orchestrator.list_jobs(q.flow_name, flow_names).await?;
    Ok(Json(jobs))
}

// GET /jobs/{id}
pub async fn get_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Job>> {
    let job = state.orchestrator.find(&JobId::from_string(&id)).await?;
    Ok(Json(job))
}

// GET /jobs/{flowName}/{number}
pub async fn get_job_by_number(
    State(state): State<Arc<AppState>>,
    Path((flow_name, number)): Path<(String, String)>,
) -> ApiResult<Json<Job>> {
    let number: i64 = number.parse().map_err(|_| {
        FlowError::IllegalParameter(format!("Invalid build number: {}", number))
    })?;
    let job = state.orchestrator.find_by_number(&flow_name, number).await?;
    Ok(Json(job))
}

// GET /jobs/{id}/nodes
pub async fn job_nodes(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Vec<NodeResult>>> {
    let results = state
        .orchestrator
        .node_results(&JobId::from_string(&id))
        .await?;
    Ok(Json(results))
}

#[derive(Deserialize)]
pub struct HookQuery {
    pub identifier: String,
}

// POST /hooks/cmd?identifier=..
pub async fn cmd_callback(
    State(state): State<Arc<AppState>>,
    Query(q): Query<HookQuery>,
    Json(cmd): Json<Cmd>,
) -> ApiResult<Json<serde_json::Value>> {
    debug!(
        identifier = %q.identifier,
        cmd_type = %cmd.cmd_type,
        cmd_status = %cmd.status,
        "Callback received"
    );
    let outcome = state.callbacks.callback(&q.identifier, cmd).await?;
    let outcome = match outcome {
        CallbackOutcome::Applied => "applied",
        CallbackOutcome::Ignored => "ignored",
    };
    Ok(Json(serde_json::json!({ "outcome": outcome })))
}
