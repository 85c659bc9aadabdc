use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use tracing::info;

use weft_core::types::{RunFilter, RunId, RunStatus};
use weft_engine::{RunDetail, RunRequest};

use crate::error::ApiError;
use crate::middleware::Authenticated;
use crate::state::AppState;
use crate::stream;

// GET /api/health (no auth)
pub async fn health(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "workflows": state.service.workflows().await.len(),
    }))
}

// GET /api/workflows
pub async fn list_workflows(
    _auth: Authenticated,
    State(state): State<Arc<AppState>>,
) -> Json<serde_json::Value> {
    let workflows = state.service.workflows().await;
    Json(serde_json::json!({ "workflows": workflows }))
}

// GET /api/workflows/{name}/dag
pub async fn workflow_dag(
    _auth: Authenticated,
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Response, ApiError> {
    let dag = state.service.describe(&name).await?;
    Ok(Json(dag).into_response())
}

// POST /api/runs
pub async fn submit_run(
    _auth: Authenticated,
    State(state): State<Arc<AppState>>,
    Json(request): Json<RunRequest>,
) -> Result<Response, ApiError> {
    if request.workflow.is_empty() {
        return Err(ApiError::bad_request("workflow is required"));
    }
    let submission = state.service.submit(request).await?;
    Ok((StatusCode::ACCEPTED, Json(submission)).into_response())
}

#[derive(Deserialize)]
pub struct RunsQuery {
    pub workflow: Option<String>,
    pub status: Option<String>,
    #[serde(default = "default_limit")]
    pub limit: usize,
    #[serde(default)]
    pub offset: usize,
}

fn default_limit() -> usize {
    50
}

// GET /api/runs?workflow=&status=&limit=50&offset=0
pub async fn list_runs(
    _auth: Authenticated,
    State(state): State<Arc<AppState>>,
    Query(q): Query<RunsQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let status = match q.status.as_deref() {
        Some(s) => Some(
            RunStatus::parse(s).ok_or_else(|| ApiError::bad_request(format!("unknown status '{}'", s)))?,
        ),
        None => None,
    };
    let runs = state
        .service
        .list_runs(RunFilter {
            workflow: q.workflow,
            status,
            limit: Some(q.limit),
            offset: Some(q.offset),
        })
        .await?;
    let runs: Vec<RunDetail> = runs.into_iter().map(RunDetail::from).collect();
    Ok(Json(serde_json::json!({ "runs": runs })))
}

// GET /api/runs/{id}
pub async fn get_run(
    _auth: Authenticated,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<RunDetail>, ApiError> {
    Ok(Json(state.service.get_run(&RunId::from_string(&id)).await?))
}

// POST /api/runs/{id}/cancel
pub async fn cancel_run(
    _auth: Authenticated,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let run_id = RunId::from_string(&id);
    let cancelled = state.service.cancel(&run_id).await?;
    info!(run_id = %run_id, cancelled, "Cancel requested via gateway");
    Ok(Json(serde_json::json!({
        "run_id": run_id,
        "cancelled": cancelled,
    })))
}

// GET /api/runs/{id}/events
pub async fn run_events(
    _auth: Authenticated,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let events = state.service.run_events(&RunId::from_string(&id)).await?;
    Ok(Json(serde_json::json!({ "events": events })))
}

#[derive(Deserialize)]
pub struct SummaryQuery {
    pub workflow: Option<String>,
}

// GET /api/summary?workflow=
pub async fn summary(
    _auth: Authenticated,
    State(state): State<Arc<AppState>>,
    Query(q): Query<SummaryQuery>,
) -> Result<Response, ApiError> {
    let summary = state.service.summary(q.workflow.as_deref()).await?;
    Ok(Json(summary).into_response())
}

// GET /api/circuits
pub async fn circuits(
    _auth: Authenticated,
    State(state): State<Arc<AppState>>,
) -> Json<serde_json::Value> {
    let circuits = state.service.router().circuits().snapshots();
    Json(serde_json::json!({ "circuits": circuits }))
}

// GET /ws/runs/{id}: replay stored events, then follow the run live
pub async fn ws_run(
    ws: WebSocketUpgrade,
    _auth: Authenticated,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let run_id = RunId::from_string(&id);
    state.service.get_run(&run_id).await?;
    let service = Arc::clone(&state.service);
    Ok(ws.on_upgrade(move |socket| stream::serve_socket(socket, service, run_id)))
}
