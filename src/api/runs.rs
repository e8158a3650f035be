/// Run lifecycle REST API endpoints
///
/// Starting a run answers as soon as the run is `running`; callers poll
/// `GET /api/runs/{id}` for progress. Canceling and retrying act on run ids.

use crate::api::{status_for, AppState};
use crate::run::RunSnapshot;
use crate::runtime::engine::RunRequest;
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use serde::Serialize;
use serde_json::{json, Value};

/// Snapshot plus derived progress, as shown by the run panel
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunView {
    #[serde(flatten)]
    pub snapshot: RunSnapshot,
    pub progress: f64,
}

impl From<RunSnapshot> for RunView {
    fn from(snapshot: RunSnapshot) -> Self {
        let progress = snapshot.progress();
        Self { snapshot, progress }
    }
}

pub fn create_run_routes() -> Router<AppState> {
    Router::new()
        .route("/api/flows/{id}/runs", post(start_run).get(flow_runs))
        .route("/api/runs", get(list_runs))
        .route("/api/runs/current", get(current_run).delete(reset_current))
        .route("/api/runs/{id}", get(get_run))
        .route("/api/runs/{id}/cancel", post(cancel_run))
        .route("/api/runs/{id}/retry", post(retry_run))
}

/// POST /api/flows/{id}/runs
/// Body (optional): { "testMode": true }
async fn start_run(
    State(state): State<AppState>,
    Path(flow_id): Path<String>,
    body: Bytes,
) -> Result<(StatusCode, Json<RunView>), StatusCode> {
    let request = if body.iter().all(u8::is_ascii_whitespace) {
        RunRequest::default()
    } else {
        serde_json::from_slice::<RunRequest>(&body).map_err(|e| {
            tracing::warn!("❌ Invalid run request for flow {}: {}", flow_id, e);
            StatusCode::BAD_REQUEST
        })?
    };

    let flow = state.flows().get(&flow_id).ok_or(StatusCode::NOT_FOUND)?;
    let handle = state
        .controller
        .start_with(&flow, request)
        .await
        .map_err(|e| {
            tracing::warn!("❌ Run for flow {} not started: {}", flow_id, e);
            status_for(&e)
        })?;

    Ok((StatusCode::ACCEPTED, Json(handle.snapshot().into())))
}

/// GET /api/flows/{id}/runs
async fn flow_runs(State(state): State<AppState>, Path(flow_id): Path<String>) -> Json<Value> {
    let runs = state.controller.history().list(Some(&flow_id));
    Json(json!({ "runs": runs }))
}

/// GET /api/runs
async fn list_runs(State(state): State<AppState>) -> Json<Value> {
    let runs = state.controller.history().list(None);
    let active = state.controller.active().await;
    Json(json!({ "runs": runs, "active": active }))
}

/// GET /api/runs/{id}
async fn get_run(State(state): State<AppState>, Path(run_id): Path<String>) -> Result<Json<RunView>, StatusCode> {
    state
        .controller
        .run(&run_id)
        .await
        .map(|snapshot| Json(snapshot.into()))
        .ok_or(StatusCode::NOT_FOUND)
}

/// POST /api/runs/{id}/cancel
///
/// Canceling a finished run is not an error; `canceled` is simply false.
async fn cancel_run(State(state): State<AppState>, Path(run_id): Path<String>) -> Result<Json<Value>, StatusCode> {
    let canceled = state
        .controller
        .cancel(&run_id)
        .await
        .map_err(|e| status_for(&e))?;
    let run = state.controller.run(&run_id).await.map(|s| s.run);
    Ok(Json(json!({ "canceled": canceled, "run": run })))
}

/// POST /api/runs/{id}/retry
async fn retry_run(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<(StatusCode, Json<RunView>), StatusCode> {
    let handle = state.controller.retry(&run_id).await.map_err(|e| {
        tracing::warn!("❌ Retry of run {} refused: {}", run_id, e);
        status_for(&e)
    })?;
    Ok((StatusCode::ACCEPTED, Json(handle.snapshot().into())))
}

/// GET /api/runs/current
async fn current_run(State(state): State<AppState>) -> Result<Json<RunView>, StatusCode> {
    state
        .controller
        .current()
        .await
        .map(|handle| Json(handle.snapshot().into()))
        .ok_or(StatusCode::NOT_FOUND)
}

/// DELETE /api/runs/current
async fn reset_current(State(state): State<AppState>) -> Result<StatusCode, StatusCode> {
    state
        .controller
        .reset()
        .await
        .map(|()| StatusCode::NO_CONTENT)
        .map_err(|e| status_for(&e))
}
