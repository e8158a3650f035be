/// Flow management REST API endpoints
///
/// Create, edit, toggle and delete flow definitions. Every change is applied to
/// the registry immediately and re-synced into the cron scheduler.

use crate::api::{status_for, AppState};
use crate::flow::{Flow, FlowGraph};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{get, post, put},
    Router,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};

/// Request body for flow creation
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateFlowRequest {
    /// Generated when absent
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub project_id: String,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub graph: FlowGraph,
}

#[derive(Debug, Deserialize)]
pub struct RenameFlowRequest {
    pub name: String,
}

pub fn create_flow_routes() -> Router<AppState> {
    Router::new()
        .route("/api/flows", post(create_flow).get(list_flows))
        .route("/api/flows/{id}", get(get_flow).delete(delete_flow))
        .route("/api/flows/{id}/graph", put(update_graph))
        .route("/api/flows/{id}/name", put(rename_flow))
        .route("/api/flows/{id}/toggle", post(toggle_flow))
        .route("/api/flows/{id}/validate", get(validate_flow))
}

/// POST /api/flows
/// Body: { "name": "...", "enabled": false, "graph": { "nodes": [...], "edges": [...] } }
async fn create_flow(
    State(state): State<AppState>,
    Json(payload): Json<CreateFlowRequest>,
) -> Result<(StatusCode, Json<Value>), StatusCode> {
    if payload.name.trim().is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }

    let now = Utc::now();
    let flow = Flow {
        id: payload
            .id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
        project_id: payload.project_id,
        name: payload.name,
        enabled: payload.enabled,
        graph: payload.graph,
        version: 1,
        created_at: now,
        updated_at: now,
    };

    let flow = state.flows().insert(flow).map_err(|e| {
        tracing::warn!("❌ Failed to create flow: {}", e);
        status_for(&e)
    })?;
    state.sync_schedules(&flow).await;

    let warnings = flow.validate();
    tracing::info!("🔥 Created flow: {} ({}) with {} warnings", flow.id, flow.name, warnings.len());
    Ok((StatusCode::CREATED, Json(json!({ "flow": flow, "warnings": warnings }))))
}

/// GET /api/flows
async fn list_flows(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "flows": state.flows().list() }))
}

/// GET /api/flows/{id}
async fn get_flow(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<Flow>, StatusCode> {
    state.flows().get(&id).map(Json).ok_or(StatusCode::NOT_FOUND)
}

/// PUT /api/flows/{id}/graph
/// Body: { "nodes": [...], "edges": [...] }
async fn update_graph(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(graph): Json<FlowGraph>,
) -> Result<Json<Value>, StatusCode> {
    let flow = state
        .flows()
        .update_graph(&id, graph.nodes, graph.edges)
        .map_err(|e| status_for(&e))?;
    state.sync_schedules(&flow).await;

    let warnings = flow.validate();
    tracing::info!("🔄 Updated graph of flow {} (version {})", flow.id, flow.version);
    Ok(Json(json!({ "flow": flow, "warnings": warnings })))
}

/// PUT /api/flows/{id}/name
async fn rename_flow(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(payload): Json<RenameFlowRequest>,
) -> Result<Json<Flow>, StatusCode> {
    if payload.name.trim().is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }
    state
        .flows()
        .rename(&id, &payload.name)
        .map(Json)
        .map_err(|e| status_for(&e))
}

/// POST /api/flows/{id}/toggle
async fn toggle_flow(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<Flow>, StatusCode> {
    let flow = state.flows().toggle_enabled(&id).map_err(|e| status_for(&e))?;
    state.sync_schedules(&flow).await;
    tracing::info!("🔀 Flow {} is now {}", flow.id, if flow.enabled { "enabled" } else { "disabled" });
    Ok(Json(flow))
}

/// DELETE /api/flows/{id}
///
/// Recorded runs of the flow stay in history.
async fn delete_flow(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<Value>, StatusCode> {
    let flow = state.flows().remove(&id).map_err(|e| status_for(&e))?;
    state.drop_schedules(&flow.id).await;
    tracing::info!("🗑️ Deleted flow: {}", flow.id);
    Ok(Json(json!({
        "id": flow.id,
        "message": format!("Flow '{}' deleted successfully", flow.name),
    })))
}

/// GET /api/flows/{id}/validate
async fn validate_flow(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<Value>, StatusCode> {
    let flow = state.flows().get(&id).ok_or(StatusCode::NOT_FOUND)?;
    let issues = flow.validate();
    Ok(Json(json!({ "valid": issues.is_empty(), "issues": issues })))
}
