/// Webhook and task-event trigger endpoints
///
/// Both only start runs of enabled flows. A webhook targets one flow that has a
/// `webhook` trigger; a task event fans out to every enabled flow with a
/// trigger of the event's type.

use crate::api::{status_for, AppState};
use crate::flow::Context;
use crate::run::TriggerSource;
use crate::runtime::engine::RunRequest;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::post,
    Router,
};
use serde::Deserialize;
use serde_json::{json, Value};

/// Trigger `nodeType` matched by the webhook route
pub const WEBHOOK_TRIGGER: &str = "webhook";

/// Body of `POST /api/events`
#[derive(Debug, Deserialize)]
pub struct TaskEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub payload: Value,
}

pub fn create_trigger_routes() -> Router<AppState> {
    Router::new()
        .route("/webhook/{flow_id}", post(execute_webhook))
        .route("/api/events", post(publish_event))
}

/// Objects become the payload as-is; anything else is wrapped
fn into_payload(value: Value) -> Option<Context> {
    match value {
        Value::Null => None,
        Value::Object(map) => Some(map),
        other => {
            let mut map = Context::new();
            map.insert("body".to_string(), other);
            Some(map)
        }
    }
}

/// POST /webhook/{flow_id}
/// Body: JSON payload merged into the run's initial context
async fn execute_webhook(
    State(state): State<AppState>,
    Path(flow_id): Path<String>,
    body: String,
) -> Result<(StatusCode, Json<Value>), StatusCode> {
    tracing::info!("📥 Webhook request received for flow {}", flow_id);

    let payload: Value = if body.trim().is_empty() {
        Value::Null
    } else {
        serde_json::from_str(&body).map_err(|e| {
            tracing::warn!("❌ Invalid JSON payload for webhook {}: {}", flow_id, e);
            StatusCode::BAD_REQUEST
        })?
    };

    let flow = state.flows().get(&flow_id).ok_or_else(|| {
        tracing::warn!("❌ Webhook called for unknown flow: {}", flow_id);
        StatusCode::NOT_FOUND
    })?;
    if flow.triggers_of_type(WEBHOOK_TRIGGER).next().is_none() {
        tracing::warn!("❌ Flow {} has no webhook trigger", flow_id);
        return Err(StatusCode::NOT_FOUND);
    }
    if !flow.enabled {
        tracing::warn!("⏸️ Webhook ignored: flow {} is disabled", flow_id);
        return Err(StatusCode::CONFLICT);
    }

    let request = RunRequest::triggered(TriggerSource::Webhook, into_payload(payload));
    let handle = state
        .controller
        .start_with(&flow, request)
        .await
        .map_err(|e| status_for(&e))?;

    tracing::info!("🚀 Webhook started run {} for flow {}", handle.id(), flow_id);
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "runId": handle.id(), "flowId": flow_id, "status": handle.status() })),
    ))
}

/// POST /api/events
/// Body: { "type": "task_created", "payload": { "task": { ... } } }
async fn publish_event(
    State(state): State<AppState>,
    Json(event): Json<TaskEvent>,
) -> Result<(StatusCode, Json<Value>), StatusCode> {
    if event.event_type.trim().is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }
    let payload = into_payload(event.payload);

    let mut started = Vec::new();
    for flow in state.flows().list_enabled() {
        if flow.triggers_of_type(&event.event_type).next().is_none() {
            continue;
        }
        let request = RunRequest::triggered(TriggerSource::Event, payload.clone());
        match state.controller.start_with(&flow, request).await {
            Ok(handle) => started.push(json!({ "runId": handle.id(), "flowId": flow.id })),
            Err(e) => tracing::error!("❌ Event {} could not start flow {}: {}", event.event_type, flow.id, e),
        }
    }

    tracing::info!("📣 Event {} started {} runs", event.event_type, started.len());
    Ok((StatusCode::ACCEPTED, Json(json!({ "event": event.event_type, "runs": started }))))
}
