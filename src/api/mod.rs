/// HTTP API Layer
///
/// REST endpoints over the engine:
/// - Flow definition management
/// - Starting, inspecting, canceling and retrying runs
/// - Webhook and task-event triggers for enabled flows

use crate::error::EngineError;
use crate::flow::{Flow, FlowRepository};
use crate::runtime::{engine::RunController, scheduler::CronScheduler};
use axum::http::StatusCode;
use std::sync::Arc;

// Flow management endpoints
pub mod flows;

// Run lifecycle endpoints
pub mod runs;

// Webhook and event trigger endpoints
pub mod webhooks;

// Re-export router builders
pub use flows::create_flow_routes;
pub use runs::create_run_routes;
pub use webhooks::create_trigger_routes;

/// Shared state for every route
#[derive(Clone)]
pub struct AppState {
    pub controller: Arc<RunController>,
    /// Absent when background scheduling is switched off
    pub scheduler: Option<Arc<CronScheduler>>,
}

impl AppState {
    pub fn new(controller: Arc<RunController>, scheduler: Option<Arc<CronScheduler>>) -> Self {
        Self {
            controller,
            scheduler,
        }
    }

    pub fn flows(&self) -> &Arc<dyn FlowRepository> {
        self.controller.flows()
    }

    /// Bring the scheduler in line with a changed flow
    pub(crate) async fn sync_schedules(&self, flow: &Flow) {
        if let Some(scheduler) = &self.scheduler {
            if let Err(e) = scheduler.sync_flow(flow).await {
                tracing::error!("❌ Failed to sync schedules for flow '{}': {}", flow.id, e);
            }
        }
    }

    pub(crate) async fn drop_schedules(&self, flow_id: &str) {
        if let Some(scheduler) = &self.scheduler {
            scheduler.remove_flow(flow_id).await;
        }
    }
}

/// HTTP status for an engine error
pub(crate) fn status_for(err: &EngineError) -> StatusCode {
    match err {
        EngineError::FlowNotFound(_) | EngineError::RunNotFound(_) => StatusCode::NOT_FOUND,
        EngineError::FlowExists(_) | EngineError::RunExists(_) | EngineError::RunInProgress(_) => {
            StatusCode::CONFLICT
        }
        EngineError::EmptyFlow(_) | EngineError::RunNotPending(_) | EngineError::RunNotFailed(_) => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
    }
}
