/// Server setup and initialization
///
/// Wires together all components: flow registry, run history, node executor,
/// run controller, cron scheduler and HTTP routes.

use crate::{
    api::{create_flow_routes, create_run_routes, create_trigger_routes, AppState},
    config::Config,
    flow::FlowRegistry,
    run::RunHistory,
    runtime::{
        actions::StandardActionDispatcher, engine::RunController, executor::NodeExecutor,
        scheduler::CronScheduler,
    },
};
use anyhow::Result;
use axum::{routing::get, Router};
use std::sync::Arc;
use tokio::net::TcpListener;

/// Build the engine components described by `config`
///
/// The scheduler is created but not started; `create_app` starts it.
pub async fn build_state(config: &Config) -> Result<AppState> {
    tracing::info!("📊 Initializing flow registry");
    let flows = Arc::new(FlowRegistry::new());
    if let Some(path) = &config.flows_file {
        let loaded = flows.load_from_file(path)?;
        tracing::info!("📥 Loaded {} flows from {}", loaded, path);
    }

    tracing::info!("⚙️ Initializing node executor (timeout: {:?})", config.engine.node_timeout());
    let dispatcher = StandardActionDispatcher::new(config.engine.http_timeout())?;
    let executor = NodeExecutor::new(Arc::new(dispatcher)).with_timeout(config.engine.node_timeout());

    tracing::info!("🚀 Initializing run controller (branch policy: {})", config.engine.branch_policy);
    let controller = Arc::new(
        RunController::new(Arc::new(executor), flows, Arc::new(RunHistory::new()))
            .with_branch_policy(config.engine.branch_policy),
    );

    let scheduler = if config.scheduler.enabled {
        tracing::info!("⏰ Initializing cron scheduler");
        let scheduler = CronScheduler::new(Arc::clone(&controller))
            .await
            .map_err(|e| anyhow::anyhow!("Failed to initialize cron scheduler: {}", e))?;
        Some(Arc::new(scheduler))
    } else {
        tracing::info!("⏸️ Cron scheduler disabled");
        None
    };

    Ok(AppState::new(controller, scheduler))
}

/// Assemble the router over an existing state
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(health_check))
        .merge(create_flow_routes())
        .merge(create_run_routes())
        .merge(create_trigger_routes())
        .with_state(state)
}

/// Create the main Axum application with all routes
pub async fn create_app(config: Config) -> Result<Router> {
    let state = build_state(&config).await?;

    if let Some(scheduler) = state.scheduler.clone() {
        tracing::info!("🚀 Starting cron scheduler");
        tokio::spawn(async move {
            if let Err(e) = scheduler.start().await {
                tracing::error!("❌ Failed to start cron scheduler: {}", e);
            }
        });
    }

    tracing::info!("📡 Creating HTTP router with all endpoints");
    let app = router(state);
    tracing::info!("✅ Application initialized successfully");
    Ok(app)
}

/// Start the HTTP server with the given configuration
pub async fn start_server(config: Config) -> Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_thread_ids(true)
        .with_level(true)
        .init();

    tracing::info!("Starting Flowline server...");

    let app = create_app(config.clone()).await?;

    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&bind_addr).await?;

    tracing::info!("Server listening on http://{}", bind_addr);

    axum::serve(listener, app.into_make_service()).await?;

    Ok(())
}

async fn health_check() -> &'static str {
    "ok"
}
