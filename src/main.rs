/// Flowline: trigger/condition/action flow engine
///
/// Main entry point. Reads configuration from the environment (refusing to
/// start on a malformed value) and serves:
/// - Flow management at /api/flows/*
/// - Run control at /api/runs/*
/// - Webhook triggers at /webhook/{flow_id} and task events at /api/events
/// - Health check at /healthz

use flowline::{config::Config, server::start_server};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env()?;
    start_server(config).await
}
