/// Background cron scheduler
///
/// Registers one tokio-cron-scheduler job per `schedule` trigger node of every
/// enabled flow. Flows are re-synced whenever they change, so schedules follow
/// edits without a restart. A job that fires for a flow that has since been
/// disabled or deleted does nothing.

use crate::flow::{Context, Flow, FlowNode};
use crate::run::TriggerSource;
use crate::runtime::engine::{RunController, RunRequest};
use anyhow::Result;
use chrono::Utc;
use serde_json::Value;
use std::{collections::HashMap, sync::Arc};
use tokio::sync::RwLock;
use tokio_cron_scheduler::{Job, JobScheduler};
use uuid::Uuid;

/// Trigger `nodeType` picked up by the scheduler
pub const SCHEDULE_TRIGGER: &str = "schedule";

pub struct CronScheduler {
    scheduler: Arc<RwLock<JobScheduler>>,
    /// `flow_id:node_id` → job id
    jobs: Arc<RwLock<HashMap<String, Uuid>>>,
    controller: Arc<RunController>,
}

impl CronScheduler {
    pub async fn new(controller: Arc<RunController>) -> Result<Self> {
        let scheduler = JobScheduler::new().await?;
        Ok(Self {
            scheduler: Arc::new(RwLock::new(scheduler)),
            jobs: Arc::new(RwLock::new(HashMap::new())),
            controller,
        })
    }

    /// Register every enabled flow's schedules and start ticking
    pub async fn start(&self) -> Result<()> {
        tracing::info!("⏰ Starting cron scheduler");

        let flows = self.controller.flows().list_enabled();
        let mut total = 0;
        for flow in &flows {
            total += self.sync_flow(flow).await?;
        }

        {
            let scheduler = self.scheduler.read().await;
            scheduler.start().await?;
        }

        tracing::info!("✅ Cron scheduler started with {} jobs from {} enabled flows", total, flows.len());
        Ok(())
    }

    pub async fn stop(&self) -> Result<()> {
        tracing::info!("⏹️ Stopping cron scheduler");
        self.jobs.write().await.clear();
        {
            let mut scheduler = self.scheduler.write().await;
            scheduler.shutdown().await?;
        }
        tracing::info!("✅ Cron scheduler stopped");
        Ok(())
    }

    /// Replace a flow's jobs with its current schedule triggers
    ///
    /// Disabled flows end up with no jobs. Returns the number registered;
    /// triggers with an unusable cron expression are logged and left out.
    pub async fn sync_flow(&self, flow: &Flow) -> Result<usize> {
        self.remove_flow(&flow.id).await;
        if !flow.enabled {
            return Ok(0);
        }

        let mut registered = 0;
        for node in flow.triggers_of_type(SCHEDULE_TRIGGER) {
            match self.add_job(&flow.id, node).await {
                Ok(()) => registered += 1,
                Err(e) => tracing::warn!("⚠️ Schedule '{}' of flow '{}' not registered: {}", node.id, flow.id, e),
            }
        }

        if registered > 0 {
            tracing::info!("🔥 Registered {} schedules for flow '{}'", registered, flow.id);
        }
        Ok(registered)
    }

    /// Drop every job belonging to a flow
    pub async fn remove_flow(&self, flow_id: &str) {
        let prefix = format!("{}:", flow_id);
        let mut jobs = self.jobs.write().await;
        let keys: Vec<String> = jobs.keys().filter(|key| key.starts_with(&prefix)).cloned().collect();

        for key in keys {
            if let Some(job_id) = jobs.remove(&key) {
                let scheduler = self.scheduler.read().await;
                match scheduler.remove(&job_id).await {
                    Ok(()) => tracing::debug!("🛑 Removed cron job {}", key),
                    Err(e) => tracing::warn!("⚠️ Failed to remove cron job {}: {}", key, e),
                }
            }
        }
    }

    /// Number of registered jobs
    pub async fn job_count(&self) -> usize {
        self.jobs.read().await.len()
    }

    async fn add_job(&self, flow_id: &str, node: &FlowNode) -> Result<()> {
        let raw = node
            .config_str("cron")
            .ok_or_else(|| anyhow::anyhow!("missing 'cron' expression"))?;
        let schedule = normalize_cron(raw);
        if let Some(tz) = node.config_str("timezone").filter(|tz| !tz.eq_ignore_ascii_case("utc")) {
            tracing::warn!("⚠️ Schedule '{}' asks for timezone {}; schedules run in UTC", node.id, tz);
        }

        let key = format!("{}:{}", flow_id, node.id);
        let flow_id = flow_id.to_string();
        let node_id = node.id.clone();
        let controller = Arc::clone(&self.controller);

        let job = Job::new_async(schedule.as_str(), move |_uuid, _lock| {
            let flow_id = flow_id.clone();
            let node_id = node_id.clone();
            let controller = Arc::clone(&controller);

            Box::pin(async move {
                tracing::debug!("🔔 Schedule '{}' fired for flow '{}'", node_id, flow_id);
                let Some(flow) = controller.flows().get(&flow_id).filter(|f| f.enabled) else {
                    tracing::debug!("⏭️ Flow '{}' is gone or disabled; skipping", flow_id);
                    return;
                };

                let mut payload = Context::new();
                payload.insert("triggerNodeId".to_string(), Value::String(node_id.clone()));
                payload.insert("scheduledAt".to_string(), Value::String(Utc::now().to_rfc3339()));

                let request = RunRequest::triggered(TriggerSource::Schedule, Some(payload));
                match controller.start_with(&flow, request).await {
                    Ok(handle) => tracing::info!("🚀 Scheduled run {} started for flow '{}'", handle.id(), flow_id),
                    Err(e) => tracing::error!("❌ Scheduled run for flow '{}' failed to start: {}", flow_id, e),
                }
            })
        })?;

        let job_id = {
            let scheduler = self.scheduler.write().await;
            scheduler.add(job).await?
        };
        self.jobs.write().await.insert(key.clone(), job_id);
        tracing::debug!("📝 Cron job {} registered ({})", key, schedule);
        Ok(())
    }
}

/// Accept the editor's five-field cron by adding a leading seconds field
pub fn normalize_cron(expr: &str) -> String {
    let expr = expr.trim();
    if expr.split_whitespace().count() == 5 {
        format!("0 {}", expr)
    } else {
        expr.to_string()
    }
}
