/// Run and step records
///
/// A `FlowRun` is one execution of a flow; each node gets an `ExecutionStep`.
/// Both serialize losslessly so a caller can persist or ship them as JSON.

use crate::flow::types::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Lifecycle state of a run
///
/// `pending` is the only entry state, `running` the only active one. The other
/// three are terminal: once reached, nothing about the run changes again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Pending,
    Running,
    Success,
    Failed,
    Canceled,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Success | RunStatus::Failed | RunStatus::Canceled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pending,
    Running,
    Success,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, StepStatus::Success | StepStatus::Failed | StepStatus::Skipped)
    }
}

/// What caused a run to start
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerSource {
    Manual,
    Schedule,
    Webhook,
    Event,
}

impl TriggerSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerSource::Manual => "manual",
            TriggerSource::Schedule => "schedule",
            TriggerSource::Webhook => "webhook",
            TriggerSource::Event => "event",
        }
    }
}

/// One node's record within a run
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionStep {
    pub node_id: String,
    /// Label at run start; later renames do not rewrite history
    pub node_name: String,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    /// Context snapshot handed to the node
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Context>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Context>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ExecutionStep {
    pub fn pending(node_id: impl Into<String>, node_name: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            node_name: node_name.into(),
            status: StepStatus::Pending,
            start_time: None,
            end_time: None,
            input: None,
            output: None,
            error: None,
        }
    }

    /// Wall time between start and end, once both are known
    pub fn duration_ms(&self) -> Option<i64> {
        match (self.start_time, self.end_time) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds()),
            _ => None,
        }
    }
}

/// A single execution instance of a flow
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FlowRun {
    /// Unique per execution
    pub id: String,
    pub flow_id: String,
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// Initial context, e.g. `{"testMode": true}`
    #[serde(default)]
    pub input: Context,
    /// Final merged context, set on success
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Context>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Starts at 1, incremented only by retry
    pub attempts: u32,
}

impl FlowRun {
    /// Fresh pending run for a flow
    pub fn new(flow_id: impl Into<String>, test_mode: bool) -> Self {
        let mut input = Context::new();
        input.insert("testMode".to_string(), Value::Bool(test_mode));
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            flow_id: flow_id.into(),
            status: RunStatus::Pending,
            started_at: None,
            finished_at: None,
            input,
            output: None,
            error: None,
            attempts: 1,
        }
    }

    pub fn test_mode(&self) -> bool {
        self.input
            .get("testMode")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// Derive the next attempt of this run
    ///
    /// The result is a new pending run: fresh id and `startedAt`, same flow and
    /// input, `attempts + 1`, no outcome. Nothing is executed here.
    pub fn retry(&self) -> FlowRun {
        FlowRun {
            id: uuid::Uuid::new_v4().to_string(),
            flow_id: self.flow_id.clone(),
            status: RunStatus::Pending,
            started_at: Some(Utc::now()),
            finished_at: None,
            input: self.input.clone(),
            output: None,
            error: None,
            attempts: self.attempts + 1,
        }
    }

    pub fn duration_ms(&self) -> Option<i64> {
        match (self.started_at, self.finished_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds()),
            _ => None,
        }
    }
}

/// A run together with its step trace
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RunSnapshot {
    pub run: FlowRun,
    pub steps: Vec<ExecutionStep>,
}

impl RunSnapshot {
    /// Percentage of steps in a terminal state, 0 when there are no steps
    pub fn progress(&self) -> f64 {
        if self.steps.is_empty() {
            return 0.0;
        }
        let done = self.steps.iter().filter(|s| s.status.is_terminal()).count();
        done as f64 / self.steps.len() as f64 * 100.0
    }

    pub fn step(&self, node_id: &str) -> Option<&ExecutionStep> {
        self.steps.iter().find(|s| s.node_id == node_id)
    }

    pub(crate) fn step_mut(&mut self, node_id: &str) -> Option<&mut ExecutionStep> {
        self.steps.iter_mut().find(|s| s.node_id == node_id)
    }
}
