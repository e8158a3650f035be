/// Action requests and the external action dispatcher
///
/// Action nodes are the only nodes that reach outside the engine. Their opaque
/// config is validated here into a typed [`ActionRequest`]; performing the side
/// effect is the job of a pluggable [`ActionDispatcher`]. The engine calls the
/// dispatcher at most once per node visit and never retries on its own.

use crate::error::NodeError;
use crate::flow::types::{Context, FlowNode};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::{collections::HashMap, sync::RwLock, time::Duration};

const TASK_STATUSES: [&str; 4] = ["todo", "in-progress", "review", "done"];
const TASK_PRIORITIES: [&str; 4] = ["low", "medium", "high", "urgent"];
const HTTP_METHODS: [&str; 5] = ["GET", "POST", "PUT", "DELETE", "PATCH"];

/// A validated side effect requested by an action node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ActionRequest {
    CreateTask {
        title: String,
        status: String,
        priority: String,
    },
    UpdateTask {
        task_id: String,
        title: Option<String>,
        status: Option<String>,
        priority: Option<String>,
    },
    SendEmail {
        to: String,
        subject: String,
        body: String,
    },
    SlackMessage {
        channel: String,
        message: String,
    },
    HttpRequest {
        url: String,
        method: String,
        headers: HashMap<String, String>,
        body: Option<Value>,
    },
    Delay {
        #[serde(with = "duration_secs")]
        duration: Duration,
    },
    /// An action type this engine has no schema for; the dispatcher decides
    Custom {
        node_type: String,
        config: Map<String, Value>,
    },
}

impl ActionRequest {
    /// Validate an action node's config against the current context
    pub fn from_node(node: &FlowNode, context: &Context) -> Result<Self, NodeError> {
        let required = |key: &str| -> Result<String, NodeError> {
            node.config_str(key)
                .map(str::to_string)
                .ok_or_else(|| NodeError::missing(&node.id, key))
        };
        let one_of = |key: &str, allowed: &[&str], default: Option<&str>| -> Result<Option<String>, NodeError> {
            match node.config_str(key).or(default) {
                Some(value) if allowed.iter().any(|a| *a == value) => Ok(Some(value.to_string())),
                Some(value) => Err(NodeError::invalid(
                    &node.id,
                    key,
                    format!("'{}' is not one of {}", value, allowed.join(", ")),
                )),
                None => Ok(None),
            }
        };

        let request = match node.node_type() {
            "create_task" => ActionRequest::CreateTask {
                title: required("taskTitle")?,
                status: one_of("status", &TASK_STATUSES, Some("todo"))?.unwrap_or_default(),
                priority: one_of("priority", &TASK_PRIORITIES, Some("medium"))?.unwrap_or_default(),
            },
            "update_task" => {
                let task_id = node
                    .config_str("taskId")
                    .map(str::to_string)
                    .or_else(|| task_id_from_context(context))
                    .ok_or_else(|| NodeError::missing(&node.id, "taskId"))?;
                ActionRequest::UpdateTask {
                    task_id,
                    title: node.config_str("taskTitle").map(str::to_string),
                    status: one_of("status", &TASK_STATUSES, None)?,
                    priority: one_of("priority", &TASK_PRIORITIES, None)?,
                }
            }
            "send_email" => ActionRequest::SendEmail {
                to: required("to")?,
                subject: required("subject")?,
                body: node.config_str("body").unwrap_or_default().to_string(),
            },
            "slack_message" => ActionRequest::SlackMessage {
                channel: required("channel")?,
                message: required("message")?,
            },
            "http_request" => {
                let url = required("url")?;
                let method = node.config_str("method").unwrap_or("POST").to_uppercase();
                if !HTTP_METHODS.contains(&method.as_str()) {
                    return Err(NodeError::invalid(
                        &node.id,
                        "method",
                        format!("unsupported HTTP method '{}'", method),
                    ));
                }
                let headers = match node.config().get("headers") {
                    None | Some(Value::Null) => HashMap::new(),
                    Some(Value::Object(map)) => map
                        .iter()
                        .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                        .collect(),
                    Some(_) => {
                        return Err(NodeError::invalid(&node.id, "headers", "expected an object"));
                    }
                };
                let body = match node.config().get("body") {
                    Some(Value::Null) | None if matches!(method.as_str(), "POST" | "PUT" | "PATCH") => {
                        Some(Value::Object(context.clone()))
                    }
                    Some(Value::Null) | None => None,
                    Some(body) => Some(body.clone()),
                };
                ActionRequest::HttpRequest {
                    url,
                    method,
                    headers,
                    body,
                }
            }
            "delay" => ActionRequest::Delay {
                duration: parse_delay(node)?,
            },
            other => ActionRequest::Custom {
                node_type: other.to_string(),
                config: node.config().clone(),
            },
        };
        Ok(request)
    }
}

/// `task.id` or `taskId` from an upstream trigger payload
fn task_id_from_context(context: &Context) -> Option<String> {
    let value = context
        .get("taskId")
        .or_else(|| context.get("task").and_then(|t| t.get("id")))?;
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn parse_delay(node: &FlowNode) -> Result<Duration, NodeError> {
    let amount = match node.config().get("duration") {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) if !s.trim().is_empty() => s.trim().parse::<f64>().ok(),
        Some(Value::String(_)) | Some(Value::Null) | None => {
            return Err(NodeError::missing(&node.id, "duration"));
        }
        Some(_) => None,
    }
    .filter(|n| n.is_finite() && *n >= 0.0)
    .ok_or_else(|| NodeError::invalid(&node.id, "duration", "expected a non-negative number"))?;

    let unit_secs = match node.config_str("unit").unwrap_or("minutes") {
        "seconds" => 1.0,
        "minutes" => 60.0,
        "hours" => 3_600.0,
        "days" => 86_400.0,
        other => {
            return Err(NodeError::invalid(
                &node.id,
                "unit",
                format!("'{}' is not one of seconds, minutes, hours, days", other),
            ));
        }
    };
    Duration::try_from_secs_f64(amount * unit_secs)
        .map_err(|e| NodeError::invalid(&node.id, "duration", e.to_string()))
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(duration.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

/// Who is asking for the side effect
#[derive(Debug, Clone)]
pub struct ActionContext<'a> {
    pub run_id: &'a str,
    pub flow_id: &'a str,
    pub node: &'a FlowNode,
    pub test_mode: bool,
    pub input: &'a Context,
}

/// Performs the side effect named by an action node
///
/// Returns a description of what happened (becomes `result` in the node
/// output) or an error whose message becomes the node's failure text.
/// Transient/permanent classification and any retry policy belong here, not in
/// the engine.
#[async_trait]
pub trait ActionDispatcher: Send + Sync {
    async fn dispatch(&self, request: &ActionRequest, ctx: &ActionContext<'_>) -> Result<Value>;
}

/// A side effect the standard dispatcher has no real provider for
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Delivery {
    pub run_id: String,
    pub flow_id: String,
    pub node_id: String,
    pub request: ActionRequest,
    pub test_mode: bool,
    pub at: DateTime<Utc>,
}

/// In-memory sink for email, Slack, task and custom actions
#[derive(Debug, Default)]
pub struct Outbox {
    deliveries: RwLock<Vec<Delivery>>,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, delivery: Delivery) -> Result<()> {
        self.deliveries
            .write()
            .map_err(|_| anyhow::anyhow!("outbox lock poisoned"))?
            .push(delivery);
        Ok(())
    }

    pub fn deliveries(&self) -> Vec<Delivery> {
        self.deliveries
            .read()
            .map(|d| d.clone())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.deliveries.read().map(|d| d.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Default dispatcher: real HTTP and delays, everything else to the outbox
#[derive(Debug)]
pub struct StandardActionDispatcher {
    client: reqwest::Client,
    outbox: std::sync::Arc<Outbox>,
}

impl StandardActionDispatcher {
    pub fn new(http_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(http_timeout)
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build HTTP client: {}", e))?;
        Ok(Self {
            client,
            outbox: std::sync::Arc::new(Outbox::new()),
        })
    }

    pub fn outbox(&self) -> std::sync::Arc<Outbox> {
        std::sync::Arc::clone(&self.outbox)
    }

    fn record(&self, request: &ActionRequest, ctx: &ActionContext<'_>) -> Result<()> {
        self.outbox.push(Delivery {
            run_id: ctx.run_id.to_string(),
            flow_id: ctx.flow_id.to_string(),
            node_id: ctx.node.id.clone(),
            request: request.clone(),
            test_mode: ctx.test_mode,
            at: Utc::now(),
        })
    }

    async fn send_http(
        &self,
        url: &str,
        method: &str,
        headers: &HashMap<String, String>,
        body: Option<&Value>,
    ) -> Result<Value> {
        tracing::debug!("🌍 HTTP Request: {} {}", method, url);

        let mut request_builder = match method {
            "GET" => self.client.get(url),
            "POST" => self.client.post(url),
            "PUT" => self.client.put(url),
            "DELETE" => self.client.delete(url),
            "PATCH" => self.client.patch(url),
            _ => return Err(anyhow::anyhow!("Unsupported HTTP method: {}", method)),
        };
        for (key, value) in headers {
            request_builder = request_builder.header(key.as_str(), value.as_str());
        }
        if let Some(body) = body {
            request_builder = match body {
                Value::String(text) => request_builder
                    .header("Content-Type", "text/plain")
                    .body(text.clone()),
                other => request_builder.json(other),
            };
        }

        let response = request_builder
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("HTTP request failed: {}", e))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to read response body: {}", e))?;

        if !status.is_success() {
            return Err(anyhow::anyhow!("HTTP {} {} returned {}", method, url, status));
        }

        let data = serde_json::from_str::<Value>(&text).unwrap_or(Value::String(text));
        tracing::info!("✅ HTTP request completed: {} {} (status: {})", method, url, status);
        Ok(json!({ "status": status.as_u16(), "data": data }))
    }
}

#[async_trait]
impl ActionDispatcher for StandardActionDispatcher {
    async fn dispatch(&self, request: &ActionRequest, ctx: &ActionContext<'_>) -> Result<Value> {
        match request {
            ActionRequest::HttpRequest {
                url,
                method,
                headers,
                body,
            } => self.send_http(url, method, headers, body.as_ref()).await,
            ActionRequest::Delay { duration } => {
                if ctx.test_mode {
                    tracing::debug!("⏭️ Test run: not waiting {:?} at node {}", duration, ctx.node.id);
                    return Ok(json!(format!("Delay of {}s skipped in test mode", duration.as_secs_f64())));
                }
                tokio::time::sleep(*duration).await;
                Ok(json!(format!("Waited {}s", duration.as_secs_f64())))
            }
            ActionRequest::CreateTask { title, .. } => {
                self.record(request, ctx)?;
                let task_id = uuid::Uuid::new_v4().to_string();
                Ok(json!({ "taskId": task_id, "summary": format!("Created task '{}'", title) }))
            }
            ActionRequest::UpdateTask { task_id, .. } => {
                self.record(request, ctx)?;
                Ok(json!(format!("Updated task {}", task_id)))
            }
            ActionRequest::SendEmail { to, .. } => {
                self.record(request, ctx)?;
                Ok(json!(format!("Email queued for {}", to)))
            }
            ActionRequest::SlackMessage { channel, .. } => {
                self.record(request, ctx)?;
                Ok(json!(format!("Message queued for {}", channel)))
            }
            ActionRequest::Custom { node_type, .. } => {
                self.record(request, ctx)?;
                Ok(json!(format!("Action {} ({}) recorded", ctx.node.label(), node_type)))
            }
        }
    }
}
