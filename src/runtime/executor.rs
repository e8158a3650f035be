/// Node execution handlers
///
/// Dispatch is a table keyed by `NodeKind`:
/// - trigger: always succeeds, stamps the trigger id/type and time
/// - condition: asks the `ConditionEvaluator` for a boolean
/// - action: validates config and hands it to the `ActionDispatcher`
/// - anything else: pass-through
///
/// A node failure is always returned as `Err(NodeError)`, never raised.

use crate::error::NodeError;
use crate::flow::types::{Context, FlowNode, NodeKind};
use crate::runtime::actions::{ActionContext, ActionDispatcher, ActionRequest};
use crate::runtime::condition::{ConditionEvaluator, RuleEvaluator};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use std::{collections::HashMap, fmt, sync::Arc, time::Duration};

/// Everything a handler may look at for one node visit
#[derive(Debug, Clone, Copy)]
pub struct NodeInvocation<'a> {
    pub run_id: &'a str,
    pub flow_id: &'a str,
    pub node: &'a FlowNode,
    /// Merged context produced by the nodes before this one
    pub input: &'a Context,
}

impl NodeInvocation<'_> {
    pub fn test_mode(&self) -> bool {
        self.input
            .get("testMode")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}

/// Execution behaviour for one node kind
#[async_trait]
pub trait NodeHandler: Send + Sync {
    async fn execute(&self, call: &NodeInvocation<'_>) -> Result<Context, NodeError>;
}

fn object(value: Value) -> Context {
    match value {
        Value::Object(map) => map,
        _ => Context::new(),
    }
}

pub struct TriggerHandler;

#[async_trait]
impl NodeHandler for TriggerHandler {
    async fn execute(&self, call: &NodeInvocation<'_>) -> Result<Context, NodeError> {
        Ok(object(json!({
            "triggerId": call.node.id,
            "triggerType": call.node.node_type(),
            "timestamp": Utc::now().to_rfc3339(),
        })))
    }
}

pub struct ConditionHandler {
    evaluator: Arc<dyn ConditionEvaluator>,
}

impl ConditionHandler {
    pub fn new(evaluator: Arc<dyn ConditionEvaluator>) -> Self {
        Self { evaluator }
    }
}

#[async_trait]
impl NodeHandler for ConditionHandler {
    async fn execute(&self, call: &NodeInvocation<'_>) -> Result<Context, NodeError> {
        // Evaluation may run a script; keep it off the async workers so the
        // node timeout and cancellation can still fire
        let evaluator = Arc::clone(&self.evaluator);
        let node = call.node.clone();
        let input = call.input.clone();
        let met = tokio::task::spawn_blocking(move || evaluator.evaluate(&node, &input))
            .await
            .map_err(|e| NodeError::Condition {
                node: call.node.id.clone(),
                reason: format!("evaluation aborted: {}", e),
            })??;
        tracing::debug!("🔀 Condition '{}' evaluated to {}", call.node.id, met);
        Ok(object(json!({
            "conditionMet": met,
            "branch": if met { "true" } else { "false" },
        })))
    }
}

pub struct ActionHandler {
    dispatcher: Arc<dyn ActionDispatcher>,
}

impl ActionHandler {
    pub fn new(dispatcher: Arc<dyn ActionDispatcher>) -> Self {
        Self { dispatcher }
    }
}

#[async_trait]
impl NodeHandler for ActionHandler {
    async fn execute(&self, call: &NodeInvocation<'_>) -> Result<Context, NodeError> {
        let request = ActionRequest::from_node(call.node, call.input)?;
        let ctx = ActionContext {
            run_id: call.run_id,
            flow_id: call.flow_id,
            node: call.node,
            test_mode: call.test_mode(),
            input: call.input,
        };

        let result = self
            .dispatcher
            .dispatch(&request, &ctx)
            .await
            .map_err(|e| NodeError::Action(e.to_string()))?;

        Ok(object(json!({
            "actionType": call.node.node_type(),
            "result": result,
            "processedAt": Utc::now().to_rfc3339(),
        })))
    }
}

/// Integration, end and unrecognised nodes
pub struct PassThroughHandler;

#[async_trait]
impl NodeHandler for PassThroughHandler {
    async fn execute(&self, call: &NodeInvocation<'_>) -> Result<Context, NodeError> {
        let node_type = match call.node.node_type() {
            "" => call.node.kind.as_str(),
            other => other,
        };
        Ok(object(json!({ "nodeType": node_type, "processed": true })))
    }
}

/// Node executor that dispatches to the handler registered for a node's kind
pub struct NodeExecutor {
    handlers: HashMap<NodeKind, Arc<dyn NodeHandler>>,
    fallback: Arc<dyn NodeHandler>,
    timeout: Option<Duration>,
}

impl fmt::Debug for NodeExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut kinds: Vec<&str> = self.handlers.keys().map(NodeKind::as_str).collect();
        kinds.sort_unstable();
        f.debug_struct("NodeExecutor")
            .field("handlers", &kinds)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl NodeExecutor {
    /// Standard table: trigger, condition (rule evaluator), action (given dispatcher)
    pub fn new(dispatcher: Arc<dyn ActionDispatcher>) -> Self {
        let mut handlers: HashMap<NodeKind, Arc<dyn NodeHandler>> = HashMap::new();
        handlers.insert(NodeKind::Trigger, Arc::new(TriggerHandler));
        handlers.insert(
            NodeKind::Condition,
            Arc::new(ConditionHandler::new(Arc::new(RuleEvaluator))),
        );
        handlers.insert(NodeKind::Action, Arc::new(ActionHandler::new(dispatcher)));

        Self {
            handlers,
            fallback: Arc::new(PassThroughHandler),
            timeout: None,
        }
    }

    pub fn with_condition_evaluator(self, evaluator: Arc<dyn ConditionEvaluator>) -> Self {
        self.with_handler(NodeKind::Condition, Arc::new(ConditionHandler::new(evaluator)))
    }

    /// Replace the handler for one kind
    pub fn with_handler(mut self, kind: NodeKind, handler: Arc<dyn NodeHandler>) -> Self {
        self.handlers.insert(kind, handler);
        self
    }

    /// Bound every node execution; `None` disables the limit
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Execute a single node
    pub async fn execute(&self, call: &NodeInvocation<'_>) -> Result<Context, NodeError> {
        let node = call.node;
        tracing::info!("🚀 Executing node '{}' ({} / {}) in run {}", node.id, node.kind.as_str(), node.node_type(), call.run_id);
        let start_time = std::time::Instant::now();

        let handler = self.handlers.get(&node.kind).unwrap_or(&self.fallback);
        let result = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, handler.execute(call))
                .await
                .unwrap_or_else(|_| {
                    Err(NodeError::Timeout {
                        node: node.id.clone(),
                        secs: limit.as_secs(),
                    })
                }),
            None => handler.execute(call).await,
        };

        let duration = start_time.elapsed();
        match &result {
            Ok(output) => {
                tracing::info!("✅ Node '{}' completed in {:?}", node.id, duration);
                let rendered = serde_json::to_string(output).unwrap_or_default();
                tracing::debug!("📤 Output: {}", rendered);
            }
            Err(e) => {
                tracing::error!("❌ Node '{}' failed in {:?}: {}", node.id, duration, e);
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::actions::StandardActionDispatcher;

    struct Failing;

    #[async_trait]
    impl ActionDispatcher for Failing {
        async fn dispatch(&self, _: &ActionRequest, _: &ActionContext<'_>) -> anyhow::Result<Value> {
            Err(anyhow::anyhow!("boom"))
        }
    }

    struct Slow;

    #[async_trait]
    impl NodeHandler for Slow {
        async fn execute(&self, _: &NodeInvocation<'_>) -> Result<Context, NodeError> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(Context::new())
        }
    }

    fn standard() -> NodeExecutor {
        NodeExecutor::new(Arc::new(StandardActionDispatcher::new(Duration::from_secs(5)).unwrap()))
    }

    async fn run(executor: &NodeExecutor, node: &FlowNode, input: &Context) -> Result<Context, NodeError> {
        executor
            .execute(&NodeInvocation {
                run_id: "r1",
                flow_id: "f1",
                node,
                input,
            })
            .await
    }

    #[tokio::test]
    async fn trigger_reports_id_and_type() {
        let node = FlowNode::new("t1", NodeKind::Trigger, "task_created");
        let output = run(&standard(), &node, &Context::new()).await.unwrap();
        assert_eq!(output["triggerId"], "t1");
        assert_eq!(output["triggerType"], "task_created");
        assert!(output.contains_key("timestamp"));
    }

    #[tokio::test]
    async fn condition_reports_branch() {
        let node = FlowNode::new("c", NodeKind::Condition, "if_else")
            .with_config("expression", json!("testMode"));
        let input = object(json!({"testMode": true}));
        let output = run(&standard(), &node, &input).await.unwrap();
        assert_eq!(output["conditionMet"], true);
        assert_eq!(output["branch"], "true");
    }

    #[tokio::test]
    async fn action_output_wraps_dispatcher_result() {
        let node = FlowNode::new("a", NodeKind::Action, "slack_message")
            .with_config("channel", json!("#ops"))
            .with_config("message", json!("deployed"));
        let output = run(&standard(), &node, &Context::new()).await.unwrap();
        assert_eq!(output["actionType"], "slack_message");
        assert_eq!(output["result"], "Message queued for #ops");
        assert!(output.contains_key("processedAt"));
    }

    #[tokio::test]
    async fn dispatcher_failure_keeps_message() {
        let executor = NodeExecutor::new(Arc::new(Failing));
        let node = FlowNode::new("a", NodeKind::Action, "print_label");
        let err = run(&executor, &node, &Context::new()).await.unwrap_err();
        assert_eq!(err.to_string(), "boom");
    }

    #[tokio::test]
    async fn misconfigured_action_fails_without_dispatch() {
        let executor = NodeExecutor::new(Arc::new(Failing));
        let node = FlowNode::new("a", NodeKind::Action, "send_email");
        let err = run(&executor, &node, &Context::new()).await.unwrap_err();
        assert!(matches!(err, NodeError::MissingConfig { .. }));
    }

    #[tokio::test]
    async fn other_kinds_pass_through() {
        let executor = standard();
        let end = FlowNode::new("e", NodeKind::End, "");
        let output = run(&executor, &end, &Context::new()).await.unwrap();
        assert_eq!(output["nodeType"], "end");
        assert_eq!(output["processed"], true);

        let odd = FlowNode::new("x", NodeKind::Unknown, "sticky_note");
        assert_eq!(run(&executor, &odd, &Context::new()).await.unwrap()["nodeType"], "sticky_note");
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_turns_into_node_error() {
        let executor = standard()
            .with_handler(NodeKind::Integration, Arc::new(Slow))
            .with_timeout(Some(Duration::from_secs(2)));
        let node = FlowNode::new("slow", NodeKind::Integration, "crm_sync");
        let err = run(&executor, &node, &Context::new()).await.unwrap_err();
        assert_eq!(err, NodeError::Timeout { node: "slow".into(), secs: 2 });
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn looping_condition_hits_the_node_timeout() {
        let executor = standard().with_timeout(Some(Duration::from_secs(1)));
        let node = FlowNode::new("c", NodeKind::Condition, "if_else")
            .with_config("expression", json!("(function() while true do end end)()"));
        let started = std::time::Instant::now();
        let err = run(&executor, &node, &Context::new()).await.unwrap_err();
        assert_eq!(err, NodeError::Timeout { node: "c".into(), secs: 1 });
        assert!(started.elapsed() < Duration::from_secs(2));
    }
}
