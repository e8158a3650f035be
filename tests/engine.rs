use async_trait::async_trait;
use flowline::flow::{FlowEdge, FlowNode, FlowRegistry, FlowRepository, NodeKind};
use flowline::run::{RunHistory, RunRepository, RunStatus, StepStatus};
use flowline::runtime::{ActionContext, ActionDispatcher, ActionRequest, BranchPolicy, NodeExecutor, RunController};
use flowline::{resolve_order, EngineError, Flow, RunSnapshot};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

/// Dispatcher that succeeds unless told to fail or hang at a node
#[derive(Default)]
struct Scripted {
    failures: HashMap<String, String>,
    hang_at: Option<String>,
    gate: Notify,
    calls: Mutex<Vec<String>>,
}

impl Scripted {
    fn failing(node_id: &str, message: &str) -> Self {
        let mut failures = HashMap::new();
        failures.insert(node_id.to_string(), message.to_string());
        Self {
            failures,
            ..Default::default()
        }
    }

    fn hanging(node_id: &str) -> Self {
        Self {
            hang_at: Some(node_id.to_string()),
            ..Default::default()
        }
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ActionDispatcher for Scripted {
    async fn dispatch(&self, _request: &ActionRequest, ctx: &ActionContext<'_>) -> anyhow::Result<Value> {
        let node_id = ctx.node.id.clone();
        self.calls.lock().unwrap().push(node_id.clone());
        if self.hang_at.as_deref() == Some(node_id.as_str()) {
            self.gate.notified().await;
        }
        match self.failures.get(&node_id) {
            Some(message) => Err(anyhow::anyhow!("{}", message)),
            None => Ok(json!(format!("did {}", node_id))),
        }
    }
}

struct Harness {
    controller: RunController,
    dispatcher: Arc<Scripted>,
    flows: Arc<FlowRegistry>,
    history: Arc<RunHistory>,
}

fn harness(dispatcher: Scripted, policy: BranchPolicy) -> Harness {
    let dispatcher = Arc::new(dispatcher);
    let flows = Arc::new(FlowRegistry::new());
    let history = Arc::new(RunHistory::new());
    let executor = NodeExecutor::new(Arc::clone(&dispatcher) as Arc<dyn ActionDispatcher>);
    let controller = RunController::new(
        Arc::new(executor),
        Arc::clone(&flows) as Arc<dyn FlowRepository>,
        Arc::clone(&history) as Arc<dyn RunRepository>,
    )
    .with_branch_policy(policy);
    Harness {
        controller,
        dispatcher,
        flows,
        history,
    }
}

fn action(id: &str) -> FlowNode {
    FlowNode::new(id, NodeKind::Action, "log_entry").with_label(format!("Action {}", id))
}

fn trigger(id: &str) -> FlowNode {
    FlowNode::new(id, NodeKind::Trigger, "manual").with_label("Start")
}

fn chain(ids: &[&str]) -> Flow {
    let mut nodes = vec![trigger(ids[0])];
    nodes.extend(ids[1..].iter().map(|id| action(id)));
    let edges = ids.windows(2).map(|w| FlowEdge::new(w[0], w[1])).collect();
    Flow::new("f1", "chain").with_graph(nodes, edges)
}

fn statuses(snapshot: &RunSnapshot) -> Vec<StepStatus> {
    snapshot.steps.iter().map(|s| s.status).collect()
}

#[tokio::test]
async fn linear_flow_succeeds_with_merged_output() {
    let h = harness(Scripted::default(), BranchPolicy::FullTraversal);
    let flow = chain(&["t", "a1", "a2"]);

    let snapshot = h.controller.execute(&flow, true).await.unwrap();

    assert_eq!(snapshot.run.status, RunStatus::Success);
    assert_eq!(snapshot.run.attempts, 1);
    assert_eq!(statuses(&snapshot), vec![StepStatus::Success; 3]);
    assert!(snapshot.run.finished_at.is_some());
    assert!(snapshot.run.error.is_none());

    let output = snapshot.run.output.as_ref().unwrap();
    assert_eq!(output["testMode"], true);
    assert_eq!(output["trigger"], "manual");
    assert_eq!(output["triggerId"], "t");
    // later nodes win on key conflicts
    assert_eq!(output["result"], "did a2");
    assert_eq!(snapshot.progress(), 100.0);

    assert_eq!(snapshot.steps[1].node_name, "Action a1");
    assert_eq!(snapshot.steps[1].input.as_ref().unwrap()["triggerType"], "manual");
}

#[tokio::test]
async fn steps_run_strictly_one_after_another() {
    let h = harness(Scripted::default(), BranchPolicy::FullTraversal);
    let snapshot = h.controller.execute(&chain(&["t", "a", "b", "c"]), false).await.unwrap();

    for pair in snapshot.steps.windows(2) {
        let previous_end = pair[0].end_time.unwrap();
        let next_start = pair[1].start_time.unwrap();
        assert!(next_start >= previous_end);
    }
}

#[tokio::test]
async fn failure_stops_the_run_at_the_failing_node() {
    let h = harness(Scripted::failing("a2", "boom"), BranchPolicy::FullTraversal);
    let snapshot = h.controller.execute(&chain(&["t", "a1", "a2"]), false).await.unwrap();

    assert_eq!(snapshot.run.status, RunStatus::Failed);
    assert_eq!(snapshot.run.error.as_deref(), Some("boom"));
    assert_eq!(
        statuses(&snapshot),
        vec![StepStatus::Success, StepStatus::Success, StepStatus::Failed]
    );
    assert_eq!(snapshot.steps[2].error.as_deref(), Some("boom"));
    assert!(snapshot.run.output.is_none());
}

#[tokio::test]
async fn steps_after_a_failure_stay_pending() {
    let h = harness(Scripted::failing("a2", "boom"), BranchPolicy::FullTraversal);
    let snapshot = h.controller.execute(&chain(&["t", "a1", "a2", "a3"]), false).await.unwrap();

    assert_eq!(
        statuses(&snapshot),
        vec![StepStatus::Success, StepStatus::Success, StepStatus::Failed, StepStatus::Pending]
    );
    assert!(snapshot.steps[3].start_time.is_none());
    assert_eq!(h.dispatcher.calls(), vec!["a1", "a2"]);
    assert_eq!(snapshot.progress(), 75.0);
}

#[tokio::test]
async fn flows_without_triggers_run_in_declaration_order() {
    let h = harness(Scripted::default(), BranchPolicy::FullTraversal);
    let flow = Flow::new("f1", "loose").with_graph(vec![action("first"), action("second")], vec![]);

    assert_eq!(resolve_order(flow.nodes(), flow.edges()), vec!["first", "second"]);

    let snapshot = h.controller.execute(&flow, false).await.unwrap();
    assert_eq!(snapshot.run.status, RunStatus::Success);
    assert_eq!(h.dispatcher.calls(), vec!["first", "second"]);
}

#[tokio::test]
async fn retrying_twice_counts_attempts() {
    let h = harness(Scripted::failing("a1", "boom"), BranchPolicy::FullTraversal);
    let flow = chain(&["t", "a1"]);
    h.flows.insert(flow.clone()).unwrap();

    let first = h.controller.execute(&flow, false).await.unwrap();
    let second = h.controller.retry(&first.run.id).await.unwrap().wait().await;
    let third = h.controller.retry(&second.run.id).await.unwrap().wait().await;

    let attempts: Vec<u32> = [&first, &second, &third].iter().map(|s| s.run.attempts).collect();
    assert_eq!(attempts, vec![1, 2, 3]);
    assert_ne!(first.run.id, second.run.id);
    assert_ne!(second.run.id, third.run.id);
    assert_eq!(third.run.status, RunStatus::Failed);
    assert_eq!(h.history.list(Some("f1")).len(), 3);
}

#[tokio::test]
async fn only_failed_runs_can_be_retried() {
    let h = harness(Scripted::default(), BranchPolicy::FullTraversal);
    let flow = chain(&["t", "a1"]);
    h.flows.insert(flow.clone()).unwrap();

    let succeeded = h.controller.execute(&flow, false).await.unwrap();
    let err = h.controller.retry(&succeeded.run.id).await.unwrap_err();
    assert_eq!(err, EngineError::RunNotFailed(succeeded.run.id.clone()));
    assert_eq!(h.history.len(), 1);
}

#[tokio::test]
async fn retry_of_unknown_run_is_an_error() {
    let h = harness(Scripted::default(), BranchPolicy::FullTraversal);
    let err = h.controller.retry("nope").await.unwrap_err();
    assert_eq!(err, EngineError::RunNotFound("nope".into()));
}

#[tokio::test]
async fn canceling_a_finished_run_changes_nothing() {
    let h = harness(Scripted::default(), BranchPolicy::FullTraversal);
    let finished = h.controller.execute(&chain(&["t", "a1"]), false).await.unwrap();

    assert!(!h.controller.cancel(&finished.run.id).await.unwrap());

    let recorded = h.history.get(&finished.run.id).unwrap();
    assert_eq!(recorded.run.status, RunStatus::Success);
    assert_eq!(recorded.run.finished_at, finished.run.finished_at);
    assert_eq!(h.history.len(), 1);

    let err = h.controller.cancel("missing").await.unwrap_err();
    assert_eq!(err, EngineError::RunNotFound("missing".into()));
}

#[tokio::test]
async fn cancel_mid_run_wins_over_the_in_flight_node() {
    let h = harness(Scripted::hanging("slow"), BranchPolicy::FullTraversal);
    let flow = chain(&["t", "fast", "slow", "never"]);

    let handle = h.controller.start(&flow, false).await.unwrap();
    let mut updates = handle.subscribe();
    updates
        .wait_for(|s| s.step("slow").is_some_and(|step| step.status == StepStatus::Running))
        .await
        .unwrap();

    assert!(h.controller.cancel(handle.id()).await.unwrap());
    let snapshot = handle.wait().await;

    assert_eq!(snapshot.run.status, RunStatus::Canceled);
    assert!(snapshot.run.finished_at.is_some());
    assert_eq!(snapshot.step("fast").unwrap().status, StepStatus::Success);
    assert_eq!(snapshot.step("slow").unwrap().status, StepStatus::Running);
    assert_eq!(snapshot.step("never").unwrap().status, StepStatus::Pending);

    // releasing the node later must not revive the run
    h.dispatcher.gate.notify_waiters();
    tokio::task::yield_now().await;
    assert_eq!(handle.status(), RunStatus::Canceled);
    assert_eq!(h.history.get(handle.id()).unwrap().run.status, RunStatus::Canceled);
    assert!(!h.dispatcher.calls().contains(&"never".to_string()));
}

#[tokio::test]
async fn reset_is_refused_while_running() {
    let h = harness(Scripted::hanging("slow"), BranchPolicy::FullTraversal);
    let handle = h.controller.start(&chain(&["t", "slow"]), false).await.unwrap();

    assert!(matches!(h.controller.reset().await, Err(EngineError::RunInProgress(_))));
    assert_eq!(h.controller.active().await.len(), 1);

    h.controller.cancel(handle.id()).await.unwrap();
    h.controller.reset().await.unwrap();
    assert!(h.controller.current().await.is_none());
    assert_eq!(h.history.len(), 1);
}

fn branching() -> Flow {
    Flow::new("f1", "branching").with_graph(
        vec![
            trigger("t"),
            FlowNode::new("check", NodeKind::Condition, "if_else")
                .with_config("field", json!("priority"))
                .with_config("operator", json!("equals"))
                .with_config("value", json!("urgent")),
            action("escalate"),
            action("archive"),
            FlowNode::new("done", NodeKind::End, "end"),
        ],
        vec![
            FlowEdge::new("t", "check"),
            FlowEdge::new("check", "escalate").on_branch("true"),
            FlowEdge::new("check", "archive").on_branch("false"),
            FlowEdge::new("escalate", "done"),
        ],
    )
}

#[tokio::test]
async fn full_traversal_runs_both_branches() {
    let h = harness(Scripted::default(), BranchPolicy::FullTraversal);
    let snapshot = h.controller.execute(&branching(), false).await.unwrap();

    assert_eq!(snapshot.run.status, RunStatus::Success);
    assert_eq!(h.dispatcher.calls(), vec!["escalate", "archive"]);
    assert_eq!(snapshot.step("check").unwrap().output.as_ref().unwrap()["branch"], "false");
}

#[tokio::test]
async fn taken_branch_policy_skips_the_other_side() {
    let h = harness(Scripted::default(), BranchPolicy::FollowTakenBranch);
    let snapshot = h.controller.execute(&branching(), false).await.unwrap();

    assert_eq!(snapshot.run.status, RunStatus::Success);
    assert_eq!(h.dispatcher.calls(), vec!["archive"]);
    assert_eq!(snapshot.step("escalate").unwrap().status, StepStatus::Skipped);
    assert_eq!(snapshot.step("done").unwrap().status, StepStatus::Skipped);
    assert_eq!(snapshot.step("archive").unwrap().status, StepStatus::Success);
    assert_eq!(snapshot.progress(), 100.0);
}

#[tokio::test]
async fn taken_branch_policy_runs_joins_reached_another_way() {
    let h = harness(Scripted::default(), BranchPolicy::FollowTakenBranch);
    let flow = Flow::new("f1", "join").with_graph(
        vec![
            trigger("t"),
            FlowNode::new("check", NodeKind::Condition, "if_else").with_config("expression", json!("false")),
            action("join"),
            action("side"),
        ],
        vec![
            FlowEdge::new("t", "check"),
            FlowEdge::new("check", "join").on_branch("true"),
            FlowEdge::new("t", "side"),
            FlowEdge::new("side", "join"),
        ],
    );

    let snapshot = h.controller.execute(&flow, false).await.unwrap();
    assert_eq!(snapshot.run.status, RunStatus::Success);
    assert_eq!(
        statuses(&snapshot),
        vec![StepStatus::Success, StepStatus::Success, StepStatus::Success, StepStatus::Success]
    );
    assert_eq!(h.dispatcher.calls(), vec!["join", "side"]);
}

#[tokio::test]
async fn broken_condition_fails_the_run() {
    let h = harness(Scripted::default(), BranchPolicy::FullTraversal);
    let flow = Flow::new("f1", "bad rule").with_graph(
        vec![
            trigger("t"),
            FlowNode::new("check", NodeKind::Condition, "if_else").with_config("expression", json!("nope(")),
            action("a"),
        ],
        vec![FlowEdge::new("t", "check"), FlowEdge::new("check", "a")],
    );

    let snapshot = h.controller.execute(&flow, false).await.unwrap();
    assert_eq!(snapshot.run.status, RunStatus::Failed);
    assert!(snapshot.run.error.as_deref().unwrap().contains("check"));
    assert!(h.dispatcher.calls().is_empty());
}

#[tokio::test]
async fn dangling_edges_and_unknown_kinds_do_not_break_runs() {
    let h = harness(Scripted::default(), BranchPolicy::FullTraversal);
    let flow: Flow = serde_json::from_value(json!({
        "id": "f1",
        "name": "sloppy",
        "graph": {
            "nodes": [
                {"id": "t", "type": "trigger", "data": {"label": "Start", "nodeType": "manual"}},
                {"id": "n", "type": "sticky-note", "data": {"label": "Note", "nodeType": "note"}}
            ],
            "edges": [
                {"id": "e1", "source": "t", "target": "ghost"},
                {"id": "e2", "source": "t", "target": "n"}
            ]
        }
    }))
    .unwrap();

    let snapshot = h.controller.execute(&flow, false).await.unwrap();
    assert_eq!(snapshot.run.status, RunStatus::Success);
    assert_eq!(snapshot.step("n").unwrap().output.as_ref().unwrap()["processed"], true);
}

#[tokio::test]
async fn concurrent_runs_of_one_flow_are_independent() {
    let h = harness(Scripted::default(), BranchPolicy::FullTraversal);
    let flow = chain(&["t", "a1"]);

    let (left, right) = tokio::join!(h.controller.execute(&flow, true), h.controller.execute(&flow, false));
    let (left, right) = (left.unwrap(), right.unwrap());

    assert_ne!(left.run.id, right.run.id);
    assert_eq!(left.run.output.unwrap()["testMode"], true);
    assert_eq!(right.run.output.unwrap()["testMode"], false);
    assert_eq!(h.history.len(), 2);
}
