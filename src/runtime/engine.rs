/// Run controller
///
/// Owns every in-flight run. A run moves `pending → running → {success, failed,
/// canceled}`; the three terminal states are final. Nodes are executed one at a
/// time in resolved order, the output of each is shallow-merged into the
/// running context, and the first failure ends the run.
///
/// Each run lives behind a `RunHandle` (a `watch` channel over its snapshot).
/// Every mutation goes through `RunHandle::transition`, which refuses changes
/// once the run is terminal, so a late node result can never overwrite a
/// cancellation. Whoever makes the terminal transition records the run in
/// history, exactly once.

use crate::error::EngineError;
use crate::flow::{Context, Flow, FlowRepository};
use crate::run::{
    ExecutionStep, FlowRun, RunRepository, RunSnapshot, RunStatus, StepStatus, TriggerSource,
};
use crate::runtime::branch::{BranchPolicy, BranchTracker};
use crate::runtime::executor::{NodeExecutor, NodeInvocation};
use crate::runtime::resolver::resolve_order;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{collections::HashMap, fmt, sync::Arc};
use tokio::sync::{watch, RwLock};

/// How and why a run is being started
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRequest {
    #[serde(default)]
    pub test_mode: bool,
    #[serde(default = "manual_trigger")]
    pub trigger: TriggerSource,
    /// Extra keys for the initial context (webhook body, task event, ...)
    #[serde(default)]
    pub payload: Option<Context>,
}

fn manual_trigger() -> TriggerSource {
    TriggerSource::Manual
}

impl Default for RunRequest {
    fn default() -> Self {
        Self::manual(false)
    }
}

impl RunRequest {
    pub fn manual(test_mode: bool) -> Self {
        Self {
            test_mode,
            trigger: TriggerSource::Manual,
            payload: None,
        }
    }

    pub fn triggered(trigger: TriggerSource, payload: Option<Context>) -> Self {
        Self {
            test_mode: false,
            trigger,
            payload,
        }
    }
}

/// Live view of one run
pub struct RunHandle {
    run_id: String,
    flow_id: String,
    state: watch::Sender<RunSnapshot>,
    history: Arc<dyn RunRepository>,
}

impl fmt::Debug for RunHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunHandle")
            .field("run_id", &self.run_id)
            .field("flow_id", &self.flow_id)
            .field("status", &self.status())
            .finish()
    }
}

impl RunHandle {
    fn new(snapshot: RunSnapshot, history: Arc<dyn RunRepository>) -> Self {
        let run_id = snapshot.run.id.clone();
        let flow_id = snapshot.run.flow_id.clone();
        let (state, _) = watch::channel(snapshot);
        Self {
            run_id,
            flow_id,
            state,
            history,
        }
    }

    pub fn id(&self) -> &str {
        &self.run_id
    }

    pub fn flow_id(&self) -> &str {
        &self.flow_id
    }

    pub fn snapshot(&self) -> RunSnapshot {
        self.state.borrow().clone()
    }

    pub fn status(&self) -> RunStatus {
        self.state.borrow().run.status
    }

    pub fn is_finished(&self) -> bool {
        self.status().is_terminal()
    }

    /// Percentage of steps in a terminal state
    pub fn progress(&self) -> f64 {
        self.state.borrow().progress()
    }

    /// Receive every change to the run as it happens
    pub fn subscribe(&self) -> watch::Receiver<RunSnapshot> {
        self.state.subscribe()
    }

    /// Wait until the run reaches a terminal state
    pub async fn wait(&self) -> RunSnapshot {
        let mut rx = self.state.subscribe();
        let finished = rx
            .wait_for(|s| s.run.status.is_terminal())
            .await
            .map(|s| (*s).clone());
        finished.unwrap_or_else(|_| self.snapshot())
    }

    /// Cancel the run if it is still running; returns whether anything changed
    pub fn cancel(&self) -> bool {
        let canceled = self.transition(|s| {
            if s.run.status != RunStatus::Running {
                return false;
            }
            s.run.status = RunStatus::Canceled;
            s.run.finished_at = Some(Utc::now());
            true
        });
        if canceled {
            tracing::info!("🛑 Run {} canceled", self.run_id);
        }
        canceled
    }

    /// Apply `change` unless the run is already terminal
    ///
    /// `change` returns whether it modified the snapshot. The call that moves
    /// the run into a terminal state appends it to history before any
    /// subscriber is woken.
    pub(crate) fn transition(&self, change: impl FnOnce(&mut RunSnapshot) -> bool) -> bool {
        self.state.send_if_modified(|snapshot| {
            if snapshot.run.status.is_terminal() {
                return false;
            }
            let changed = change(snapshot);
            if changed && snapshot.run.status.is_terminal() {
                match self.history.append(snapshot.clone()) {
                    Ok(()) => tracing::debug!("🗂️ Run {} recorded as {:?}", self.run_id, snapshot.run.status),
                    Err(e) => tracing::warn!("⚠️ Run {} could not be recorded: {}", self.run_id, e),
                }
            }
            changed
        })
    }

    fn update_step(&self, node_id: &str, change: impl FnOnce(&mut ExecutionStep)) -> bool {
        self.transition(|s| match s.step_mut(node_id) {
            Some(step) => {
                change(step);
                true
            }
            None => false,
        })
    }
}

/// Starts, tracks, cancels and retries runs
pub struct RunController {
    executor: Arc<NodeExecutor>,
    flows: Arc<dyn FlowRepository>,
    history: Arc<dyn RunRepository>,
    policy: BranchPolicy,
    active: Arc<RwLock<HashMap<String, Arc<RunHandle>>>>,
    /// The run a single-run UI is looking at
    current: RwLock<Option<Arc<RunHandle>>>,
}

impl fmt::Debug for RunController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunController")
            .field("executor", &self.executor)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl RunController {
    pub fn new(
        executor: Arc<NodeExecutor>,
        flows: Arc<dyn FlowRepository>,
        history: Arc<dyn RunRepository>,
    ) -> Self {
        Self {
            executor,
            flows,
            history,
            policy: BranchPolicy::default(),
            active: Arc::new(RwLock::new(HashMap::new())),
            current: RwLock::new(None),
        }
    }

    pub fn with_branch_policy(mut self, policy: BranchPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn branch_policy(&self) -> BranchPolicy {
        self.policy
    }

    pub fn flows(&self) -> &Arc<dyn FlowRepository> {
        &self.flows
    }

    pub fn history(&self) -> &Arc<dyn RunRepository> {
        &self.history
    }

    /// Start a manual run; returns as soon as the run is `running`
    pub async fn start(&self, flow: &Flow, test_mode: bool) -> Result<Arc<RunHandle>, EngineError> {
        self.start_with(flow, RunRequest::manual(test_mode)).await
    }

    /// Start a run with an explicit trigger source and payload
    ///
    /// The initial context is the payload plus `testMode` and `trigger`, which
    /// the payload cannot override.
    pub async fn start_with(&self, flow: &Flow, request: RunRequest) -> Result<Arc<RunHandle>, EngineError> {
        let mut run = FlowRun::new(&flow.id, request.test_mode);
        if let Some(payload) = request.payload {
            for (key, value) in payload {
                if key != "testMode" && key != "trigger" {
                    run.input.insert(key, value);
                }
            }
        }
        run.input.insert(
            "trigger".to_string(),
            Value::String(request.trigger.as_str().to_string()),
        );

        let is_manual = request.trigger == TriggerSource::Manual;
        self.spawn(flow, run, is_manual).await
    }

    /// Start a manual run and wait for it to finish
    pub async fn execute(&self, flow: &Flow, test_mode: bool) -> Result<RunSnapshot, EngineError> {
        let handle = self.start(flow, test_mode).await?;
        Ok(handle.wait().await)
    }

    /// Execute a pending run built elsewhere, typically by `FlowRun::retry`
    pub async fn launch(&self, flow: &Flow, run: FlowRun) -> Result<Arc<RunHandle>, EngineError> {
        self.spawn(flow, run, true).await
    }

    /// Launch the next attempt of a failed run against the flow's current graph
    pub async fn retry(&self, run_id: &str) -> Result<Arc<RunHandle>, EngineError> {
        let Some(previous) = self.history.get(run_id) else {
            if self.handle(run_id).await.is_some_and(|h| !h.is_finished()) {
                return Err(EngineError::RunInProgress(run_id.to_string()));
            }
            return Err(EngineError::RunNotFound(run_id.to_string()));
        };
        if previous.run.status != RunStatus::Failed {
            return Err(EngineError::RunNotFailed(run_id.to_string()));
        }

        let flow = self
            .flows
            .get(&previous.run.flow_id)
            .ok_or_else(|| EngineError::FlowNotFound(previous.run.flow_id.clone()))?;

        let next = previous.run.retry();
        tracing::info!(
            "🔁 Retrying run {} as {} (attempt {})",
            run_id, next.id, next.attempts
        );
        self.launch(&flow, next).await
    }

    /// Cancel a run; `Ok(false)` when it already finished
    pub async fn cancel(&self, run_id: &str) -> Result<bool, EngineError> {
        if let Some(handle) = self.handle(run_id).await {
            return Ok(handle.cancel());
        }
        if self.history.get(run_id).is_some() {
            return Ok(false);
        }
        Err(EngineError::RunNotFound(run_id.to_string()))
    }

    /// Forget the current run; refused while it is still executing
    pub async fn reset(&self) -> Result<(), EngineError> {
        let mut current = self.current.write().await;
        if let Some(handle) = current.as_ref() {
            if !handle.is_finished() {
                return Err(EngineError::RunInProgress(handle.id().to_string()));
            }
        }
        *current = None;
        tracing::debug!("🧹 Current run cleared");
        Ok(())
    }

    pub async fn current(&self) -> Option<Arc<RunHandle>> {
        self.current.read().await.clone()
    }

    /// Handle of a run that is still being driven
    pub async fn handle(&self, run_id: &str) -> Option<Arc<RunHandle>> {
        self.active.read().await.get(run_id).cloned()
    }

    /// Latest snapshot of a run, in flight or recorded
    pub async fn run(&self, run_id: &str) -> Option<RunSnapshot> {
        match self.handle(run_id).await {
            Some(handle) => Some(handle.snapshot()),
            None => self.history.get(run_id),
        }
    }

    /// Runs that have not reached a terminal state, oldest first
    pub async fn active(&self) -> Vec<RunSnapshot> {
        let mut runs: Vec<RunSnapshot> = self
            .active
            .read()
            .await
            .values()
            .map(|h| h.snapshot())
            .filter(|s| !s.run.status.is_terminal())
            .collect();
        runs.sort_by_key(|s| s.run.started_at);
        runs
    }

    async fn spawn(&self, flow: &Flow, mut run: FlowRun, track_current: bool) -> Result<Arc<RunHandle>, EngineError> {
        if run.status != RunStatus::Pending {
            return Err(EngineError::RunNotPending(run.id));
        }
        if flow.nodes().is_empty() {
            return Err(EngineError::EmptyFlow(flow.id.clone()));
        }
        if self.history.get(&run.id).is_some() {
            return Err(EngineError::RunExists(run.id));
        }

        for issue in flow.validate() {
            tracing::warn!("⚠️ Flow '{}' graph issue: {:?}", flow.id, issue);
        }

        let order = resolve_order(flow.nodes(), flow.edges());
        let steps = order
            .iter()
            .filter_map(|id| flow.node(id))
            .map(|node| ExecutionStep::pending(&node.id, node.label()))
            .collect();

        run.status = RunStatus::Running;
        run.started_at = Some(Utc::now());
        run.finished_at = None;
        run.output = None;
        run.error = None;

        let handle = Arc::new(RunHandle::new(
            RunSnapshot { run, steps },
            Arc::clone(&self.history),
        ));

        {
            let mut active = self.active.write().await;
            if active.contains_key(handle.id()) {
                return Err(EngineError::RunExists(handle.id().to_string()));
            }
            active.insert(handle.id().to_string(), Arc::clone(&handle));
        }
        if track_current {
            *self.current.write().await = Some(Arc::clone(&handle));
        }

        let snapshot = handle.snapshot();
        let trigger = snapshot
            .run
            .input
            .get("trigger")
            .and_then(|t| t.as_str())
            .unwrap_or("manual");
        tracing::info!(
            "▶️ Run {} started for flow '{}' ({} steps, attempt {}, trigger {})",
            handle.id(),
            flow.id,
            snapshot.steps.len(),
            snapshot.run.attempts,
            trigger,
        );

        let driver = RunDriver {
            executor: Arc::clone(&self.executor),
            policy: self.policy,
            flow: flow.clone(),
            order,
            handle: Arc::clone(&handle),
        };
        let active = Arc::clone(&self.active);
        tokio::spawn(async move {
            driver.drive().await;
            active.write().await.remove(driver.handle.id());
        });

        Ok(handle)
    }
}

/// The sequential loop behind one run
struct RunDriver {
    executor: Arc<NodeExecutor>,
    policy: BranchPolicy,
    /// Copy of the graph taken at start; later edits do not affect the run
    flow: Flow,
    order: Vec<String>,
    handle: Arc<RunHandle>,
}

impl RunDriver {
    async fn drive(&self) {
        let run_id = self.handle.id();
        let flow_id = self.handle.flow_id();
        let mut context = self.handle.snapshot().run.input;
        let mut branches = BranchTracker::new(&self.flow, self.policy);

        for (position, node_id) in self.order.iter().enumerate() {
            if self.handle.is_finished() {
                tracing::info!("⏹️ Run {} stopped before node '{}'", run_id, node_id);
                return;
            }
            let Some(node) = self.flow.node(node_id) else {
                continue;
            };

            if branches.should_skip(node) {
                tracing::debug!("⏭️ Run {}: skipping '{}' on an untaken branch", run_id, node_id);
                self.handle.update_step(node_id, |step| {
                    let now = Utc::now();
                    step.status = StepStatus::Skipped;
                    step.start_time = Some(now);
                    step.end_time = Some(now);
                });
                branches.record_skipped(node_id);
                continue;
            }

            tracing::info!(
                "📍 Run {} step {}/{}: '{}'",
                run_id,
                position + 1,
                self.order.len(),
                node.label()
            );
            let input = context.clone();
            let started = self.handle.update_step(node_id, |step| {
                step.status = StepStatus::Running;
                step.start_time = Some(Utc::now());
                step.input = Some(input);
            });
            if !started {
                continue;
            }

            let call = NodeInvocation {
                run_id,
                flow_id,
                node,
                input: &context,
            };
            let mut watcher = self.handle.subscribe();
            let outcome = tokio::select! {
                outcome = self.executor.execute(&call) => outcome,
                _ = watcher.wait_for(|s| s.run.status.is_terminal()) => {
                    tracing::warn!("🛑 Run {} ended while '{}' was in flight; its result is discarded", run_id, node_id);
                    return;
                }
            };

            match outcome {
                Ok(output) => {
                    branches.record_success(node_id, &output);
                    let recorded = output.clone();
                    self.handle.update_step(node_id, |step| {
                        step.status = StepStatus::Success;
                        step.end_time = Some(Utc::now());
                        step.output = Some(recorded);
                    });
                    context.extend(output);
                }
                Err(err) => {
                    let message = err.to_string();
                    tracing::error!("💥 Run {} failed at node '{}': {}", run_id, node_id, message);
                    self.handle.transition(|s| {
                        let now = Utc::now();
                        if let Some(step) = s.step_mut(node_id) {
                            step.status = StepStatus::Failed;
                            step.end_time = Some(now);
                            step.error = Some(message.clone());
                        }
                        s.run.status = RunStatus::Failed;
                        s.run.error = Some(message);
                        s.run.finished_at = Some(now);
                        true
                    });
                    return;
                }
            }
        }

        let finished = self.handle.transition(|s| {
            s.run.status = RunStatus::Success;
            s.run.output = Some(context);
            s.run.finished_at = Some(Utc::now());
            true
        });
        if finished {
            tracing::info!("🎉 Run {} of flow '{}' completed successfully", run_id, flow_id);
        }
    }
}
