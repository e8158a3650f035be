/// Runtime execution engine
///
/// This module turns a flow graph into a run:
/// - Resolving the DFS visitation order
/// - Executing single nodes through a dispatch table
/// - Driving runs through their state machine with tokio
/// - Firing schedule triggers in the background

// Execution order resolution over petgraph
pub mod resolver;

// Condition rules (JSONPath comparisons and sandboxed Lua)
pub mod condition;

// Action requests and the pluggable side-effect dispatcher
pub mod actions;

// Individual node execution handlers
pub mod executor;

// Branch policy for condition outcomes
pub mod branch;

// Run controller and live run handles
pub mod engine;

// Background cron scheduler for schedule triggers
pub mod scheduler;

// Re-export main types
pub use actions::{ActionContext, ActionDispatcher, ActionRequest, Outbox, StandardActionDispatcher};
pub use branch::BranchPolicy;
pub use condition::{ConditionEvaluator, RuleEvaluator};
pub use engine::{RunController, RunHandle, RunRequest};
pub use executor::{NodeExecutor, NodeHandler, NodeInvocation};
pub use resolver::resolve_order;
pub use scheduler::CronScheduler;
