/// Flowline: flow execution engine
///
/// Runs trigger/condition/action graphs one node at a time, producing an
/// auditable step trace per run, with history and whole-run retry.

// Core configuration and setup
pub mod config;

// Typed engine and node errors
pub mod error;

// Flow definition layer - graph model, validation and registry
pub mod flow;

// Run records and append-only history
pub mod run;

// Runtime - order resolution, node execution, run control and scheduling
pub mod runtime;

// HTTP API layer - flow management, run control and trigger endpoints
pub mod api;

// Server setup and initialization
pub mod server;

// Re-export commonly used types for external consumers
pub use error::{EngineError, NodeError};
pub use flow::{Context, Flow, FlowEdge, FlowNode, FlowRegistry, FlowRepository, NodeKind};
pub use run::{ExecutionStep, FlowRun, RunHistory, RunRepository, RunSnapshot, RunStatus, StepStatus};
pub use runtime::{resolve_order, BranchPolicy, NodeExecutor, RunController, RunHandle, RunRequest};
pub use server::start_server;
