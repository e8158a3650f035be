/// Typed errors for the engine core
///
/// `EngineError` covers controller and repository misuse (unknown ids, conflicting
/// inserts, commands issued in the wrong run state). `NodeError` is the failure
/// half of a node execution: its `Display` text is what ends up in
/// `ExecutionStep.error` and `FlowRun.error`, so messages are written for people.

use thiserror::Error;

/// Errors raised by the run controller and the flow/run repositories
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("flow not found: {0}")]
    FlowNotFound(String),

    #[error("flow already exists: {0}")]
    FlowExists(String),

    #[error("run not found: {0}")]
    RunNotFound(String),

    /// The run repository is append-only; a run id can be recorded once
    #[error("run already recorded: {0}")]
    RunExists(String),

    #[error("run {0} is still in progress")]
    RunInProgress(String),

    #[error("flow {0} has no nodes to execute")]
    EmptyFlow(String),

    #[error("run {0} is not pending and cannot be launched")]
    RunNotPending(String),

    /// Only failed runs get another attempt
    #[error("run {0} did not fail and cannot be retried")]
    RunNotFailed(String),
}

/// Failure of a single node execution
///
/// Always returned as a value, never raised past the executor: the controller
/// decides what a failure means for the run (today: fail-fast).
#[derive(Debug, Error, Clone, PartialEq)]
pub enum NodeError {
    /// A required config key is absent or empty
    #[error("node '{node}' is missing required config '{key}'")]
    MissingConfig { node: String, key: String },

    /// A config key is present but unusable
    #[error("node '{node}' has invalid config '{key}': {reason}")]
    InvalidConfig {
        node: String,
        key: String,
        reason: String,
    },

    /// The condition rule could not be evaluated
    #[error("condition '{node}' failed: {reason}")]
    Condition { node: String, reason: String },

    /// The external action dispatcher reported a failure
    #[error("{0}")]
    Action(String),

    #[error("node '{node}' timed out after {secs}s")]
    Timeout { node: String, secs: u64 },
}

impl NodeError {
    pub(crate) fn missing(node: &str, key: &str) -> Self {
        Self::MissingConfig {
            node: node.to_string(),
            key: key.to_string(),
        }
    }

    pub(crate) fn invalid(node: &str, key: &str, reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            node: node.to_string(),
            key: key.to_string(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_errors_keep_the_dispatcher_message() {
        assert_eq!(NodeError::Action("boom".into()).to_string(), "boom");
    }

    #[test]
    fn config_errors_name_node_and_key() {
        let err = NodeError::missing("n2", "to");
        assert_eq!(err.to_string(), "node 'n2' is missing required config 'to'");

        let err = NodeError::invalid("n3", "priority", "expected one of low, medium, high, urgent");
        assert!(err.to_string().contains("'priority'"));
    }
}
