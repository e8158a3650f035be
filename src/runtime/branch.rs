/// Branch policy for condition nodes
///
/// Under `FullTraversal` every node in the resolved order runs, whatever a
/// condition decided. Under `FollowTakenBranch` a node is skipped once every
/// incoming edge is dead: its source failed or was skipped, the source
/// condition took the other branch, or the source is itself certain to be
/// skipped. A predecessor that may still run keeps the node alive.

use crate::flow::types::{Context, Flow, FlowNode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{
    collections::{HashMap, HashSet},
    fmt,
    str::FromStr,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BranchPolicy {
    /// Execute the whole resolved order
    #[default]
    FullTraversal,
    /// Skip nodes reachable only through untaken condition branches
    FollowTakenBranch,
}

impl FromStr for BranchPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "full" | "full_traversal" => Ok(BranchPolicy::FullTraversal),
            "taken" | "follow_taken_branch" => Ok(BranchPolicy::FollowTakenBranch),
            other => Err(anyhow::anyhow!("Unknown branch policy '{}' (expected full or taken)", other)),
        }
    }
}

impl fmt::Display for BranchPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BranchPolicy::FullTraversal => f.write_str("full"),
            BranchPolicy::FollowTakenBranch => f.write_str("taken"),
        }
    }
}

#[derive(Debug, Clone)]
enum Settled {
    /// Succeeded; carries the `branch` output of a condition
    Succeeded(Option<String>),
    /// Failed or skipped; no edge out of it is live
    Dead,
}

#[derive(Debug, Clone)]
struct Incoming {
    source: String,
    branch: Option<String>,
}

/// Per-run record of which edges carried control
#[derive(Debug)]
pub(crate) struct BranchTracker {
    policy: BranchPolicy,
    incoming: HashMap<String, Vec<Incoming>>,
    triggers: HashSet<String>,
    settled: HashMap<String, Settled>,
}

impl BranchTracker {
    pub(crate) fn new(flow: &Flow, policy: BranchPolicy) -> Self {
        let mut incoming: HashMap<String, Vec<Incoming>> = HashMap::new();
        let mut triggers = HashSet::new();
        if policy == BranchPolicy::FollowTakenBranch {
            triggers.extend(
                flow.nodes()
                    .iter()
                    .filter(|n| n.is_trigger())
                    .map(|n| n.id.clone()),
            );
            for edge in flow.edges() {
                if flow.node(&edge.source).is_none() {
                    continue;
                }
                incoming.entry(edge.target.clone()).or_default().push(Incoming {
                    source: edge.source.clone(),
                    branch: edge.branch.clone(),
                });
            }
        }
        Self {
            policy,
            incoming,
            triggers,
            settled: HashMap::new(),
        }
    }

    pub(crate) fn record_success(&mut self, node_id: &str, output: &Context) {
        let branch = output.get("branch").and_then(Value::as_str).map(str::to_string);
        self.settled.insert(node_id.to_string(), Settled::Succeeded(branch));
    }

    pub(crate) fn record_skipped(&mut self, node_id: &str) {
        self.settled.insert(node_id.to_string(), Settled::Dead);
    }

    /// Whether the node sits on an untaken branch
    pub(crate) fn should_skip(&self, node: &FlowNode) -> bool {
        if self.policy == BranchPolicy::FullTraversal {
            return false;
        }
        self.is_dead(&node.id, &mut HashSet::new())
    }

    /// Dead: not a trigger, has incoming edges, and all of them are dead
    ///
    /// Nodes on a cycle through `visiting` count as alive.
    fn is_dead(&self, node_id: &str, visiting: &mut HashSet<String>) -> bool {
        if self.triggers.contains(node_id) {
            return false;
        }
        let Some(edges) = self.incoming.get(node_id) else {
            return false;
        };
        if !visiting.insert(node_id.to_string()) {
            return false;
        }
        let dead = edges.iter().all(|edge| self.edge_is_dead(edge, visiting));
        visiting.remove(node_id);
        dead
    }

    fn edge_is_dead(&self, edge: &Incoming, visiting: &mut HashSet<String>) -> bool {
        match self.settled.get(&edge.source) {
            Some(Settled::Dead) => true,
            Some(Settled::Succeeded(taken)) => {
                matches!((&edge.branch, taken), (Some(label), Some(taken)) if label != taken)
            }
            None => self.is_dead(&edge.source, visiting),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::types::{FlowEdge, NodeKind};
    use serde_json::json;

    fn diamond() -> Flow {
        Flow::new("f", "branches").with_graph(
            vec![
                FlowNode::new("t", NodeKind::Trigger, "manual"),
                FlowNode::new("c", NodeKind::Condition, "if_else"),
                FlowNode::new("yes", NodeKind::Action, "send_email"),
                FlowNode::new("no", NodeKind::Action, "send_email"),
                FlowNode::new("after_no", NodeKind::Action, "delay"),
            ],
            vec![
                FlowEdge::new("t", "c"),
                FlowEdge::new("c", "yes").on_branch("true"),
                FlowEdge::new("c", "no").on_branch("false"),
                FlowEdge::new("no", "after_no"),
            ],
        )
    }

    fn output(value: serde_json::Value) -> Context {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn parses_policy_names() {
        assert_eq!("full".parse::<BranchPolicy>().unwrap(), BranchPolicy::FullTraversal);
        assert_eq!("TAKEN".parse::<BranchPolicy>().unwrap(), BranchPolicy::FollowTakenBranch);
        assert!("sometimes".parse::<BranchPolicy>().is_err());
        assert_eq!(BranchPolicy::default().to_string(), "full");
    }

    #[test]
    fn full_traversal_never_skips() {
        let flow = diamond();
        let mut tracker = BranchTracker::new(&flow, BranchPolicy::FullTraversal);
        tracker.record_success("c", &output(json!({"branch": "true"})));
        assert!(!tracker.should_skip(flow.node("no").unwrap()));
    }

    #[test]
    fn untaken_branch_and_its_descendants_are_skipped() {
        let flow = diamond();
        let mut tracker = BranchTracker::new(&flow, BranchPolicy::FollowTakenBranch);
        tracker.record_success("t", &Context::new());
        tracker.record_success("c", &output(json!({"conditionMet": true, "branch": "true"})));

        assert!(!tracker.should_skip(flow.node("yes").unwrap()));
        assert!(tracker.should_skip(flow.node("no").unwrap()));

        tracker.record_skipped("no");
        assert!(tracker.should_skip(flow.node("after_no").unwrap()));
    }

    #[test]
    fn join_with_a_live_unconditional_path_runs() {
        let flow = Flow::new("f", "join").with_graph(
            vec![
                FlowNode::new("t", NodeKind::Trigger, "manual"),
                FlowNode::new("c", NodeKind::Condition, "if_else"),
                FlowNode::new("j", NodeKind::Action, "send_email"),
                FlowNode::new("x", NodeKind::Action, "delay"),
            ],
            vec![
                FlowEdge::new("t", "c"),
                FlowEdge::new("c", "j").on_branch("true"),
                FlowEdge::new("t", "x"),
                FlowEdge::new("x", "j"),
            ],
        );
        let mut tracker = BranchTracker::new(&flow, BranchPolicy::FollowTakenBranch);
        tracker.record_success("t", &Context::new());
        tracker.record_success("c", &output(json!({"branch": "false"})));

        assert!(!tracker.should_skip(flow.node("j").unwrap()));
        assert!(!tracker.should_skip(flow.node("x").unwrap()));
    }

    #[test]
    fn join_fed_only_by_untaken_paths_is_skipped_early() {
        let flow = Flow::new("f", "dead join").with_graph(
            vec![
                FlowNode::new("t", NodeKind::Trigger, "manual"),
                FlowNode::new("c", NodeKind::Condition, "if_else"),
                FlowNode::new("j", NodeKind::Action, "send_email"),
                FlowNode::new("y", NodeKind::Action, "delay"),
            ],
            vec![
                FlowEdge::new("t", "c"),
                FlowEdge::new("c", "j").on_branch("true"),
                FlowEdge::new("c", "y").on_branch("true"),
                FlowEdge::new("y", "j"),
            ],
        );
        let mut tracker = BranchTracker::new(&flow, BranchPolicy::FollowTakenBranch);
        tracker.record_success("t", &Context::new());
        tracker.record_success("c", &output(json!({"branch": "false"})));

        // y has not been visited yet but can only be reached through the false side
        assert!(tracker.should_skip(flow.node("j").unwrap()));
    }

    #[test]
    fn cycles_without_a_settled_source_stay_alive() {
        let flow = Flow::new("f", "loop").with_graph(
            vec![
                FlowNode::new("a", NodeKind::Action, "delay"),
                FlowNode::new("b", NodeKind::Action, "delay"),
            ],
            vec![FlowEdge::new("a", "b"), FlowEdge::new("b", "a")],
        );
        let tracker = BranchTracker::new(&flow, BranchPolicy::FollowTakenBranch);
        assert!(!tracker.should_skip(flow.node("a").unwrap()));
    }

    #[test]
    fn unsettled_predecessors_do_not_skip() {
        let flow = diamond();
        let tracker = BranchTracker::new(&flow, BranchPolicy::FollowTakenBranch);
        assert!(!tracker.should_skip(flow.node("after_no").unwrap()));
    }
}
