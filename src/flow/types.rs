/// Core flow type definitions
///
/// Defines flows, nodes and edges exactly as the graph editor produces them.
/// These types are serialized/deserialized from JSON; the engine only reads them.

use chrono::{DateTime, Utc};
use petgraph::algo::is_cyclic_directed;
use petgraph::graph::DiGraph;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};

/// Accumulating key/value data handed from node to node during one run
pub type Context = Map<String, Value>;

/// A saved automation definition
///
/// Owns its graph. `version` is bumped on every structural edit; `enabled` gates
/// automatic triggering (schedules, webhooks, task events) but never manual runs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Flow {
    /// Unique flow identifier
    pub id: String,
    /// Owning project (opaque to the engine)
    #[serde(default)]
    pub project_id: String,
    /// Human-readable flow name
    pub name: String,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub graph: FlowGraph,
    #[serde(default = "initial_version")]
    pub version: u64,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

fn initial_version() -> u64 {
    1
}

/// Nodes and edges of a flow, in declaration order
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct FlowGraph {
    #[serde(default)]
    pub nodes: Vec<FlowNode>,
    #[serde(default)]
    pub edges: Vec<FlowEdge>,
}

/// Behavior family of a node; selects the executor handler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    Trigger,
    Condition,
    Action,
    Integration,
    End,
    /// Anything the editor emits that this engine does not know; runs as pass-through
    #[serde(other)]
    Unknown,
}

impl NodeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::Trigger => "trigger",
            NodeKind::Condition => "condition",
            NodeKind::Action => "action",
            NodeKind::Integration => "integration",
            NodeKind::End => "end",
            NodeKind::Unknown => "unknown",
        }
    }
}

/// Canvas position, carried for lossless round-trips only
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

/// Editor payload of a node
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodeData {
    /// Display label, snapshotted into each execution step
    #[serde(default)]
    pub label: String,
    /// Sub-selector within the kind (`task_created`, `if_else`, `send_email`, ...)
    #[serde(default)]
    pub node_type: String,
    /// Opaque configuration, validated by the node's handler at execution time
    #[serde(default)]
    pub config: Map<String, Value>,
}

/// A vertex in the automation graph
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FlowNode {
    /// Unique within the flow
    pub id: String,
    #[serde(rename = "type")]
    pub kind: NodeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Position>,
    #[serde(default)]
    pub data: NodeData,
}

impl FlowNode {
    pub fn new(id: impl Into<String>, kind: NodeKind, node_type: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            data: NodeData {
                label: id.clone(),
                node_type: node_type.into(),
                config: Map::new(),
            },
            id,
            kind,
            position: None,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.data.label = label.into();
        self
    }

    pub fn with_config(mut self, key: impl Into<String>, value: Value) -> Self {
        self.data.config.insert(key.into(), value);
        self
    }

    pub fn label(&self) -> &str {
        &self.data.label
    }

    pub fn node_type(&self) -> &str {
        &self.data.node_type
    }

    pub fn config(&self) -> &Map<String, Value> {
        &self.data.config
    }

    /// Non-empty string config value
    pub fn config_str(&self, key: &str) -> Option<&str> {
        self.data
            .config
            .get(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    pub fn is_trigger(&self) -> bool {
        self.kind == NodeKind::Trigger
    }
}

/// Directed connection `source -> target`
///
/// `branch` tags edges leaving a condition node (`"true"` / `"false"`). The
/// editor stores it as the source handle id, so `sourceHandle` is accepted too.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FlowEdge {
    #[serde(default)]
    pub id: String,
    pub source: String,
    pub target: String,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub edge_type: Option<String>,
    #[serde(default, alias = "sourceHandle", skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
}

impl FlowEdge {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        let source = source.into();
        let target = target.into();
        Self {
            id: format!("{}-{}", source, target),
            source,
            target,
            edge_type: None,
            branch: None,
        }
    }

    pub fn on_branch(mut self, branch: impl Into<String>) -> Self {
        self.branch = Some(branch.into());
        self
    }
}

/// Structural problem found by [`Flow::validate`]
///
/// None of these block execution: dangling edges are ignored by the resolver,
/// cycles are cut by its visited set, and a flow without triggers is simply
/// ordered by declaration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "issue", rename_all = "snake_case")]
pub enum GraphIssue {
    DuplicateNode { node_id: String },
    DanglingEdge { edge_id: String, missing: String },
    Cycle,
    NoTrigger,
    BranchOnNonCondition { edge_id: String, source: String },
}

impl Flow {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            project_id: String::new(),
            name: name.into(),
            enabled: false,
            graph: FlowGraph::default(),
            version: initial_version(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_graph(mut self, nodes: Vec<FlowNode>, edges: Vec<FlowEdge>) -> Self {
        self.graph = FlowGraph { nodes, edges };
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn nodes(&self) -> &[FlowNode] {
        &self.graph.nodes
    }

    pub fn edges(&self) -> &[FlowEdge] {
        &self.graph.edges
    }

    /// First node declared with this id
    pub fn node(&self, id: &str) -> Option<&FlowNode> {
        self.graph.nodes.iter().find(|n| n.id == id)
    }

    /// Trigger nodes whose `nodeType` matches, in declaration order
    pub fn triggers_of_type<'a>(&'a self, node_type: &'a str) -> impl Iterator<Item = &'a FlowNode> + 'a {
        self.graph
            .nodes
            .iter()
            .filter(move |n| n.is_trigger() && n.node_type() == node_type)
    }

    /// Check the graph invariants and report every violation found
    pub fn validate(&self) -> Vec<GraphIssue> {
        let mut issues = Vec::new();
        let mut seen = HashSet::new();
        let mut graph = DiGraph::<(), ()>::new();
        let mut index = HashMap::new();

        for node in &self.graph.nodes {
            if seen.insert(node.id.as_str()) {
                index.insert(node.id.as_str(), graph.add_node(()));
            } else {
                issues.push(GraphIssue::DuplicateNode {
                    node_id: node.id.clone(),
                });
            }
        }

        for edge in &self.graph.edges {
            let (source, target) = match (index.get(edge.source.as_str()), index.get(edge.target.as_str())) {
                (Some(s), Some(t)) => (*s, *t),
                (None, _) => {
                    issues.push(GraphIssue::DanglingEdge {
                        edge_id: edge.id.clone(),
                        missing: edge.source.clone(),
                    });
                    continue;
                }
                (_, None) => {
                    issues.push(GraphIssue::DanglingEdge {
                        edge_id: edge.id.clone(),
                        missing: edge.target.clone(),
                    });
                    continue;
                }
            };
            graph.add_edge(source, target, ());

            if edge.branch.is_some() {
                let from_condition = self
                    .node(&edge.source)
                    .is_some_and(|n| n.kind == NodeKind::Condition);
                if !from_condition {
                    issues.push(GraphIssue::BranchOnNonCondition {
                        edge_id: edge.id.clone(),
                        source: edge.source.clone(),
                    });
                }
            }
        }

        if is_cyclic_directed(&graph) {
            issues.push(GraphIssue::Cycle);
        }

        if !self.graph.nodes.is_empty() && !self.graph.nodes.iter().any(FlowNode::is_trigger) {
            issues.push(GraphIssue::NoTrigger);
        }

        issues
    }
}
