/// Execution order resolution
///
/// Turns a node/edge list into the sequence the run controller walks. This is a
/// depth-first pre-order, not a topological sort:
/// - traversal is seeded from every trigger node, in declaration order
/// - outgoing edges are followed in edge-declaration order
/// - nodes unreachable from any trigger are swept afterwards, in declaration order
/// - a visited set cuts cycles and fan-in, so every node appears exactly once
///
/// Dangling edges (unknown source or target) are ignored.

use crate::flow::types::{FlowEdge, FlowNode};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use std::collections::HashMap;

/// Compute the deterministic visitation order over a flow graph
pub fn resolve_order(nodes: &[FlowNode], edges: &[FlowEdge]) -> Vec<String> {
    let graph = ExecutionGraph::build(nodes, edges);
    let mut visited = vec![false; graph.graph.node_count()];
    let mut order = Vec::with_capacity(graph.graph.node_count());

    let triggers = graph
        .graph
        .node_indices()
        .filter(|&idx| nodes[graph.graph[idx]].is_trigger());
    let everything = graph.graph.node_indices();

    for start in triggers.chain(everything) {
        graph.visit(start, &mut visited, &mut order);
    }

    tracing::debug!("📋 Execution order: {:?}", order);
    order
}

/// Petgraph view of a flow: node weight = position in `nodes`, edge weight =
/// position in `edges`
struct ExecutionGraph<'a> {
    nodes: &'a [FlowNode],
    graph: DiGraph<usize, usize>,
    /// Outgoing neighbours per node, sorted by edge declaration
    successors: Vec<Vec<NodeIndex>>,
}

impl<'a> ExecutionGraph<'a> {
    fn build(nodes: &'a [FlowNode], edges: &[FlowEdge]) -> Self {
        let mut graph = DiGraph::with_capacity(nodes.len(), edges.len());
        let mut index: HashMap<&str, NodeIndex> = HashMap::new();

        for (position, node) in nodes.iter().enumerate() {
            if index.contains_key(node.id.as_str()) {
                tracing::warn!("⚠️ Duplicate node id '{}' ignored during ordering", node.id);
                continue;
            }
            index.insert(node.id.as_str(), graph.add_node(position));
        }

        for (position, edge) in edges.iter().enumerate() {
            match (index.get(edge.source.as_str()), index.get(edge.target.as_str())) {
                (Some(&source), Some(&target)) => {
                    graph.add_edge(source, target, position);
                }
                _ => {
                    tracing::warn!(
                        "⚠️ Ignoring dangling edge '{}' ({} → {})",
                        edge.id, edge.source, edge.target
                    );
                }
            }
        }

        // petgraph yields edges newest-first; restore declaration order
        let successors = graph
            .node_indices()
            .map(|idx| {
                let mut out: Vec<(usize, NodeIndex)> = graph
                    .edges(idx)
                    .map(|e| (*e.weight(), e.target()))
                    .collect();
                out.sort_by_key(|(position, _)| *position);
                out.into_iter().map(|(_, target)| target).collect()
            })
            .collect();

        Self {
            nodes,
            graph,
            successors,
        }
    }

    /// Iterative pre-order DFS from `start`; equivalent to the recursive form
    /// but safe on long chains
    fn visit(&self, start: NodeIndex, visited: &mut [bool], order: &mut Vec<String>) {
        if visited[start.index()] {
            return;
        }
        visited[start.index()] = true;
        order.push(self.id(start));

        // (node, next successor to consider)
        let mut stack = vec![(start, 0usize)];
        while let Some((node, cursor)) = stack.pop() {
            let successors = &self.successors[node.index()];
            let Some(&next) = successors.get(cursor) else {
                continue;
            };
            stack.push((node, cursor + 1));

            if !visited[next.index()] {
                visited[next.index()] = true;
                order.push(self.id(next));
                stack.push((next, 0));
            }
        }
    }

    fn id(&self, idx: NodeIndex) -> String {
        self.nodes[self.graph[idx]].id.clone()
    }
}
