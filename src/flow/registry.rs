/// Hot-reload flow registry using ArcSwap
///
/// Provides lock-free reads of the flow collection. Every edit clones the map,
/// applies the change and swaps the pointer, so runs that already hold a `Flow`
/// clone keep executing against the definition they started with.

use crate::error::EngineError;
use crate::flow::types::{Flow, FlowEdge, FlowNode};
use anyhow::{Context as _, Result};
use arc_swap::ArcSwap;
use chrono::Utc;
use std::{collections::HashMap, path::Path, sync::Arc};

/// Storage contract for flow definitions
///
/// The engine never mutates flows itself; the editor-facing API does, through
/// this trait. Implementations must be cheap to read concurrently.
pub trait FlowRepository: Send + Sync {
    fn get(&self, flow_id: &str) -> Option<Flow>;

    /// All flows, ordered by creation time
    fn list(&self) -> Vec<Flow>;

    /// Add a new flow; fails if the id is taken
    fn insert(&self, flow: Flow) -> Result<Flow, EngineError>;

    /// Replace the graph, bump `version` and `updatedAt`
    fn update_graph(
        &self,
        flow_id: &str,
        nodes: Vec<FlowNode>,
        edges: Vec<FlowEdge>,
    ) -> Result<Flow, EngineError>;

    fn rename(&self, flow_id: &str, name: &str) -> Result<Flow, EngineError>;

    fn set_enabled(&self, flow_id: &str, enabled: bool) -> Result<Flow, EngineError>;

    fn remove(&self, flow_id: &str) -> Result<Flow, EngineError>;

    fn toggle_enabled(&self, flow_id: &str) -> Result<Flow, EngineError> {
        let current = self
            .get(flow_id)
            .ok_or_else(|| EngineError::FlowNotFound(flow_id.to_string()))?;
        self.set_enabled(flow_id, !current.enabled)
    }

    /// Enabled flows only; candidates for automatic triggering
    fn list_enabled(&self) -> Vec<Flow> {
        self.list().into_iter().filter(|f| f.enabled).collect()
    }
}

/// Lock-free in-memory flow registry
#[derive(Debug, Default)]
pub struct FlowRegistry {
    /// Key: flow id
    flows: ArcSwap<HashMap<String, Flow>>,
}

impl FlowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Populate the registry from a JSON file holding an array of flows
    ///
    /// Existing entries with the same id are replaced. Returns how many flows were loaded.
    pub fn load_from_file(&self, path: impl AsRef<Path>) -> Result<usize> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read flows file {}", path.display()))?;
        let flows: Vec<Flow> = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse flows file {}", path.display()))?;

        let count = flows.len();
        self.flows.rcu(|current| {
            let mut next = (**current).clone();
            for flow in &flows {
                next.insert(flow.id.clone(), flow.clone());
            }
            next
        });

        tracing::info!("📥 Loaded {} flows from {}", count, path.display());
        Ok(count)
    }

    /// Apply `edit` to one flow and swap the registry
    fn modify(
        &self,
        flow_id: &str,
        edit: impl Fn(&mut Flow),
    ) -> Result<Flow, EngineError> {
        let mut updated = None;
        self.flows.rcu(|current| {
            let mut next = (**current).clone();
            updated = next.get_mut(flow_id).map(|flow| {
                edit(flow);
                flow.clone()
            });
            next
        });
        updated.ok_or_else(|| EngineError::FlowNotFound(flow_id.to_string()))
    }
}

impl FlowRepository for FlowRegistry {
    fn get(&self, flow_id: &str) -> Option<Flow> {
        self.flows.load().get(flow_id).cloned()
    }

    fn list(&self) -> Vec<Flow> {
        let mut flows: Vec<Flow> = self.flows.load().values().cloned().collect();
        flows.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        flows
    }

    fn insert(&self, flow: Flow) -> Result<Flow, EngineError> {
        let mut conflict = false;
        self.flows.rcu(|current| {
            conflict = current.contains_key(&flow.id);
            let mut next = (**current).clone();
            if !conflict {
                next.insert(flow.id.clone(), flow.clone());
            }
            next
        });

        if conflict {
            return Err(EngineError::FlowExists(flow.id));
        }
        tracing::info!("🔥 Registered flow: {} ({})", flow.id, flow.name);
        Ok(flow)
    }

    fn update_graph(
        &self,
        flow_id: &str,
        nodes: Vec<FlowNode>,
        edges: Vec<FlowEdge>,
    ) -> Result<Flow, EngineError> {
        let flow = self.modify(flow_id, |flow| {
            flow.graph.nodes = nodes.clone();
            flow.graph.edges = edges.clone();
            flow.version += 1;
            flow.updated_at = Utc::now();
        })?;
        tracing::info!("🔥 Hot-reloaded flow graph: {} (version {})", flow.id, flow.version);
        Ok(flow)
    }

    fn rename(&self, flow_id: &str, name: &str) -> Result<Flow, EngineError> {
        self.modify(flow_id, |flow| {
            flow.name = name.to_string();
            flow.updated_at = Utc::now();
        })
    }

    fn set_enabled(&self, flow_id: &str, enabled: bool) -> Result<Flow, EngineError> {
        let flow = self.modify(flow_id, |flow| flow.enabled = enabled)?;
        tracing::info!("🔀 Flow {} is now {}", flow.id, if flow.enabled { "enabled" } else { "disabled" });
        Ok(flow)
    }

    fn remove(&self, flow_id: &str) -> Result<Flow, EngineError> {
        let mut removed = None;
        self.flows.rcu(|current| {
            let mut next = (**current).clone();
            removed = next.remove(flow_id);
            next
        });
        let flow = removed.ok_or_else(|| EngineError::FlowNotFound(flow_id.to_string()))?;
        tracing::info!("🗑️ Removed flow from registry: {}", flow_id);
        Ok(flow)
    }
}

impl From<Vec<Flow>> for FlowRegistry {
    fn from(flows: Vec<Flow>) -> Self {
        let map = flows.into_iter().map(|f| (f.id.clone(), f)).collect();
        Self {
            flows: ArcSwap::new(Arc::new(map)),
        }
    }
}
