/// Flow definition layer
///
/// This module holds the static graph model the engine consumes:
/// - Type definitions (Flow, FlowNode, FlowEdge) and structural validation
/// - Lock-free hot-reload registry using ArcSwap

// Core flow type definitions
pub mod types;

// Hot-reload registry behind the FlowRepository trait
pub mod registry;

// Re-export commonly used types
pub use registry::{FlowRegistry, FlowRepository};
pub use types::{Context, Flow, FlowEdge, FlowGraph, FlowNode, GraphIssue, NodeData, NodeKind, Position};
