//! Flow definition types.
//!
//! These are the shapes a flow loader hands to
//! [`FlowRunner::load_flow`](crate::FlowRunner::load_flow); they
//! (de)serialise to the JSON flow format.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ---------------------------------------------------------------------------
// FlowNode
// ---------------------------------------------------------------------------

/// A single step in the flow graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowNode {
    /// Unique identifier within this flow (referenced by edges).
    pub id: String,
    /// `"<Mode>.<Kind>"`, e.g. `"V.PDA"` or `"I.Default"`.
    #[serde(rename = "type")]
    pub node_type: String,
    #[serde(default)]
    pub label: String,
    /// Kind-specific configuration, decoded when the flow is loaded.
    #[serde(default)]
    pub config: Value,
}

impl FlowNode {
    pub fn new(id: impl Into<String>, node_type: impl Into<String>, config: Value) -> Self {
        Self {
            id: id.into(),
            node_type: node_type.into(),
            label: String::new(),
            config,
        }
    }
}

// ---------------------------------------------------------------------------
// FlowEdge
// ---------------------------------------------------------------------------

fn always() -> String {
    "always".into()
}

/// Directed, conditional edge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowEdge {
    pub from: String,
    pub to: String,
    /// `"always"`, `"never"`, or an expression with `{{path}}` placeholders.
    #[serde(default = "always")]
    pub condition: String,
}

impl FlowEdge {
    pub fn new(from: impl Into<String>, to: impl Into<String>, condition: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            condition: condition.into(),
        }
    }

    pub fn always(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self::new(from, to, always())
    }
}

// ---------------------------------------------------------------------------
// FlowSpec
// ---------------------------------------------------------------------------

/// A complete flow definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowSpec {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub nodes: Vec<FlowNode>,
    #[serde(default)]
    pub edges: Vec<FlowEdge>,
    /// Initial key/value data, merged with start-time input.
    #[serde(default)]
    pub context: Map<String, Value>,
}

impl FlowSpec {
    /// Convenience constructor for testing.
    pub fn new(id: impl Into<String>, nodes: Vec<FlowNode>, edges: Vec<FlowEdge>) -> Self {
        Self {
            id: id.into(),
            title: String::new(),
            description: String::new(),
            nodes,
            edges,
            context: Map::new(),
        }
    }
}
