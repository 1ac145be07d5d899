//! Flow graph validation: run this before loading a flow.
//!
//! Rules enforced:
//! 1. Node IDs must be unique within the flow.
//! 2. Every edge must reference valid node IDs (both `from` and `to`).
//!
//! Cycles are allowed: conditional back-edges are how flows loop.

use std::collections::{HashMap, HashSet, VecDeque};

use tracing::warn;

use crate::{EngineError, models::FlowSpec};

/// Validate the flow's node ids and edge endpoints.
///
/// # Errors
/// - [`EngineError::DuplicateNodeId`] if two nodes share an ID.
/// - [`EngineError::UnknownNodeReference`] if an edge references a missing node.
pub fn validate_flow(spec: &FlowSpec) -> Result<(), EngineError> {
    // -----------------------------------------------------------------------
    // 1. Ensure node IDs are unique
    // -----------------------------------------------------------------------
    let mut seen_ids: HashSet<&str> = HashSet::new();
    for node in &spec.nodes {
        if !seen_ids.insert(node.id.as_str()) {
            return Err(EngineError::DuplicateNodeId(node.id.clone()));
        }
    }

    // -----------------------------------------------------------------------
    // 2. Validate edge endpoints
    // -----------------------------------------------------------------------
    for edge in &spec.edges {
        if !seen_ids.contains(edge.from.as_str()) {
            return Err(EngineError::UnknownNodeReference {
                node_id: edge.from.clone(),
                side: "from",
            });
        }
        if !seen_ids.contains(edge.to.as_str()) {
            return Err(EngineError::UnknownNodeReference {
                node_id: edge.to.clone(),
                side: "to",
            });
        }
    }

    Ok(())
}

/// The node execution starts from: the one with no incoming edge.
///
/// Returns `None` when every node has an incoming edge (or there are no
/// nodes).  With several candidates the first in declaration order wins.
pub fn find_start_node(spec: &FlowSpec) -> Option<&str> {
    let targets: HashSet<&str> = spec.edges.iter().map(|e| e.to.as_str()).collect();
    let mut roots = spec
        .nodes
        .iter()
        .map(|n| n.id.as_str())
        .filter(|id| !targets.contains(id));

    let start = roots.next()?;
    let others: Vec<&str> = roots.collect();
    if !others.is_empty() {
        warn!(
            flow = %spec.id,
            start,
            ignored = ?others,
            "flow has several nodes without incoming edges; using the first"
        );
    }
    Some(start)
}

/// Nodes that no path from `start` reaches, in declaration order.
pub fn unreachable_nodes(spec: &FlowSpec, start: Option<&str>) -> Vec<String> {
    let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();
    for edge in &spec.edges {
        adjacency
            .entry(edge.from.as_str())
            .or_default()
            .push(edge.to.as_str());
    }

    let mut visited: HashSet<&str> = HashSet::new();
    let mut queue: VecDeque<&str> = start.into_iter().collect();
    while let Some(node_id) = queue.pop_front() {
        if !visited.insert(node_id) {
            continue;
        }
        if let Some(neighbours) = adjacency.get(node_id) {
            queue.extend(neighbours.iter().copied());
        }
    }

    spec.nodes
        .iter()
        .filter(|n| !visited.contains(n.id.as_str()))
        .map(|n| n.id.clone())
        .collect()
}

// ============================================================
// Unit tests
// ============================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{FlowEdge, FlowNode};
    use serde_json::Value;

    fn make_node(id: &str) -> FlowNode {
        FlowNode::new(id, "V.Calculate", Value::Null)
    }

    fn make_flow(nodes: Vec<FlowNode>, edges: Vec<FlowEdge>) -> FlowSpec {
        FlowSpec::new("test", nodes, edges)
    }

    #[test]
    fn linear_flow_starts_at_its_head() {
        // A → B → C
        let spec = make_flow(
            vec![make_node("a"), make_node("b"), make_node("c")],
            vec![FlowEdge::always("a", "b"), FlowEdge::always("b", "c")],
        );
        validate_flow(&spec).expect("should be valid");
        assert_eq!(find_start_node(&spec), Some("a"));
        assert!(unreachable_nodes(&spec, Some("a")).is_empty());
    }

    #[test]
    fn start_node_ignores_declaration_position() {
        let spec = make_flow(
            vec![make_node("b"), make_node("a")],
            vec![FlowEdge::always("a", "b")],
        );
        assert_eq!(find_start_node(&spec), Some("a"));
    }

    #[test]
    fn duplicate_node_id_is_rejected() {
        let spec = make_flow(vec![make_node("a"), make_node("a")], vec![]);
        assert!(matches!(
            validate_flow(&spec),
            Err(EngineError::DuplicateNodeId(id)) if id == "a"
        ));
    }

    #[test]
    fn edge_referencing_missing_node_is_rejected() {
        let spec = make_flow(vec![make_node("a")], vec![FlowEdge::always("a", "ghost")]);
        assert!(matches!(
            validate_flow(&spec),
            Err(EngineError::UnknownNodeReference { node_id, side: "to" }) if node_id == "ghost"
        ));
    }

    #[test]
    fn cycle_is_allowed_but_has_no_start() {
        // A → B → A
        let spec = make_flow(
            vec![make_node("a"), make_node("b")],
            vec![FlowEdge::always("a", "b"), FlowEdge::always("b", "a")],
        );
        validate_flow(&spec).expect("cycles are legal");
        assert_eq!(find_start_node(&spec), None);
    }

    #[test]
    fn empty_flow_has_no_start() {
        assert_eq!(find_start_node(&make_flow(vec![], vec![])), None);
    }

    #[test]
    fn unreachable_nodes_are_reported() {
        let spec = make_flow(
            vec![make_node("a"), make_node("b"), make_node("island")],
            vec![FlowEdge::always("a", "b"), FlowEdge::always("island", "island")],
        );
        assert_eq!(unreachable_nodes(&spec, Some("a")), vec!["island"]);
    }
}
