//! Typed node configuration.
//!
//! A flow definition carries each node's `config` as free-form JSON.  At
//! load time the node's handler decodes it into one of the variants below,
//! so malformed configs are rejected before anything runs.

use serde::de::DeserializeOwned;
use serde_json::Value;
use timer::Mode;

use crate::kinds::{
    assess::AssessConfig, calculate::CalculateConfig, default_action::DefaultConfig,
    detect::DetectConfig, learn::LearnConfig, pda::PdaConfig, sweep::SweepConfig,
};
use crate::NodeError;

/// Decoded `config` of a node, one variant per built-in kind.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeConfig {
    Pda(PdaConfig),
    Calculate(CalculateConfig),
    Assess(AssessConfig),
    Detect(DetectConfig),
    Default(DefaultConfig),
    Sweep(SweepConfig),
    Learn(LearnConfig),
    /// Config of a node whose type has no built-in decoder.
    Opaque(Value),
}

/// Countdown attached to a node: apply `action` after `timeout_s` unless the
/// user steps in first.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeTimeout {
    pub timeout_s: f64,
    pub action: String,
    pub mode: Mode,
}

impl NodeTimeout {
    /// Read `timeout_s` / `action` out of a raw config.
    ///
    /// A zero, missing, or non-numeric `timeout_s` means "no countdown", as
    /// does a node type without a recognised mode prefix.
    pub fn from_raw(node_type: &str, raw: &Value) -> Option<Self> {
        let timeout_s = raw.get("timeout_s").and_then(Value::as_f64)?;
        if timeout_s == 0.0 || timeout_s.is_nan() {
            return None;
        }
        let mode = Mode::of_node_type(node_type)?;
        let action = raw
            .get("action")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned();
        Some(Self { timeout_s, action, mode })
    }
}

/// A node ready to execute.
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub id: String,
    /// `"<Mode>.<Kind>"`, the dispatch key.
    pub node_type: String,
    pub label: String,
    pub config: NodeConfig,
    pub timeout: Option<NodeTimeout>,
}

/// Decode a raw config into `T`, treating `null` as an empty object.
pub(crate) fn decode<T: DeserializeOwned>(
    node_id: &str,
    node_type: &str,
    raw: &Value,
) -> Result<T, NodeError> {
    let raw = if raw.is_null() { Value::Object(Default::default()) } else { raw.clone() };
    serde_json::from_value(raw).map_err(|e| NodeError::InvalidConfig {
        node_id: node_id.to_owned(),
        node_type: node_type.to_owned(),
        message: e.to_string(),
    })
}

/// Error for a handler handed a config variant it does not own.
pub(crate) fn mismatch(node: &Node, expected: &str) -> NodeError {
    NodeError::InvalidConfig {
        node_id: node.id.clone(),
        node_type: node.node_type.clone(),
        message: format!("expected {expected} config"),
    }
}
