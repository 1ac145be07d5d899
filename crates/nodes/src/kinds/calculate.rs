//! `V.Calculate`: fold a list of numbers with a named formula.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::config::{decode, mismatch, Node, NodeConfig};
use crate::traits::{ExecutableNode, NodeEnv};
use crate::{FlowContext, NodeError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Formula {
    Sum,
    Average,
    /// Any other name; evaluates to `0`.
    Other(String),
}

impl Default for Formula {
    fn default() -> Self {
        Formula::Other(String::new())
    }
}

impl From<String> for Formula {
    fn from(name: String) -> Self {
        match name.as_str() {
            "sum" => Formula::Sum,
            "average" => Formula::Average,
            _ => Formula::Other(name),
        }
    }
}

impl From<Formula> for String {
    fn from(formula: Formula) -> Self {
        match formula {
            Formula::Sum => "sum".into(),
            Formula::Average => "average".into(),
            Formula::Other(name) => name,
        }
    }
}

impl Formula {
    pub fn apply(&self, inputs: &[f64]) -> f64 {
        match self {
            Formula::Sum => inputs.iter().sum(),
            Formula::Average if inputs.is_empty() => 0.0,
            Formula::Average => inputs.iter().sum::<f64>() / inputs.len() as f64,
            Formula::Other(_) => 0.0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CalculateConfig {
    #[serde(default)]
    pub formula: Formula,
    #[serde(default)]
    pub inputs: Vec<f64>,
}

pub struct CalculateNode;

impl ExecutableNode for CalculateNode {
    fn parse_config(&self, node_id: &str, node_type: &str, raw: &Value) -> Result<NodeConfig, NodeError> {
        decode(node_id, node_type, raw).map(NodeConfig::Calculate)
    }

    fn execute(&self, node: &Node, ctx: &FlowContext, env: &NodeEnv<'_>) -> Result<Value, NodeError> {
        let NodeConfig::Calculate(config) = &node.config else {
            return Err(mismatch(node, "V.Calculate"));
        };
        let result = config.formula.apply(&config.inputs);
        env.emit("V.calculate.completed", ctx, node, json!({ "result": result }));
        Ok(json!({ "result": result, "formula": config.formula }))
    }
}
