//! `I.Detect`: flag violations in the previous node's items.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::config::{decode, mismatch, Node, NodeConfig};
use crate::context::is_truthy;
use crate::traits::{ExecutableNode, NodeEnv};
use crate::{FlowContext, NodeError};

const SHRINK: &str = "shrink";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DetectConfig {
    #[serde(default)]
    pub triggers: Vec<String>,
}

pub struct DetectNode;

impl ExecutableNode for DetectNode {
    fn parse_config(&self, node_id: &str, node_type: &str, raw: &Value) -> Result<NodeConfig, NodeError> {
        decode(node_id, node_type, raw).map(NodeConfig::Detect)
    }

    fn execute(&self, node: &Node, ctx: &FlowContext, env: &NodeEnv<'_>) -> Result<Value, NodeError> {
        let NodeConfig::Detect(config) = &node.config else {
            return Err(mismatch(node, "I.Detect"));
        };
        if !config.triggers.iter().any(|t| t == SHRINK) {
            return Ok(json!({ "violation_detected": false, "affected_items": [] }));
        }

        let affected: Vec<Value> = ctx
            .get_previous_node_output("items")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter(|item| item.get(SHRINK).is_some_and(is_truthy))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        let violation_detected = !affected.is_empty();
        if violation_detected {
            env.emit(
                "I.detect.violation",
                ctx,
                node,
                json!({ "trigger": SHRINK, "items": affected }),
            );
        }
        Ok(json!({ "violation_detected": violation_detected, "affected_items": affected }))
    }
}
