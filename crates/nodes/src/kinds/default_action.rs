//! `<Mode>.Default`: apply the node's action right away.
//!
//! This is the untimed path.  When a countdown applies, the engine routes
//! the node through the timer instead and never calls this.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::config::{decode, mismatch, Node, NodeConfig};
use crate::traits::{ExecutableNode, NodeEnv};
use crate::{FlowContext, NodeError};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DefaultConfig {
    #[serde(default)]
    pub action: String,
    #[serde(default)]
    pub timeout_s: Option<f64>,
}

pub struct DefaultNode;

impl ExecutableNode for DefaultNode {
    fn parse_config(&self, node_id: &str, node_type: &str, raw: &Value) -> Result<NodeConfig, NodeError> {
        decode(node_id, node_type, raw).map(NodeConfig::Default)
    }

    fn execute(&self, node: &Node, _ctx: &FlowContext, _env: &NodeEnv<'_>) -> Result<Value, NodeError> {
        let NodeConfig::Default(config) = &node.config else {
            return Err(mismatch(node, "Default"));
        };
        Ok(json!({
            "action_applied": true,
            "result": { "applied": true, "type": "immediate", "action": config.action },
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kinds::test_support::{context, event_names, executor, run};

    #[test]
    fn applies_immediately_without_events() {
        let (executor, log) = executor();
        let config = json!({ "action": "O.Fallback.comply", "timeout_s": 10 });
        let out = run(&executor, &context("rent"), "O.Default", config);

        assert_eq!(out["action_applied"], true);
        assert_eq!(out["result"]["type"], "immediate");
        assert_eq!(out["result"]["action"], "O.Fallback.comply");
        assert!(event_names(&log).is_empty());
    }
}
