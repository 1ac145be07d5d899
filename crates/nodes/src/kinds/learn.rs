//! `B.Learn`: queue a learning episode for the user.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::config::{decode, mismatch, Node, NodeConfig};
use crate::traits::{ExecutableNode, NodeEnv};
use crate::{FlowContext, NodeError};

fn default_priority() -> String {
    "medium".into()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearnConfig {
    #[serde(default)]
    pub episode_id: Option<String>,
    #[serde(default = "default_priority")]
    pub priority: String,
}

pub struct LearnNode;

impl ExecutableNode for LearnNode {
    fn parse_config(&self, node_id: &str, node_type: &str, raw: &Value) -> Result<NodeConfig, NodeError> {
        decode(node_id, node_type, raw).map(NodeConfig::Learn)
    }

    fn execute(&self, node: &Node, ctx: &FlowContext, env: &NodeEnv<'_>) -> Result<Value, NodeError> {
        let NodeConfig::Learn(config) = &node.config else {
            return Err(mismatch(node, "B.Learn"));
        };
        let Some(episode_id) = config.episode_id.as_deref().filter(|id| !id.is_empty()) else {
            return Ok(json!({ "episode_queued": false }));
        };

        env.emit(
            "B.learn.triggered",
            ctx,
            node,
            json!({ "episode_id": episode_id, "priority": config.priority }),
        );
        Ok(json!({
            "episode_queued": true,
            "episode_id": episode_id,
            "priority": config.priority,
        }))
    }
}
