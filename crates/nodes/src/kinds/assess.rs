//! `V.Assess`: placeholder risk/fairness assessment.
//!
//! The verdict is a random draw against a threshold.  The randomness comes
//! from the executor so callers can seed it; a real assessment model would
//! replace [`AssessNode::execute`] without touching the runner.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::config::{decode, mismatch, Node, NodeConfig};
use crate::traits::{ExecutableNode, NodeEnv};
use crate::{FlowContext, NodeError};

const EXPLANATION: &str = "Placeholder assessment: random score compared against threshold";

fn default_threshold() -> f64 {
    0.5
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssessConfig {
    #[serde(default = "default_threshold")]
    pub threshold: f64,
}

impl Default for AssessConfig {
    fn default() -> Self {
        Self { threshold: default_threshold() }
    }
}

pub struct AssessNode;

impl ExecutableNode for AssessNode {
    fn parse_config(&self, node_id: &str, node_type: &str, raw: &Value) -> Result<NodeConfig, NodeError> {
        decode(node_id, node_type, raw).map(NodeConfig::Assess)
    }

    fn execute(&self, node: &Node, ctx: &FlowContext, env: &NodeEnv<'_>) -> Result<Value, NodeError> {
        let NodeConfig::Assess(config) = &node.config else {
            return Err(mismatch(node, "V.Assess"));
        };
        let score = env.random();
        let passed = score > config.threshold;
        env.emit("V.assess.completed", ctx, node, json!({ "assessment": passed }));
        Ok(json!({
            "assessment": passed,
            "score": score,
            "threshold": config.threshold,
            "explanation": EXPLANATION,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kinds::test_support::{context, run};
    use crate::NodeExecutor;
    use bus::EventBus;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn threshold_bounds_force_the_verdict() {
        let executor = NodeExecutor::new(EventBus::new());
        let ctx = context("risk");

        let always = run(&executor, &ctx, "V.Assess", json!({ "threshold": -1.0 }));
        assert_eq!(always["assessment"], true);

        let never = run(&executor, &ctx, "V.Assess", json!({ "threshold": 1.0 }));
        assert_eq!(never["assessment"], false);
    }

    #[test]
    fn seeded_source_is_reproducible() {
        let ctx = context("risk");
        let first = NodeExecutor::new(EventBus::new()).with_rng(StdRng::seed_from_u64(7));
        let second = NodeExecutor::new(EventBus::new()).with_rng(StdRng::seed_from_u64(7));

        let a = run(&first, &ctx, "V.Assess", Value::Null);
        let b = run(&second, &ctx, "V.Assess", Value::Null);
        assert_eq!(a["score"], b["score"]);
        assert_eq!(a["threshold"], 0.5);
    }
}
