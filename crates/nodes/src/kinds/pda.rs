//! `V.PDA`: personal deflated amount of a basket.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::config::{decode, mismatch, Node, NodeConfig};
use crate::traits::{ExecutableNode, NodeEnv};
use crate::{FlowContext, NodeError};

/// Average relative price change below which a basket is "Great".
const GREAT_BELOW: f64 = -0.02;
/// Average relative price change above which a basket is "Poor".
const POOR_ABOVE: f64 = 0.02;

/// One basket line.  Extra fields (name, shrink, ...) pass through to the
/// output so later nodes can inspect them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PdaItem {
    pub price: f64,
    pub usual: f64,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PdaConfig {
    #[serde(default)]
    pub items: Vec<PdaItem>,
}

pub fn classify(avg: f64) -> &'static str {
    if avg < GREAT_BELOW {
        "Great"
    } else if avg > POOR_ABOVE {
        "Poor"
    } else {
        "OK"
    }
}

pub struct PdaNode;

impl ExecutableNode for PdaNode {
    fn parse_config(&self, node_id: &str, node_type: &str, raw: &Value) -> Result<NodeConfig, NodeError> {
        decode(node_id, node_type, raw).map(NodeConfig::Pda)
    }

    fn execute(&self, node: &Node, ctx: &FlowContext, env: &NodeEnv<'_>) -> Result<Value, NodeError> {
        let NodeConfig::Pda(config) = &node.config else {
            return Err(mismatch(node, "V.PDA"));
        };
        env.emit("V.pda.started", ctx, node, json!({}));

        let deflator = env.settings.deflator_for(&ctx.flow_id);
        let mut nominal = 0.0;
        let mut real = 0.0;
        let mut quality_score = 0.0;
        for item in &config.items {
            nominal += item.price;
            real += item.price * deflator;
            quality_score += (item.price - item.usual) / item.usual;
        }
        // An empty basket averages to NaN and classifies as "OK".
        let avg = quality_score / config.items.len() as f64;
        let quality = classify(avg);

        env.emit(
            "V.pda.completed",
            ctx,
            node,
            json!({ "nominal": nominal, "real": real, "quality": quality }),
        );
        Ok(json!({
            "nominal": nominal,
            "real": real,
            "quality": quality,
            "quality_score": quality_score,
            "items": config.items,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kinds::test_support::{context, event_names, executor, run};

    fn basket() -> Value {
        json!({ "items": [
            { "name": "bread", "price": 10.0, "usual": 10.0 },
            { "name": "milk", "price": 8.0, "usual": 10.0, "shrink": true },
        ]})
    }

    #[test]
    fn groceries_basket_is_deflated_and_rated_great() {
        let (executor, log) = executor();
        let out = run(&executor, &context("groceries"), "V.PDA", basket());

        assert_eq!(out["nominal"], 18.0);
        assert!((out["real"].as_f64().unwrap() - 15.48).abs() < 1e-9);
        assert!((out["quality_score"].as_f64().unwrap() + 0.2).abs() < 1e-9);
        assert_eq!(out["quality"], "Great");
        assert_eq!(out["items"][1]["shrink"], true);
        assert_eq!(event_names(&log), vec!["V.pda.started", "V.pda.completed"]);
    }

    #[test]
    fn other_flows_use_unit_deflator() {
        let (executor, _) = executor();
        let out = run(&executor, &context("household"), "V.PDA", basket());
        assert_eq!(out["real"], 18.0);
    }

    #[test]
    fn price_rises_rate_poor() {
        let (executor, _) = executor();
        let config = json!({ "items": [{ "price": 11.0, "usual": 10.0 }] });
        let out = run(&executor, &context("groceries"), "V.PDA", config);
        assert_eq!(out["quality"], "Poor");
    }

    #[test]
    fn empty_basket_is_ok() {
        let (executor, _) = executor();
        let out = run(&executor, &context("groceries"), "V.PDA", json!({ "items": [] }));
        assert_eq!(out["nominal"], 0.0);
        assert_eq!(out["quality"], "OK");
    }

    #[test]
    fn classification_bounds_are_exclusive() {
        assert_eq!(classify(-0.02), "OK");
        assert_eq!(classify(0.02), "OK");
        assert_eq!(classify(-0.021), "Great");
        assert_eq!(classify(0.021), "Poor");
    }
}
