//! `B.Sweep`: recompute a set of KPIs from the flow so far.
//!
//! Each KPI is a formula in a three-verb language:
//! `last(path)` reads a context path, `count(..)` counts stored outputs,
//! `sum(..)` adds the numeric ones.  Anything else evaluates to `null`.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::config::{decode, mismatch, Node, NodeConfig};
use crate::traits::{ExecutableNode, NodeEnv};
use crate::{FlowContext, NodeError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum KpiFormula {
    Last(String),
    Count,
    Sum,
    Unsupported(String),
}

fn call<'a>(formula: &'a str, verb: &str) -> Option<&'a str> {
    formula.strip_prefix(verb)?.strip_prefix('(')?.strip_suffix(')')
}

impl From<String> for KpiFormula {
    fn from(formula: String) -> Self {
        let trimmed = formula.trim();
        if let Some(path) = call(trimmed, "last") {
            KpiFormula::Last(path.trim().to_owned())
        } else if call(trimmed, "count").is_some() {
            KpiFormula::Count
        } else if call(trimmed, "sum").is_some() {
            KpiFormula::Sum
        } else {
            KpiFormula::Unsupported(formula)
        }
    }
}

impl From<KpiFormula> for String {
    fn from(formula: KpiFormula) -> Self {
        match formula {
            KpiFormula::Last(path) => format!("last({path})"),
            KpiFormula::Count => "count()".into(),
            KpiFormula::Sum => "sum()".into(),
            KpiFormula::Unsupported(raw) => raw,
        }
    }
}

impl KpiFormula {
    pub fn evaluate(&self, ctx: &FlowContext) -> Value {
        match self {
            KpiFormula::Last(path) => ctx.get_context_value(path).unwrap_or(Value::Null),
            KpiFormula::Count => json!(ctx.node_outputs.len()),
            KpiFormula::Sum => json!(ctx.numeric_outputs().sum::<f64>()),
            KpiFormula::Unsupported(_) => Value::Null,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SweepConfig {
    #[serde(default)]
    pub kpis: IndexMap<String, KpiFormula>,
}

pub struct SweepNode;

impl ExecutableNode for SweepNode {
    fn parse_config(&self, node_id: &str, node_type: &str, raw: &Value) -> Result<NodeConfig, NodeError> {
        decode(node_id, node_type, raw).map(NodeConfig::Sweep)
    }

    fn execute(&self, node: &Node, ctx: &FlowContext, env: &NodeEnv<'_>) -> Result<Value, NodeError> {
        let NodeConfig::Sweep(config) = &node.config else {
            return Err(mismatch(node, "B.Sweep"));
        };
        // Declaration order survives into the event and output.
        let kpis: serde_json::Map<String, Value> = config
            .kpis
            .iter()
            .map(|(name, formula)| (name.clone(), formula.evaluate(ctx)))
            .collect();

        env.emit("B.sweep.updated", ctx, node, json!({ "kpis": kpis }));
        Ok(json!({ "kpis": kpis }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kinds::test_support::{context, executor, run};

    #[test]
    fn formulas_parse_into_verbs() {
        assert_eq!(KpiFormula::from("last(nodeOutputs.pda.real)".to_string()), KpiFormula::Last("nodeOutputs.pda.real".into()));
        assert_eq!(KpiFormula::from(" count(*) ".to_string()), KpiFormula::Count);
        assert_eq!(KpiFormula::from("sum(outputs)".to_string()), KpiFormula::Sum);
        assert!(matches!(KpiFormula::from("max(x)".to_string()), KpiFormula::Unsupported(_)));
    }

    #[test]
    fn kpis_are_computed_from_context() {
        let (executor, log) = executor();
        let mut ctx = context("groceries");
        ctx.node_outputs.insert("pda".into(), json!({ "real": 15.48 }));
        ctx.node_outputs.insert("calc".into(), json!(4));
        ctx.node_outputs.insert("calc2".into(), json!(6.5));

        let config = json!({ "kpis": {
            "real_spend": "last(nodeOutputs.pda.real)",
            "steps": "count()",
            "total": "sum()",
            "missing": "last(nodeOutputs.ghost)",
            "bogus": "median()",
        }});
        let out = run(&executor, &ctx, "B.Sweep", config);

        assert_eq!(out["kpis"]["real_spend"], 15.48);
        assert_eq!(out["kpis"]["steps"], 3);
        assert_eq!(out["kpis"]["total"], 10.5);
        assert_eq!(out["kpis"]["missing"], Value::Null);
        assert_eq!(out["kpis"]["bogus"], Value::Null);
        let order: Vec<&str> = out["kpis"].as_object().unwrap().keys().map(String::as_str).collect();
        assert_eq!(order, ["real_spend", "steps", "total", "missing", "bogus"]);

        let log = log.lock();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].0, "B.sweep.updated");
        assert_eq!(log[0].1["kpis"]["steps"], 3);
        assert_eq!(log[0].1["kpis"].as_object().unwrap().keys().next().map(String::as_str), Some("real_spend"));
    }
}
