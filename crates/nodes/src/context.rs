//! `FlowContext`: per-flow execution state.
//!
//! Defined here (in the nodes crate) so both the engine and the node
//! implementations can use it without a circular dependency.  Nodes only
//! ever read it; the engine's context manager owns every mutation.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use timer::TimerId;

/// Why a flow ended in the error state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowFailure {
    pub message: String,
    /// Node that was executing, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node: Option<String>,
}

/// Mutable state of one flow instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowContext {
    pub flow_id: String,
    /// Regenerated on every start; ties log lines to one run.
    pub run_id: Uuid,
    pub current_node: Option<String>,
    /// Node id -> output, in execution order.
    pub node_outputs: IndexMap<String, Value>,
    /// Node id -> its one live timer.
    pub active_timers: BTreeMap<String, TimerId>,
    pub user_overrides: BTreeMap<String, bool>,
    pub start_time: DateTime<Utc>,
    pub ai_butler_enabled: bool,
    pub completed: bool,
    pub error: Option<FlowFailure>,
    /// The flow's context bag (spec context merged with start-time input).
    pub data: Map<String, Value>,
}

impl FlowContext {
    pub fn new(flow_id: impl Into<String>, ai_butler_enabled: bool, data: Map<String, Value>) -> Self {
        Self {
            flow_id: flow_id.into(),
            run_id: Uuid::new_v4(),
            current_node: None,
            node_outputs: IndexMap::new(),
            active_timers: BTreeMap::new(),
            user_overrides: BTreeMap::new(),
            start_time: Utc::now(),
            ai_butler_enabled,
            completed: false,
            error: None,
            data,
        }
    }

    /// Resolve a dotted path such as `nodeOutputs.detect.violation_detected`.
    ///
    /// The first segment names a context field (camelCase, as serialised);
    /// later segments walk objects by key and arrays by index.  Any missing
    /// segment yields `None`.
    pub fn get_context_value(&self, path: &str) -> Option<Value> {
        let mut segments = path.split('.');
        let root = segments.next().filter(|s| !s.is_empty())?;

        if root == "nodeOutputs" {
            let Some(node_id) = segments.next() else {
                return serde_json::to_value(&self.node_outputs).ok();
            };
            return walk(self.node_outputs.get(node_id)?, segments).cloned();
        }
        if root == "data" {
            let Some(key) = segments.next() else {
                return Some(Value::Object(self.data.clone()));
            };
            return walk(self.data.get(key)?, segments).cloned();
        }

        let root_value = match root {
            "flowId" => Value::String(self.flow_id.clone()),
            "runId" => Value::String(self.run_id.to_string()),
            "currentNode" => self.current_node.clone().map(Value::String)?,
            "activeTimers" => serde_json::to_value(&self.active_timers).ok()?,
            "userOverrides" => serde_json::to_value(&self.user_overrides).ok()?,
            "startTime" => Value::String(self.start_time.to_rfc3339()),
            "aiButlerEnabled" => Value::Bool(self.ai_butler_enabled),
            "completed" => Value::Bool(self.completed),
            "error" => serde_json::to_value(self.error.as_ref()?).ok()?,
            _ => return None,
        };
        walk(&root_value, segments).cloned()
    }

    /// Field `key` of the most recently stored node output.
    pub fn get_previous_node_output(&self, key: &str) -> Option<&Value> {
        self.node_outputs.last()?.1.get(key)
    }

    /// Numbers among the stored outputs, in execution order.
    pub fn numeric_outputs(&self) -> impl Iterator<Item = f64> + '_ {
        self.node_outputs.values().filter_map(Value::as_f64)
    }
}

/// JavaScript-style truthiness of a JSON value.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0 && !f.is_nan()),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

fn walk<'a, 'p>(mut value: &'a Value, segments: impl Iterator<Item = &'p str>) -> Option<&'a Value> {
    for segment in segments {
        value = match value {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn context() -> FlowContext {
        let mut data = Map::new();
        data.insert("budget".into(), json!({ "weekly": 120 }));
        let mut ctx = FlowContext::new("groceries", true, data);
        ctx.node_outputs.insert("pda".into(), json!({ "nominal": 18.0, "items": [{ "name": "milk" }] }));
        ctx.node_outputs.insert("detect".into(), json!({ "violation_detected": false }));
        ctx
    }

    #[test]
    fn resolves_nested_node_outputs() {
        let ctx = context();
        assert_eq!(ctx.get_context_value("nodeOutputs.pda.nominal"), Some(json!(18.0)));
        assert_eq!(ctx.get_context_value("nodeOutputs.pda.items.0.name"), Some(json!("milk")));
        assert_eq!(
            ctx.get_context_value("nodeOutputs.detect.violation_detected"),
            Some(json!(false))
        );
    }

    #[test]
    fn missing_segments_yield_none() {
        let ctx = context();
        assert_eq!(ctx.get_context_value("nodeOutputs.ghost.value"), None);
        assert_eq!(ctx.get_context_value("nodeOutputs.pda.items.7"), None);
        assert_eq!(ctx.get_context_value("nodeOutputs.pda.nominal.deeper"), None);
        assert_eq!(ctx.get_context_value("nonexistent.path"), None);
        assert_eq!(ctx.get_context_value(""), None);
        assert_eq!(ctx.get_context_value("currentNode"), None);
    }

    #[test]
    fn resolves_scalar_fields_and_data_bag() {
        let ctx = context();
        assert_eq!(ctx.get_context_value("flowId"), Some(json!("groceries")));
        assert_eq!(ctx.get_context_value("aiButlerEnabled"), Some(json!(true)));
        assert_eq!(ctx.get_context_value("data.budget.weekly"), Some(json!(120)));
    }

    #[test]
    fn previous_output_is_last_inserted() {
        let ctx = context();
        assert_eq!(ctx.get_previous_node_output("violation_detected"), Some(&json!(false)));
        assert_eq!(ctx.get_previous_node_output("nominal"), None);

        let empty = FlowContext::new("empty", true, Map::new());
        assert_eq!(empty.get_previous_node_output("items"), None);
    }

    #[test]
    fn truthiness_follows_script_rules() {
        assert!(!is_truthy(&json!(null)));
        assert!(!is_truthy(&json!(0)));
        assert!(!is_truthy(&json!("")));
        assert!(is_truthy(&json!("no")));
        assert!(is_truthy(&json!([])));
        assert!(is_truthy(&json!(-1.5)));
    }

    #[test]
    fn serialises_with_camel_case_keys() {
        let value = serde_json::to_value(context()).unwrap();
        assert!(value.get("nodeOutputs").is_some());
        assert!(value.get("aiButlerEnabled").is_some());
        assert!(value.get("node_outputs").is_none());
    }
}
