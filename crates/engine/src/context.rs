//! Flow Context Manager: per-flow mutable execution state keyed by flow id.
//!
//! Every mutation of a [`FlowContext`] goes through this store.  Callers get
//! clones or closures over a borrowed context; the lock is never held while
//! a caller-supplied callback that may re-enter the store is running.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use nodes::{FlowContext, FlowFailure};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use timer::TimerId;
use tracing::debug;
use uuid::Uuid;

use crate::models::FlowSpec;

/// Partial update for [`ContextManager::update`].  `None` leaves a field as
/// it is; the nested options on `current_node` and `error` allow clearing.
#[derive(Debug, Clone, Default)]
pub struct ContextPatch {
    pub current_node: Option<Option<String>>,
    pub completed: Option<bool>,
    pub error: Option<Option<FlowFailure>>,
    pub ai_butler_enabled: Option<bool>,
    pub start_time: Option<DateTime<Utc>>,
    pub run_id: Option<Uuid>,
    pub data: Option<Map<String, Value>>,
}

#[derive(Debug, Default)]
pub struct ContextManager {
    contexts: Mutex<HashMap<String, FlowContext>>,
}

impl ContextManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create (or replace) the context for `spec`, with default field values.
    pub fn create(&self, spec: &FlowSpec, ai_butler_enabled: bool) -> FlowContext {
        let ctx = FlowContext::new(spec.id.clone(), ai_butler_enabled, spec.context.clone());
        debug!(flow = %spec.id, run_id = %ctx.run_id, "context created");
        self.contexts.lock().insert(spec.id.clone(), ctx.clone());
        ctx
    }

    /// Snapshot of a flow's context.
    pub fn get(&self, flow_id: &str) -> Option<FlowContext> {
        self.contexts.lock().get(flow_id).cloned()
    }

    /// Run `f` against the context without cloning it.
    pub fn read<R>(&self, flow_id: &str, f: impl FnOnce(&FlowContext) -> R) -> Option<R> {
        self.contexts.lock().get(flow_id).map(f)
    }

    pub fn exists(&self, flow_id: &str) -> bool {
        self.contexts.lock().contains_key(flow_id)
    }

    /// Shallow-merge `patch` into the context.  Returns `false` if there is
    /// no context for `flow_id`.
    pub fn update(&self, flow_id: &str, patch: ContextPatch) -> bool {
        self.with_mut(flow_id, |ctx| {
            if let Some(current_node) = patch.current_node {
                ctx.current_node = current_node;
            }
            if let Some(completed) = patch.completed {
                ctx.completed = completed;
            }
            if let Some(error) = patch.error {
                ctx.error = error;
            }
            if let Some(enabled) = patch.ai_butler_enabled {
                ctx.ai_butler_enabled = enabled;
            }
            if let Some(start_time) = patch.start_time {
                ctx.start_time = start_time;
            }
            if let Some(run_id) = patch.run_id {
                ctx.run_id = run_id;
            }
            if let Some(data) = patch.data {
                ctx.data = data;
            }
            if ctx.completed {
                ctx.current_node = None;
            }
        })
    }

    pub fn remove(&self, flow_id: &str) -> Option<FlowContext> {
        self.contexts.lock().remove(flow_id)
    }

    /// Flow ids whose context is neither completed nor errored, sorted.
    pub fn list_active(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .contexts
            .lock()
            .values()
            .filter(|ctx| !ctx.completed && ctx.error.is_none())
            .map(|ctx| ctx.flow_id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn store_node_output(&self, flow_id: &str, node_id: &str, output: Value) -> bool {
        self.with_mut(flow_id, |ctx| {
            // Re-running a node moves it to the end so "previous output"
            // stays the most recently executed node.
            ctx.node_outputs.shift_remove(node_id);
            ctx.node_outputs.insert(node_id.to_owned(), output);
        })
    }

    pub fn set_user_override(&self, flow_id: &str, node_id: &str, value: bool) -> bool {
        self.with_mut(flow_id, |ctx| {
            ctx.user_overrides.insert(node_id.to_owned(), value);
        })
    }

    /// Record `timer_id` as the live timer of `node_id`.  Returns the timer
    /// it displaced, if any.
    pub fn add_active_timer(&self, flow_id: &str, node_id: &str, timer_id: TimerId) -> Option<TimerId> {
        self.contexts
            .lock()
            .get_mut(flow_id)?
            .active_timers
            .insert(node_id.to_owned(), timer_id)
    }

    pub fn remove_active_timer(&self, flow_id: &str, node_id: &str) -> Option<TimerId> {
        self.contexts
            .lock()
            .get_mut(flow_id)?
            .active_timers
            .remove(node_id)
    }

    /// Remove the node's entry only if it still refers to `timer_id`.
    pub fn remove_active_timer_if(&self, flow_id: &str, node_id: &str, timer_id: &str) -> bool {
        let mut contexts = self.contexts.lock();
        let Some(ctx) = contexts.get_mut(flow_id) else {
            return false;
        };
        if ctx.active_timers.get(node_id).map(TimerId::as_str) == Some(timer_id) {
            ctx.active_timers.remove(node_id);
            true
        } else {
            false
        }
    }

    pub fn active_timer(&self, flow_id: &str, node_id: &str) -> Option<TimerId> {
        self.read(flow_id, |ctx| ctx.active_timers.get(node_id).cloned())
            .flatten()
    }

    /// Invoke `on_each` for every active timer of the flow, then drop those
    /// entries.  The lock is released while `on_each` runs.  Returns how many
    /// timers were visited.
    pub fn clear_active_timers(&self, flow_id: &str, mut on_each: impl FnMut(&str, &TimerId)) -> usize {
        let Some(snapshot) = self.read(flow_id, |ctx| ctx.active_timers.clone()) else {
            return 0;
        };

        for (node_id, timer_id) in &snapshot {
            on_each(node_id, timer_id);
        }

        self.with_mut(flow_id, |ctx| {
            for (node_id, timer_id) in &snapshot {
                if ctx.active_timers.get(node_id) == Some(timer_id) {
                    ctx.active_timers.remove(node_id);
                }
            }
        });
        snapshot.len()
    }

    /// Dotted-path lookup against the flow's context.
    pub fn get_context_value(&self, flow_id: &str, path: &str) -> Option<Value> {
        self.read(flow_id, |ctx| ctx.get_context_value(path)).flatten()
    }

    fn with_mut(&self, flow_id: &str, f: impl FnOnce(&mut FlowContext)) -> bool {
        match self.contexts.lock().get_mut(flow_id) {
            Some(ctx) => {
                f(ctx);
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn manager_with(flow_id: &str) -> ContextManager {
        let manager = ContextManager::new();
        let mut spec = FlowSpec::new(flow_id, vec![], vec![]);
        spec.context.insert("budget".into(), json!(120));
        manager.create(&spec, true);
        manager
    }

    fn timer_id(raw: &str) -> TimerId {
        serde_json::from_value(json!(raw)).unwrap()
    }

    #[test]
    fn create_uses_defaults_and_spec_context() {
        let manager = manager_with("groceries");
        let ctx = manager.get("groceries").unwrap();
        assert_eq!(ctx.flow_id, "groceries");
        assert!(ctx.current_node.is_none());
        assert!(ctx.node_outputs.is_empty());
        assert!(ctx.ai_butler_enabled);
        assert!(!ctx.completed);
        assert_eq!(ctx.data["budget"], 120);
        assert_eq!(manager.get_context_value("groceries", "data.budget"), Some(json!(120)));
    }

    #[test]
    fn update_merges_and_completion_clears_current_node() {
        let manager = manager_with("f");
        assert!(manager.update(
            "f",
            ContextPatch {
                current_node: Some(Some("a".into())),
                ..Default::default()
            }
        ));
        assert_eq!(manager.get("f").unwrap().current_node.as_deref(), Some("a"));

        manager.update(
            "f",
            ContextPatch {
                completed: Some(true),
                ..Default::default()
            },
        );
        let ctx = manager.get("f").unwrap();
        assert!(ctx.completed);
        assert!(ctx.current_node.is_none());

        assert!(!manager.update("missing", ContextPatch::default()));
    }

    #[test]
    fn list_active_skips_finished_and_errored() {
        let manager = ContextManager::new();
        for id in ["c", "a", "b"] {
            manager.create(&FlowSpec::new(id, vec![], vec![]), true);
        }
        manager.update(
            "b",
            ContextPatch {
                completed: Some(true),
                ..Default::default()
            },
        );
        manager.update(
            "c",
            ContextPatch {
                error: Some(Some(FlowFailure {
                    message: "boom".into(),
                    node: None,
                })),
                ..Default::default()
            },
        );
        assert_eq!(manager.list_active(), vec!["a".to_string()]);
    }

    #[test]
    fn node_outputs_keep_execution_order() {
        let manager = manager_with("f");
        manager.store_node_output("f", "a", json!({ "items": [1] }));
        manager.store_node_output("f", "b", json!({ "items": [2] }));
        manager.store_node_output("f", "a", json!({ "items": [3] }));

        let ctx = manager.get("f").unwrap();
        let order: Vec<&String> = ctx.node_outputs.keys().collect();
        assert_eq!(order, ["b", "a"]);
        assert_eq!(ctx.get_previous_node_output("items"), Some(&json!([3])));
    }

    #[test]
    fn active_timers_are_keyed_by_node() {
        let manager = manager_with("f");
        assert_eq!(manager.add_active_timer("f", "wait", timer_id("f_wait_1")), None);
        assert_eq!(
            manager.add_active_timer("f", "wait", timer_id("f_wait_2")),
            Some(timer_id("f_wait_1"))
        );
        assert!(!manager.remove_active_timer_if("f", "wait", "f_wait_1"));
        assert_eq!(manager.active_timer("f", "wait"), Some(timer_id("f_wait_2")));
        assert!(manager.remove_active_timer_if("f", "wait", "f_wait_2"));
        assert_eq!(manager.active_timer("f", "wait"), None);
        assert_eq!(manager.add_active_timer("missing", "x", timer_id("x")), None);
    }

    #[test]
    fn remove_active_timer_returns_the_entry() {
        let manager = manager_with("f");
        manager.add_active_timer("f", "wait", timer_id("f_wait_1"));

        assert_eq!(manager.remove_active_timer("f", "wait"), Some(timer_id("f_wait_1")));
        assert_eq!(manager.remove_active_timer("f", "wait"), None);
        assert_eq!(manager.remove_active_timer("missing", "wait"), None);
        assert!(manager.get("f").unwrap().active_timers.is_empty());
    }

    #[test]
    fn clear_active_timers_calls_back_before_clearing() {
        let manager = manager_with("f");
        manager.add_active_timer("f", "a", timer_id("f_a_1"));
        manager.add_active_timer("f", "b", timer_id("f_b_2"));

        let mut seen = Vec::new();
        let cleared = manager.clear_active_timers("f", |node, id| {
            // Entry is still present while the callback runs.
            assert_eq!(manager.active_timer("f", node).as_ref(), Some(id));
            seen.push(node.to_owned());
        });

        assert_eq!(cleared, 2);
        assert_eq!(seen, ["a", "b"]);
        assert!(manager.get("f").unwrap().active_timers.is_empty());
        assert_eq!(manager.clear_active_timers("f", |_, _| panic!("no timers")), 0);
        assert_eq!(manager.clear_active_timers("missing", |_, _| {}), 0);
    }

    #[test]
    fn remove_discards_the_context() {
        let manager = manager_with("f");
        assert!(manager.remove("f").is_some());
        assert!(!manager.exists("f"));
        assert!(!manager.store_node_output("f", "a", json!(1)));
        assert!(!manager.set_user_override("f", "a", true));
    }
}
