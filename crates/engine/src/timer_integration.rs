//! Flow Timer Integration: runs a timed node through the [`TimerManager`]
//! and turns the timer's outcome back into an ordinary node output.

use std::sync::Arc;

use bus::{Event, EventBus, ListenerId};
use nodes::{Node, NodeError};
use parking_lot::Mutex;
use serde_json::{json, Value};
use timer::{TimerConfig, TimerId, TimerManager};
use tracing::{debug, warn};

use crate::context::ContextManager;
use crate::error::EngineError;

/// Called with `(node_id, output)` when a node's default action is applied.
pub type CompletionCallback = Arc<dyn Fn(&str, Value) + Send + Sync>;

/// Listener bookkeeping for one node timeout.
#[derive(Default)]
struct Watch {
    applied: Option<ListenerId>,
    cancelled: Option<ListenerId>,
    timer_id: Option<TimerId>,
    settled: bool,
}

impl Watch {
    /// Accept `event` as this timer's terminal event, at most once.
    fn settle(&mut self, event: &Event) -> bool {
        if self.settled {
            return false;
        }
        if let Some(id) = &self.timer_id {
            if event.str_field("timer_id") != Some(id.as_str()) {
                return false;
            }
        }
        self.settled = true;
        true
    }
}

#[derive(Clone)]
pub struct FlowTimerIntegration {
    bus: EventBus,
    timers: TimerManager,
    contexts: Arc<ContextManager>,
}

impl FlowTimerIntegration {
    pub fn new(bus: EventBus, timers: TimerManager, contexts: Arc<ContextManager>) -> Self {
        Self { bus, timers, contexts }
    }

    pub fn timers(&self) -> &TimerManager {
        &self.timers
    }

    /// Start the countdown for `node` and register it on the flow's context.
    ///
    /// When the default action is applied the timer is deregistered and
    /// `on_complete` receives `{action_applied, result, type: "timeout"}`.
    /// A cancellation deregisters the timer and flags the node as
    /// user-overridden, without calling `on_complete`.
    pub fn start_node_timeout(
        &self,
        node: &Node,
        flow_id: &str,
        on_complete: CompletionCallback,
    ) -> Result<TimerId, EngineError> {
        let timeout = node.timeout.clone().ok_or_else(|| EngineError::Node {
            node_id: node.id.clone(),
            source: NodeError::InvalidConfig {
                node_id: node.id.clone(),
                node_type: node.node_type.clone(),
                message: "timeout_s is not set".into(),
            },
        })?;

        let applied_event = timeout.mode.default_event("applied");
        let cancelled_event = timeout.mode.default_event("cancelled");
        let watch = Arc::new(Mutex::new(Watch::default()));

        let applied = self.bus.on(&applied_event, {
            let this = self.clone();
            let watch = Arc::clone(&watch);
            let (flow, node_id) = (flow_id.to_owned(), node.id.clone());
            let names = (applied_event.clone(), cancelled_event.clone());
            move |event: &Event| {
                if !is_for(event, &flow, &node_id) || !watch.lock().settle(event) {
                    return;
                }
                this.detach(&watch, &names.0, &names.1);
                if let Some(timer_id) = event.str_field("timer_id") {
                    this.contexts.remove_active_timer_if(&flow, &node_id, timer_id);
                }
                if !this.contexts.exists(&flow) {
                    debug!(flow = %flow, node = %node_id, "default applied after flow context was removed");
                    return;
                }
                let output = json!({
                    "action_applied": true,
                    "result": event.payload.get("result").cloned().unwrap_or(Value::Null),
                    "type": "timeout",
                });
                on_complete(&node_id, output);
            }
        });

        let cancelled = self.bus.on(&cancelled_event, {
            let this = self.clone();
            let watch = Arc::clone(&watch);
            let (flow, node_id) = (flow_id.to_owned(), node.id.clone());
            let names = (applied_event.clone(), cancelled_event.clone());
            move |event: &Event| {
                if !is_for(event, &flow, &node_id) || !watch.lock().settle(event) {
                    return;
                }
                this.detach(&watch, &names.0, &names.1);
                if let Some(timer_id) = event.str_field("timer_id") {
                    this.contexts.remove_active_timer_if(&flow, &node_id, timer_id);
                }
                this.contexts.set_user_override(&flow, &node_id, true);
            }
        });

        {
            let mut w = watch.lock();
            w.applied = Some(applied);
            w.cancelled = Some(cancelled);
        }

        let config = TimerConfig {
            flow_id: flow_id.to_owned(),
            node_id: node.id.clone(),
            timeout_s: timeout.timeout_s,
            action: timeout.action.clone(),
            mode: timeout.mode,
        };
        // Registered before arming so a `started` listener can already
        // cancel or override it.
        let timer_id = self.timers.allocate(&config);
        watch.lock().timer_id = Some(timer_id.clone());
        if let Some(previous) = self.contexts.add_active_timer(flow_id, &node.id, timer_id.clone()) {
            warn!(flow = flow_id, node = %node.id, timer_id = %previous, "replacing a live node timer");
            self.timers.cancel(&previous, "replaced");
        }

        if let Err(err) = self.timers.start_with_id(timer_id.clone(), config) {
            self.detach(&watch, &applied_event, &cancelled_event);
            self.contexts.remove_active_timer_if(flow_id, &node.id, timer_id.as_str());
            return Err(err.into());
        }
        Ok(timer_id)
    }

    /// Cancel the live timer of `node_id`.  Returns `false` if the node has
    /// none or it already settled.
    pub fn cancel_node_timeout(&self, flow_id: &str, node_id: &str, reason: &str) -> bool {
        let Some(timer_id) = self.contexts.active_timer(flow_id, node_id) else {
            debug!(flow = flow_id, node = node_id, reason, "no live timer to cancel");
            return false;
        };
        let cancelled = self.timers.cancel(&timer_id, reason);
        self.contexts.remove_active_timer_if(flow_id, node_id, timer_id.as_str());
        cancelled
    }

    /// Cancel every live timer of the flow.  Returns how many were found.
    pub fn cancel_all_timers(&self, flow_id: &str, reason: &str) -> usize {
        self.contexts.clear_active_timers(flow_id, |_, timer_id| {
            self.timers.cancel(timer_id, reason);
        })
    }

    fn detach(&self, watch: &Mutex<Watch>, applied_event: &str, cancelled_event: &str) {
        let (applied, cancelled) = {
            let mut w = watch.lock();
            (w.applied.take(), w.cancelled.take())
        };
        if let Some(id) = applied {
            self.bus.off(applied_event, id);
        }
        if let Some(id) = cancelled {
            self.bus.off(cancelled_event, id);
        }
    }
}

fn is_for(event: &Event, flow_id: &str, node_id: &str) -> bool {
    event.str_field("flow") == Some(flow_id) && event.str_field("node") == Some(node_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::FlowSpec;
    use nodes::NodeExecutor;
    use std::time::Duration;

    type Completions = Arc<Mutex<Vec<(String, Value)>>>;

    struct Fixture {
        bus: EventBus,
        contexts: Arc<ContextManager>,
        integration: FlowTimerIntegration,
        completions: Completions,
    }

    fn fixture() -> Fixture {
        let bus = EventBus::new();
        let contexts = Arc::new(ContextManager::new());
        contexts.create(&FlowSpec::new("f", vec![], vec![]), true);
        let integration =
            FlowTimerIntegration::new(bus.clone(), TimerManager::new(bus.clone()), Arc::clone(&contexts));
        Fixture {
            bus,
            contexts,
            integration,
            completions: Arc::default(),
        }
    }

    fn timed_node(timeout_s: f64) -> Node {
        NodeExecutor::new(EventBus::new())
            .prepare(
                "wait",
                "I.Default",
                "",
                &json!({ "timeout_s": timeout_s, "action": "I.Fallback.high" }),
            )
            .unwrap()
    }

    fn recorder(completions: &Completions) -> CompletionCallback {
        let completions = Arc::clone(completions);
        Arc::new(move |node, output| completions.lock().push((node.to_owned(), output)))
    }

    #[tokio::test(start_paused = true)]
    async fn applied_timeout_completes_the_node() {
        let fx = fixture();
        let id = fx
            .integration
            .start_node_timeout(&timed_node(5.0), "f", recorder(&fx.completions))
            .unwrap();
        assert_eq!(fx.contexts.active_timer("f", "wait"), Some(id));

        tokio::time::sleep(Duration::from_secs(6)).await;

        let completions = fx.completions.lock();
        assert_eq!(completions.len(), 1);
        let (node, output) = &completions[0];
        assert_eq!(node, "wait");
        assert_eq!(output["type"], "timeout");
        assert_eq!(output["action_applied"], true);
        assert_eq!(output["result"]["action"], "I.Fallback.high");
        assert_eq!(fx.contexts.active_timer("f", "wait"), None);
        assert_eq!(fx.bus.listener_count("I.default.applied"), 0);
        assert_eq!(fx.bus.listener_count("I.default.cancelled"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_flags_override_without_completing() {
        let fx = fixture();
        fx.integration
            .start_node_timeout(&timed_node(5.0), "f", recorder(&fx.completions))
            .unwrap();

        assert!(fx.integration.cancel_node_timeout("f", "wait", "user_paused"));
        assert!(!fx.integration.cancel_node_timeout("f", "wait", "user_paused"));

        tokio::time::sleep(Duration::from_secs(10)).await;

        assert!(fx.completions.lock().is_empty());
        let ctx = fx.contexts.get("f").unwrap();
        assert!(ctx.active_timers.is_empty());
        assert_eq!(ctx.user_overrides.get("wait"), Some(&true));
        assert_eq!(fx.bus.listener_count("I.default.applied"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn timer_is_registered_before_started_is_emitted() {
        let fx = fixture();
        let outcome = Arc::new(Mutex::new(None));
        let (integration, o) = (fx.integration.clone(), Arc::clone(&outcome));
        fx.bus.on("I.default.started", move |_| {
            *o.lock() = Some(integration.cancel_node_timeout("f", "wait", "user_paused"));
        });

        let id = fx
            .integration
            .start_node_timeout(&timed_node(3.0), "f", recorder(&fx.completions))
            .unwrap();

        assert_eq!(*outcome.lock(), Some(true));
        assert!(!fx.integration.timers().is_active(&id));
        assert_eq!(fx.contexts.active_timer("f", "wait"), None);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(fx.completions.lock().is_empty());
        assert_eq!(fx.contexts.get("f").unwrap().user_overrides.get("wait"), Some(&true));
        assert_eq!(fx.bus.listener_count("I.default.applied"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn removed_context_swallows_the_completion() {
        let fx = fixture();
        fx.integration
            .start_node_timeout(&timed_node(2.0), "f", recorder(&fx.completions))
            .unwrap();
        fx.contexts.remove("f");

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(fx.completions.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_all_timers_tolerates_an_empty_set() {
        let fx = fixture();
        assert_eq!(fx.integration.cancel_all_timers("f", "flow_stopped"), 0);
        assert_eq!(fx.integration.cancel_all_timers("missing", "flow_stopped"), 0);

        fx.integration
            .start_node_timeout(&timed_node(5.0), "f", recorder(&fx.completions))
            .unwrap();
        assert_eq!(fx.integration.cancel_all_timers("f", "flow_stopped"), 1);
        assert!(fx.integration.timers().get_active_timers().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn node_without_timeout_is_rejected() {
        let fx = fixture();
        let node = NodeExecutor::new(EventBus::new())
            .prepare("plain", "I.Default", "", &json!({ "action": "x" }))
            .unwrap();
        let err = fx
            .integration
            .start_node_timeout(&node, "f", recorder(&fx.completions))
            .unwrap_err();
        assert!(matches!(err, EngineError::Node { node_id, .. } if node_id == "plain"));
        assert_eq!(fx.bus.listener_count("I.default.applied"), 0);
    }

    #[test]
    fn start_outside_a_runtime_detaches_listeners() {
        let fx = fixture();
        let err = fx
            .integration
            .start_node_timeout(&timed_node(5.0), "f", recorder(&fx.completions))
            .unwrap_err();
        assert!(matches!(err, EngineError::Timer(_)));
        assert_eq!(fx.contexts.active_timer("f", "wait"), None);
        assert_eq!(fx.bus.listener_count("I.default.applied"), 0);
        assert_eq!(fx.bus.listener_count("I.default.cancelled"), 0);
    }
}
