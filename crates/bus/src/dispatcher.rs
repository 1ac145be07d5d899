//! `EventBus`: listener registry plus synchronous dispatch.
//!
//! The bus is a cheap-to-clone handle; clones share one registry.  The
//! registry lock is never held while a listener runs, so listeners are free
//! to emit, subscribe, or unsubscribe re-entrantly.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tracing::trace;

use crate::Event;

/// Callback invoked for each matching event.
pub type Listener = Arc<dyn Fn(&Event) + Send + Sync>;

/// Handle returned by registration, used to deregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

#[derive(Clone)]
struct Registration {
    id: ListenerId,
    once: bool,
    listener: Listener,
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    named: HashMap<String, Vec<Registration>>,
    wildcard: Vec<Registration>,
}

impl Registry {
    fn allocate(&mut self) -> ListenerId {
        self.next_id += 1;
        ListenerId(self.next_id)
    }
}

/// Process-local publish/subscribe channel.
#[derive(Clone, Default)]
pub struct EventBus {
    registry: Arc<Mutex<Registry>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `listener` for every future `name` event.
    pub fn on<F>(&self, name: &str, listener: F) -> ListenerId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.register(name, false, Arc::new(listener))
    }

    /// Register `listener` for the next `name` event only.
    pub fn once<F>(&self, name: &str, listener: F) -> ListenerId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.register(name, true, Arc::new(listener))
    }

    /// Register `listener` for every event regardless of name.
    ///
    /// Wildcard listeners run after the named listeners of the same emit.
    pub fn on_any<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let mut registry = self.registry.lock();
        let id = registry.allocate();
        registry.wildcard.push(Registration {
            id,
            once: false,
            listener: Arc::new(listener),
        });
        id
    }

    /// Deregister a listener.  Returns `false` if it was not registered under
    /// `name` (already removed, or a `once` listener that already fired).
    pub fn off(&self, name: &str, id: ListenerId) -> bool {
        let mut registry = self.registry.lock();
        let Some(list) = registry.named.get_mut(name) else {
            return false;
        };
        let before = list.len();
        list.retain(|r| r.id != id);
        let removed = list.len() != before;
        if list.is_empty() {
            registry.named.remove(name);
        }
        removed
    }

    /// Deregister a wildcard listener.
    pub fn off_any(&self, id: ListenerId) -> bool {
        let mut registry = self.registry.lock();
        let before = registry.wildcard.len();
        registry.wildcard.retain(|r| r.id != id);
        registry.wildcard.len() != before
    }

    /// Number of listeners currently registered under `name`.
    pub fn listener_count(&self, name: &str) -> usize {
        self.registry.lock().named.get(name).map_or(0, Vec::len)
    }

    /// Deliver `payload` to every listener of `name`, synchronously and in
    /// registration order.
    ///
    /// Returns whether any listener called [`Event::prevent_default`].
    pub fn emit(&self, name: &str, payload: Value) -> bool {
        let targets = self.snapshot(name);
        trace!(event = name, listeners = targets.len(), "emit");

        if targets.is_empty() {
            return false;
        }

        let event = Event::new(name, payload);
        for listener in targets {
            listener(&event);
        }
        event.default_prevented()
    }

    fn register(&self, name: &str, once: bool, listener: Listener) -> ListenerId {
        let mut registry = self.registry.lock();
        let id = registry.allocate();
        registry
            .named
            .entry(name.to_owned())
            .or_default()
            .push(Registration { id, once, listener });
        id
    }

    /// Copy out the listeners for one emit, dropping `once` registrations
    /// before any of them runs.
    fn snapshot(&self, name: &str) -> Vec<Listener> {
        let mut registry = self.registry.lock();
        let mut targets = Vec::new();

        if let Some(list) = registry.named.get_mut(name) {
            targets.extend(list.iter().map(|r| Arc::clone(&r.listener)));
            list.retain(|r| !r.once);
            if list.is_empty() {
                registry.named.remove(name);
            }
        }
        targets.extend(registry.wildcard.iter().map(|r| Arc::clone(&r.listener)));
        targets
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let registry = self.registry.lock();
        f.debug_struct("EventBus")
            .field("named", &registry.named.len())
            .field("wildcard", &registry.wildcard.len())
            .finish()
    }
}

// ============================================================
// Unit tests
// ============================================================
#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn recorder(bus: &EventBus, name: &str, tag: &'static str, log: &Arc<Mutex<Vec<String>>>) -> ListenerId {
        let log = Arc::clone(log);
        bus.on(name, move |_| log.lock().push(tag.to_string()))
    }

    #[test]
    fn listeners_run_in_registration_order() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        recorder(&bus, "flow.started", "first", &log);
        recorder(&bus, "flow.started", "second", &log);

        bus.emit("flow.started", json!({}));
        assert_eq!(*log.lock(), vec!["first", "second"]);
    }

    #[test]
    fn emit_without_listeners_is_dropped() {
        let bus = EventBus::new();
        assert!(!bus.emit("nobody.listens", json!({ "x": 1 })));
    }

    #[test]
    fn off_removes_only_the_given_listener() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let a = recorder(&bus, "tick", "a", &log);
        recorder(&bus, "tick", "b", &log);

        assert!(bus.off("tick", a));
        assert!(!bus.off("tick", a), "double off is a no-op");

        bus.emit("tick", json!(null));
        assert_eq!(*log.lock(), vec!["b"]);
    }

    #[test]
    fn once_listener_fires_a_single_time() {
        let bus = EventBus::new();
        let hits = Arc::new(Mutex::new(0));
        let h = Arc::clone(&hits);
        bus.once("flow.completed", move |_| *h.lock() += 1);

        bus.emit("flow.completed", json!({}));
        bus.emit("flow.completed", json!({}));
        assert_eq!(*hits.lock(), 1);
        assert_eq!(bus.listener_count("flow.completed"), 0);
    }

    #[test]
    fn prevent_default_is_reported_to_emitter() {
        let bus = EventBus::new();
        bus.on("ui.action.override", |e| e.prevent_default());
        assert!(bus.emit("ui.action.override", json!({})));
    }

    #[test]
    fn listener_may_unsubscribe_itself_during_emit() {
        let bus = EventBus::new();
        let slot: Arc<Mutex<Option<ListenerId>>> = Arc::new(Mutex::new(None));
        let hits = Arc::new(Mutex::new(0));

        let (b, s, h) = (bus.clone(), Arc::clone(&slot), Arc::clone(&hits));
        let id = bus.on("x", move |_| {
            *h.lock() += 1;
            if let Some(id) = s.lock().take() {
                b.off("x", id);
            }
        });
        *slot.lock() = Some(id);

        bus.emit("x", json!(null));
        bus.emit("x", json!(null));
        assert_eq!(*hits.lock(), 1);
    }

    #[test]
    fn wildcard_sees_every_event_after_named_listeners() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        recorder(&bus, "a", "named", &log);
        let l = Arc::clone(&log);
        bus.on_any(move |e| l.lock().push(format!("any:{}", e.name)));

        bus.emit("a", json!(null));
        bus.emit("b", json!(null));
        assert_eq!(*log.lock(), vec!["named", "any:a", "any:b"]);
    }

    #[test]
    fn off_any_removes_a_wildcard_listener() {
        let bus = EventBus::new();
        let hits = Arc::new(Mutex::new(0));
        let h = Arc::clone(&hits);
        let id = bus.on_any(move |_| *h.lock() += 1);

        bus.emit("a", json!(null));
        assert!(bus.off_any(id));
        assert!(!bus.off_any(id));
        bus.emit("b", json!(null));
        assert_eq!(*hits.lock(), 1);
    }
}
