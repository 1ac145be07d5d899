//! The value handed to every listener.

use std::sync::atomic::{AtomicBool, Ordering};

use serde_json::Value;

/// A named event with a JSON payload.
///
/// Listeners receive a shared reference; the only thing a listener may change
/// is the advisory "default prevented" flag.
#[derive(Debug)]
pub struct Event {
    pub name: String,
    pub payload: Value,
    default_prevented: AtomicBool,
}

impl Event {
    pub fn new(name: impl Into<String>, payload: Value) -> Self {
        Self {
            name: name.into(),
            payload,
            default_prevented: AtomicBool::new(false),
        }
    }

    /// Ask the emitter to skip its default behaviour.  Purely advisory.
    pub fn prevent_default(&self) {
        self.default_prevented.store(true, Ordering::Relaxed);
    }

    pub fn default_prevented(&self) -> bool {
        self.default_prevented.load(Ordering::Relaxed)
    }

    /// Shorthand for reading a string field out of an object payload.
    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }
}
