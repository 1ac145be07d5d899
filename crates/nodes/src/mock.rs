//! `MockNode`: a test double for `ExecutableNode`.
//!
//! Register it under a custom type to observe which nodes a flow runs, or
//! to make a node fail on purpose.

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{json, Value};

use crate::config::Node;
use crate::traits::{ExecutableNode, NodeEnv};
use crate::{FlowContext, NodeError};

/// Behaviour injected into `MockNode` at construction time.
#[derive(Debug, Clone)]
pub enum MockBehaviour {
    /// Return a specific JSON value (merged with `{"node": <id>}` when it is
    /// an object).
    ReturnValue(Value),
    /// Fail with a `Fatal` error.
    FailFatal(String),
}

/// A mock node that records the id of every node it executes.
#[derive(Debug, Clone)]
pub struct MockNode {
    pub behaviour: MockBehaviour,
    /// Node ids seen by this mock, in call order.  Shared between clones.
    pub calls: Arc<Mutex<Vec<String>>>,
}

impl MockNode {
    /// Create a mock that always succeeds with the given value.
    pub fn returning(value: Value) -> Self {
        Self {
            behaviour: MockBehaviour::ReturnValue(value),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Create a mock that always fails with a `Fatal` error.
    pub fn failing_fatal(msg: impl Into<String>) -> Self {
        Self {
            behaviour: MockBehaviour::FailFatal(msg.into()),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Number of times this node has been executed.
    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    /// Node ids executed so far, in order.
    pub fn executed(&self) -> Vec<String> {
        self.calls.lock().clone()
    }
}

impl ExecutableNode for MockNode {
    fn execute(&self, node: &Node, _ctx: &FlowContext, _env: &NodeEnv<'_>) -> Result<Value, NodeError> {
        self.calls.lock().push(node.id.clone());

        match &self.behaviour {
            MockBehaviour::ReturnValue(v) => {
                let mut out = json!({ "node": node.id });
                match (out.as_object_mut(), v.as_object()) {
                    (Some(out_obj), Some(v_obj)) => {
                        out_obj.extend(v_obj.iter().map(|(k, val)| (k.clone(), val.clone())));
                        Ok(out)
                    }
                    _ => Ok(v.clone()),
                }
            }
            MockBehaviour::FailFatal(msg) => Err(NodeError::Fatal(msg.clone())),
        }
    }
}
