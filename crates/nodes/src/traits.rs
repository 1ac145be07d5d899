//! The `ExecutableNode` trait: the contract every node kind must fulfil.

use bus::EventBus;
use parking_lot::Mutex;
use rand::{Rng, RngCore};
use serde_json::{json, Value};

use crate::config::{Node, NodeConfig};
use crate::executor::ExecutorSettings;
use crate::{FlowContext, NodeError};

/// Collaborators a node may use while executing.
pub struct NodeEnv<'a> {
    pub bus: &'a EventBus,
    pub settings: &'a ExecutorSettings,
    pub(crate) rng: &'a Mutex<Box<dyn RngCore + Send>>,
}

impl NodeEnv<'_> {
    /// Uniform sample in `[0, 1)` from the executor's randomness source.
    pub fn random(&self) -> f64 {
        self.rng.lock().gen::<f64>()
    }

    /// Emit `name` with `{flow, node}` plus the fields of `extra`.
    pub fn emit(&self, name: &str, ctx: &FlowContext, node: &Node, extra: Value) {
        let mut payload = json!({ "flow": ctx.flow_id, "node": node.id });
        if let (Some(target), Value::Object(fields)) = (payload.as_object_mut(), extra) {
            target.extend(fields);
        }
        self.bus.emit(name, payload);
    }
}

/// The core node trait.
///
/// Implementations read the context and return the node's output; storing
/// that output is the caller's job.
pub trait ExecutableNode: Send + Sync {
    /// Decode the raw JSON `config` at flow-load time.
    fn parse_config(&self, _node_id: &str, _node_type: &str, raw: &Value) -> Result<NodeConfig, NodeError> {
        Ok(NodeConfig::Opaque(raw.clone()))
    }

    /// Execute the node against a read-only view of its flow.
    fn execute(&self, node: &Node, ctx: &FlowContext, env: &NodeEnv<'_>) -> Result<Value, NodeError>;
}
