//! `NodeExecutor`: dispatch from a node's type string to its implementation.

use std::collections::HashMap;
use std::sync::Arc;

use bus::EventBus;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use serde_json::Value;
use tracing::debug;

use crate::config::{Node, NodeTimeout};
use crate::kinds;
use crate::traits::{ExecutableNode, NodeEnv};
use crate::{FlowContext, NodeError};

/// Maps `"<Mode>.<Kind>"` strings to node implementations.
pub type NodeRegistry = HashMap<String, Arc<dyn ExecutableNode>>;

/// Tuning knobs for the built-in node kinds.
#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    /// Per-flow deflator applied by `V.PDA` to the real total.
    pub deflators: HashMap<String, f64>,
    /// Deflator for flows not listed in `deflators`.
    pub default_deflator: f64,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            deflators: HashMap::from([("groceries".to_string(), 0.86)]),
            default_deflator: 1.0,
        }
    }
}

impl ExecutorSettings {
    pub fn deflator_for(&self, flow_id: &str) -> f64 {
        self.deflators.get(flow_id).copied().unwrap_or(self.default_deflator)
    }
}

/// Runs nodes.  Never mutates a context; returns outputs for the caller to
/// store.
pub struct NodeExecutor {
    registry: NodeRegistry,
    bus: EventBus,
    settings: ExecutorSettings,
    rng: Mutex<Box<dyn RngCore + Send>>,
}

impl NodeExecutor {
    /// Executor with every built-in kind, default settings and an
    /// entropy-seeded randomness source.
    pub fn new(bus: EventBus) -> Self {
        let mut registry = NodeRegistry::new();
        kinds::register_builtins(&mut registry);
        let rng: Box<dyn RngCore + Send> = Box::new(StdRng::from_entropy());
        Self {
            registry,
            bus,
            settings: ExecutorSettings::default(),
            rng: Mutex::new(rng),
        }
    }

    pub fn with_settings(mut self, settings: ExecutorSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Replace the randomness source, e.g. with a seeded `StdRng` in tests.
    pub fn with_rng(mut self, rng: impl RngCore + Send + 'static) -> Self {
        let rng: Box<dyn RngCore + Send> = Box::new(rng);
        self.rng = Mutex::new(rng);
        self
    }

    /// Add or replace the implementation for `node_type`.
    pub fn register(&mut self, node_type: impl Into<String>, node: Arc<dyn ExecutableNode>) {
        self.registry.insert(node_type.into(), node);
    }

    pub fn supports(&self, node_type: &str) -> bool {
        self.registry.contains_key(node_type)
    }

    pub fn settings(&self) -> &ExecutorSettings {
        &self.settings
    }

    /// Turn a raw node definition into an executable [`Node`].
    ///
    /// Known types have their config decoded now.  Unknown types are kept
    /// as-is and fail when executed.
    pub fn prepare(
        &self,
        id: &str,
        node_type: &str,
        label: &str,
        raw_config: &Value,
    ) -> Result<Node, NodeError> {
        let config = match self.registry.get(node_type) {
            Some(handler) => handler.parse_config(id, node_type, raw_config)?,
            None => crate::NodeConfig::Opaque(raw_config.clone()),
        };
        Ok(Node {
            id: id.to_owned(),
            node_type: node_type.to_owned(),
            label: label.to_owned(),
            config,
            timeout: NodeTimeout::from_raw(node_type, raw_config),
        })
    }

    /// Execute `node` against `ctx`.
    ///
    /// # Errors
    /// [`NodeError::UnknownNodeType`] when nothing is registered for the
    /// node's type, otherwise whatever the implementation returns.
    pub fn execute(&self, node: &Node, ctx: &FlowContext) -> Result<Value, NodeError> {
        let handler = self
            .registry
            .get(&node.node_type)
            .ok_or_else(|| NodeError::UnknownNodeType(node.node_type.clone()))?;

        debug!(flow = %ctx.flow_id, node = %node.id, node_type = %node.node_type, "executing node");
        let env = NodeEnv {
            bus: &self.bus,
            settings: &self.settings,
            rng: &self.rng,
        };
        handler.execute(node, ctx, &env)
    }
}
