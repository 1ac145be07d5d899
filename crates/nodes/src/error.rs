//! Node-level error type.

use thiserror::Error;

/// Errors returned while preparing or executing a node.
///
/// None of these are retried; the flow runner turns any of them into a
/// terminal `flow.error`.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum NodeError {
    /// The node's `type` has no entry in the dispatch table.
    #[error("unknown node type: '{0}'")]
    UnknownNodeType(String),

    /// The node's `config` does not fit the shape its type requires.
    #[error("invalid config for {node_type} node '{node_id}': {message}")]
    InvalidConfig {
        node_id: String,
        node_type: String,
        message: String,
    },

    /// Any other permanent failure raised by a node implementation.
    #[error("fatal node error: {0}")]
    Fatal(String),
}
