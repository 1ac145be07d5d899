//! Engine-level error types.

use nodes::NodeError;
use thiserror::Error;
use timer::TimerError;

/// Errors produced by the flow engine (load validation + execution).
#[derive(Debug, Error, Clone, PartialEq)]
pub enum EngineError {
    // ------ Validation errors ------

    /// Two or more nodes share the same ID.
    #[error("duplicate node ID: '{0}'")]
    DuplicateNodeId(String),

    /// An edge references a node ID that doesn't exist in the flow.
    #[error("edge references unknown node '{node_id}' ({side} side)")]
    UnknownNodeReference {
        node_id: String,
        side: &'static str,
    },

    // ------ Execution errors ------

    #[error("flow '{0}' is not loaded")]
    FlowNotFound(String),

    #[error("no context for flow '{0}'")]
    ContextNotFound(String),

    #[error("node '{node_id}' not found in flow '{flow_id}'")]
    NodeNotFound { flow_id: String, node_id: String },

    /// A node was rejected at load time or failed while executing.
    #[error("node '{node_id}' failed: {source}")]
    Node {
        node_id: String,
        #[source]
        source: NodeError,
    },

    #[error("timer error: {0}")]
    Timer(#[from] TimerError),

    /// More synchronous node executions than allowed in one pass.
    #[error("step limit of {limit} exceeded")]
    StepLimitExceeded { limit: usize },
}

/// Why an edge condition could not be parsed.  Never escapes the engine; a
/// malformed condition simply evaluates to `false`.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConditionError {
    #[error("unexpected character '{ch}' at offset {offset}")]
    UnexpectedChar { ch: char, offset: usize },

    #[error("unterminated string literal starting at offset {0}")]
    UnterminatedString(usize),

    #[error("unterminated placeholder starting at offset {0}")]
    UnterminatedPlaceholder(usize),

    #[error("unexpected token '{0}'")]
    UnexpectedToken(String),

    #[error("unexpected end of expression")]
    UnexpectedEnd,
}
