//! `nodes` crate: the flow context, node kinds and the node executor.
//!
//! Every node, built-in or registered by a caller, implements
//! [`ExecutableNode`].  The engine crate dispatches through
//! [`NodeExecutor`], which looks the node's `"<Mode>.<Kind>"` type up in its
//! registry.

pub mod error;
pub mod context;
pub mod config;
pub mod traits;
pub mod executor;
pub mod kinds;
pub mod mock;

pub use error::NodeError;
pub use context::{is_truthy, FlowContext, FlowFailure};
pub use config::{Node, NodeConfig, NodeTimeout};
pub use traits::{ExecutableNode, NodeEnv};
pub use executor::{ExecutorSettings, NodeExecutor, NodeRegistry};
