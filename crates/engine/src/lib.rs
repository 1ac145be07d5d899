//! `engine` crate: flow definitions, load validation, per-flow context
//! state, edge conditions, timer bridging and the flow runner.

pub mod models;
pub mod error;
pub mod dag;
pub mod condition;
pub mod context;
pub mod timer_integration;
pub mod runner;

pub use models::{FlowEdge, FlowNode, FlowSpec};
pub use error::{ConditionError, EngineError};
pub use condition::EdgeCondition;
pub use context::{ContextManager, ContextPatch};
pub use timer_integration::{CompletionCallback, FlowTimerIntegration};
pub use runner::{FlowRunner, FlowState, RunnerConfig};
