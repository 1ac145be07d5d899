//! Timer-level error type.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum TimerError {
    /// Timers are tokio tasks; starting one needs a runtime.
    #[error("no tokio runtime available to arm timer for node '{node_id}'")]
    NoRuntime { node_id: String },

    #[error("invalid timeout {timeout_s}s for node '{node_id}'")]
    InvalidTimeout { node_id: String, timeout_s: f64 },

    #[error("timer '{timer_id}' is already running")]
    AlreadyRunning { timer_id: String },
}
