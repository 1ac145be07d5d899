//! `timer` crate: cancellable countdown timers for default actions.
//!
//! A timer belongs to one (flow, node) pair.  It either expires, applying
//! its fallback action, or is cancelled first; never both.

pub mod error;
pub mod mode;
pub mod actions;
pub mod manager;

pub use error::TimerError;
pub use mode::Mode;
pub use actions::FallbackAction;
pub use manager::{TimerConfig, TimerId, TimerInfo, TimerManager};
