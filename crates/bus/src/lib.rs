//! `bus` crate: synchronous, in-process publish/subscribe.
//!
//! Every component of the flow engine reports side-effects (countdown ticks,
//! violations, completion) by emitting named events here.  Delivery happens
//! on the caller's stack, in registration order; nothing is queued.

pub mod event;
pub mod dispatcher;

pub use event::Event;
pub use dispatcher::{EventBus, Listener, ListenerId};
