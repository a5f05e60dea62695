//! Application layer - call dispatching and per-call lifecycle
//!
//! The dispatcher turns call-start notifications into call handler tasks;
//! each handler runs the configured script against its call and always
//! leaves the channel hung up.

pub mod call_handler;
pub mod dispatcher;

pub use call_handler::{CallHandler, CallOutcome};
pub use dispatcher::{DispatchStats, Dispatcher};
