//! stasis-ivr - A minimal IVR application for the Asterisk REST Interface
//!
//! Calls entering the Stasis application are handed to independent call
//! handlers, each running a configurable prompt script and hanging the call
//! up when done.

pub mod application;
pub mod config;
pub mod domain;
pub mod infrastructure;

// Re-export commonly used types
pub use domain::shared::error::DomainError;
pub use domain::shared::result::Result;
