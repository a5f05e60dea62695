//! Domain layer - Call lifecycle, prompts and the ports to the call-control bus
//!
//! This layer contains:
//! - The `Call` aggregate and its prompt operations
//! - Bus notifications and the `ControlBus` / `ChannelHandle` ports
//! - Call scripts
//! - Sound-resource URI builders

pub mod audio;
pub mod call;
pub mod shared;

// Re-export commonly used types
pub use shared::{DomainError, Result};
