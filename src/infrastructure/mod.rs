//! Infrastructure layer - Technical implementations
//!
//! This layer contains:
//! - The ARI adapter for the call-control bus
//! - An in-memory bus for tests and dry runs
//! - Event fan-out shared by both
//! - Metrics

pub mod ari;
pub mod memory;
pub mod messaging;
pub mod metrics;
