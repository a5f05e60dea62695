//! Event fan-out shared by the bus adapters

mod router;

pub use router::EventRouter;
