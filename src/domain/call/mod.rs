//! Call bounded context - one caller routed into the application

pub mod aggregate;
pub mod event;
pub mod port;
pub mod script;
pub mod value_object;

pub use aggregate::Call;
pub use event::{BusEvent, ChannelSnapshot, EventKind, PlaybackSnapshot, DIALED_CHANNEL_ARG};
pub use port::{ChannelHandle, ControlBus, Subscription, SubscriptionSender};
pub use script::{CallScript, ScriptStep, StepScript};
pub use value_object::{CallState, EndReason};
