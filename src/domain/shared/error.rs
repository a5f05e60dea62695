//! Domain errors

use super::value_objects::ChannelId;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DomainError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Playback of {uri} failed: {reason}")]
    Playback { uri: String, reason: String },

    #[error("Channel variable not found: {0}")]
    VariableNotFound(String),

    #[error("Dial failed: {0}")]
    Dial(String),

    #[error("Answer failed: {0}")]
    Answer(String),

    #[error("Hangup failed: {0}")]
    Hangup(String),

    #[error("Call {0} has ended")]
    CallEnded(ChannelId),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl DomainError {
    pub fn playback(uri: impl Into<String>, reason: impl Into<String>) -> Self {
        DomainError::Playback {
            uri: uri.into(),
            reason: reason.into(),
        }
    }

    /// True when the error means the call is gone rather than that an operation failed
    pub fn is_call_ended(&self) -> bool {
        matches!(self, DomainError::CallEnded(_))
    }
}
