//! Call value objects

use serde::{Deserialize, Serialize};

/// Call state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallState {
    /// Call is routed into the application and the script may run
    Active,
    /// Call has ended
    Ended(EndReason),
}

impl CallState {
    /// Check if state transition is valid
    pub fn can_transition_to(&self, new_state: &CallState) -> bool {
        matches!((self, new_state), (CallState::Active, CallState::Ended(_)))
    }

    pub fn is_active(&self) -> bool {
        matches!(self, CallState::Active)
    }
}

/// Reason for call ending
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EndReason {
    /// Script ran to completion
    Completed,
    /// Script aborted on an error
    ScriptFailed(String),
    /// Caller hung up before the script finished
    CallerHangup,
    /// Process is shutting down
    Shutdown,
    /// Turned away by admission control
    Rejected,
}

impl EndReason {
    /// Short label for metrics and logs
    pub fn label(&self) -> &'static str {
        match self {
            EndReason::Completed => "completed",
            EndReason::ScriptFailed(_) => "script_failed",
            EndReason::CallerHangup => "caller_hangup",
            EndReason::Shutdown => "shutdown",
            EndReason::Rejected => "rejected",
        }
    }
}
