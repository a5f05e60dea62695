//! Control-bus notifications
//!
//! Events arrive as JSON objects tagged by `type`. Only the events the
//! application reacts to are modelled; everything else decodes to
//! [`BusEvent::Unknown`].

use crate::domain::shared::value_objects::ChannelId;
use serde::{Deserialize, Serialize};

/// Stasis argument attached to channels the application originates itself
pub const DIALED_CHANNEL_ARG: &str = "ivr-dialed";

/// Caller id as reported on a channel
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallerId {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub number: String,
}

/// Dialplan location of a channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DialplanCep {
    pub context: String,
    pub exten: String,
    pub priority: i64,
}

/// Channel snapshot carried by channel events
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelSnapshot {
    pub id: ChannelId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub caller: CallerId,
    #[serde(default)]
    pub dialplan: Option<DialplanCep>,
}

/// Playback snapshot carried by playback events
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaybackSnapshot {
    pub id: String,
    pub media_uri: String,
    #[serde(default)]
    pub target_uri: String,
    #[serde(default)]
    pub state: String,
}

impl PlaybackSnapshot {
    /// Channel the playback targets, from a `channel:<id>` target URI
    pub fn target_channel(&self) -> Option<ChannelId> {
        self.target_uri
            .strip_prefix("channel:")
            .map(ChannelId::from)
    }

    pub fn failed(&self) -> bool {
        self.state == "failed"
    }
}

/// Notification from the control bus
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum BusEvent {
    /// A channel entered the application
    StasisStart {
        channel: ChannelSnapshot,
        #[serde(default)]
        args: Vec<String>,
    },
    /// A channel left the application
    StasisEnd { channel: ChannelSnapshot },
    PlaybackStarted { playback: PlaybackSnapshot },
    PlaybackFinished { playback: PlaybackSnapshot },
    ChannelHangupRequest { channel: ChannelSnapshot },
    ChannelDestroyed {
        channel: ChannelSnapshot,
        #[serde(default)]
        cause: i64,
        #[serde(default)]
        cause_txt: String,
    },
    #[serde(other)]
    Unknown,
}

/// Event kinds, used as subscription filters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    StasisStart,
    StasisEnd,
    PlaybackStarted,
    PlaybackFinished,
    ChannelHangupRequest,
    ChannelDestroyed,
    Unknown,
}

impl BusEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            BusEvent::StasisStart { .. } => EventKind::StasisStart,
            BusEvent::StasisEnd { .. } => EventKind::StasisEnd,
            BusEvent::PlaybackStarted { .. } => EventKind::PlaybackStarted,
            BusEvent::PlaybackFinished { .. } => EventKind::PlaybackFinished,
            BusEvent::ChannelHangupRequest { .. } => EventKind::ChannelHangupRequest,
            BusEvent::ChannelDestroyed { .. } => EventKind::ChannelDestroyed,
            BusEvent::Unknown => EventKind::Unknown,
        }
    }

    /// Channel the event concerns, if any
    pub fn channel_id(&self) -> Option<ChannelId> {
        match self {
            BusEvent::StasisStart { channel, .. }
            | BusEvent::StasisEnd { channel }
            | BusEvent::ChannelHangupRequest { channel }
            | BusEvent::ChannelDestroyed { channel, .. } => Some(channel.id.clone()),
            BusEvent::PlaybackStarted { playback } | BusEvent::PlaybackFinished { playback } => {
                playback.target_channel()
            }
            BusEvent::Unknown => None,
        }
    }

    /// True when the event matches the kind filter (empty filter matches all)
    pub fn matches(&self, kinds: &[EventKind]) -> bool {
        kinds.is_empty() || kinds.contains(&self.kind())
    }

    /// Convenience constructor for a bare channel snapshot
    pub fn stasis_start(id: impl Into<ChannelId>) -> Self {
        BusEvent::StasisStart {
            channel: ChannelSnapshot::bare(id.into()),
            args: Vec::new(),
        }
    }

    pub fn stasis_end(id: impl Into<ChannelId>) -> Self {
        BusEvent::StasisEnd {
            channel: ChannelSnapshot::bare(id.into()),
        }
    }
}

impl ChannelSnapshot {
    pub fn bare(id: ChannelId) -> Self {
        Self {
            id,
            name: String::new(),
            state: String::new(),
            caller: CallerId::default(),
            dialplan: None,
        }
    }
}
