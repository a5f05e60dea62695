//! In-memory call-control bus
//!
//! Behaves like a small Asterisk: channels answer, play and hang up
//! instantly (or after a configurable playback delay) and every operation is
//! recorded so callers can inspect what happened on each channel. Used by
//! the test suite and for running scripts without a telephony server.

use crate::domain::audio::SoundUri;
use crate::domain::call::event::{BusEvent, EventKind};
use crate::domain::call::port::{ChannelHandle, ControlBus, Subscription};
use crate::domain::shared::error::DomainError;
use crate::domain::shared::result::Result;
use crate::domain::shared::value_objects::ChannelId;
use crate::infrastructure::messaging::EventRouter;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;

/// Operation performed on a channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelOp {
    Answer,
    Hangup,
    Play(SoundUri),
    GetVariable(String),
    Dial { destination: String, timeout: Duration },
}

/// Channel living in an [`InMemoryBus`]
pub struct MemoryChannel {
    id: ChannelId,
    router: EventRouter,
    ops: Mutex<Vec<ChannelOp>>,
    variables: Mutex<HashMap<String, String>>,
    failing_sounds: Mutex<HashSet<SoundUri>>,
    unreachable: Mutex<HashSet<String>>,
    play_delay: Mutex<Option<Duration>>,
    gone: AtomicBool,
}

impl MemoryChannel {
    fn new(id: ChannelId, router: EventRouter) -> Self {
        Self {
            id,
            router,
            ops: Mutex::new(Vec::new()),
            variables: Mutex::new(HashMap::new()),
            failing_sounds: Mutex::new(HashSet::new()),
            unreachable: Mutex::new(HashSet::new()),
            play_delay: Mutex::new(None),
            gone: AtomicBool::new(false),
        }
    }

    pub fn set_variable(&self, name: &str, value: &str) {
        self.variables
            .lock()
            .unwrap()
            .insert(name.to_string(), value.to_string());
    }

    /// Make every playback of `uri` fail
    pub fn fail_playback(&self, uri: impl Into<SoundUri>) {
        self.failing_sounds.lock().unwrap().insert(uri.into());
    }

    /// Make dialing `destination` fail
    pub fn fail_dial(&self, destination: &str) {
        self.unreachable
            .lock()
            .unwrap()
            .insert(destination.to_string());
    }

    /// Time every playback takes
    pub fn set_play_delay(&self, delay: Duration) {
        *self.play_delay.lock().unwrap() = Some(delay);
    }

    pub fn ops(&self) -> Vec<ChannelOp> {
        self.ops.lock().unwrap().clone()
    }

    pub fn played(&self) -> Vec<SoundUri> {
        self.ops()
            .into_iter()
            .filter_map(|op| match op {
                ChannelOp::Play(uri) => Some(uri),
                _ => None,
            })
            .collect()
    }

    pub fn hangup_count(&self) -> usize {
        self.ops()
            .iter()
            .filter(|op| matches!(op, ChannelOp::Hangup))
            .count()
    }

    pub fn is_gone(&self) -> bool {
        self.gone.load(Ordering::SeqCst)
    }

    /// Caller hangs up: the channel disappears and leaves the application
    pub fn remote_hangup(&self) {
        if !self.gone.swap(true, Ordering::SeqCst) {
            self.router.publish(BusEvent::stasis_end(self.id.clone()));
        }
    }

    fn record(&self, op: ChannelOp) {
        self.ops.lock().unwrap().push(op);
    }
}

#[async_trait]
impl ChannelHandle for MemoryChannel {
    fn id(&self) -> &ChannelId {
        &self.id
    }

    async fn answer(&self) -> Result<()> {
        self.record(ChannelOp::Answer);
        if self.is_gone() {
            return Err(DomainError::Answer("Channel not found".to_string()));
        }
        Ok(())
    }

    async fn hangup(&self) -> Result<()> {
        self.record(ChannelOp::Hangup);
        // already gone is not an error
        self.remote_hangup();
        Ok(())
    }

    async fn play(&self, uri: &SoundUri) -> Result<()> {
        self.record(ChannelOp::Play(uri.clone()));
        if self.is_gone() {
            return Err(DomainError::playback(uri.as_str(), "Channel not found"));
        }

        let delay = *self.play_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if self.failing_sounds.lock().unwrap().contains(uri) {
            return Err(DomainError::playback(uri.as_str(), "File does not exist"));
        }
        debug!(channel = %self.id, sound = %uri, "Played");
        Ok(())
    }

    async fn get_variable(&self, name: &str) -> Result<String> {
        self.record(ChannelOp::GetVariable(name.to_string()));
        self.variables
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| DomainError::VariableNotFound(name.to_string()))
    }

    async fn dial(&self, destination: &str, timeout: Duration) -> Result<()> {
        self.record(ChannelOp::Dial {
            destination: destination.to_string(),
            timeout,
        });
        if self.unreachable.lock().unwrap().contains(destination) {
            return Err(DomainError::Dial(format!("{} did not answer", destination)));
        }
        Ok(())
    }

    async fn subscribe(&self, kinds: &[EventKind]) -> Result<Subscription> {
        Ok(self.router.subscribe(kinds, Some(self.id.clone())))
    }
}

/// In-memory control bus
#[derive(Clone, Default)]
pub struct InMemoryBus {
    router: EventRouter,
    channels: Arc<Mutex<HashMap<ChannelId, Arc<MemoryChannel>>>>,
    resolved: Arc<Mutex<Vec<ChannelId>>>,
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create a channel, e.g. to configure it before the call starts
    pub fn channel_state(&self, id: impl Into<ChannelId>) -> Arc<MemoryChannel> {
        let id = id.into();
        self.channels
            .lock()
            .unwrap()
            .entry(id.clone())
            .or_insert_with(|| Arc::new(MemoryChannel::new(id, self.router.clone())))
            .clone()
    }

    /// A new call enters the application
    pub fn start_call(&self, id: impl Into<ChannelId>) -> Arc<MemoryChannel> {
        let channel = self.channel_state(id);
        self.router.publish(BusEvent::stasis_start(channel.id.clone()));
        channel
    }

    pub fn publish(&self, event: BusEvent) {
        self.router.publish(event);
    }

    /// Channel ids handed out through [`ControlBus::channel`], in order
    pub fn resolved_channels(&self) -> Vec<ChannelId> {
        self.resolved.lock().unwrap().clone()
    }

    /// Subscriptions currently attached to the bus
    pub fn subscriber_count(&self) -> usize {
        self.router.subscriber_count()
    }

    /// Shut the bus down; all subscriptions end
    pub fn close(&self) {
        self.router.close();
    }
}

#[async_trait]
impl ControlBus for InMemoryBus {
    async fn subscribe(&self, kinds: &[EventKind]) -> Result<Subscription> {
        Ok(self.router.subscribe(kinds, None))
    }

    fn channel(&self, id: &ChannelId) -> Arc<dyn ChannelHandle> {
        self.resolved.lock().unwrap().push(id.clone());
        self.channel_state(id.clone())
    }
}
