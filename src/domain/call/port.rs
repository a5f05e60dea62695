//! Call-control bus ports
//!
//! The domain only talks to the telephony system through these traits.
//! Adapters live in the infrastructure layer.

use crate::domain::audio::SoundUri;
use crate::domain::call::event::{BusEvent, EventKind};
use crate::domain::shared::result::Result;
use crate::domain::shared::value_objects::ChannelId;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Session with the call-control bus
///
/// Implementations must be safe for concurrent use by many call handlers.
#[async_trait]
pub trait ControlBus: Send + Sync {
    /// Subscribe to application events of the given kinds (empty = all)
    async fn subscribe(&self, kinds: &[EventKind]) -> Result<Subscription>;

    /// Resolve a handle to a channel. Does not touch the bus.
    fn channel(&self, id: &ChannelId) -> Arc<dyn ChannelHandle>;
}

/// Capability referencing one channel
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChannelHandle: Send + Sync {
    fn id(&self) -> &ChannelId;

    async fn answer(&self) -> Result<()>;

    /// Hang up. Hanging up a channel that is already gone succeeds.
    async fn hangup(&self) -> Result<()>;

    /// Play one sound resource and wait until the playback finishes
    async fn play(&self, uri: &SoundUri) -> Result<()>;

    async fn get_variable(&self, name: &str) -> Result<String>;

    /// Originate to `destination` and bridge it with this channel
    async fn dial(&self, destination: &str, timeout: Duration) -> Result<()>;

    /// Subscribe to events scoped to this channel
    async fn subscribe(&self, kinds: &[EventKind]) -> Result<Subscription>;
}

/// Receiving side of an event subscription
///
/// Dropping or cancelling the subscription releases it; the producing side
/// notices through [`SubscriptionSender::closed`].
pub struct Subscription {
    rx: mpsc::UnboundedReceiver<BusEvent>,
    token: CancellationToken,
}

/// Producing side of an event subscription
#[derive(Clone)]
pub struct SubscriptionSender {
    tx: mpsc::UnboundedSender<BusEvent>,
    token: CancellationToken,
}

impl Subscription {
    pub fn channel() -> (SubscriptionSender, Subscription) {
        let (tx, rx) = mpsc::unbounded_channel();
        let token = CancellationToken::new();
        (
            SubscriptionSender {
                tx,
                token: token.clone(),
            },
            Subscription { rx, token },
        )
    }

    /// Next event, or `None` once cancelled or the producer is gone
    pub async fn next(&mut self) -> Option<BusEvent> {
        tokio::select! {
            biased;
            _ = self.token.cancelled() => None,
            event = self.rx.recv() => event,
        }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("cancelled", &self.token.is_cancelled())
            .finish()
    }
}

impl SubscriptionSender {
    /// Deliver an event. Returns false once the subscription is released.
    pub fn send(&self, event: BusEvent) -> bool {
        if self.token.is_cancelled() {
            return false;
        }
        self.tx.send(event).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.token.is_cancelled() || self.tx.is_closed()
    }

    /// Resolves when the subscriber cancels or drops the subscription
    pub async fn closed(&self) {
        tokio::select! {
            _ = self.token.cancelled() => {}
            _ = self.tx.closed() => {}
        }
    }
}
