//! Event router
//!
//! Fans bus notifications out to subscriptions. Each subscription gets a
//! forwarding task that applies the kind and channel filters and stops as
//! soon as the subscriber releases it or the router closes.

use crate::domain::call::event::{BusEvent, EventKind};
use crate::domain::call::port::Subscription;
use crate::domain::shared::value_objects::ChannelId;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{trace, warn};

const DEFAULT_CAPACITY: usize = 1024;

#[derive(Clone)]
pub struct EventRouter {
    tx: broadcast::Sender<BusEvent>,
    closed: CancellationToken,
}

impl EventRouter {
    /// Create new event router with specified capacity
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx,
            closed: CancellationToken::new(),
        }
    }

    /// Publish an event to every live subscription
    pub fn publish(&self, event: BusEvent) {
        if self.closed.is_cancelled() {
            return;
        }
        trace!(kind = ?event.kind(), "Routing event");
        // No receivers is fine: nobody is interested in this event
        let _ = self.tx.send(event);
    }

    /// Subscribe to events of the given kinds, optionally scoped to one channel
    ///
    /// The subscription sees every event published after this call returns.
    pub fn subscribe(&self, kinds: &[EventKind], channel: Option<ChannelId>) -> Subscription {
        let (sender, subscription) = Subscription::channel();
        if self.closed.is_cancelled() {
            return subscription;
        }

        let mut rx = self.tx.subscribe();
        let kinds = kinds.to_vec();
        let closed = self.closed.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = sender.closed() => break,
                    _ = closed.cancelled() => break,
                    received = rx.recv() => match received {
                        Ok(event) => {
                            if !event.matches(&kinds) {
                                continue;
                            }
                            if let Some(ref id) = channel {
                                if event.channel_id().as_ref() != Some(id) {
                                    continue;
                                }
                            }
                            if !sender.send(event) {
                                break;
                            }
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(skipped, "Subscription lagged, events dropped");
                        }
                        Err(RecvError::Closed) => break,
                    }
                }
            }
        });

        subscription
    }

    /// Close the router; all subscriptions end
    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Get number of active subscriptions
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventRouter {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
