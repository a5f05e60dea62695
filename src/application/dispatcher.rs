//! Dispatcher - turns call-start notifications into call handlers

use super::call_handler::CallHandler;
use crate::domain::call::event::{BusEvent, EventKind, DIALED_CHANNEL_ARG};
use crate::domain::call::port::ControlBus;
use crate::domain::call::script::CallScript;
use crate::domain::shared::result::Result;
use crate::domain::shared::value_objects::ChannelId;
use crate::infrastructure::metrics;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, info_span, trace, warn, Instrument};

/// Counters for one dispatcher run
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchStats {
    /// Handlers started
    pub dispatched: usize,
    /// Calls hung up because the concurrency limit was reached
    pub rejected: usize,
    /// Notifications for channels the application originated itself
    pub ignored: usize,
}

pub struct Dispatcher {
    bus: Arc<dyn ControlBus>,
    script: Arc<dyn CallScript>,
    limiter: Option<Arc<Semaphore>>,
    tracker: TaskTracker,
    calls: CancellationToken,
}

impl Dispatcher {
    pub fn new(bus: Arc<dyn ControlBus>, script: Arc<dyn CallScript>) -> Self {
        Self {
            bus,
            script,
            limiter: None,
            tracker: TaskTracker::new(),
            calls: CancellationToken::new(),
        }
    }

    /// Reject calls beyond `limit` concurrent handlers (`None` = unbounded)
    pub fn with_max_concurrent_calls(mut self, limit: Option<usize>) -> Self {
        self.limiter = limit.map(|n| Arc::new(Semaphore::new(n)));
        self
    }

    /// Token every handler's cancellation derives from
    pub fn with_calls_token(mut self, calls: CancellationToken) -> Self {
        self.calls = calls;
        self
    }

    /// Number of handler tasks still running
    pub fn active_calls(&self) -> usize {
        self.tracker.len()
    }

    /// Accept calls until `shutdown` fires or the event stream ends
    ///
    /// Handlers run detached; firing `shutdown` only stops acceptance.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<DispatchStats> {
        let span = info_span!("ivr.dispatcher", script = self.script.name());
        self.accept_calls(shutdown).instrument(span).await
    }

    async fn accept_calls(&self, shutdown: CancellationToken) -> Result<DispatchStats> {
        let mut starts = self.bus.subscribe(&[EventKind::StasisStart]).await?;
        info!("Listening for new calls");

        let mut stats = DispatchStats::default();
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    info!("Shutdown requested, no longer accepting calls");
                    break;
                }
                event = starts.next() => match event {
                    Some(BusEvent::StasisStart { channel, args }) => {
                        if args.iter().any(|arg| arg == DIALED_CHANNEL_ARG) {
                            trace!(channel = %channel.id, "Ignoring dialed channel");
                            stats.ignored += 1;
                            continue;
                        }

                        debug!(channel = %channel.id, "Got stasis start");
                        if self.dispatch(channel.id) {
                            stats.dispatched += 1;
                        } else {
                            stats.rejected += 1;
                        }
                    }
                    Some(other) => trace!(kind = ?other.kind(), "Ignoring event"),
                    None => {
                        warn!("Event stream closed");
                        break;
                    }
                }
            }
        }

        starts.cancel();
        info!(?stats, "Dispatcher stopped");
        Ok(stats)
    }

    /// Start a handler for the channel; false when the call was rejected
    fn dispatch(&self, id: ChannelId) -> bool {
        let handle = self.bus.channel(&id);

        let permit = match &self.limiter {
            None => None,
            Some(limiter) => match limiter.clone().try_acquire_owned() {
                Ok(permit) => Some(permit),
                Err(_) => {
                    warn!(channel = %id, "At capacity, rejecting call");
                    metrics::record_call_rejected();
                    self.tracker.spawn(async move {
                        if let Err(e) = handle.hangup().await {
                            warn!(channel = %id, error = %e, "Hangup of rejected call failed");
                        }
                    });
                    return false;
                }
            },
        };

        let span = info_span!("ivr.call", channel = %id);
        let handler = CallHandler::new(handle, self.script.clone(), &self.calls, span);
        self.tracker.spawn(async move {
            let _permit = permit;
            handler.run().await;
        });
        true
    }

    /// Wait for every running handler to finish
    pub async fn drain(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::call::script::{ScriptStep, StepScript};
    use crate::infrastructure::memory::{ChannelOp, InMemoryBus};
    use std::time::Duration;

    async fn wait_for_subscribers(bus: &InMemoryBus, count: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while bus.subscriber_count() < count {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
    }

    fn dispatcher(bus: &InMemoryBus, steps: Vec<ScriptStep>) -> Arc<Dispatcher> {
        Arc::new(Dispatcher::new(
            Arc::new(bus.clone()),
            Arc::new(StepScript::new("test", steps)),
        ))
    }

    #[tokio::test]
    async fn test_ignores_dialed_channels() {
        let bus = InMemoryBus::new();
        let dispatcher = dispatcher(&bus, vec![ScriptStep::Answer]);
        let shutdown = CancellationToken::new();

        let runner = {
            let dispatcher = dispatcher.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { dispatcher.run(shutdown).await })
        };
        wait_for_subscribers(&bus, 1).await;

        bus.publish(BusEvent::StasisStart {
            channel: crate::domain::call::event::ChannelSnapshot::bare(ChannelId::from("out-1")),
            args: vec![DIALED_CHANNEL_ARG.to_string()],
        });
        bus.start_call("in-1");

        tokio::time::timeout(Duration::from_secs(5), async {
            while bus.resolved_channels().is_empty() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        shutdown.cancel();

        let stats = runner.await.unwrap().unwrap();
        assert_eq!(stats.ignored, 1);
        assert_eq!(stats.dispatched, 1);
        assert_eq!(bus.resolved_channels(), vec![ChannelId::from("in-1")]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejects_calls_over_limit() {
        let bus = InMemoryBus::new();
        bus.channel_state("c1").set_play_delay(Duration::from_secs(60));

        let dispatcher = Arc::new(
            Dispatcher::new(
                Arc::new(bus.clone()),
                Arc::new(StepScript::new(
                    "slow",
                    vec![ScriptStep::PlayNumber { number: 1 }],
                )),
            )
            .with_max_concurrent_calls(Some(1)),
        );
        let shutdown = CancellationToken::new();
        let runner = {
            let dispatcher = dispatcher.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { dispatcher.run(shutdown).await })
        };
        wait_for_subscribers(&bus, 1).await;

        bus.start_call("c1");
        bus.start_call("c2");

        tokio::time::timeout(Duration::from_secs(5), async {
            while bus.resolved_channels().len() < 2 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        shutdown.cancel();

        let stats = runner.await.unwrap().unwrap();
        assert_eq!(stats.dispatched, 1);
        assert_eq!(stats.rejected, 1);

        dispatcher.drain().await;
        assert_eq!(bus.channel_state("c2").ops(), vec![ChannelOp::Hangup]);
        assert_eq!(bus.channel_state("c1").hangup_count(), 1);
    }
}
