//! Per-call lifecycle
//!
//! A handler subscribes to the end of its own call, runs the script and
//! hangs up exactly once on the way out, whatever ended the script.

use crate::domain::call::aggregate::Call;
use crate::domain::call::event::EventKind;
use crate::domain::call::port::ChannelHandle;
use crate::domain::call::script::CallScript;
use crate::domain::call::value_object::EndReason;
use crate::domain::shared::error::DomainError;
use crate::domain::shared::value_objects::ChannelId;
use crate::infrastructure::metrics;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument, Span};

/// How a call handler finished
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallOutcome {
    pub channel: ChannelId,
    pub reason: EndReason,
    /// Whether the cleanup hangup was sent (false when the script hung up itself)
    pub cleanup_hangup: bool,
}

pub struct CallHandler {
    call: Call,
    script: Arc<dyn CallScript>,
    parent: CancellationToken,
    span: Span,
}

impl CallHandler {
    /// Create a handler for a channel
    ///
    /// The call's cancellation is a child of `parent`, so cancelling
    /// `parent` stops the script at its next step. Everything the handler
    /// logs is recorded inside `span`.
    pub fn new(
        handle: Arc<dyn ChannelHandle>,
        script: Arc<dyn CallScript>,
        parent: &CancellationToken,
        span: Span,
    ) -> Self {
        Self {
            call: Call::new(handle, parent.child_token()),
            script,
            parent: parent.clone(),
            span,
        }
    }

    pub fn channel_id(&self) -> &ChannelId {
        self.call.id()
    }

    pub async fn run(self) -> CallOutcome {
        let span = self.span.clone();
        self.run_in_span().instrument(span).await
    }

    async fn run_in_span(mut self) -> CallOutcome {
        debug!(script = self.script.name(), "Running app");
        metrics::record_call_started();

        let watcher = self.watch_for_call_end().await;

        let result = self.script.run(&mut self.call).await;
        let ended_during_script = self.call.cancellation().is_cancelled();
        let shutting_down = self.parent.is_cancelled();

        // stops the watcher if the call is still up
        self.call.cancellation().cancel();
        let end_seen = match watcher {
            Some(watcher) => watcher.await.unwrap_or(false),
            None => false,
        };
        // the end of a call the script hung up itself is not a caller hangup
        let caller_hung_up = end_seen && ended_during_script && !self.call.has_hung_up();

        let reason = match result {
            _ if caller_hung_up => EndReason::CallerHangup,
            Err(DomainError::CallEnded(_)) if shutting_down => EndReason::Shutdown,
            Ok(()) => EndReason::Completed,
            Err(e) => {
                warn!(error = %e, "Script aborted");
                EndReason::ScriptFailed(e.to_string())
            }
        };

        let cleanup_hangup = self.call.finish(reason.clone()).await;
        metrics::record_call_finished(&reason);
        info!(?reason, "Call finished");

        CallOutcome {
            channel: self.call.id().clone(),
            reason,
            cleanup_hangup,
        }
    }

    /// Cancel the call when its channel leaves the application
    ///
    /// Resolves to true when the end notification was seen. The
    /// subscription is released when the watcher exits.
    async fn watch_for_call_end(&self) -> Option<JoinHandle<bool>> {
        let mut end = match self.call.subscribe(&[EventKind::StasisEnd]).await {
            Ok(subscription) => subscription,
            Err(e) => {
                warn!(error = %e, "Could not watch for call end");
                return None;
            }
        };

        let cancel = self.call.cancellation().clone();
        let watcher = async move {
            let seen = tokio::select! {
                biased;
                event = end.next() => event.is_some(),
                _ = cancel.cancelled() => false,
            };
            end.cancel();
            if seen {
                debug!("Channel left the application");
                cancel.cancel();
            }
            seen
        };

        Some(tokio::spawn(watcher.instrument(Span::current())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::audio::SoundUri;
    use crate::domain::call::port::ControlBus;
    use crate::domain::call::script::{ScriptStep, StepScript};
    use crate::infrastructure::memory::{ChannelOp, InMemoryBus};
    use std::time::Duration;

    fn script(steps: Vec<ScriptStep>) -> Arc<dyn CallScript> {
        Arc::new(StepScript::new("test", steps))
    }

    fn handler(bus: &InMemoryBus, id: &str, steps: Vec<ScriptStep>) -> CallHandler {
        CallHandler::new(
            bus.channel(&ChannelId::from(id)),
            script(steps),
            &CancellationToken::new(),
            Span::none(),
        )
    }

    #[tokio::test]
    async fn test_completed_script_hangs_up_once() {
        let bus = InMemoryBus::new();
        let outcome = handler(&bus, "c1", vec![ScriptStep::PlayNumber { number: 45678 }])
            .run()
            .await;

        assert_eq!(outcome.reason, EndReason::Completed);
        assert!(outcome.cleanup_hangup);

        let channel = bus.channel_state("c1");
        assert_eq!(
            channel.ops(),
            vec![ChannelOp::Play(SoundUri::from("number:45678")), ChannelOp::Hangup]
        );
        assert_eq!(channel.hangup_count(), 1);
    }

    #[tokio::test]
    async fn test_script_hangup_is_not_repeated() {
        let bus = InMemoryBus::new();
        let outcome = handler(&bus, "c1", vec![ScriptStep::Answer, ScriptStep::HangUp])
            .run()
            .await;

        assert_eq!(outcome.reason, EndReason::Completed);
        assert!(!outcome.cleanup_hangup);
        assert_eq!(bus.channel_state("c1").hangup_count(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_script_hangup_always_reports_completed() {
        let bus = InMemoryBus::new();
        for i in 0..200 {
            let id = format!("c{}", i);
            let outcome = handler(&bus, &id, vec![ScriptStep::Answer, ScriptStep::HangUp])
                .run()
                .await;

            assert_eq!(outcome.reason, EndReason::Completed, "run {}", i);
            assert!(!outcome.cleanup_hangup);
            assert_eq!(bus.channel_state(id.as_str()).hangup_count(), 1);
        }
    }

    #[tokio::test]
    async fn test_failed_playback_aborts_and_hangs_up() {
        let bus = InMemoryBus::new();
        bus.channel_state("c1").fail_playback("recording:missing");

        let outcome = handler(
            &bus,
            "c1",
            vec![
                ScriptStep::PlayRecording {
                    name: "missing".to_string(),
                },
                ScriptStep::PlayNumber { number: 1 },
            ],
        )
        .run()
        .await;

        assert!(matches!(outcome.reason, EndReason::ScriptFailed(_)));
        let channel = bus.channel_state("c1");
        assert_eq!(channel.played(), vec![SoundUri::from("recording:missing")]);
        assert_eq!(channel.hangup_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_caller_hangup_stops_script() {
        let bus = InMemoryBus::new();
        let state = bus.channel_state("c1");
        state.set_play_delay(Duration::from_secs(1));

        let call = handler(
            &bus,
            "c1",
            vec![ScriptStep::PlayDigits {
                digits: "12345".to_string(),
                hash_word: String::new(),
            }],
        );
        let task = tokio::spawn(call.run());

        tokio::time::sleep(Duration::from_millis(1500)).await;
        state.remote_hangup();

        let outcome = task.await.unwrap();
        assert_eq!(outcome.reason, EndReason::CallerHangup);
        // second segment was in flight when the caller left; nothing after it
        assert_eq!(
            state.played(),
            vec![SoundUri::from("digits:1"), SoundUri::from("digits:2")]
        );
        assert_eq!(state.hangup_count(), 1);
    }

    #[tokio::test]
    async fn test_parent_cancellation_reports_shutdown() {
        let bus = InMemoryBus::new();
        let parent = CancellationToken::new();
        parent.cancel();

        let outcome = CallHandler::new(
            bus.channel(&ChannelId::from("c1")),
            script(vec![ScriptStep::PlayNumber { number: 7 }]),
            &parent,
            Span::none(),
        )
        .run()
        .await;

        assert_eq!(outcome.reason, EndReason::Shutdown);
        let channel = bus.channel_state("c1");
        assert!(channel.played().is_empty());
        assert_eq!(channel.hangup_count(), 1);
    }

    #[tokio::test]
    async fn test_end_subscription_is_released() {
        let bus = InMemoryBus::new();
        handler(&bus, "c1", vec![ScriptStep::Answer]).run().await;

        tokio::time::timeout(Duration::from_secs(1), async {
            while bus.subscriber_count() > 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
    }
}
