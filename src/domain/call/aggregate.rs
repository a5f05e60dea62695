//! Call aggregate - one channel routed into the application
//!
//! A `Call` owns the handle to its channel and is the only thing that
//! touches it. Every operation first checks that the call is still live:
//! once the call-end notification has cancelled the call's token, or once
//! the call has been hung up, operations fail with
//! [`DomainError::CallEnded`] without reaching the bus.

use crate::domain::audio::{uri, SoundUri};
use crate::domain::call::event::EventKind;
use crate::domain::call::port::{ChannelHandle, Subscription};
use crate::domain::call::value_object::{CallState, EndReason};
use crate::domain::shared::error::DomainError;
use crate::domain::shared::result::Result;
use crate::domain::shared::value_objects::ChannelId;
use chrono::{Datelike, Timelike};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub struct Call {
    id: ChannelId,
    handle: Arc<dyn ChannelHandle>,
    state: CallState,
    cancel: CancellationToken,
    hung_up: bool,
}

impl Call {
    pub fn new(handle: Arc<dyn ChannelHandle>, cancel: CancellationToken) -> Self {
        Self {
            id: handle.id().clone(),
            handle,
            state: CallState::Active,
            cancel,
            hung_up: false,
        }
    }

    pub fn id(&self) -> &ChannelId {
        &self.id
    }

    pub fn state(&self) -> &CallState {
        &self.state
    }

    pub fn is_active(&self) -> bool {
        self.state.is_active() && !self.hung_up && !self.cancel.is_cancelled()
    }

    pub fn has_hung_up(&self) -> bool {
        self.hung_up
    }

    /// Token cancelled when the call ends
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Subscribe to events for this call's channel
    pub async fn subscribe(&self, kinds: &[EventKind]) -> Result<Subscription> {
        self.handle.subscribe(kinds).await
    }

    fn ensure_active(&self) -> Result<()> {
        if self.is_active() {
            Ok(())
        } else {
            Err(DomainError::CallEnded(self.id.clone()))
        }
    }

    /// Play a stored recording
    pub async fn play_recording(&mut self, name: &str) -> Result<()> {
        debug!(recording = name, "Playing recording");
        self.play(&uri::recording(name)).await
    }

    /// Play a spoken number
    pub async fn play_number(&mut self, n: i64) -> Result<()> {
        debug!(number = n, "Playing number");
        self.play_sequence(&uri::number(n)).await
    }

    /// Play digits one by one, reading `#` as `hash_word`
    pub async fn play_digits(&mut self, digits: &str, hash_word: &str) -> Result<()> {
        debug!(digits, hash = hash_word, "Playing digits");
        self.play_sequence(&uri::digits(digits, hash_word)).await
    }

    pub async fn play_duration(&mut self, d: Duration) -> Result<()> {
        debug!(duration = ?d, "Playing duration");
        self.play_sequence(&uri::duration(d)).await
    }

    pub async fn play_date_time<T>(&mut self, t: &T) -> Result<()>
    where
        T: Datelike + Timelike + std::fmt::Debug,
    {
        debug!(time = ?t, "Playing date and time");
        self.play_sequence(&uri::date_time(t)).await
    }

    /// Play silence for the given duration
    pub async fn wait(&mut self, d: Duration) -> Result<()> {
        debug!(duration = ?d, "Waiting");
        self.play_sequence(&uri::wait(d)).await
    }

    /// Play segments in order, stopping at the first failure or when the call ends
    pub async fn play_sequence(&mut self, uris: &[SoundUri]) -> Result<()> {
        for sound in uris {
            self.play(sound).await?;
        }
        Ok(())
    }

    /// Play one sound resource
    pub async fn play(&mut self, sound: &SoundUri) -> Result<()> {
        self.ensure_active()?;
        debug!(sound = %sound, "Playing sound");
        metrics::counter!("ivr_playbacks_total").increment(1);

        self.handle.play(sound).await.map_err(|e| {
            metrics::counter!("ivr_playback_failures_total").increment(1);
            e
        })
    }

    pub async fn answer(&mut self) -> Result<()> {
        self.ensure_active()?;
        debug!(channel = %self.id, "Answering call");
        self.handle.answer().await
    }

    /// Hang up the call. Later operations fail with `CallEnded`.
    pub async fn hang_up(&mut self) -> Result<()> {
        self.ensure_active()?;
        debug!(channel = %self.id, "Hanging up channel");
        self.hung_up = true;
        self.handle.hangup().await
    }

    pub async fn get_channel_variable(&mut self, name: &str) -> Result<String> {
        self.ensure_active()?;
        let value = self.handle.get_variable(name).await?;
        debug!(variable = name, value = %value, "Got channel variable");
        Ok(value)
    }

    pub async fn dial(&mut self, destination: &str, timeout: Duration) -> Result<()> {
        self.ensure_active()?;
        debug!(destination, timeout = ?timeout, "Dialing");
        self.handle.dial(destination, timeout).await
    }

    /// Close the call: hang up unless the script already did, then mark it ended
    ///
    /// The hangup is issued even after the call-end notification so the
    /// channel never stays up; failures are logged, not returned.
    pub async fn finish(&mut self, reason: EndReason) -> bool {
        let issued = if self.hung_up {
            false
        } else {
            self.hung_up = true;
            if let Err(e) = self.handle.hangup().await {
                warn!(channel = %self.id, error = %e, "Cleanup hangup failed");
            }
            true
        };

        let ended = CallState::Ended(reason);
        if self.state.can_transition_to(&ended) {
            self.state = ended;
        }
        issued
    }
}

impl std::fmt::Debug for Call {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Call")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("hung_up", &self.hung_up)
            .finish()
    }
}
