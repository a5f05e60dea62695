//! Call scripts - what the application does with a call
//!
//! A script is a strategy chosen at startup. [`StepScript`] is the data
//! driven implementation: a fixed list of [`ScriptStep`]s run in order,
//! aborting at the first error.

use crate::domain::audio::SoundUri;
use crate::domain::call::aggregate::Call;
use crate::domain::shared::result::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

#[async_trait]
pub trait CallScript: Send + Sync {
    fn name(&self) -> &str;

    /// Run the script against a live call. Returning an error aborts it.
    async fn run(&self, call: &mut Call) -> Result<()>;
}

/// One step of a data driven script
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ScriptStep {
    Answer,
    Play {
        uri: String,
    },
    PlayRecording {
        name: String,
    },
    PlayNumber {
        number: i64,
    },
    PlayDigits {
        digits: String,
        #[serde(default)]
        hash_word: String,
    },
    PlayDuration {
        seconds: u64,
    },
    /// Current local date and time
    PlayDateTime,
    Wait {
        seconds: u64,
    },
    Dial {
        destination: String,
        timeout_secs: u64,
    },
    /// Read a variable and log it; fails when the variable is unset
    GetVariable {
        name: String,
    },
    HangUp,
}

impl ScriptStep {
    pub async fn execute(&self, call: &mut Call) -> Result<()> {
        match self {
            ScriptStep::Answer => call.answer().await,
            ScriptStep::Play { uri } => call.play(&SoundUri::new(uri.as_str())).await,
            ScriptStep::PlayRecording { name } => call.play_recording(name).await,
            ScriptStep::PlayNumber { number } => call.play_number(*number).await,
            ScriptStep::PlayDigits { digits, hash_word } => {
                call.play_digits(digits, hash_word).await
            }
            ScriptStep::PlayDuration { seconds } => {
                call.play_duration(Duration::from_secs(*seconds)).await
            }
            ScriptStep::PlayDateTime => call.play_date_time(&chrono::Local::now()).await,
            ScriptStep::Wait { seconds } => call.wait(Duration::from_secs(*seconds)).await,
            ScriptStep::Dial {
                destination,
                timeout_secs,
            } => {
                call.dial(destination, Duration::from_secs(*timeout_secs))
                    .await
            }
            ScriptStep::GetVariable { name } => {
                let value = call.get_channel_variable(name).await?;
                info!(variable = %name, value = %value, "Channel variable");
                Ok(())
            }
            ScriptStep::HangUp => call.hang_up().await,
        }
    }
}

/// Script made of a fixed list of steps
#[derive(Debug, Clone)]
pub struct StepScript {
    name: String,
    steps: Vec<ScriptStep>,
}

impl StepScript {
    pub fn new(name: impl Into<String>, steps: Vec<ScriptStep>) -> Self {
        Self {
            name: name.into(),
            steps,
        }
    }

    pub fn steps(&self) -> &[ScriptStep] {
        &self.steps
    }
}

#[async_trait]
impl CallScript for StepScript {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, call: &mut Call) -> Result<()> {
        for (index, step) in self.steps.iter().enumerate() {
            debug!(script = %self.name, step = index, ?step, "Running step");
            step.execute(call).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::call::port::MockChannelHandle;
    use crate::domain::shared::error::DomainError;
    use crate::domain::shared::value_objects::ChannelId;
    use mockall::predicate::eq;
    use mockall::Sequence;
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    #[test]
    fn test_steps_deserialize_from_toml() {
        #[derive(Deserialize)]
        struct Wrapper {
            steps: Vec<ScriptStep>,
        }

        let wrapper: Wrapper = toml::from_str(
            r#"
            steps = [
                { action = "answer" },
                { action = "play_digits", digits = "12#" },
                { action = "dial", destination = "PJSIP/1002", timeout_secs = 30 },
                { action = "hang_up" },
            ]
            "#,
        )
        .unwrap();

        assert_eq!(
            wrapper.steps,
            vec![
                ScriptStep::Answer,
                ScriptStep::PlayDigits {
                    digits: "12#".to_string(),
                    hash_word: String::new(),
                },
                ScriptStep::Dial {
                    destination: "PJSIP/1002".to_string(),
                    timeout_secs: 30,
                },
                ScriptStep::HangUp,
            ]
        );
    }

    #[tokio::test]
    async fn test_step_script_runs_in_order() {
        let mut mock = MockChannelHandle::new();
        mock.expect_id().return_const(ChannelId::from("c1"));
        let mut seq = Sequence::new();
        mock.expect_answer()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Ok(()));
        mock.expect_play()
            .with(eq(SoundUri::from("recording:welcome")))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        mock.expect_hangup()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Ok(()));

        let script = StepScript::new(
            "welcome",
            vec![
                ScriptStep::Answer,
                ScriptStep::PlayRecording {
                    name: "welcome".to_string(),
                },
                ScriptStep::HangUp,
            ],
        );

        let mut call = Call::new(Arc::new(mock), CancellationToken::new());
        script.run(&mut call).await.unwrap();
        assert!(call.has_hung_up());
    }

    #[tokio::test]
    async fn test_step_script_aborts_on_error() {
        let mut mock = MockChannelHandle::new();
        mock.expect_id().return_const(ChannelId::from("c1"));
        mock.expect_answer()
            .times(1)
            .returning(|| Err(DomainError::Answer("channel not in stasis".to_string())));
        mock.expect_play().never();

        let script = StepScript::new(
            "broken",
            vec![ScriptStep::Answer, ScriptStep::PlayNumber { number: 1 }],
        );

        let mut call = Call::new(Arc::new(mock), CancellationToken::new());
        let err = script.run(&mut call).await.unwrap_err();
        assert!(matches!(err, DomainError::Answer(_)));
    }
}
