//! Channel handle backed by ARI REST calls

use super::client::{AriClient, RequestFailure};
use crate::domain::audio::SoundUri;
use crate::domain::call::event::{BusEvent, EventKind, PlaybackSnapshot, DIALED_CHANNEL_ARG};
use crate::domain::call::port::{ChannelHandle, Subscription};
use crate::domain::shared::error::DomainError;
use crate::domain::shared::result::Result;
use crate::domain::shared::value_objects::ChannelId;
use async_trait::async_trait;
use reqwest::Method;
use serde::Deserialize;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Deserialize)]
struct Variable {
    value: String,
}

/// Outbound leg created by `dial`, torn down with the call
#[derive(Debug, Clone, PartialEq, Eq)]
struct DialedLeg {
    channel: ChannelId,
    bridge: String,
}

pub struct AriChannel {
    id: ChannelId,
    client: AriClient,
    legs: Mutex<Vec<DialedLeg>>,
}

/// Hanging up a channel that no longer exists is not an error
fn hangup_outcome(result: std::result::Result<String, RequestFailure>) -> Result<()> {
    match result {
        Ok(_) => Ok(()),
        Err(e) if e.is_not_found() => Ok(()),
        Err(e) => Err(DomainError::Hangup(e.to_string())),
    }
}

/// Classify a failed variable lookup
///
/// ARI answers 404 both for an unknown channel ("Channel not found") and
/// for an unset variable ("Provided variable was not found").
fn variable_failure(channel: &ChannelId, name: &str, failure: RequestFailure) -> DomainError {
    if !failure.is_not_found() {
        return DomainError::Transport(failure.to_string());
    }
    if failure.message.to_lowercase().starts_with("channel") {
        DomainError::CallEnded(channel.clone())
    } else {
        DomainError::VariableNotFound(name.to_string())
    }
}

fn playback_outcome(uri: &SoundUri, playback: &PlaybackSnapshot) -> Result<()> {
    if playback.failed() {
        Err(DomainError::playback(uri.as_str(), "playback failed"))
    } else {
        Ok(())
    }
}

impl AriChannel {
    pub fn new(id: ChannelId, client: AriClient) -> Self {
        Self {
            id,
            client,
            legs: Mutex::new(Vec::new()),
        }
    }

    fn path(&self, suffix: &str) -> String {
        if suffix.is_empty() {
            format!("channels/{}", self.id)
        } else {
            format!("channels/{}/{}", self.id, suffix)
        }
    }

    /// Best-effort hangup of a channel this handle created
    async fn release_channel(&self, channel: &ChannelId) {
        let result = self
            .client
            .request(Method::DELETE, &format!("channels/{}", channel), &[])
            .await;
        if let Err(e) = hangup_outcome(result) {
            warn!(channel = %channel, error = %e, "Hangup of dialed channel failed");
        }
    }

    /// Best-effort removal of a bridge this handle created
    async fn release_bridge(&self, bridge: &str) {
        match self
            .client
            .request(Method::DELETE, &format!("bridges/{}", bridge), &[])
            .await
        {
            Ok(_) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => warn!(bridge, error = %e, "Bridge removal failed"),
        }
    }

    /// Tear down every outbound leg and bridge created by `dial`
    async fn release_legs(&self) {
        let legs = match self.legs.lock() {
            Ok(mut legs) => std::mem::take(&mut *legs),
            Err(_) => return,
        };
        for leg in legs {
            self.release_channel(&leg.channel).await;
            self.release_bridge(&leg.bridge).await;
        }
    }

    /// Wait until the originated channel enters the application or goes away
    async fn await_answer(&self, events: &mut Subscription, timeout: Duration) -> Result<()> {
        let outcome = tokio::time::timeout(timeout, async {
            while let Some(event) = events.next().await {
                match event {
                    BusEvent::StasisStart { .. } => return Ok(()),
                    BusEvent::ChannelDestroyed { cause_txt, .. } => {
                        return Err(DomainError::Dial(cause_txt));
                    }
                    _ => {}
                }
            }
            Err(DomainError::Transport("ARI event stream closed".to_string()))
        })
        .await;

        outcome.unwrap_or_else(|_| Err(DomainError::Dial(format!("no answer within {:?}", timeout))))
    }

    /// Bridge the answered leg with this channel
    async fn bridge_with(&self, dialed: &ChannelId) -> Result<String> {
        let bridge_id = Uuid::new_v4().to_string();
        self.client
            .request(
                Method::POST,
                "bridges",
                &[("type", "mixing".to_string()), ("bridgeId", bridge_id.clone())],
            )
            .await
            .map_err(|e| DomainError::Dial(format!("bridge create: {}", e)))?;

        if let Err(e) = self
            .client
            .request(
                Method::POST,
                &format!("bridges/{}/addChannel", bridge_id),
                &[("channel", format!("{},{}", self.id, dialed))],
            )
            .await
        {
            warn!(bridge = %bridge_id, error = %e, "Bridging failed");
            self.release_bridge(&bridge_id).await;
            return Err(DomainError::Dial(format!("bridge add: {}", e)));
        }

        Ok(bridge_id)
    }
}

#[async_trait]
impl ChannelHandle for AriChannel {
    fn id(&self) -> &ChannelId {
        &self.id
    }

    async fn answer(&self) -> Result<()> {
        self.client
            .request(Method::POST, &self.path("answer"), &[])
            .await
            .map(|_| ())
            .map_err(|e| DomainError::Answer(e.to_string()))
    }

    async fn hangup(&self) -> Result<()> {
        let result = self
            .client
            .request(Method::DELETE, &self.path(""), &[("reason", "normal".to_string())])
            .await;
        self.release_legs().await;
        hangup_outcome(result)
    }

    async fn play(&self, uri: &SoundUri) -> Result<()> {
        let playback_id = Uuid::new_v4().to_string();
        let mut events = self.client.router().subscribe(
            &[
                EventKind::PlaybackFinished,
                EventKind::StasisEnd,
                EventKind::ChannelDestroyed,
            ],
            Some(self.id.clone()),
        );

        self.client
            .request(
                Method::POST,
                &self.path(&format!("play/{}", playback_id)),
                &[("media", uri.to_string())],
            )
            .await
            .map_err(|e| DomainError::playback(uri.as_str(), e.to_string()))?;

        while let Some(event) = events.next().await {
            match event {
                BusEvent::PlaybackFinished { playback } if playback.id == playback_id => {
                    return playback_outcome(uri, &playback);
                }
                BusEvent::StasisEnd { .. } | BusEvent::ChannelDestroyed { .. } => {
                    return Err(DomainError::playback(uri.as_str(), "channel hung up"));
                }
                _ => {}
            }
        }

        Err(DomainError::playback(uri.as_str(), "event stream closed"))
    }

    async fn get_variable(&self, name: &str) -> Result<String> {
        let body = self
            .client
            .request(Method::GET, &self.path("variable"), &[("variable", name.to_string())])
            .await
            .map_err(|e| variable_failure(&self.id, name, e))?;

        let variable: Variable = serde_json::from_str(&body)
            .map_err(|e| DomainError::Transport(format!("bad variable response: {}", e)))?;
        Ok(variable.value)
    }

    async fn dial(&self, destination: &str, timeout: Duration) -> Result<()> {
        let dialed = ChannelId::generate();
        let mut events = self.client.router().subscribe(
            &[EventKind::StasisStart, EventKind::ChannelDestroyed],
            Some(dialed.clone()),
        );

        let application = self.client.settings().application.clone();
        self.client
            .request(
                Method::POST,
                "channels",
                &[
                    ("endpoint", destination.to_string()),
                    ("app", application),
                    ("appArgs", DIALED_CHANNEL_ARG.to_string()),
                    ("channelId", dialed.to_string()),
                    ("originator", self.id.to_string()),
                    ("timeout", timeout.as_secs().max(1).to_string()),
                ],
            )
            .await
            .map_err(|e| DomainError::Dial(e.to_string()))?;

        let answered = self.await_answer(&mut events, timeout).await;
        events.cancel();
        if let Err(e) = answered {
            self.release_channel(&dialed).await;
            return Err(e);
        }

        let bridge = match self.bridge_with(&dialed).await {
            Ok(bridge) => bridge,
            Err(e) => {
                self.release_channel(&dialed).await;
                return Err(e);
            }
        };

        debug!(channel = %self.id, dialed = %dialed, bridge = %bridge, "Bridged");
        if let Ok(mut legs) = self.legs.lock() {
            legs.push(DialedLeg {
                channel: dialed,
                bridge,
            });
        }
        Ok(())
    }

    async fn subscribe(&self, kinds: &[EventKind]) -> Result<Subscription> {
        if self.client.router().is_closed() {
            return Err(DomainError::Transport("ARI event stream is closed".to_string()));
        }
        Ok(self.client.router().subscribe(kinds, Some(self.id.clone())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BusConfig;
    use crate::domain::call::event::ChannelSnapshot;
    use crate::infrastructure::ari::AriSettings;
    use reqwest::StatusCode;
    use wiremock::matchers::{method, path, path_regex, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn failure(status: StatusCode, message: &str) -> RequestFailure {
        RequestFailure {
            status: Some(status),
            message: message.to_string(),
        }
    }

    fn playback(state: &str) -> PlaybackSnapshot {
        PlaybackSnapshot {
            id: "pb-1".to_string(),
            media_uri: "sound:hello".to_string(),
            target_uri: "channel:c1".to_string(),
            state: state.to_string(),
        }
    }

    async fn channel_on(server: &MockServer) -> AriChannel {
        let settings = AriSettings::from_config(&BusConfig {
            url: format!("{}/ari", server.uri()),
            request_timeout_secs: 5,
            ..BusConfig::default()
        })
        .unwrap();
        AriChannel::new(ChannelId::from("c1"), AriClient::new(settings).unwrap())
    }

    async fn mount(server: &MockServer, verb: &str, route: &str, status: u16) {
        Mock::given(method(verb))
            .and(path_regex(route))
            .respond_with(ResponseTemplate::new(status).set_body_json(serde_json::json!({})))
            .mount(server)
            .await;
    }

    async fn deleted_paths(server: &MockServer) -> Vec<String> {
        server
            .received_requests()
            .await
            .unwrap_or_default()
            .iter()
            .filter(|r| r.method.as_str() == "DELETE")
            .map(|r| r.url.path().to_string())
            .collect()
    }

    /// Answer the first originated leg by publishing its StasisStart
    async fn answer_dialed_leg(server: &MockServer, channel: &AriChannel) -> ChannelId {
        loop {
            let requests = server.received_requests().await.unwrap_or_default();
            let dialed = requests
                .iter()
                .filter(|r| r.method.as_str() == "POST" && r.url.path() == "/ari/channels")
                .find_map(|r| {
                    r.url
                        .query_pairs()
                        .find(|(key, _)| key == "channelId")
                        .map(|(_, value)| ChannelId::new(value.into_owned()))
                });

            if let Some(dialed) = dialed {
                channel.client.router().publish(BusEvent::StasisStart {
                    channel: ChannelSnapshot::bare(dialed.clone()),
                    args: vec![DIALED_CHANNEL_ARG.to_string()],
                });
                return dialed;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[test]
    fn test_hangup_of_missing_channel_succeeds() {
        assert_eq!(hangup_outcome(Ok(String::new())), Ok(()));
        assert_eq!(
            hangup_outcome(Err(failure(StatusCode::NOT_FOUND, "Channel not found"))),
            Ok(())
        );
        assert!(matches!(
            hangup_outcome(Err(failure(StatusCode::INTERNAL_SERVER_ERROR, "boom"))),
            Err(DomainError::Hangup(_))
        ));
    }

    #[test]
    fn test_variable_failure_classification() {
        let id = ChannelId::from("c1");

        assert_eq!(
            variable_failure(
                &id,
                "EXTEN",
                failure(StatusCode::NOT_FOUND, "Provided variable was not found")
            ),
            DomainError::VariableNotFound("EXTEN".to_string())
        );
        assert_eq!(
            variable_failure(&id, "EXTEN", failure(StatusCode::NOT_FOUND, "Channel not found")),
            DomainError::CallEnded(id.clone())
        );
        assert!(matches!(
            variable_failure(&id, "EXTEN", failure(StatusCode::BAD_REQUEST, "Invalid")),
            DomainError::Transport(_)
        ));
    }

    #[test]
    fn test_failed_playback_is_an_error() {
        let uri = SoundUri::from("sound:hello");
        assert_eq!(playback_outcome(&uri, &playback("done")), Ok(()));
        assert_eq!(
            playback_outcome(&uri, &playback("failed")),
            Err(DomainError::playback("sound:hello", "playback failed"))
        );
    }

    #[tokio::test]
    async fn test_hangup_tolerates_gone_channel() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/ari/channels/c1"))
            .respond_with(
                ResponseTemplate::new(404)
                    .set_body_json(serde_json::json!({ "message": "Channel not found" })),
            )
            .mount(&server)
            .await;

        let channel = channel_on(&server).await;
        assert_eq!(channel.hangup().await, Ok(()));
    }

    #[tokio::test]
    async fn test_get_variable_over_http() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/ari/channels/c1/variable"))
            .and(query_param("variable", "CALLERID(num)"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({ "value": "1001" })),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/ari/channels/c1/variable"))
            .and(query_param("variable", "EXTEN"))
            .respond_with(ResponseTemplate::new(404).set_body_json(
                serde_json::json!({ "message": "Provided variable was not found" }),
            ))
            .mount(&server)
            .await;

        let channel = channel_on(&server).await;
        assert_eq!(channel.get_variable("CALLERID(num)").await, Ok("1001".to_string()));
        assert_eq!(
            channel.get_variable("EXTEN").await,
            Err(DomainError::VariableNotFound("EXTEN".to_string()))
        );
    }

    #[tokio::test]
    async fn test_hangup_tears_down_dialed_leg_and_bridge() {
        let server = MockServer::start().await;
        mount(&server, "POST", r"^/ari/channels$", 200).await;
        mount(&server, "POST", r"^/ari/bridges$", 200).await;
        mount(&server, "POST", r"^/ari/bridges/[^/]+/addChannel$", 200).await;
        mount(&server, "DELETE", r"^/ari/.*$", 200).await;

        let channel = channel_on(&server).await;
        let (dialed, answered) = tokio::join!(
            channel.dial("PJSIP/1002", Duration::from_secs(5)),
            answer_dialed_leg(&server, &channel),
        );
        dialed.unwrap();
        assert!(deleted_paths(&server).await.is_empty());

        channel.hangup().await.unwrap();

        let deleted = deleted_paths(&server).await;
        assert_eq!(deleted.len(), 3, "{:?}", deleted);
        assert_eq!(deleted[0], "/ari/channels/c1");
        assert_eq!(deleted[1], format!("/ari/channels/{}", answered));
        assert!(deleted[2].starts_with("/ari/bridges/"));

        // legs are released once
        channel.hangup().await.unwrap();
        assert_eq!(deleted_paths(&server).await.len(), 4);
    }

    #[tokio::test]
    async fn test_failed_bridge_hangs_up_dialed_leg() {
        let server = MockServer::start().await;
        mount(&server, "POST", r"^/ari/channels$", 200).await;
        mount(&server, "POST", r"^/ari/bridges$", 500).await;
        mount(&server, "DELETE", r"^/ari/.*$", 200).await;

        let channel = channel_on(&server).await;
        let (dialed, answered) = tokio::join!(
            channel.dial("PJSIP/1002", Duration::from_secs(5)),
            answer_dialed_leg(&server, &channel),
        );

        assert!(matches!(dialed, Err(DomainError::Dial(_))));
        assert_eq!(
            deleted_paths(&server).await,
            vec![format!("/ari/channels/{}", answered)]
        );
    }

    #[tokio::test]
    async fn test_unanswered_dial_hangs_up_dialed_leg() {
        let server = MockServer::start().await;
        mount(&server, "POST", r"^/ari/channels$", 200).await;
        mount(&server, "DELETE", r"^/ari/.*$", 200).await;

        let channel = channel_on(&server).await;
        let result = channel.dial("PJSIP/1002", Duration::from_millis(100)).await;

        assert!(matches!(result, Err(DomainError::Dial(_))));
        let deleted = deleted_paths(&server).await;
        assert_eq!(deleted.len(), 1);
        assert!(deleted[0].starts_with("/ari/channels/"));
        assert_ne!(deleted[0], "/ari/channels/c1");
    }
}
