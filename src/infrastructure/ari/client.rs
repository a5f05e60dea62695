//! ARI session: HTTP client plus event WebSocket

use super::channel::AriChannel;
use crate::config::BusConfig;
use crate::domain::call::event::{BusEvent, EventKind};
use crate::domain::call::port::{ChannelHandle, ControlBus, Subscription};
use crate::domain::shared::error::DomainError;
use crate::domain::shared::result::Result;
use crate::domain::shared::value_objects::ChannelId;
use crate::infrastructure::messaging::EventRouter;
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{Method, StatusCode};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};
use url::Url;

/// Connection settings for an ARI session
#[derive(Debug, Clone)]
pub struct AriSettings {
    /// Base URL of the REST interface, e.g. `http://localhost:8088/ari`
    pub base_url: Url,
    /// Stasis application name
    pub application: String,
    pub username: String,
    pub password: String,
    pub request_timeout: Duration,
}

impl AriSettings {
    pub fn from_config(config: &BusConfig) -> Result<Self> {
        let base_url = Url::parse(&config.url)
            .map_err(|e| DomainError::Connection(format!("invalid bus url {}: {}", config.url, e)))?;

        Ok(Self {
            base_url,
            application: config.application.clone(),
            username: config.username.clone(),
            password: config.password.clone(),
            request_timeout: Duration::from_secs(config.request_timeout_secs),
        })
    }

    /// WebSocket URL of the event stream for this application
    pub fn events_url(&self) -> Result<Url> {
        let mut url = self.base_url.clone();
        let scheme = match url.scheme() {
            "http" | "ws" => "ws",
            "https" | "wss" => "wss",
            other => {
                return Err(DomainError::Connection(format!(
                    "unsupported bus url scheme: {}",
                    other
                )))
            }
        };
        url.set_scheme(scheme)
            .map_err(|_| DomainError::Connection("cannot build events url".to_string()))?;

        let path = format!("{}/events", url.path().trim_end_matches('/'));
        url.set_path(&path);
        url.query_pairs_mut()
            .clear()
            .append_pair("app", &self.application)
            .append_pair("api_key", &format!("{}:{}", self.username, self.password));
        Ok(url)
    }

    fn endpoint(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.as_str().trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }
}

/// Install the process-wide rustls crypto provider used for `https` buses
///
/// Later calls keep the provider that is already installed.
pub fn install_crypto_provider() {
    let _ = rustls::crypto::ring::default_provider().install_default();
}

/// Failed ARI request
#[derive(Debug, Clone)]
pub(crate) struct RequestFailure {
    pub status: Option<StatusCode>,
    pub message: String,
}

impl RequestFailure {
    pub fn is_not_found(&self) -> bool {
        self.status == Some(StatusCode::NOT_FOUND)
    }
}

impl std::fmt::Display for RequestFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.status {
            Some(status) => write!(f, "{} ({})", self.message, status),
            None => write!(f, "{}", self.message),
        }
    }
}

#[derive(Deserialize)]
struct AriErrorBody {
    message: String,
}

struct AriInner {
    settings: AriSettings,
    http: reqwest::Client,
    router: EventRouter,
    reader: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Drop for AriInner {
    fn drop(&mut self) {
        if let Ok(mut reader) = self.reader.lock() {
            if let Some(handle) = reader.take() {
                handle.abort();
            }
        }
        self.router.close();
    }
}

/// Session with Asterisk through ARI
#[derive(Clone)]
pub struct AriClient {
    inner: Arc<AriInner>,
}

impl AriClient {
    /// Build a client without opening the event stream
    ///
    /// REST requests work right away; events only flow once
    /// [`AriClient::connect`] has attached the WebSocket reader.
    pub fn new(settings: AriSettings) -> Result<Self> {
        install_crypto_provider();

        let http = reqwest::Client::builder()
            .timeout(settings.request_timeout)
            .build()
            .map_err(|e| DomainError::Connection(e.to_string()))?;

        Ok(Self {
            inner: Arc::new(AriInner {
                settings,
                http,
                router: EventRouter::default(),
                reader: std::sync::Mutex::new(None),
            }),
        })
    }

    /// Connect to ARI under the given application name
    ///
    /// Verifies the REST credentials, then opens the event WebSocket. There
    /// is no retry; the caller decides what a failure means.
    pub async fn connect(settings: AriSettings) -> Result<Self> {
        let client = Self::new(settings)?;

        client
            .request(Method::GET, "asterisk/info", &[])
            .await
            .map_err(|e| DomainError::Connection(format!("ARI probe failed: {}", e)))?;

        let events_url = client.inner.settings.events_url()?;
        let (stream, _response) = tokio_tungstenite::connect_async(events_url.as_str())
            .await
            .map_err(|e| DomainError::Connection(format!("event stream: {}", e)))?;

        info!(
            url = %client.inner.settings.base_url,
            application = %client.inner.settings.application,
            "Connected to ARI"
        );

        let router = client.inner.router.clone();
        let reader = tokio::spawn(async move {
            let mut events = stream;
            while let Some(message) = events.next().await {
                match message {
                    Ok(Message::Text(text)) => match serde_json::from_str::<BusEvent>(&text) {
                        Ok(event) => router.publish(event),
                        Err(e) => warn!(error = %e, "Undecodable ARI event"),
                    },
                    Ok(Message::Close(frame)) => {
                        info!(?frame, "ARI event stream closed by server");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!(error = %e, "ARI event stream failed");
                        break;
                    }
                }
            }
            router.close();
        });

        if let Ok(mut slot) = client.inner.reader.lock() {
            *slot = Some(reader);
        }

        Ok(client)
    }

    pub fn settings(&self) -> &AriSettings {
        &self.inner.settings
    }

    pub(crate) fn router(&self) -> &EventRouter {
        &self.inner.router
    }

    /// Stop reading events; every subscription ends
    pub fn close(&self) {
        if let Ok(mut reader) = self.inner.reader.lock() {
            if let Some(handle) = reader.take() {
                handle.abort();
            }
        }
        self.inner.router.close();
    }

    /// Send a request and return the response body of a successful call
    pub(crate) async fn request(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
    ) -> std::result::Result<String, RequestFailure> {
        let settings = &self.inner.settings;
        let url = settings.endpoint(path);
        debug!(%method, %url, "ARI request");

        let response = self
            .inner
            .http
            .request(method, &url)
            .basic_auth(&settings.username, Some(&settings.password))
            .query(query)
            .send()
            .await
            .map_err(|e| RequestFailure {
                status: e.status(),
                message: e.to_string(),
            })?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if status.is_success() {
            return Ok(body);
        }

        let message = serde_json::from_str::<AriErrorBody>(&body)
            .map(|b| b.message)
            .unwrap_or_else(|_| status.canonical_reason().unwrap_or("request failed").to_string());
        Err(RequestFailure {
            status: Some(status),
            message,
        })
    }
}

#[async_trait]
impl ControlBus for AriClient {
    async fn subscribe(&self, kinds: &[EventKind]) -> Result<Subscription> {
        if self.inner.router.is_closed() {
            return Err(DomainError::Transport("ARI event stream is closed".to_string()));
        }
        Ok(self.inner.router.subscribe(kinds, None))
    }

    fn channel(&self, id: &ChannelId) -> Arc<dyn ChannelHandle> {
        Arc::new(AriChannel::new(id.clone(), self.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(url: &str) -> AriSettings {
        AriSettings::from_config(&BusConfig {
            url: url.to_string(),
            application: "ivr".to_string(),
            username: "asterisk".to_string(),
            password: "secret".to_string(),
            request_timeout_secs: 5,
        })
        .unwrap()
    }

    #[test]
    fn test_events_url() {
        let url = settings("http://pbx.local:8088/ari").events_url().unwrap();
        assert_eq!(
            url.as_str(),
            "ws://pbx.local:8088/ari/events?app=ivr&api_key=asterisk%3Asecret"
        );

        let secure = settings("https://pbx.local/ari/").events_url().unwrap();
        assert_eq!(secure.scheme(), "wss");
        assert_eq!(secure.path(), "/ari/events");
    }

    #[test]
    fn test_rejects_unknown_scheme() {
        let err = settings("nats://localhost:4222").events_url().unwrap_err();
        assert!(matches!(err, DomainError::Connection(_)));
    }

    #[test]
    fn test_invalid_url() {
        let err = AriSettings::from_config(&BusConfig {
            url: "not a url".to_string(),
            ..BusConfig::default()
        })
        .unwrap_err();
        assert!(matches!(err, DomainError::Connection(_)));
    }

    #[test]
    fn test_endpoint_join() {
        let s = settings("http://localhost:8088/ari/");
        assert_eq!(
            s.endpoint("/channels/1.2/answer"),
            "http://localhost:8088/ari/channels/1.2/answer"
        );
    }

    #[tokio::test]
    async fn test_connect_failure_is_connection_error() {
        // nothing listens on port 9 (discard) on the loopback interface
        let result = AriClient::connect(settings("http://127.0.0.1:9/ari")).await;
        assert!(matches!(result, Err(DomainError::Connection(_))));
    }

    #[tokio::test]
    async fn test_secure_event_stream_attempts_tls() {
        use tokio_tungstenite::tungstenite::error::{Error as WsError, UrlError};

        install_crypto_provider();
        // accepts TCP and hangs up, so only the TLS handshake can fail
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                drop(socket);
            }
        });

        let url = settings(&format!("https://{}/ari", addr)).events_url().unwrap();
        let err = tokio_tungstenite::connect_async(url.as_str()).await.unwrap_err();
        assert!(
            !matches!(err, WsError::Url(UrlError::TlsFeatureNotEnabled)),
            "unexpected error: {}",
            err
        );
    }

    #[tokio::test]
    async fn test_request_maps_ari_error_body() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/ari/asterisk/info"))
            .respond_with(
                ResponseTemplate::new(401).set_body_json(serde_json::json!({
                    "message": "Authentication required"
                })),
            )
            .mount(&server)
            .await;

        let client = AriClient::new(settings(&format!("{}/ari", server.uri()))).unwrap();
        let failure = client
            .request(Method::GET, "asterisk/info", &[])
            .await
            .unwrap_err();
        assert_eq!(failure.status, Some(StatusCode::UNAUTHORIZED));
        assert_eq!(failure.message, "Authentication required");

        let result = AriClient::connect(client.settings().clone()).await;
        assert!(matches!(result, Err(DomainError::Connection(_))));
    }
}
