//! Configuration management
//!
//! Layers, later ones winning: built-in defaults, an optional TOML file,
//! then `IVR_*` environment variables (`IVR_BUS__URL`,
//! `IVR_DISPATCHER__MAX_CONCURRENT_CALLS`, ...).

use crate::domain::call::script::ScriptStep;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub bus: BusConfig,
    pub dispatcher: DispatcherConfig,
    pub script: ScriptConfig,
    pub logging: LoggingConfig,
    pub metrics: MetricsConfig,
}

/// Call-control bus endpoint and application identity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    pub url: String,
    pub application: String,
    pub username: String,
    pub password: String,
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Admission limit; unset means every call is accepted
    pub max_concurrent_calls: Option<usize>,
    /// How long running calls may continue after shutdown starts
    pub shutdown_grace_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScriptConfig {
    pub name: String,
    pub steps: Vec<ScriptStep>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `tracing_subscriber::EnvFilter` directive; `RUST_LOG` wins when set
    pub filter: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Address of the Prometheus scrape endpoint; disabled when unset
    pub listen: Option<SocketAddr>,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:8088/ari".to_string(),
            application: "ivr".to_string(),
            username: "asterisk".to_string(),
            password: "asterisk".to_string(),
            request_timeout_secs: 10,
        }
    }
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_concurrent_calls: None,
            shutdown_grace_secs: 30,
        }
    }
}

impl Default for ScriptConfig {
    fn default() -> Self {
        Self {
            name: "number".to_string(),
            steps: vec![ScriptStep::PlayNumber { number: 45678 }],
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from defaults, an optional file and the environment
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let defaults = config::Config::try_from(&Config::default())?;
        let mut builder = config::Config::builder().add_source(defaults);

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("IVR")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config: Config = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML document on top of the defaults
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: Config =
            toml::from_str(source).map_err(|e| ConfigError::Invalid(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Render as TOML, e.g. to bootstrap a config file
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Invalid(e.to_string()))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bus.application.trim().is_empty() {
            return Err(ConfigError::Invalid("bus.application must not be empty".to_string()));
        }
        if let Err(e) = url::Url::parse(&self.bus.url) {
            return Err(ConfigError::Invalid(format!("bus.url {}: {}", self.bus.url, e)));
        }
        if self.dispatcher.max_concurrent_calls == Some(0) {
            return Err(ConfigError::Invalid(
                "dispatcher.max_concurrent_calls must be at least 1".to_string(),
            ));
        }
        if self.script.steps.is_empty() {
            return Err(ConfigError::Invalid("script.steps must not be empty".to_string()));
        }
        Ok(())
    }
}
