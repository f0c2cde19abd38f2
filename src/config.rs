//! Adapter configuration loaded from the environment.
//!
//! Variables follow the knative/triggermesh adapter conventions (`FF`,
//! `TOPIC`, `K_SINK`, ...). Values are read through a resolver closure so
//! tests never touch the process environment.

use std::time::Duration;

use thiserror::Error;

use crate::dispatcher::DEFAULT_REQUEST_TIMEOUT;
use crate::logging::LogFormat;

/// FireFly node base URL (required).
pub const ENV_NODE_URL: &str = "FF";
/// Comma-separated topic list.
pub const ENV_TOPICS: &str = "TOPIC";
/// Bridge workflow this target is part of.
pub const ENV_BRIDGE_IDENTIFIER: &str = "EVENTS_BRIDGE_IDENTIFIER";
/// Reply payload policy.
pub const ENV_PAYLOAD_POLICY: &str = "EVENTS_PAYLOAD_POLICY";
/// Reply sink; when unset replies go back to the sender.
pub const ENV_SINK: &str = "K_SINK";
/// Component name, used as the source of reply events.
pub const ENV_COMPONENT: &str = "K_COMPONENT";
/// Receiver listen port.
pub const ENV_PORT: &str = "PORT";
/// Outbound request timeout in seconds.
pub const ENV_REQUEST_TIMEOUT: &str = "FF_REQUEST_TIMEOUT_SECS";
/// Log output format, `json` or `pretty`.
pub const ENV_LOG_FORMAT: &str = "LOG_FORMAT";

const DEFAULT_PAYLOAD_POLICY: &str = "error";
const DEFAULT_COMPONENT: &str = "firemesh";
const DEFAULT_PORT: u16 = 8080;

/// Configuration errors. All of them are fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required variable is unset or empty.
    #[error("required environment variable {0} is not set")]
    Missing(&'static str),
    /// A variable holds a value that cannot be parsed.
    #[error("invalid value {value:?} for {var}: {reason}")]
    InvalidValue {
        /// Variable name.
        var: &'static str,
        /// Raw value.
        value: String,
        /// Parser message.
        reason: String,
    },
}

/// Immutable adapter settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterConfig {
    /// FireFly node base URL.
    pub node_url: String,
    /// Configured topics, possibly empty.
    pub topics: Vec<String>,
    /// Bridge identifier for stateful reply headers.
    pub bridge_identifier: Option<String>,
    /// Payload policy selector, validated when the replier is built.
    pub payload_policy: String,
    /// Optional sink receiving reply events.
    pub sink: Option<String>,
    /// Component name.
    pub component: String,
    /// Receiver listen port.
    pub port: u16,
    /// Timeout applied to each broadcast request.
    pub request_timeout: Duration,
    /// Log output format.
    pub log_format: LogFormat,
}

impl AdapterConfig {
    /// Configuration with defaults for everything but the node URL.
    pub fn new(node_url: impl Into<String>) -> Self {
        Self {
            node_url: node_url.into(),
            topics: Vec::new(),
            bridge_identifier: None,
            payload_policy: DEFAULT_PAYLOAD_POLICY.to_owned(),
            sink: None,
            component: DEFAULT_COMPONENT.to_owned(),
            port: DEFAULT_PORT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            log_format: LogFormat::default(),
        }
    }

    /// Load from the process environment.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when `FF` is missing or a value is invalid.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_env_with(|key| std::env::var(key).ok())
    }

    /// Load using a custom resolver.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when `FF` is missing or a value is invalid.
    pub fn from_env_with(env: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let non_empty = |key: &str| env(key).map(|v| v.trim().to_owned()).filter(|v| !v.is_empty());

        let node_url = non_empty(ENV_NODE_URL).ok_or(ConfigError::Missing(ENV_NODE_URL))?;
        let mut config = Self::new(node_url);

        if let Some(raw) = env(ENV_TOPICS) {
            config.topics = split_list(&raw);
        }
        config.bridge_identifier = non_empty(ENV_BRIDGE_IDENTIFIER);
        if let Some(policy) = non_empty(ENV_PAYLOAD_POLICY) {
            config.payload_policy = policy;
        }
        config.sink = non_empty(ENV_SINK);
        if let Some(component) = non_empty(ENV_COMPONENT) {
            config.component = component;
        }
        if let Some(raw) = non_empty(ENV_PORT) {
            config.port = parse_value(ENV_PORT, &raw)?;
        }
        if let Some(raw) = non_empty(ENV_REQUEST_TIMEOUT) {
            let secs: u64 = parse_value(ENV_REQUEST_TIMEOUT, &raw)?;
            config.request_timeout = Duration::from_secs(secs);
        }
        if let Some(raw) = non_empty(ENV_LOG_FORMAT) {
            config.log_format = parse_value(ENV_LOG_FORMAT, &raw)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Check URLs and limits.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] for a non-http(s) node or sink
    /// URL, or a zero request timeout.
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_http_url(ENV_NODE_URL, &self.node_url)?;
        if let Some(sink) = &self.sink {
            check_http_url(ENV_SINK, sink)?;
        }
        if self.request_timeout.is_zero() {
            return Err(ConfigError::InvalidValue {
                var: ENV_REQUEST_TIMEOUT,
                value: "0".to_owned(),
                reason: "timeout must be positive".to_owned(),
            });
        }
        Ok(())
    }
}

/// Split a multi-value variable on commas, dropping blanks.
fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .collect()
}

fn parse_value<T>(var: &'static str, raw: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        var,
        value: raw.to_owned(),
        reason: e.to_string(),
    })
}

fn check_http_url(var: &'static str, raw: &str) -> Result<(), ConfigError> {
    let invalid = |reason: String| ConfigError::InvalidValue {
        var,
        value: raw.to_owned(),
        reason,
    };
    let parsed = url::Url::parse(raw).map_err(|e| invalid(e.to_string()))?;
    match parsed.scheme() {
        "http" | "https" => Ok(()),
        other => Err(invalid(format!("unsupported scheme {other}"))),
    }
}
