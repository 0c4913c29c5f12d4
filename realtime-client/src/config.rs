//! Client configuration: defaults, environment loading, and validation.

use std::time::Duration;

use crate::backoff::ReconnectPolicy;

/// Endpoint used when neither the caller nor the environment provides one.
pub const DEFAULT_URL: &str = "ws://localhost:8000/ws";
/// Environment variable holding the endpoint URL.
pub const URL_ENV: &str = "WS_URL";

const BASE_DELAY_ENV: &str = "WS_RECONNECT_BASE_MS";
const MAX_ATTEMPTS_ENV: &str = "WS_RECONNECT_MAX_ATTEMPTS";
const CONNECT_TIMEOUT_ENV: &str = "WS_CONNECT_TIMEOUT_MS";
const IDLE_TIMEOUT_ENV: &str = "WS_IDLE_TIMEOUT_MS";
const KEEP_HISTORY_ENV: &str = "WS_KEEP_HISTORY";

pub(crate) const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Configuration for [`Client`](crate::Client).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// `ws://` or `wss://` endpoint.
    pub url: String,
    pub reconnect: ReconnectPolicy,
    /// A handshake that takes longer than this counts as a failed attempt.
    pub connect_timeout: Duration,
    /// Treat the connection as lost when no frame arrives for this long.
    pub idle_timeout: Option<Duration>,
    /// Keep every dispatched payload for [`Handle::history`](crate::Handle::history).
    pub keep_history: bool,
    /// Start connecting as soon as the client is started.
    pub auto_connect: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_URL.to_string(),
            reconnect: ReconnectPolicy::default(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            idle_timeout: None,
            keep_history: false,
            auto_connect: true,
        }
    }
}

impl ClientConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    /// Load from the process environment, falling back to defaults for unset
    /// keys.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup(
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(url) = lookup(URL_ENV) {
            config.url = url;
        }
        if let Some(ms) = parse_key(&lookup, BASE_DELAY_ENV)? {
            config.reconnect.base_delay = Duration::from_millis(ms);
        }
        if let Some(n) = parse_key(&lookup, MAX_ATTEMPTS_ENV)? {
            config.reconnect.max_attempts = n;
        }
        if let Some(ms) = parse_key(&lookup, CONNECT_TIMEOUT_ENV)? {
            config.connect_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_key::<u64>(&lookup, IDLE_TIMEOUT_ENV)? {
            config.idle_timeout = (ms > 0).then(|| Duration::from_millis(ms));
        }
        if let Some(keep) = parse_key(&lookup, KEEP_HISTORY_ENV)? {
            config.keep_history = keep;
        }
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the client cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let url = url::Url::parse(&self.url)
            .map_err(|e| ConfigError::InvalidUrl(format!("{}: {e}", self.url)))?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(ConfigError::InvalidUrl(format!(
                "{}: scheme must be ws or wss",
                self.url
            )));
        }
        if self.connect_timeout.is_zero() {
            return Err(ConfigError::InvalidTimeout(
                "connect_timeout must be > 0".to_string(),
            ));
        }
        if self.idle_timeout.is_some_and(|t| t.is_zero()) {
            return Err(ConfigError::InvalidTimeout(
                "idle_timeout must be > 0 when set".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_key<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<T>, ConfigError> {
    match lookup(key) {
        None => Ok(None),
        Some(value) => match value.trim().parse() {
            Ok(parsed) => Ok(Some(parsed)),
            Err(_) => Err(ConfigError::InvalidValue { key, value }),
        },
    }
}

/// Configuration validation errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid url: {0}")]
    InvalidUrl(String),

    #[error("invalid timeout: {0}")]
    InvalidTimeout(String),

    #[error("invalid value for {key}: {value:?}")]
    InvalidValue { key: &'static str, value: String },
}
