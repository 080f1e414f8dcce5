//! Client configuration and environment loading.

use std::time::Duration;

use secrecy::SecretString;
use thiserror::Error;

/// Environment variable holding the remote host (`host[:port]`).
pub const ENV_HOST: &str = "APP_BIOSTAR_HOST";
/// Environment variable holding the login id.
pub const ENV_LOGIN_ID: &str = "APP_BIOSTAR_LOGINID";
/// Environment variable holding the login password.
pub const ENV_PASSWORD: &str = "APP_BIOSTAR_PASSWORD";
/// Environment variable toggling certificate validation.
pub const ENV_REJECT_UNAUTHORIZED: &str = "APP_BIOSTAR_REJECT_UNAUTHORIZED";
/// Environment variable holding the keep-alive interval in seconds.
pub const ENV_KEEPALIVE_SECS: &str = "APP_BIOSTAR_KEEPALIVE_SECS";
/// Environment variable holding the reconnect delay in milliseconds.
pub const ENV_RECONNECT_DELAY_MS: &str = "APP_BIOSTAR_RECONNECT_DELAY_MS";
/// Environment variable switching to plain `http://` and `ws://`.
pub const ENV_LOCAL: &str = "APP_BIOSTAR_LOCAL";

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SessionDefaults;

impl SessionDefaults {
    pub const HOST: &'static str = "localhost";
    pub const LOGIN_ID: &'static str = "admin";
    pub const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(30 * 60);
    pub const RECONNECT_DELAY: Duration = Duration::from_secs(3);
}

/// Connection settings for a [`crate::session::SessionClient`].
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Remote host, optionally with a port.
    pub host: String,
    /// Login id sent on every login.
    pub login_id: String,
    /// Login password.
    pub password: SecretString,
    /// Rejects invalid TLS certificates when `true`.
    pub reject_unauthorized: bool,
    /// Keep-alive probe interval. `None` disables keep-alive.
    pub keep_alive_interval: Option<Duration>,
    /// Fixed delay before each reconnection attempt.
    pub reconnect_delay: Duration,
    /// Uses `http://` and `ws://` instead of their TLS variants.
    pub local_mode: bool,
}

impl ClientConfig {
    pub fn new(
        host: impl Into<String>,
        login_id: impl Into<String>,
        password: SecretString,
    ) -> Self {
        Self {
            host: host.into().trim().to_string(),
            login_id: login_id.into(),
            password,
            reject_unauthorized: true,
            keep_alive_interval: Some(SessionDefaults::KEEP_ALIVE_INTERVAL),
            reconnect_delay: SessionDefaults::RECONNECT_DELAY,
            local_mode: false,
        }
    }

    /// Loads configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads configuration from an arbitrary key lookup.
    ///
    /// Unset keys fall back to [`SessionDefaults`].
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let host = lookup(ENV_HOST).unwrap_or_else(|| SessionDefaults::HOST.to_string());
        let login_id = lookup(ENV_LOGIN_ID).unwrap_or_else(|| SessionDefaults::LOGIN_ID.to_string());
        let password = SecretString::new(lookup(ENV_PASSWORD).unwrap_or_default());

        let mut config = Self::new(host, login_id, password);

        if let Some(value) = lookup(ENV_REJECT_UNAUTHORIZED) {
            config.reject_unauthorized = parse_bool(ENV_REJECT_UNAUTHORIZED, &value)?;
        }
        if let Some(value) = lookup(ENV_KEEPALIVE_SECS) {
            let secs = parse_u64(ENV_KEEPALIVE_SECS, &value)?;
            config = config.with_keep_alive_interval(Some(Duration::from_secs(secs)));
        }
        if let Some(value) = lookup(ENV_RECONNECT_DELAY_MS) {
            let millis = parse_u64(ENV_RECONNECT_DELAY_MS, &value)?;
            config.reconnect_delay = Duration::from_millis(millis);
        }
        if let Some(value) = lookup(ENV_LOCAL) {
            config.local_mode = parse_bool(ENV_LOCAL, &value)?;
        }

        Ok(config)
    }

    pub fn with_reject_unauthorized(mut self, reject: bool) -> Self {
        self.reject_unauthorized = reject;
        self
    }

    /// Sets the keep-alive interval. A zero duration disables keep-alive.
    pub fn with_keep_alive_interval(mut self, interval: Option<Duration>) -> Self {
        self.keep_alive_interval = interval.filter(|interval| !interval.is_zero());
        self
    }

    /// Interval the keep-alive task runs with; zero counts as disabled.
    pub fn keep_alive_period(&self) -> Option<Duration> {
        self.keep_alive_interval.filter(|interval| !interval.is_zero())
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    pub fn with_local_mode(mut self, local: bool) -> Self {
        self.local_mode = local;
        self
    }

    /// Base URL for HTTP calls, including the `/api` prefix.
    pub fn api_base_url(&self) -> String {
        let scheme = if self.local_mode { "http" } else { "https" };
        format!("{scheme}://{}/api", self.host)
    }

    /// URL of the push-event websocket.
    pub fn socket_url(&self) -> String {
        let scheme = if self.local_mode { "ws" } else { "wss" };
        format!("{scheme}://{}/wsapi", self.host)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{key} must be a boolean, got {value:?}")]
    InvalidBool { key: &'static str, value: String },

    #[error("{key} must be a non-negative integer, got {value:?}")]
    InvalidNumber { key: &'static str, value: String },
}

fn parse_bool(key: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(ConfigError::InvalidBool {
            key,
            value: value.to_string(),
        }),
    }
}

fn parse_u64(key: &'static str, value: &str) -> Result<u64, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidNumber {
            key,
            value: value.to_string(),
        })
}
