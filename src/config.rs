//! Session manager configuration.

use std::time::Duration;
use thiserror::Error;

/// Default collaboration server
pub const DEFAULT_SERVER_URL: &str = "http://localhost:8100";

/// Errors raised while loading or validating configuration
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: &'static str, value: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Configuration for the session manager
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Server used when a room token does not name one
    pub server_url: String,
    /// How often pending create/join calls check for cancellation
    pub poll_interval: Duration,
    /// Upper bound on waiting for the remote close acknowledgement
    pub close_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            server_url: DEFAULT_SERVER_URL.to_string(),
            poll_interval: Duration::from_millis(100),
            close_timeout: Duration::from_secs(5),
        }
    }
}

impl SessionConfig {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            ..Default::default()
        }
    }

    /// Create from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(url) = std::env::var("COLLAB_SERVER_URL") {
            config.server_url = url;
        }
        if let Some(ms) = read_millis("COLLAB_POLL_INTERVAL_MS")? {
            config.poll_interval = ms;
        }
        if let Some(ms) = read_millis("COLLAB_CLOSE_TIMEOUT_MS")? {
            config.close_timeout = ms;
        }

        config.validate()?;
        Ok(config)
    }

    /// Set the cancellation polling interval
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the bound on waiting for a remote close
    pub fn with_close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = timeout;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server_url.trim().is_empty() {
            return Err(ConfigError::Invalid("Server URL is empty".to_string()));
        }
        if self.poll_interval.is_zero() {
            return Err(ConfigError::Invalid("Poll interval must be positive".to_string()));
        }
        Ok(())
    }
}

fn read_millis(key: &'static str) -> Result<Option<Duration>, ConfigError> {
    match std::env::var(key) {
        Ok(value) => value
            .trim()
            .parse::<u64>()
            .map(|ms| Some(Duration::from_millis(ms)))
            .map_err(|_| ConfigError::InvalidValue { key, value }),
        Err(_) => Ok(None),
    }
}
