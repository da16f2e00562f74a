//! TOML configuration loading.
//!
//! ```toml
//! [server]
//! address = "127.0.0.1:10393"
//! max_connections = 64
//! poll_timeout_ms = 5000
//!
//! [connection]
//! socket_timeout_ms = 60000
//! max_keep_alive_requests = 10
//!
//! [request]
//! max_header_size = 8192
//! ```

use crate::limits::{ConnLimits, ReqLimits, RespLimits, ServerLimits};
use serde::Deserialize;
use std::{fs, path::Path};
use thiserror::Error;

/// All limit sections of one configuration file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerLimits,
    pub connection: ConnLimits,
    pub request: ReqLimits,
    pub response: RespLimits,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Validation(String),
}

impl Config {
    /// Reads and validates a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when the file cannot be read, is not valid TOML,
    /// or fails validation.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parses and validates TOML text. Missing keys keep their defaults.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.worker_threads == 0 {
            return Err(ConfigError::Validation(
                "server.worker_threads must be > 0".into(),
            ));
        }
        if self.server.worker_queue == 0 {
            return Err(ConfigError::Validation(
                "server.worker_queue must be > 0".into(),
            ));
        }
        if self.server.poll_timeout.is_zero() {
            return Err(ConfigError::Validation(
                "server.poll_timeout_ms must be > 0".into(),
            ));
        }
        if self.request.max_header_size == 0 || self.request.body_window == 0 {
            return Err(ConfigError::Validation(
                "request.max_header_size and request.body_window must be > 0".into(),
            ));
        }
        if self.response.buffer_size == 0 {
            return Err(ConfigError::Validation(
                "response.buffer_size must be > 0".into(),
            ));
        }
        Ok(())
    }
}
