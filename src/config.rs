//! Configuration for the server and the client.
//!
//! Everything has a default, so a TOML file only needs the values it changes:
//!
//! ```toml
//! log_level = "debug"
//!
//! [server]
//! bind = "0.0.0.0:6000"
//! root = "/srv/uftp"
//!
//! [server.retry]
//! timeout_ms = 500
//! max_retries = 8
//! ```

use std::fs;
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse config file {}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("retry timeout must be greater than 0 ms")]
    ZeroTimeout,

    #[error("retry backoff must be at least 1.0, got {0}")]
    InvalidBackoff(f64),

    #[error("max_timeout_ms ({max}) is below timeout_ms ({initial})")]
    MaxBelowInitial { initial: u64, max: u64 },

    #[error("max_sessions must be between 1 and 1000, got {0}")]
    InvalidMaxSessions(usize),

    #[error("inbox_capacity must be greater than 0")]
    ZeroInbox,

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),
}

const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Fallback tracing filter when `RUST_LOG` is unset.
    pub log_level: String,
    pub server: ServerConfig,
    pub client: ClientConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: SocketAddr,
    /// Directory whose files are served.
    pub root: PathBuf,
    /// Transfers running at the same time.
    pub max_sessions: usize,
    /// Packets queued per session before further ones are dropped.
    pub inbox_capacity: usize,
    /// STUN server queried once at startup to log the public address.
    pub stun_server: Option<String>,
    pub retry: RetryPolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClientConfig {
    /// Directory downloads land in and uploads are read from.
    pub root: PathBuf,
    pub retry: RetryPolicy,
}

/// How long to wait for an answer and how often to re-send before giving up.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryPolicy {
    pub timeout_ms: u64,
    pub max_retries: u32,
    /// Each re-send multiplies the wait by this factor.
    pub backoff: f64,
    pub max_timeout_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            server: ServerConfig::default(),
            client: ClientConfig::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 5001)),
            root: PathBuf::from("."),
            max_sessions: 16,
            inbox_capacity: 32,
            stun_server: None,
            retry: RetryPolicy::default(),
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
            retry: RetryPolicy::default(),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            timeout_ms: 2000,
            max_retries: 5,
            backoff: 2.0,
            max_timeout_ms: 16_000,
        }
    }
}

impl RetryPolicy {
    pub fn new(timeout: Duration, max_retries: u32) -> Self {
        let timeout_ms = timeout.as_millis().max(1) as u64;
        Self {
            timeout_ms,
            max_retries,
            backoff: 2.0,
            max_timeout_ms: timeout_ms.saturating_mul(8),
        }
    }

    pub fn initial(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Wait before re-send number `attempt` (0 for the first wait).
    pub fn wait_for(&self, attempt: u32) -> Duration {
        let scaled = self.timeout_ms as f64 * self.backoff.powi(attempt.min(64) as i32);
        let capped = scaled.min(self.max_timeout_ms as f64);
        Duration::from_millis(capped as u64)
    }

    /// Longest a peer keeps trying: every wait, first to last.
    pub fn total_wait(&self) -> Duration {
        (0..=self.max_retries).map(|attempt| self.wait_for(attempt)).sum()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.timeout_ms == 0 {
            return Err(ConfigError::ZeroTimeout);
        }
        if !(self.backoff >= 1.0) {
            return Err(ConfigError::InvalidBackoff(self.backoff));
        }
        if self.max_timeout_ms < self.timeout_ms {
            return Err(ConfigError::MaxBelowInitial {
                initial: self.timeout_ms,
                max: self.max_timeout_ms,
            });
        }
        Ok(())
    }
}

impl Config {
    /// Reads a TOML file. Missing keys keep their defaults.
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Config = toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Loads `path` if given, otherwise the defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Config, ConfigError> {
        match path {
            Some(path) => Config::load(path),
            None => Ok(Config::default()),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !VALID_LOG_LEVELS.contains(&self.log_level.to_lowercase().as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.log_level.clone()));
        }
        if self.server.max_sessions == 0 || self.server.max_sessions > 1000 {
            return Err(ConfigError::InvalidMaxSessions(self.server.max_sessions));
        }
        if self.server.inbox_capacity == 0 {
            return Err(ConfigError::ZeroInbox);
        }
        self.server.retry.validate()?;
        self.client.retry.validate()?;
        Ok(())
    }
}
