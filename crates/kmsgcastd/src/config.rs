//! Daemon configuration.
//!
//! Values are resolved in this order, later wins:
//! 1. Built-in defaults
//! 2. Optional TOML file (`--config`)
//! 3. Environment (`KMSGCAST_PORT`)
//! 4. Command line flags (applied by the binary)

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default TCP port subscribers connect to.
pub const DEFAULT_PORT: u16 = 2244;

/// Default maximum number of simultaneous subscribers.
pub const DEFAULT_MAX_SUBSCRIBERS: usize = 10;

/// Default pause after a would-block or failed accept.
pub const DEFAULT_ACCEPT_BACKOFF_MS: u64 = 100;

/// Default pause after each admission. Throttles the admission rate.
pub const DEFAULT_ADMISSION_INTERVAL_MS: u64 = 100;

/// Default upper bound for one line write to one subscriber.
pub const DEFAULT_WRITE_TIMEOUT_MS: u64 = 5_000;

/// Default log source.
pub const DEFAULT_SOURCE: &str = "/dev/kmsg";

/// Environment variable overriding the listening port.
pub const ENV_PORT: &str = "KMSGCAST_PORT";

/// How lines read from the source are presented to subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceFormat {
    /// Forward bytes exactly as read
    Raw,
    /// Parse `/dev/kmsg` records and render them like the kernel console
    Kmsg,
}

/// Complete daemon configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    /// Interface address to listen on
    pub bind_addr: IpAddr,

    /// TCP port to listen on
    pub port: u16,

    /// Maximum number of simultaneous subscribers
    pub max_subscribers: usize,

    /// Pause after a would-block or failed accept, in milliseconds
    pub accept_backoff_ms: u64,

    /// Pause after each admission, in milliseconds
    pub admission_interval_ms: u64,

    /// Upper bound for one line write to one subscriber, in milliseconds
    pub write_timeout_ms: u64,

    /// Path to read log lines from (`-` for stdin)
    pub source: PathBuf,

    /// Source format; chosen from `source` when unset
    pub source_format: Option<SourceFormat>,

    /// Lines buffered between the source reader and the broadcaster
    pub pump_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_PORT,
            max_subscribers: DEFAULT_MAX_SUBSCRIBERS,
            accept_backoff_ms: DEFAULT_ACCEPT_BACKOFF_MS,
            admission_interval_ms: DEFAULT_ADMISSION_INTERVAL_MS,
            write_timeout_ms: DEFAULT_WRITE_TIMEOUT_MS,
            source: PathBuf::from(DEFAULT_SOURCE),
            source_format: None,
            pump_capacity: crate::source::DEFAULT_PUMP_CAPACITY,
        }
    }
}

impl ServerConfig {
    /// Loads a configuration file. Missing keys take their defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;

        toml::from_str(&contents).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            error: e.to_string(),
        })
    }

    /// Applies environment overrides using `lookup` to read variables.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup(ENV_PORT) {
            self.port = value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
                var: ENV_PORT,
                value,
            })?;
        }
        Ok(())
    }

    /// Checks value ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_subscribers == 0 {
            return Err(ConfigError::Invalid(
                "max_subscribers must be at least 1".to_string(),
            ));
        }

        if self.write_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "write_timeout_ms must be greater than 0".to_string(),
            ));
        }

        if self.pump_capacity == 0 {
            return Err(ConfigError::Invalid(
                "pump_capacity must be at least 1".to_string(),
            ));
        }

        Ok(())
    }

    /// Socket address to listen on.
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_addr, self.port)
    }

    pub fn accept_backoff(&self) -> Duration {
        Duration::from_millis(self.accept_backoff_ms)
    }

    pub fn admission_interval(&self) -> Duration {
        Duration::from_millis(self.admission_interval_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    /// Returns true if lines should be read from stdin.
    pub fn reads_stdin(&self) -> bool {
        self.source == Path::new("-")
    }

    /// Source format, inferred from the source path when not set.
    pub fn effective_source_format(&self) -> SourceFormat {
        match self.source_format {
            Some(format) => format,
            None if self.source == Path::new(DEFAULT_SOURCE) => SourceFormat::Kmsg,
            None => SourceFormat::Raw,
        }
    }
}

/// Errors that can occur while loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {error}")]
    Read { path: PathBuf, error: String },

    #[error("Failed to parse config file {path}: {error}")]
    Parse { path: PathBuf, error: String },

    #[error("Invalid value for {var}: {value:?}")]
    InvalidEnv { var: &'static str, value: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
