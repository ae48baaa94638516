//! Configuration module for echod.
//!
//! Supports both command-line arguments and a TOML configuration file.
//! CLI arguments take precedence over config file values, which take
//! precedence over built-in defaults.

use crate::connection::HandlerConfig;
use crate::server::ListenerConfig;
use clap::Parser;
use serde::Deserialize;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Command-line arguments for the echo server
#[derive(Parser, Debug, Default)]
#[command(name = "echod")]
#[command(version)]
#[command(about = "A TCP byte-echo server", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Host to bind to (default: 0.0.0.0)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to listen on (default: 10000)
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Accept queue depth (default: 20)
    #[arg(long)]
    pub backlog: Option<u32>,

    /// Stop accepting after this many connections
    #[arg(long)]
    pub accept_limit: Option<usize>,

    /// Transfer buffer size in bytes (default: 1460)
    #[arg(long)]
    pub buffer_size: Option<usize>,

    /// Receive timeout in milliseconds (default: 5000)
    #[arg(long)]
    pub recv_timeout_ms: Option<u64>,

    /// Send timeout in milliseconds (default: 5000)
    #[arg(long)]
    pub send_timeout_ms: Option<u64>,

    /// How long to drain after shutdown, in milliseconds (default: 5000)
    #[arg(long)]
    pub shutdown_deadline_ms: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub connection: ConnectionSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

/// Listener-related configuration
#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct ServerSection {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub backlog: Option<u32>,
    pub accept_limit: Option<usize>,
}

/// Per-connection configuration
#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct ConnectionSection {
    pub buffer_size: Option<usize>,
    pub recv_timeout_ms: Option<u64>,
    pub send_timeout_ms: Option<u64>,
    pub shutdown_deadline_ms: Option<u64>,
}

/// Logging configuration
#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct LoggingSection {
    pub level: Option<String>,
}

/// Final resolved configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub backlog: u32,
    pub accept_limit: Option<usize>,
    pub buffer_size: usize,
    pub recv_timeout_ms: u64,
    pub send_timeout_ms: u64,
    pub shutdown_deadline_ms: u64,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: crate::DEFAULT_HOST.to_string(),
            port: crate::DEFAULT_PORT,
            backlog: crate::DEFAULT_BACKLOG,
            accept_limit: None,
            buffer_size: crate::DEFAULT_MSS,
            recv_timeout_ms: crate::DEFAULT_IO_TIMEOUT_MS,
            send_timeout_ms: crate::DEFAULT_IO_TIMEOUT_MS,
            shutdown_deadline_ms: crate::DEFAULT_SHUTDOWN_DEADLINE_MS,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from process arguments and an optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_cli(CliArgs::parse())
    }

    /// Resolve configuration from already-parsed CLI arguments.
    pub fn from_cli(cli: CliArgs) -> Result<Self, ConfigError> {
        let file = match cli.config {
            Some(ref path) => {
                let contents = std::fs::read_to_string(path)
                    .map_err(|source| ConfigError::FileRead {
                        path: path.clone(),
                        source,
                    })?;
                toml::from_str(&contents).map_err(|source| ConfigError::TomlParse {
                    path: path.clone(),
                    source,
                })?
            }
            None => TomlConfig::default(),
        };

        Self::merge(cli, file)
    }

    /// Merge CLI args over file values over defaults, then validate.
    pub fn merge(cli: CliArgs, file: TomlConfig) -> Result<Self, ConfigError> {
        let defaults = Config::default();

        let config = Config {
            host: cli.host.or(file.server.host).unwrap_or(defaults.host),
            port: cli.port.or(file.server.port).unwrap_or(defaults.port),
            backlog: cli
                .backlog
                .or(file.server.backlog)
                .unwrap_or(defaults.backlog),
            accept_limit: cli.accept_limit.or(file.server.accept_limit),
            buffer_size: cli
                .buffer_size
                .or(file.connection.buffer_size)
                .unwrap_or(defaults.buffer_size),
            recv_timeout_ms: cli
                .recv_timeout_ms
                .or(file.connection.recv_timeout_ms)
                .unwrap_or(defaults.recv_timeout_ms),
            send_timeout_ms: cli
                .send_timeout_ms
                .or(file.connection.send_timeout_ms)
                .unwrap_or(defaults.send_timeout_ms),
            shutdown_deadline_ms: cli
                .shutdown_deadline_ms
                .or(file.connection.shutdown_deadline_ms)
                .unwrap_or(defaults.shutdown_deadline_ms),
            log_level: cli
                .log_level
                .or(file.logging.level)
                .unwrap_or(defaults.log_level),
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.backlog == 0 {
            return Err(ConfigError::Invalid("backlog must be greater than 0"));
        }
        if self.buffer_size == 0 {
            return Err(ConfigError::Invalid("buffer_size must be greater than 0"));
        }
        if self.recv_timeout_ms == 0 || self.send_timeout_ms == 0 {
            return Err(ConfigError::Invalid("timeouts must be greater than 0"));
        }
        if self.shutdown_deadline_ms == 0 {
            return Err(ConfigError::Invalid(
                "shutdown_deadline_ms must be greater than 0",
            ));
        }
        self.bind_address().map(|_| ())
    }

    /// Returns the bind address
    pub fn bind_address(&self) -> Result<SocketAddr, ConfigError> {
        let ip: IpAddr = self
            .host
            .parse()
            .map_err(|_| ConfigError::InvalidHost(self.host.clone()))?;
        Ok(SocketAddr::new(ip, self.port))
    }

    /// Builds the listener settings from this configuration.
    pub fn listener_config(&self) -> Result<ListenerConfig, ConfigError> {
        Ok(ListenerConfig {
            addr: self.bind_address()?,
            backlog: self.backlog,
            accept_limit: self.accept_limit,
            handler: HandlerConfig {
                buffer_size: self.buffer_size,
                recv_timeout: Duration::from_millis(self.recv_timeout_ms),
                send_timeout: Duration::from_millis(self.send_timeout_ms),
                shutdown_deadline: Duration::from_millis(self.shutdown_deadline_ms),
            },
        })
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {source}", .path.display())]
    FileRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file '{}': {source}", .path.display())]
    TomlParse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Invalid host '{0}': expected an IP address")]
    InvalidHost(String),

    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}
