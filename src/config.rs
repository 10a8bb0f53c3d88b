//! Configuration module for framewire.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use std::collections::HashMap;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use serde::Deserialize;
use thiserror::Error;

/// Which side of the exchange this process plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Accept connections and answer requests
    Server,
    /// Send one request per connection and print the replies
    Client,
}

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(name = "framewire")]
#[command(version = "0.1.0")]
#[command(about = "Length-prefixed JSON-header messaging over a single-threaded event loop", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Run as server or client
    #[arg(long, value_enum)]
    pub mode: Option<Mode>,

    /// Host to bind to (server) or connect to (client)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (server) or connect to (client)
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Request action; "search" sends a JSON request, anything else a binary one
    #[arg(short, long)]
    pub action: Option<String>,

    /// Request value
    #[arg(short, long)]
    pub value: Option<String>,

    /// Number of concurrent client connections
    #[arg(short = 'n', long)]
    pub connections: Option<usize>,

    /// Readiness wait timeout in milliseconds (0 = wait indefinitely)
    #[arg(long)]
    pub poll_timeout_ms: Option<u64>,

    /// Maximum buffered inbound bytes per connection (unbounded if unset)
    #[arg(long)]
    pub max_buffer: Option<usize>,

    /// Maximum concurrent server connections
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    pub mode: Option<Mode>,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Extra or replacement search answers
    #[serde(default)]
    pub answers: HashMap<String, String>,
}

/// Server address and limits; the client connects to the same address
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub poll_timeout_ms: Option<u64>,
    pub max_buffer: Option<usize>,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            poll_timeout_ms: None,
            max_buffer: None,
            max_connections: default_max_connections(),
        }
    }
}

/// Client request settings
#[derive(Debug, Deserialize)]
pub struct ClientConfig {
    #[serde(default = "default_action")]
    pub action: String,
    #[serde(default = "default_value")]
    pub value: String,
    #[serde(default = "default_connections")]
    pub connections: usize,
    #[serde(default = "default_client_poll_timeout_ms")]
    pub poll_timeout_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            action: default_action(),
            value: default_value(),
            connections: default_connections(),
            poll_timeout_ms: default_client_poll_timeout_ms(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_max_connections() -> usize {
    1024
}

fn default_action() -> String {
    "GET ".to_string()
}

fn default_value() -> String {
    "/".to_string()
}

fn default_connections() -> usize {
    1
}

fn default_client_poll_timeout_ms() -> u64 {
    1000
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub mode: Mode,
    pub host: String,
    pub port: u16,
    pub action: String,
    pub value: String,
    pub connections: usize,
    /// `None` waits indefinitely.
    pub poll_timeout: Option<Duration>,
    pub max_buffer: Option<usize>,
    pub max_connections: usize,
    pub answers: HashMap<String, String>,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_cli(CliArgs::parse())
    }

    /// Merge CLI args over the TOML file named by `--config`, if any.
    pub fn from_cli(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = match cli.config {
            Some(ref config_path) => {
                let contents =
                    std::fs::read_to_string(config_path).map_err(|source| ConfigError::FileRead {
                        path: config_path.clone(),
                        source,
                    })?;
                toml::from_str(&contents).map_err(|source| ConfigError::TomlParse {
                    path: config_path.clone(),
                    source,
                })?
            }
            None => TomlConfig::default(),
        };

        Ok(Self::merge(cli, toml_config))
    }

    /// CLI values win; the TOML file fills the rest.
    pub fn merge(cli: CliArgs, toml_config: TomlConfig) -> Self {
        let mode = cli.mode.or(toml_config.mode).unwrap_or(Mode::Server);

        let poll_timeout_ms = cli.poll_timeout_ms.or(match mode {
            Mode::Server => toml_config.server.poll_timeout_ms,
            Mode::Client => Some(toml_config.client.poll_timeout_ms),
        });

        Config {
            mode,
            host: cli.host.unwrap_or(toml_config.server.host),
            port: cli.port.unwrap_or(toml_config.server.port),
            action: cli.action.unwrap_or(toml_config.client.action),
            value: cli.value.unwrap_or(toml_config.client.value),
            connections: cli.connections.unwrap_or(toml_config.client.connections),
            poll_timeout: poll_timeout_ms
                .filter(|ms| *ms > 0)
                .map(Duration::from_millis),
            max_buffer: cli.max_buffer.or(toml_config.server.max_buffer),
            max_connections: cli
                .max_connections
                .unwrap_or(toml_config.server.max_connections),
            answers: toml_config.answers,
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        }
    }

    /// Resolve `host:port` to the first matching socket address.
    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        let target = format!("{}:{}", self.host, self.port);
        (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|e| ConfigError::InvalidAddress(target.clone(), e.to_string()))?
            .next()
            .ok_or_else(|| ConfigError::InvalidAddress(target, "no addresses found".to_string()))
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {source}", path.display())]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file '{}': {source}", path.display())]
    TomlParse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("Invalid address '{0}': {1}")]
    InvalidAddress(String, String),
}
