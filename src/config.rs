//! Configuration module for the finger server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::timeout::Timeouts;
use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Command-line arguments for the finger server
#[derive(Parser, Debug)]
#[command(name = "fingerd")]
#[command(author = "fingerd authors")]
#[command(version = "0.1.0")]
#[command(about = "A finger server answering from a management attribute directory", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 0.0.0.0)
    #[arg(long)]
    pub host: Option<String>,

    /// Preferred listen port
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Port to use when the preferred port cannot be bound
    #[arg(long)]
    pub fallback_port: Option<u16>,

    /// Milliseconds a client has to send its query line
    #[arg(long)]
    pub max_query_wait_ms: Option<u64>,

    /// Milliseconds a client may stay silent after connecting
    #[arg(long)]
    pub max_idle_read_ms: Option<u64>,

    /// Number of threads running directory lookups
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Longest accepted query line in bytes
    #[arg(long)]
    pub max_line_length: Option<usize>,

    /// Directory host used when a query names no host
    #[arg(long)]
    pub directory_host: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub directory: DirectoryConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_host")]
    pub host: String,
    /// Preferred port
    #[serde(default = "default_port")]
    pub port: u16,
    /// Port tried when the preferred one cannot be bound
    #[serde(default = "default_fallback_port")]
    pub fallback_port: Option<u16>,
    /// Number of lookup threads
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Longest accepted query line
    #[serde(default = "default_max_line_length")]
    pub max_line_length: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            fallback_port: default_fallback_port(),
            workers: default_workers(),
            max_line_length: default_max_line_length(),
        }
    }
}

/// Per-connection deadlines
#[derive(Debug, Deserialize)]
pub struct TimeoutConfig {
    #[serde(default = "default_max_query_wait_ms")]
    pub max_query_wait_ms: u64,
    #[serde(default = "default_max_idle_read_ms")]
    pub max_idle_read_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            max_query_wait_ms: default_max_query_wait_ms(),
            max_idle_read_ms: default_max_idle_read_ms(),
        }
    }
}

/// Directory lookup configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DirectoryConfig {
    /// Host queried when the request carries no `@host`
    #[serde(default = "default_directory_host")]
    pub default_host: String,
    /// Port used when the host hint carries no `:port`
    #[serde(default = "default_directory_port")]
    pub default_port: u16,
    /// In-process stores served by this instance
    #[serde(default)]
    pub stores: Vec<StoreConfig>,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            default_host: default_directory_host(),
            default_port: default_directory_port(),
            stores: Vec::new(),
        }
    }
}

/// One attribute store reachable at `host:port`
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_directory_host")]
    pub host: String,
    #[serde(default = "default_directory_port")]
    pub port: u16,
    #[serde(default)]
    pub objects: Vec<ObjectConfig>,
}

/// A managed object with fixed attribute values
#[derive(Debug, Clone, Deserialize)]
pub struct ObjectConfig {
    pub name: String,
    /// Listed in the order they are reported
    #[serde(default)]
    pub attributes: Vec<AttributeConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AttributeConfig {
    pub name: String,
    pub value: String,
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level
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
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    79
}

fn default_fallback_port() -> Option<u16> {
    Some(7979)
}

fn default_workers() -> usize {
    25
}

fn default_max_line_length() -> usize {
    1024
}

fn default_max_query_wait_ms() -> u64 {
    5000
}

fn default_max_idle_read_ms() -> u64 {
    1000
}

fn default_directory_host() -> String {
    "localhost".to_string()
}

fn default_directory_port() -> u16 {
    8989
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub fallback_port: Option<u16>,
    pub workers: usize,
    pub max_line_length: usize,
    pub timeouts: Timeouts,
    pub directory: DirectoryConfig,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(CliArgs::parse())
    }

    pub fn from_args(cli: CliArgs) -> Result<Self, ConfigError> {
        // Load TOML config if specified
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Self::merge(cli, toml_config)
    }

    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Result<Self, ConfigError> {
        let mut directory = toml_config.directory;
        if let Some(host) = cli.directory_host {
            directory.default_host = host;
        }

        let config = Config {
            host: cli.host.unwrap_or(toml_config.server.host),
            port: cli.port.unwrap_or(toml_config.server.port),
            fallback_port: cli.fallback_port.or(toml_config.server.fallback_port),
            workers: cli.workers.unwrap_or(toml_config.server.workers),
            max_line_length: cli
                .max_line_length
                .unwrap_or(toml_config.server.max_line_length),
            timeouts: Timeouts {
                max_query_wait: Duration::from_millis(
                    cli.max_query_wait_ms
                        .unwrap_or(toml_config.timeouts.max_query_wait_ms),
                ),
                max_idle_read: Duration::from_millis(
                    cli.max_idle_read_ms
                        .unwrap_or(toml_config.timeouts.max_idle_read_ms),
                ),
            },
            directory,
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::Invalid("workers must be at least 1".into()));
        }
        if self.max_line_length == 0 {
            return Err(ConfigError::Invalid(
                "max_line_length must be at least 1".into(),
            ));
        }
        if self.timeouts.max_query_wait.is_zero() || self.timeouts.max_idle_read.is_zero() {
            return Err(ConfigError::Invalid("timeouts must be non-zero".into()));
        }
        Ok(())
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}", path = .0.display(), source = .1)]
    FileRead(PathBuf, #[source] std::io::Error),
    #[error("Failed to parse config file '{path}': {source}", path = .0.display(), source = .1)]
    TomlParse(PathBuf, #[source] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
