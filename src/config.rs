//! Configuration module for the gecho server.
//!
//! Supports both command-line arguments and a TOML configuration file.
//! CLI arguments take precedence over config file values, which take
//! precedence over built-in defaults.

use clap::{Args, Parser, Subcommand};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::session::SessionLimits;

/// Command-line arguments for the echo server
#[derive(Parser, Debug)]
#[command(name = "gecho")]
#[command(version)]
#[command(about = "An echo server")]
#[command(
    long_about = "An echo server that can be used to test connectivity to a Kubernetes cluster over TCP."
)]
pub struct CliArgs {
    #[command(subcommand)]
    pub command: CliCommand,
}

#[derive(Subcommand, Debug)]
pub enum CliCommand {
    /// Start the echo server
    ///
    /// Listens for incoming TCP connections and echoes back any line received.
    /// Recognized commands (help, time, status, quit) are answered instead.
    Start(StartArgs),
}

/// Flags for `gecho start`
#[derive(Args, Debug, Default)]
pub struct StartArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// The interface to bind to [default: 0.0.0.0]
    #[arg(short = 'i', long = "interface")]
    pub host: Option<String>,

    /// The port number to listen on [default: 8080]
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Enable verbose (debug) logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Seconds a connection may stay silent before it is closed [default: 300]
    #[arg(long)]
    pub idle_timeout: Option<u64>,

    /// Maximum length of a single input line in bytes [default: 65536]
    #[arg(long)]
    pub max_line_length: Option<usize>,

    /// Listen backlog [default: 1024]
    #[arg(long)]
    pub backlog: Option<u32>,

    /// Number of runtime worker threads (defaults to number of CPU cores)
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Interface to bind to
    #[serde(default = "default_host")]
    pub host: String,
    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,
    /// Idle timeout in seconds
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout: u64,
    /// Maximum input line length in bytes
    #[serde(default = "default_max_line_length")]
    pub max_line_length: usize,
    /// Listen backlog
    #[serde(default = "default_backlog")]
    pub backlog: u32,
    /// Number of worker threads
    pub workers: Option<usize>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            idle_timeout: default_idle_timeout(),
            max_line_length: default_max_line_length(),
            backlog: default_backlog(),
            workers: None,
        }
    }
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
    8080
}

fn default_idle_timeout() -> u64 {
    300 // 5 minutes
}

fn default_max_line_length() -> usize {
    64 * 1024
}

fn default_backlog() -> u32 {
    1024
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub idle_timeout: Duration,
    pub max_line_length: usize,
    pub backlog: u32,
    pub workers: Option<usize>,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self::merge(StartArgs::default(), TomlConfig::default())
    }
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        let CliCommand::Start(args) = CliArgs::parse().command;
        Self::from_start_args(args)
    }

    /// Resolve `gecho start` flags, reading the config file they name.
    pub fn from_start_args(args: StartArgs) -> Result<Self, ConfigError> {
        let toml_config = match args.config {
            Some(ref config_path) => {
                let contents = std::fs::read_to_string(config_path)
                    .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
                toml::from_str(&contents)
                    .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
            }
            None => TomlConfig::default(),
        };

        let config = Self::merge(args, toml_config);
        config.validate()?;
        Ok(config)
    }

    /// Merge CLI args over TOML config (CLI takes precedence).
    fn merge(cli: StartArgs, toml_config: TomlConfig) -> Self {
        let log_level = match (cli.log_level, cli.verbose) {
            (Some(level), _) => level,
            (None, true) => "debug".to_string(),
            (None, false) => toml_config.logging.level,
        };

        Config {
            host: cli.host.unwrap_or(toml_config.server.host),
            port: cli.port.unwrap_or(toml_config.server.port),
            idle_timeout: Duration::from_secs(
                cli.idle_timeout.unwrap_or(toml_config.server.idle_timeout),
            ),
            max_line_length: cli
                .max_line_length
                .unwrap_or(toml_config.server.max_line_length),
            backlog: cli.backlog.unwrap_or(toml_config.server.backlog),
            workers: cli.workers.or(toml_config.server.workers),
            log_level,
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.idle_timeout.is_zero() {
            return Err(ConfigError::Invalid("idle_timeout must be at least 1 second"));
        }
        if self.max_line_length == 0 {
            return Err(ConfigError::Invalid("max_line_length must be greater than 0"));
        }
        if self.workers == Some(0) {
            return Err(ConfigError::Invalid("workers must be greater than 0"));
        }
        Ok(())
    }

    /// Configured `host:port`.
    pub fn address(&self) -> String {
        if self.host.contains(':') {
            // Bare IPv6 literal
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Limits applied to every connection.
    pub fn session_limits(&self) -> SessionLimits {
        SessionLimits {
            idle_timeout: self.idle_timeout,
            max_line_length: self.max_line_length,
        }
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    Invalid(&'static str),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::FileRead(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::TomlParse(path, e) => {
                write!(f, "Failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::Invalid(msg) => write!(f, "Invalid configuration: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {}
