//! Configuration for the example servers.
//!
//! Supports both command-line arguments and a TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Command-line arguments shared by the example servers
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to listen on (e.g., 127.0.0.1:8211)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Maximum length of a single line in bytes
    #[arg(long)]
    pub max_line: Option<usize>,

    /// Idle timeout in seconds (0 disables the timeout)
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Update cadence in milliseconds
    #[arg(long)]
    pub tick_ms: Option<u64>,

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
    pub limits: LimitsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize, Default)]
pub struct ServerConfig {
    /// Address to listen on
    pub listen: Option<String>,
    /// Update cadence in milliseconds
    pub tick_ms: Option<u64>,
}

/// Per-connection limit configuration
#[derive(Debug, Deserialize, Default)]
pub struct LimitsConfig {
    /// Maximum length of a single line in bytes
    pub max_line_bytes: Option<usize>,
    /// Idle timeout in seconds (0 disables)
    pub timeout_secs: Option<u64>,
}

/// Logging configuration
#[derive(Debug, Deserialize, Default)]
pub struct LoggingConfig {
    /// Log level
    pub level: Option<String>,
}

fn default_tick_ms() -> u64 {
    100
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: String,
    pub tick: Duration,
    pub max_line: usize,
    pub timeout: Duration,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values; `default_listen`
    /// is used when neither specifies an address.
    pub fn load(default_listen: &str) -> Result<Self, ConfigError> {
        Self::resolve(CliArgs::parse(), default_listen)
    }

    fn resolve(cli: CliArgs, default_listen: &str) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Ok(Config {
            listen: cli
                .listen
                .or(toml_config.server.listen)
                .unwrap_or_else(|| default_listen.to_string()),
            tick: Duration::from_millis(
                cli.tick_ms
                    .or(toml_config.server.tick_ms)
                    .unwrap_or_else(default_tick_ms),
            ),
            max_line: cli
                .max_line
                .or(toml_config.limits.max_line_bytes)
                .unwrap_or(crate::connection::DEFAULT_MAX_LINE),
            timeout: Duration::from_secs(
                cli.timeout
                    .or(toml_config.limits.timeout_secs)
                    .unwrap_or(crate::connection::DEFAULT_TIMEOUT.as_secs()),
            ),
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level.unwrap_or(cli.log_level)
            },
        })
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
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
        }
    }
}

impl std::error::Error for ConfigError {}
