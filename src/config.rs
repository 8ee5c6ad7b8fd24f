//! Configuration module for the discard server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::options::{default_worker_threads, SelectionPolicy, ServerOptions, DEFAULT_PORT};
use clap::Parser;
use serde::Deserialize;
use std::net::IpAddr;
use std::path::PathBuf;
use thiserror::Error;

/// Command-line arguments for the discard server
#[derive(Parser, Debug, Default)]
#[command(name = "discard-server")]
#[command(version)]
#[command(about = "A TCP discard server", long_about = None)]
pub struct CliArgs {
    /// Port to listen on (1-65535, default 8080)
    #[arg(value_parser = clap::value_parser!(u16).range(1..))]
    pub port: Option<u16>,

    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 127.0.0.1)
    #[arg(long)]
    pub host: Option<String>,

    /// Number of acceptor threads
    #[arg(short = 'a', long)]
    pub acceptors: Option<usize>,

    /// Number of worker threads (defaults to number of CPU cores)
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Listen backlog
    #[arg(long)]
    pub backlog: Option<u32>,

    /// Enable SO_KEEPALIVE on accepted sockets
    #[arg(long)]
    pub keep_alive: Option<bool>,

    /// Enable TCP_NODELAY on accepted sockets
    #[arg(long)]
    pub no_delay: Option<bool>,

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
    pub socket: SocketConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_acceptors")]
    pub acceptors: usize,
    /// Number of worker threads
    pub workers: Option<usize>,
    #[serde(default)]
    pub selection: SelectionPolicy,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            acceptors: default_acceptors(),
            workers: None,
            selection: SelectionPolicy::default(),
        }
    }
}

/// Listening and accepted socket options
#[derive(Debug, Deserialize)]
pub struct SocketConfig {
    #[serde(default = "default_backlog")]
    pub backlog: u32,
    #[serde(default = "default_true")]
    pub keep_alive: bool,
    #[serde(default = "default_true")]
    pub no_delay: bool,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            backlog: default_backlog(),
            keep_alive: true,
            no_delay: true,
        }
    }
}

/// Event loop sizing
#[derive(Debug, Deserialize)]
pub struct RuntimeConfig {
    /// Bytes per read buffer
    #[serde(default = "default_read_buffer_size")]
    pub read_buffer_size: usize,
    /// Buffers per worker
    #[serde(default = "default_max_buffers")]
    pub max_buffers: usize,
    /// Connections per worker
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_queue_capacity")]
    pub task_queue_capacity: usize,
    #[serde(default = "default_events_capacity")]
    pub events_capacity: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            read_buffer_size: default_read_buffer_size(),
            max_buffers: default_max_buffers(),
            max_connections: default_max_connections(),
            task_queue_capacity: default_queue_capacity(),
            events_capacity: default_events_capacity(),
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
    DEFAULT_PORT
}

fn default_acceptors() -> usize {
    1
}

fn default_backlog() -> u32 {
    128
}

fn default_true() -> bool {
    true
}

fn default_read_buffer_size() -> usize {
    8 * 1024 // 8 KiB
}

fn default_max_buffers() -> usize {
    4096
}

fn default_max_connections() -> usize {
    10_000
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_events_capacity() -> usize {
    1024
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub acceptors: usize,
    pub workers: Option<usize>,
    pub selection: SelectionPolicy,
    pub backlog: u32,
    pub keep_alive: bool,
    pub no_delay: bool,
    pub read_buffer_size: usize,
    pub max_buffers: usize,
    pub max_connections: usize,
    pub task_queue_capacity: usize,
    pub events_capacity: usize,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_cli(CliArgs::parse())
    }

    pub fn from_cli(cli: CliArgs) -> Result<Self, ConfigError> {
        // Load TOML config if specified
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Ok(Self::merge(cli, toml_config))
    }

    /// Merge CLI args over TOML values.
    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Self {
        Config {
            host: cli.host.unwrap_or(toml_config.server.host),
            port: cli.port.unwrap_or(toml_config.server.port),
            acceptors: cli.acceptors.unwrap_or(toml_config.server.acceptors),
            workers: cli.workers.or(toml_config.server.workers),
            selection: toml_config.server.selection,
            backlog: cli.backlog.unwrap_or(toml_config.socket.backlog),
            keep_alive: cli.keep_alive.unwrap_or(toml_config.socket.keep_alive),
            no_delay: cli.no_delay.unwrap_or(toml_config.socket.no_delay),
            read_buffer_size: toml_config.runtime.read_buffer_size,
            max_buffers: toml_config.runtime.max_buffers,
            max_connections: toml_config.runtime.max_connections,
            task_queue_capacity: toml_config.runtime.task_queue_capacity,
            events_capacity: toml_config.runtime.events_capacity,
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
        }
    }

    /// Check values and build the options the bootstrap runs with.
    pub fn into_options(self) -> Result<ServerOptions, ConfigError> {
        let host: IpAddr = self
            .host
            .parse()
            .map_err(|_| ConfigError::Invalid(format!("host '{}' is not an IP address", self.host)))?;

        if self.port == 0 {
            return Err(ConfigError::Invalid("port must be between 1 and 65535".to_string()));
        }

        let options = ServerOptions::default()
            .with_host_addr(host)
            .with_acceptor_threads(self.acceptors)
            .with_worker_threads(self.workers.unwrap_or_else(default_worker_threads))
            .with_selection(self.selection)
            .with_backlog(self.backlog)
            .with_keep_alive(self.keep_alive)
            .with_no_delay(self.no_delay)
            .with_read_buffer_size(self.read_buffer_size)
            .with_max_buffers_per_worker(self.max_buffers)
            .with_max_connections_per_worker(self.max_connections)
            .with_task_queue_capacity(self.task_queue_capacity)
            .with_events_capacity(self.events_capacity);

        options
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        Ok(options)
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {}", .0.display(), .1)]
    FileRead(PathBuf, #[source] std::io::Error),
    #[error("Failed to parse config file '{}': {}", .0.display(), .1)]
    TomlParse(PathBuf, #[source] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TomlConfig::default();
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.acceptors, 1);
        assert_eq!(config.socket.backlog, 128);
        assert!(config.socket.keep_alive);
        assert_eq!(config.runtime.read_buffer_size, 8192);
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            host = "127.0.0.1"
            port = 9009
            workers = 4
            selection = "least-loaded"

            [socket]
            backlog = 512
            keep_alive = false

            [runtime]
            max_connections = 100

            [logging]
            level = "debug"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 9009);
        assert_eq!(config.server.workers, Some(4));
        assert_eq!(config.server.selection, SelectionPolicy::LeastLoaded);
        assert_eq!(config.socket.backlog, 512);
        assert!(!config.socket.keep_alive);
        assert!(config.socket.no_delay);
        assert_eq!(config.runtime.max_connections, 100);
        assert_eq!(config.runtime.max_buffers, 4096);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_cli_overrides_file() {
        let toml_config: TomlConfig = toml::from_str(
            r#"
            [server]
            port = 9000
            workers = 2

            [logging]
            level = "warn"
        "#,
        )
        .unwrap();
        let cli = CliArgs {
            port: Some(7000),
            workers: Some(8),
            keep_alive: Some(false),
            ..Default::default()
        };

        let config = Config::merge(cli, toml_config);
        assert_eq!(config.port, 7000);
        assert_eq!(config.workers, Some(8));
        assert!(!config.keep_alive);
        assert_eq!(config.log_level, "warn");
    }

    #[test]
    fn test_cli_positional_port() {
        let cli = CliArgs::try_parse_from(["discard-server", "9999", "--workers", "3"]).unwrap();
        assert_eq!(cli.port, Some(9999));
        assert_eq!(cli.workers, Some(3));

        let config = Config::from_cli(CliArgs::try_parse_from(["discard-server"]).unwrap()).unwrap();
        assert_eq!(config.port, 8080);

        assert!(CliArgs::try_parse_from(["discard-server", "0"]).is_err());
        assert!(CliArgs::try_parse_from(["discard-server", "70000"]).is_err());
    }

    #[test]
    fn test_into_options() {
        let cli = CliArgs {
            host: Some("127.0.0.1".to_string()),
            workers: Some(2),
            backlog: Some(64),
            ..Default::default()
        };
        let options = Config::merge(cli, TomlConfig::default())
            .into_options()
            .unwrap();
        assert_eq!(options.bind_addr(8080), "127.0.0.1:8080".parse().unwrap());
        assert_eq!(options.worker_threads, 2);
        assert_eq!(options.backlog, 64);
    }

    #[test]
    fn test_invalid_values() {
        let from_file = |toml_str: &str| {
            Config::merge(CliArgs::default(), toml::from_str(toml_str).unwrap()).into_options()
        };

        assert!(matches!(
            from_file("[server]\nport = 0"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            from_file("[server]\nworkers = 0"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            from_file("[runtime]\nread_buffer_size = 0"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            from_file("[server]\nhost = \"localhost:80\""),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_missing_file() {
        let cli = CliArgs {
            config: Some(PathBuf::from("/nonexistent/discard.toml")),
            ..Default::default()
        };
        assert!(matches!(
            Config::from_cli(cli),
            Err(ConfigError::FileRead(_, _))
        ));
    }
}
