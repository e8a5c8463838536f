//! Configuration module for the chunkcast server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::error::ConfigError;
use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Port used when none is given or the given one is rejected.
pub const DEFAULT_PORT: u16 = 8080;

/// Concurrency style used to drive sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Style {
    /// Completion callbacks on an io_uring worker pool (Linux only)
    Callback,
    /// One thread per connection waiting on mio readiness
    Readiness,
}

/// Channel processing mode. Accepted for compatibility; both values
/// behave identically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Mode {
    Sync,
    Async,
}

/// Command-line arguments for the server
#[derive(Parser, Debug)]
#[command(name = "chunkcast")]
#[command(author = "chunkcast authors")]
#[command(version = "0.1.0")]
#[command(about = "Serves a fixed payload to every client read", long_about = None)]
pub struct CliArgs {
    /// Concurrency style
    #[arg(value_enum)]
    pub style: Style,

    /// Channel processing mode
    #[arg(value_enum)]
    pub mode: Mode,

    /// Port to listen on (1025-65535, default 8080)
    pub port: Option<String>,

    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 0.0.0.0)
    #[arg(long)]
    pub host: Option<String>,

    /// File whose contents are served to clients
    #[arg(long)]
    pub content: Option<PathBuf>,

    /// Capacity of each payload chunk in bytes
    #[arg(long)]
    pub chunk_size: Option<usize>,

    /// Per-session read buffer size in bytes
    #[arg(long)]
    pub read_buffer_size: Option<usize>,

    /// Number of io_uring worker threads (defaults to number of CPU cores)
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Maximum number of concurrent sessions
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// io_uring submission queue size
    #[arg(long)]
    pub ring_size: Option<u32>,

    /// Idle timeout for a single read or write in seconds (0 = none)
    #[arg(long)]
    pub idle_timeout: Option<u64>,

    /// SO_SNDBUF for accepted sockets in bytes
    #[arg(long)]
    pub send_buffer_size: Option<usize>,

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
    pub content: ContentConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    pub port: Option<i64>,
    pub workers: Option<usize>,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_ring_size")]
    pub ring_size: u32,
    /// Seconds; 0 disables the timeout
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout: u64,
    pub send_buffer_size: Option<usize>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: None,
            workers: None,
            max_connections: default_max_connections(),
            ring_size: default_ring_size(),
            idle_timeout: default_idle_timeout(),
            send_buffer_size: None,
        }
    }
}

/// Payload source configuration
#[derive(Debug, Deserialize)]
pub struct ContentConfig {
    #[serde(default = "default_content_path")]
    pub path: PathBuf,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_read_buffer_size")]
    pub read_buffer_size: usize,
}

impl Default for ContentConfig {
    fn default() -> Self {
        Self {
            path: default_content_path(),
            chunk_size: default_chunk_size(),
            read_buffer_size: default_read_buffer_size(),
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
    "0.0.0.0".to_string()
}

fn default_max_connections() -> usize {
    10_000
}

fn default_ring_size() -> u32 {
    1024
}

fn default_idle_timeout() -> u64 {
    20
}

fn default_content_path() -> PathBuf {
    PathBuf::from("data").join("file.txt")
}

fn default_chunk_size() -> usize {
    16 * 1024
}

fn default_read_buffer_size() -> usize {
    crate::runtime::DEFAULT_READ_BUFFER_SIZE
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Why a requested port was replaced by `DEFAULT_PORT`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortFallback {
    Unparsable(String),
    Reserved(i64),
}

impl fmt::Display for PortFallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortFallback::Unparsable(raw) => write!(f, "invalid port number format: {raw}"),
            PortFallback::Reserved(port) => write!(
                f,
                "invalid port number {port}: must be between 1025 and 65535"
            ),
        }
    }
}

/// Validate a requested port. Anything unparsable, at or below 1024, or
/// above 65535 falls back to `DEFAULT_PORT`.
pub fn resolve_port(raw: Option<&str>) -> (u16, Option<PortFallback>) {
    let Some(raw) = raw else {
        return (DEFAULT_PORT, None);
    };
    match raw.trim().parse::<i64>() {
        Ok(port) if port > 1024 && port <= i64::from(u16::MAX) => (port as u16, None),
        Ok(port) => (DEFAULT_PORT, Some(PortFallback::Reserved(port))),
        Err(_) => (DEFAULT_PORT, Some(PortFallback::Unparsable(raw.to_string()))),
    }
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub style: Style,
    pub mode: Mode,
    pub host: String,
    pub port: u16,
    /// Set when the requested port was rejected; logged at startup.
    pub port_fallback: Option<PortFallback>,
    pub content_path: PathBuf,
    pub chunk_size: usize,
    pub read_buffer_size: usize,
    /// 0 means one worker per CPU core.
    pub workers: usize,
    pub max_connections: usize,
    pub ring_size: u32,
    pub idle_timeout: Option<Duration>,
    pub send_buffer_size: Option<usize>,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        Self::resolve(CliArgs::parse())
    }

    /// Merge parsed CLI args with the TOML file they point at, if any.
    pub fn resolve(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents =
                std::fs::read_to_string(config_path).map_err(|source| ConfigError::FileRead {
                    path: config_path.clone(),
                    source,
                })?;
            toml::from_str(&contents).map_err(|source| ConfigError::TomlParse {
                path: config_path.clone(),
                source,
            })?
        } else {
            TomlConfig::default()
        };

        Ok(Self::merge(cli, toml_config))
    }

    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Self {
        let raw_port = cli
            .port
            .clone()
            .or_else(|| toml_config.server.port.map(|p| p.to_string()));
        let (port, port_fallback) = resolve_port(raw_port.as_deref());

        let idle_timeout = cli
            .idle_timeout
            .unwrap_or(toml_config.server.idle_timeout);

        Config {
            style: cli.style,
            mode: cli.mode,
            host: cli.host.unwrap_or(toml_config.server.host),
            port,
            port_fallback,
            content_path: cli.content.unwrap_or(toml_config.content.path),
            chunk_size: cli.chunk_size.unwrap_or(toml_config.content.chunk_size),
            read_buffer_size: cli
                .read_buffer_size
                .unwrap_or(toml_config.content.read_buffer_size),
            workers: cli.workers.or(toml_config.server.workers).unwrap_or(0),
            max_connections: cli
                .max_connections
                .unwrap_or(toml_config.server.max_connections),
            ring_size: cli.ring_size.unwrap_or(toml_config.server.ring_size),
            idle_timeout: (idle_timeout > 0).then(|| Duration::from_secs(idle_timeout)),
            send_buffer_size: cli.send_buffer_size.or(toml_config.server.send_buffer_size),
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        }
    }

    /// Address string the listener binds to.
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
pub(crate) fn test_config(style: Style) -> Config {
    let style = match style {
        Style::Callback => "callback",
        Style::Readiness => "readiness",
    };
    let cli = CliArgs::try_parse_from(["chunkcast", style, "async", "--host", "127.0.0.1"])
        .expect("valid test arguments");
    let mut config = Config::merge(cli, TomlConfig::default());
    config.port = 0;
    config.workers = 2;
    config.ring_size = 64;
    config.idle_timeout = Some(Duration::from_secs(10));
    config
}
