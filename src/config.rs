//! Configuration module for echo-mux.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::{Args, Parser, Subcommand};
use serde::Deserialize;
use std::path::PathBuf;

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(name = "echo-mux")]
#[command(author = "echo-mux authors")]
#[command(version = "0.1.0")]
#[command(about = "A readiness-polled TCP echo server and its harness programs", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

/// Program to run
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the echo server
    Serve(ServeArgs),
    /// Send one message to an echo server and print the reply
    Client(ClientArgs),
    /// Run the producer/consumer handoff demo
    Handoff(HandoffArgs),
}

#[derive(Args, Debug, Default)]
pub struct ServeArgs {
    /// Address to bind to
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Maximum number of simultaneous peer connections
    #[arg(short = 'n', long)]
    pub max_connections: Option<usize>,

    /// Listen backlog
    #[arg(long)]
    pub backlog: Option<i32>,
}

#[derive(Args, Debug, Default)]
pub struct ClientArgs {
    /// Server address
    #[arg(long)]
    pub host: Option<String>,

    /// Server port
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Message to send
    #[arg(short, long)]
    pub message: Option<String>,

    /// Read timeout in milliseconds (0 = wait for the server to close)
    #[arg(short, long)]
    pub timeout_ms: Option<u64>,
}

#[derive(Args, Debug, Default)]
pub struct HandoffArgs {
    /// Number of values to pass from producer to consumer
    #[arg(short = 'n', long)]
    pub count: Option<usize>,

    /// Consumer delay after each value, in milliseconds
    #[arg(short, long)]
    pub delay_ms: Option<u64>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub handoff: HandoffConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Echo server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Peer connections admitted at once; the listener does not count.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_backlog")]
    pub backlog: i32,
    /// Upper bound on a single read, and so on a single echoed chunk.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_connections: default_max_connections(),
            backlog: default_backlog(),
            chunk_size: default_chunk_size(),
        }
    }
}

/// Echo client configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_message")]
    pub message: String,
    /// 0 disables the read timeout.
    #[serde(default)]
    pub timeout_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            message: default_message(),
            timeout_ms: 0,
        }
    }
}

/// Handoff demo configuration
#[derive(Debug, Clone, Deserialize)]
pub struct HandoffConfig {
    #[serde(default = "default_count")]
    pub count: usize,
    #[serde(default = "default_consumer_delay_ms")]
    pub consumer_delay_ms: u64,
}

impl Default for HandoffConfig {
    fn default() -> Self {
        Self {
            count: default_count(),
            consumer_delay_ms: default_consumer_delay_ms(),
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
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_max_connections() -> usize {
    100
}

fn default_backlog() -> i32 {
    5
}

fn default_chunk_size() -> usize {
    1024
}

fn default_message() -> String {
    "GET /\n\n".to_string()
}

fn default_count() -> usize {
    100
}

fn default_consumer_delay_ms() -> u64 {
    100
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Which program the binary runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Serve,
    Client,
    Handoff,
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub mode: Mode,
    pub server: ServerConfig,
    pub client: ClientConfig,
    pub handoff: HandoffConfig,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_cli(CliArgs::parse())
    }

    /// Merge parsed CLI args with the TOML file they point at, if any.
    /// CLI arguments take precedence over TOML file values.
    pub fn from_cli(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        let TomlConfig {
            mut server,
            mut client,
            mut handoff,
            logging,
        } = toml_config;

        let mode = match cli.command {
            Command::Serve(args) => {
                server.host = args.host.unwrap_or(server.host);
                server.port = args.port.unwrap_or(server.port);
                server.max_connections = args.max_connections.unwrap_or(server.max_connections);
                server.backlog = args.backlog.unwrap_or(server.backlog);
                Mode::Serve
            }
            Command::Client(args) => {
                client.host = args.host.unwrap_or(client.host);
                client.port = args.port.unwrap_or(client.port);
                client.message = args.message.unwrap_or(client.message);
                client.timeout_ms = args.timeout_ms.unwrap_or(client.timeout_ms);
                Mode::Client
            }
            Command::Handoff(args) => {
                handoff.count = args.count.unwrap_or(handoff.count);
                handoff.consumer_delay_ms = args.delay_ms.unwrap_or(handoff.consumer_delay_ms);
                Mode::Handoff
            }
        };

        if server.chunk_size == 0 {
            return Err(ConfigError::Invalid("server.chunk_size must be at least 1"));
        }

        Ok(Config {
            mode,
            server,
            client,
            handoff,
            log_level: cli.log_level.unwrap_or(logging.level),
        })
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
