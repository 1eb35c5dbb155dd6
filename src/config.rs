//! Configuration module for the tributary server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// How accepted connections are handed to workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum WorkerMode {
    /// Blocking accept loop feeding a bounded worker-thread pool.
    Threads,
    /// Pre-forked worker processes sharing one listening socket.
    Processes,
    /// Every connection becomes a task on the cooperative event loop.
    EventLoop,
}

/// Command-line arguments for the server
#[derive(Parser, Debug)]
#[command(name = "tributary")]
#[command(author = "tributary authors")]
#[command(version = "0.1.0")]
#[command(about = "HTTP/1.1, HTTP/2 and WebSocket connection engine", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 127.0.0.1:8080 or [::]:8080)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Refuse IPv4-mapped connections when bound to an IPv6 address
    #[arg(long)]
    pub ipv6_only: bool,

    /// Number of workers (threads or processes, defaults to number of CPU cores)
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Worker model
    #[arg(long, value_enum)]
    pub worker_mode: Option<WorkerMode>,

    /// PEM certificate chain; enables TLS together with --tls-key
    #[arg(long)]
    pub tls_cert: Option<PathBuf>,

    /// PEM private key
    #[arg(long)]
    pub tls_key: Option<PathBuf>,

    /// Maximum requests served on one HTTP/1.1 connection
    #[arg(long)]
    pub max_requests: Option<u64>,

    /// Keep-alive idle timeout in seconds
    #[arg(long)]
    pub keepalive_timeout: Option<u64>,

    /// Maximum inbound WebSocket frame payload in bytes
    #[arg(long)]
    pub max_ws_frame_size: Option<usize>,

    /// WebSocket ping interval in seconds
    #[arg(long)]
    pub ping_interval: Option<u64>,

    /// WebSocket pong timeout in seconds
    #[arg(long)]
    pub pong_timeout: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub tls: TlsSection,
    #[serde(default)]
    pub http: HttpSection,
    #[serde(default)]
    pub http2: Http2Section,
    #[serde(default)]
    pub websocket: WebSocketSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

/// Listener and worker configuration
#[derive(Debug, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default)]
    pub ipv6_only: bool,
    pub workers: Option<usize>,
    #[serde(default = "default_worker_mode")]
    pub worker_mode: WorkerMode,
    #[serde(default = "default_event_loop_threads")]
    pub event_loop_threads: usize,
    pub queue_depth: Option<usize>,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_accept_backoff_ms")]
    pub accept_backoff_ms: u64,
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            ipv6_only: false,
            workers: None,
            worker_mode: default_worker_mode(),
            event_loop_threads: default_event_loop_threads(),
            queue_depth: None,
            max_connections: default_max_connections(),
            accept_backoff_ms: default_accept_backoff_ms(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
        }
    }
}

/// Certificate material consumed at accept time
#[derive(Debug, Deserialize)]
pub struct TlsSection {
    pub cert: Option<PathBuf>,
    pub key: Option<PathBuf>,
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
}

impl Default for TlsSection {
    fn default() -> Self {
        Self {
            cert: None,
            key: None,
            handshake_timeout_ms: default_handshake_timeout_ms(),
        }
    }
}

/// HTTP/1.1 connection limits
#[derive(Debug, Deserialize)]
pub struct HttpSection {
    #[serde(default = "default_keepalive_timeout_secs")]
    pub keepalive_timeout_secs: u64,
    #[serde(default = "default_max_requests")]
    pub max_requests_per_connection: u64,
    #[serde(default = "default_io_timeout_secs")]
    pub read_timeout_secs: u64,
    #[serde(default = "default_io_timeout_secs")]
    pub write_timeout_secs: u64,
    #[serde(default = "default_max_header_bytes")]
    pub max_header_bytes: usize,
    #[serde(default = "default_max_request_bytes")]
    pub max_request_bytes: usize,
}

impl Default for HttpSection {
    fn default() -> Self {
        Self {
            keepalive_timeout_secs: default_keepalive_timeout_secs(),
            max_requests_per_connection: default_max_requests(),
            read_timeout_secs: default_io_timeout_secs(),
            write_timeout_secs: default_io_timeout_secs(),
            max_header_bytes: default_max_header_bytes(),
            max_request_bytes: default_max_request_bytes(),
        }
    }
}

/// HTTP/2 session settings
#[derive(Debug, Deserialize)]
pub struct Http2Section {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_max_concurrent_streams")]
    pub max_concurrent_streams: u32,
    #[serde(default = "default_initial_window_size")]
    pub initial_window_size: u32,
    #[serde(default = "default_h2_max_frame_size")]
    pub max_frame_size: u32,
}

impl Default for Http2Section {
    fn default() -> Self {
        Self {
            enabled: true,
            max_concurrent_streams: default_max_concurrent_streams(),
            initial_window_size: default_initial_window_size(),
            max_frame_size: default_h2_max_frame_size(),
        }
    }
}

/// WebSocket session settings
#[derive(Debug, Deserialize)]
pub struct WebSocketSection {
    #[serde(default = "default_ws_max_frame_size")]
    pub max_frame_size: usize,
    #[serde(default = "default_ws_max_message_size")]
    pub max_message_size: usize,
    #[serde(default = "default_ping_interval_secs")]
    pub ping_interval_secs: u64,
    #[serde(default = "default_pong_timeout_secs")]
    pub pong_timeout_secs: u64,
    #[serde(default = "default_true")]
    pub permessage_deflate: bool,
}

impl Default for WebSocketSection {
    fn default() -> Self {
        Self {
            max_frame_size: default_ws_max_frame_size(),
            max_message_size: default_ws_max_message_size(),
            ping_interval_secs: default_ping_interval_secs(),
            pong_timeout_secs: default_pong_timeout_secs(),
            permessage_deflate: true,
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingSection {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_listen() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_worker_mode() -> WorkerMode {
    WorkerMode::Threads
}

fn default_event_loop_threads() -> usize {
    1
}

fn default_max_connections() -> usize {
    10_000
}

fn default_accept_backoff_ms() -> u64 {
    10
}

fn default_shutdown_timeout_secs() -> u64 {
    10
}

fn default_handshake_timeout_ms() -> u64 {
    500
}

fn default_keepalive_timeout_secs() -> u64 {
    20
}

fn default_max_requests() -> u64 {
    1000
}

fn default_io_timeout_secs() -> u64 {
    30
}

fn default_max_header_bytes() -> usize {
    64 * 1024
}

fn default_max_request_bytes() -> usize {
    1024 * 1024 // 1 MB
}

fn default_true() -> bool {
    true
}

fn default_max_concurrent_streams() -> u32 {
    100
}

fn default_initial_window_size() -> u32 {
    65_535
}

fn default_h2_max_frame_size() -> u32 {
    16_384
}

fn default_ws_max_frame_size() -> usize {
    1024 * 1024
}

fn default_ws_max_message_size() -> usize {
    4 * 1024 * 1024
}

fn default_ping_interval_secs() -> u64 {
    20
}

fn default_pong_timeout_secs() -> u64 {
    10
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Certificate and key paths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsFiles {
    pub cert: PathBuf,
    pub key: PathBuf,
}

/// Resolved HTTP/1.1 limits.
#[derive(Debug, Clone)]
pub struct HttpLimits {
    pub keepalive_timeout: Duration,
    pub max_requests_per_connection: u64,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub max_header_bytes: usize,
    pub max_request_bytes: usize,
}

impl Default for HttpLimits {
    fn default() -> Self {
        HttpSection::default().into()
    }
}

impl From<HttpSection> for HttpLimits {
    fn from(section: HttpSection) -> Self {
        Self {
            keepalive_timeout: Duration::from_secs(section.keepalive_timeout_secs),
            max_requests_per_connection: section.max_requests_per_connection,
            read_timeout: Duration::from_secs(section.read_timeout_secs),
            write_timeout: Duration::from_secs(section.write_timeout_secs),
            max_header_bytes: section.max_header_bytes,
            max_request_bytes: section.max_request_bytes,
        }
    }
}

/// Resolved HTTP/2 settings advertised to peers.
#[derive(Debug, Clone)]
pub struct Http2Limits {
    pub enabled: bool,
    pub max_concurrent_streams: u32,
    pub initial_window_size: u32,
    pub max_frame_size: u32,
}

impl Default for Http2Limits {
    fn default() -> Self {
        Http2Section::default().into()
    }
}

impl From<Http2Section> for Http2Limits {
    fn from(section: Http2Section) -> Self {
        Self {
            enabled: section.enabled,
            max_concurrent_streams: section.max_concurrent_streams,
            initial_window_size: section.initial_window_size,
            max_frame_size: section.max_frame_size,
        }
    }
}

/// Resolved WebSocket settings.
#[derive(Debug, Clone)]
pub struct WebSocketLimits {
    pub max_frame_size: usize,
    pub max_message_size: usize,
    pub ping_interval: Duration,
    pub pong_timeout: Duration,
    pub permessage_deflate: bool,
}

impl Default for WebSocketLimits {
    fn default() -> Self {
        WebSocketSection::default().into()
    }
}

impl From<WebSocketSection> for WebSocketLimits {
    fn from(section: WebSocketSection) -> Self {
        Self {
            max_frame_size: section.max_frame_size,
            max_message_size: section.max_message_size,
            ping_interval: Duration::from_secs(section.ping_interval_secs),
            pong_timeout: Duration::from_secs(section.pong_timeout_secs),
            permessage_deflate: section.permessage_deflate,
        }
    }
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: String,
    pub ipv6_only: bool,
    pub workers: usize,
    pub worker_mode: WorkerMode,
    pub event_loop_threads: usize,
    pub queue_depth: usize,
    pub max_connections: usize,
    pub accept_backoff: Duration,
    pub shutdown_timeout: Duration,
    pub tls: Option<TlsFiles>,
    pub handshake_timeout: Duration,
    pub http: HttpLimits,
    pub http2: Http2Limits,
    pub websocket: WebSocketLimits,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        let workers = num_cpus();
        Self {
            listen: default_listen(),
            ipv6_only: false,
            workers,
            worker_mode: default_worker_mode(),
            event_loop_threads: default_event_loop_threads(),
            queue_depth: workers * 4,
            max_connections: default_max_connections(),
            accept_backoff: Duration::from_millis(default_accept_backoff_ms()),
            shutdown_timeout: Duration::from_secs(default_shutdown_timeout_secs()),
            tls: None,
            handshake_timeout: Duration::from_millis(default_handshake_timeout_ms()),
            http: HttpLimits::default(),
            http2: Http2Limits::default(),
            websocket: WebSocketLimits::default(),
            log_level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();

        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        let config = Self::merge(cli, toml_config)?;
        config.validate()?;
        Ok(config)
    }

    /// Merge CLI args with TOML config (CLI takes precedence).
    pub fn merge(cli: CliArgs, toml_config: TomlConfig) -> Result<Self, ConfigError> {
        let TomlConfig {
            server,
            tls,
            mut http,
            http2,
            mut websocket,
            logging,
        } = toml_config;

        let workers = cli.workers.or(server.workers).unwrap_or_else(num_cpus);

        let cert = cli.tls_cert.or(tls.cert);
        let key = cli.tls_key.or(tls.key);
        let tls_files = match (cert, key) {
            (Some(cert), Some(key)) => Some(TlsFiles { cert, key }),
            (None, None) => None,
            _ => return Err(ConfigError::Invalid("tls cert and key must be given together")),
        };

        if let Some(max) = cli.max_requests {
            http.max_requests_per_connection = max;
        }
        if let Some(secs) = cli.keepalive_timeout {
            http.keepalive_timeout_secs = secs;
        }
        if let Some(size) = cli.max_ws_frame_size {
            websocket.max_frame_size = size;
        }
        if let Some(secs) = cli.ping_interval {
            websocket.ping_interval_secs = secs;
        }
        if let Some(secs) = cli.pong_timeout {
            websocket.pong_timeout_secs = secs;
        }

        Ok(Config {
            listen: cli.listen.unwrap_or(server.listen),
            ipv6_only: cli.ipv6_only || server.ipv6_only,
            workers,
            worker_mode: cli.worker_mode.unwrap_or(server.worker_mode),
            event_loop_threads: server.event_loop_threads,
            queue_depth: server.queue_depth.unwrap_or(workers * 4),
            max_connections: server.max_connections,
            accept_backoff: Duration::from_millis(server.accept_backoff_ms),
            shutdown_timeout: Duration::from_secs(server.shutdown_timeout_secs),
            tls: tls_files,
            handshake_timeout: Duration::from_millis(tls.handshake_timeout_ms),
            http: http.into(),
            http2: http2.into(),
            websocket: websocket.into(),
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                logging.level
            },
        })
    }

    /// Reject values the protocol layers cannot honor.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::Invalid("workers must be at least 1"));
        }
        if self.event_loop_threads == 0 {
            return Err(ConfigError::Invalid("event_loop_threads must be at least 1"));
        }
        if self.queue_depth == 0 {
            return Err(ConfigError::Invalid("queue_depth must be at least 1"));
        }
        if self.handshake_timeout.is_zero() {
            return Err(ConfigError::Invalid("handshake_timeout_ms must be positive"));
        }
        if !(16_384..=16_777_215).contains(&self.http2.max_frame_size) {
            return Err(ConfigError::Invalid(
                "http2 max_frame_size must be between 16384 and 16777215",
            ));
        }
        if self.http2.initial_window_size > 0x7fff_ffff {
            return Err(ConfigError::Invalid("http2 initial_window_size exceeds 2^31-1"));
        }
        if self.websocket.max_frame_size == 0 || self.websocket.max_message_size == 0 {
            return Err(ConfigError::Invalid("websocket size limits must be positive"));
        }
        if self.websocket.ping_interval.is_zero() || self.websocket.pong_timeout.is_zero() {
            return Err(ConfigError::Invalid("websocket heartbeat timers must be positive"));
        }
        Ok(())
    }
}

fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
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

#[cfg(test)]
mod tests {
    use super::*;

    fn cli(args: &[&str]) -> CliArgs {
        let mut argv = vec!["tributary"];
        argv.extend_from_slice(args);
        CliArgs::parse_from(argv)
    }

    #[test]
    fn test_default_config() {
        let config = TomlConfig::default();
        assert_eq!(config.server.listen, "127.0.0.1:8080");
        assert_eq!(config.server.worker_mode, WorkerMode::Threads);
        assert_eq!(config.tls.handshake_timeout_ms, 500);
        assert_eq!(config.http.keepalive_timeout_secs, 20);
        assert_eq!(config.websocket.ping_interval_secs, 20);
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            listen = "[::]:8443"
            workers = 4
            worker_mode = "event-loop"

            [tls]
            cert = "/etc/tributary/cert.pem"
            key = "/etc/tributary/key.pem"
            handshake_timeout_ms = 250

            [http]
            keepalive_timeout_secs = 5
            max_requests_per_connection = 10

            [websocket]
            ping_interval_secs = 30
            pong_timeout_secs = 5
            permessage_deflate = false

            [logging]
            level = "debug"
        "#;

        let toml_config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(toml_config.server.workers, Some(4));
        assert_eq!(toml_config.server.worker_mode, WorkerMode::EventLoop);

        let config = Config::merge(cli(&[]), toml_config).unwrap();
        assert_eq!(config.listen, "[::]:8443");
        assert_eq!(config.workers, 4);
        assert_eq!(config.queue_depth, 16);
        assert_eq!(config.handshake_timeout, Duration::from_millis(250));
        assert_eq!(config.http.keepalive_timeout, Duration::from_secs(5));
        assert_eq!(config.http.max_requests_per_connection, 10);
        assert!(!config.websocket.permessage_deflate);
        assert_eq!(config.log_level, "debug");
        assert!(config.tls.is_some());
        config.validate().unwrap();
    }

    #[test]
    fn test_cli_overrides_toml() {
        let toml_config: TomlConfig = toml::from_str(
            r#"
            [server]
            listen = "0.0.0.0:80"
            workers = 2
            [http]
            keepalive_timeout_secs = 60
            "#,
        )
        .unwrap();

        let args = cli(&[
            "--listen",
            "127.0.0.1:9000",
            "--workers",
            "8",
            "--worker-mode",
            "processes",
            "--keepalive-timeout",
            "3",
            "--pong-timeout",
            "2",
        ]);
        let config = Config::merge(args, toml_config).unwrap();
        assert_eq!(config.listen, "127.0.0.1:9000");
        assert_eq!(config.workers, 8);
        assert_eq!(config.worker_mode, WorkerMode::Processes);
        assert_eq!(config.http.keepalive_timeout, Duration::from_secs(3));
        assert_eq!(config.websocket.pong_timeout, Duration::from_secs(2));
    }

    #[test]
    fn test_tls_requires_both_files() {
        let args = cli(&["--tls-cert", "cert.pem"]);
        let err = Config::merge(args, TomlConfig::default()).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_validate_rejects_bad_frame_size() {
        let mut config = Config::default();
        config.http2.max_frame_size = 1024;
        assert!(config.validate().is_err());

        config.http2.max_frame_size = 16_384;
        config.workers = 0;
        assert!(config.validate().is_err());
    }
}
