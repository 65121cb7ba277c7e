//! Configuration management for the camera hub.
//!
//! Configuration is layered from `config/default.toml`, an optional
//! `config/{RUN_MODE}.toml` and `HUB_`-prefixed environment variables.

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::net::SocketAddr;
use std::time::Duration;

/// Placeholder substituted with the input device in capture arguments.
pub const INPUT_PLACEHOLDER: &str = "{input}";

/// Main configuration for the hub.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HubConfig {
    /// WebSocket/HTTP listener configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Capture subprocess configuration
    #[serde(default)]
    pub capture: CaptureConfig,

    /// Outbound gRPC configuration for processing devices
    #[serde(default)]
    pub grpc: GrpcConfig,

    /// Peer session configuration
    #[serde(default)]
    pub session: SessionConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Address the WebSocket server binds to
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// Route serving the WebSocket upgrade
    #[serde(default = "default_ws_path")]
    pub ws_path: String,
}

/// Capture subprocess configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct CaptureConfig {
    /// Capture program (must write motion-JPEG to stdout)
    #[serde(default = "default_program")]
    pub program: String,

    /// Program arguments; `{input}` is replaced by the input device
    #[serde(default = "default_args")]
    pub args: Vec<String>,

    /// Input device used when a request does not name one
    #[serde(default = "default_input_device")]
    pub default_input_device: String,

    /// Grace period between SIGTERM and SIGKILL in milliseconds
    #[serde(default = "default_stop_timeout_ms")]
    pub stop_timeout_ms: u64,

    /// Frames buffered between capture and bridge before capture blocks
    #[serde(default = "default_frame_queue_size")]
    pub frame_queue_size: usize,
}

/// gRPC client configuration for processing devices.
#[derive(Debug, Clone, Deserialize)]
pub struct GrpcConfig {
    /// Connection timeout in seconds
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout_secs: u64,

    /// Unary request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Connection attempts before `add_client` fails
    #[serde(default = "default_max_connect_attempts")]
    pub max_connect_attempts: u32,

    /// Base delay between connection attempts in milliseconds
    #[serde(default = "default_reconnect_base_delay_ms")]
    pub reconnect_base_delay_ms: u64,

    /// Maximum delay between connection attempts in milliseconds
    #[serde(default = "default_reconnect_max_delay_ms")]
    pub reconnect_max_delay_ms: u64,

    /// Processing type announced to a device until a task overrides it
    #[serde(default = "default_processing_type")]
    pub default_processing_type: String,
}

/// Peer session configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    /// Registration handshake timeout in seconds (0 = wait forever)
    #[serde(default = "default_registration_timeout")]
    pub registration_timeout_secs: u64,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format (json, pretty)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_bind_address() -> String {
    "0.0.0.0:8765".to_string()
}
fn default_ws_path() -> String {
    "/ws".to_string()
}
fn default_program() -> String {
    "ffmpeg".to_string()
}
fn default_args() -> Vec<String> {
    [
        "-i",
        INPUT_PLACEHOLDER,
        "-f",
        "image2pipe",
        "-vcodec",
        "mjpeg",
        "-qscale:v",
        "2",
        "pipe:1",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}
fn default_input_device() -> String {
    "/dev/video0".to_string()
}
fn default_stop_timeout_ms() -> u64 {
    5000
}
fn default_frame_queue_size() -> usize {
    8
}
fn default_connection_timeout() -> u64 {
    10
}
fn default_request_timeout() -> u64 {
    30
}
fn default_max_connect_attempts() -> u32 {
    3
}
fn default_reconnect_base_delay_ms() -> u64 {
    500
}
fn default_reconnect_max_delay_ms() -> u64 {
    5000
}
fn default_processing_type() -> String {
    "motion_detection".to_string()
}
fn default_registration_timeout() -> u64 {
    30
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            ws_path: default_ws_path(),
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            program: default_program(),
            args: default_args(),
            default_input_device: default_input_device(),
            stop_timeout_ms: default_stop_timeout_ms(),
            frame_queue_size: default_frame_queue_size(),
        }
    }
}

impl Default for GrpcConfig {
    fn default() -> Self {
        Self {
            connection_timeout_secs: default_connection_timeout(),
            request_timeout_secs: default_request_timeout(),
            max_connect_attempts: default_max_connect_attempts(),
            reconnect_base_delay_ms: default_reconnect_base_delay_ms(),
            reconnect_max_delay_ms: default_reconnect_max_delay_ms(),
            default_processing_type: default_processing_type(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            registration_timeout_secs: default_registration_timeout(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

/// `HUB_`-prefixed environment variables. `HUB_CAPTURE__ARGS` is split on
/// spaces, e.g. `HUB_CAPTURE__ARGS="-i {input} -f image2pipe pipe:1"`.
fn env_source() -> Environment {
    Environment::with_prefix("HUB")
        .separator("__")
        .list_separator(" ")
        .with_list_parse_key("capture.args")
        .try_parsing(true)
}

impl HubConfig {
    /// Load configuration from file and environment variables.
    ///
    /// Later sources override earlier ones:
    /// 1. Default config file (config/default.toml)
    /// 2. Environment-specific config (config/{env}.toml)
    /// 3. Environment variables (prefixed with HUB_)
    pub fn load() -> Result<Self, ConfigError> {
        let run_mode = std::env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let config = Config::builder()
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            // e.g. HUB_SERVER__BIND_ADDRESS
            .add_source(env_source())
            .build()?;

        config.try_deserialize()
    }

    /// Create configuration from environment variables only.
    pub fn from_env() -> Result<Self, ConfigError> {
        let config = Config::builder().add_source(env_source()).build()?;

        config.try_deserialize()
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.server.bind_address.parse::<SocketAddr>().is_err() {
            return Err(ConfigValidationError::InvalidValue {
                field: "server.bind_address".to_string(),
                message: format!("'{}' is not a socket address", self.server.bind_address),
            });
        }

        if !self.server.ws_path.starts_with('/') {
            return Err(ConfigValidationError::InvalidValue {
                field: "server.ws_path".to_string(),
                message: "Path must start with '/'".to_string(),
            });
        }

        if self.capture.program.is_empty() {
            return Err(ConfigValidationError::MissingField(
                "capture.program".to_string(),
            ));
        }

        if self.capture.frame_queue_size == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "capture.frame_queue_size".to_string(),
                message: "Queue size must be greater than 0".to_string(),
            });
        }

        if self.grpc.max_connect_attempts == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "grpc.max_connect_attempts".to_string(),
                message: "At least one connection attempt is required".to_string(),
            });
        }

        if self.grpc.default_processing_type.is_empty() {
            return Err(ConfigValidationError::MissingField(
                "grpc.default_processing_type".to_string(),
            ));
        }

        Ok(())
    }
}

impl CaptureConfig {
    /// Capture arguments with the input device substituted.
    pub fn args_for(&self, input_device: &str) -> Vec<String> {
        self.args
            .iter()
            .map(|arg| arg.replace(INPUT_PLACEHOLDER, input_device))
            .collect()
    }

    /// Get the SIGTERM grace period as Duration.
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }
}

impl GrpcConfig {
    /// Get request timeout as Duration.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Get connection timeout as Duration.
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_secs)
    }

    /// Get base reconnection delay as Duration.
    pub fn reconnect_base_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_base_delay_ms)
    }

    /// Get maximum reconnection delay as Duration.
    pub fn reconnect_max_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_delay_ms)
    }
}

impl SessionConfig {
    /// Registration timeout, if one is configured.
    pub fn registration_timeout(&self) -> Option<Duration> {
        match self.registration_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }
}

/// Configuration validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigValidationError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}
