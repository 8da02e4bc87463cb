//! Server configuration.
//!
//! Configuration can be loaded from:
//! - TOML configuration file (`chatter.toml`, `/etc/chatter/chatter.toml`,
//!   `~/.config/chatter/chatter.toml`, or `--config <path>`)
//! - Environment variables (`CHATTER__<SECTION>__<KEY>`), applied on top
//! - `CHATTER_HOST` / `CHATTER_PORT` for the bind address defaults

use anyhow::{Context, Result};
use chatter_core::{ConnectionConfig, HubConfig};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Default configuration file locations, in search order.
pub const CONFIG_PATHS: [&str; 3] = [
    "chatter.toml",
    "/etc/chatter/chatter.toml",
    "~/.config/chatter/chatter.toml",
];

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Transport configuration.
    #[serde(default)]
    pub transport: TransportConfig,

    /// Resource limits.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Liveness configuration.
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    /// Identity admission.
    #[serde(default)]
    pub identity: IdentityConfig,

    /// Per-IP request rate limiting.
    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// Cross-origin access.
    #[serde(default)]
    pub cors: CorsConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Shutdown behaviour.
    #[serde(default)]
    pub shutdown: ShutdownConfig,
}

/// Transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Path for WebSocket endpoint.
    #[serde(default = "default_ws_path")]
    pub websocket_path: String,
}

/// Resource limits configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum number of connections.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Maximum message size in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Per-connection outbound queue capacity.
    #[serde(default = "default_outbound_queue_capacity")]
    pub outbound_queue_capacity: usize,

    /// Hub command channel capacity.
    #[serde(default = "default_command_capacity")]
    pub command_capacity: usize,
}

/// Heartbeat configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Read deadline in milliseconds. Pings go out at 90% of it.
    #[serde(default = "default_pong_wait")]
    pub pong_wait_ms: u64,
}

/// Where the upstream proxy puts the authenticated identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityConfig {
    #[serde(default = "default_user_id_header")]
    pub user_id_header: String,

    #[serde(default = "default_username_header")]
    pub username_header: String,

    /// Accept `user_id` / `username` query parameters when headers are absent.
    #[serde(default = "default_true")]
    pub allow_query: bool,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,

    /// How often hub statistics are sampled, in milliseconds.
    #[serde(default = "default_report_interval")]
    pub report_interval_ms: u64,
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Sustained requests per second, per client IP.
    #[serde(default = "default_rate_per_second")]
    pub per_second: u64,

    /// Requests a client may make in a burst before being limited.
    #[serde(default = "default_rate_burst")]
    pub burst: u32,
}

/// CORS configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CorsConfig {
    /// Allowed origins. Empty mirrors the request's `Origin`.
    #[serde(default)]
    pub allowed_origins: Vec<String>,
}

/// Shutdown configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShutdownConfig {
    /// How long to wait for the hub and every connection task to finish.
    #[serde(default = "default_grace")]
    pub grace_ms: u64,

    /// How long a cancelled connection may keep flushing its socket.
    #[serde(default = "default_write_grace")]
    pub write_grace_ms: u64,
}

// Default value functions
fn default_host() -> String {
    std::env::var("CHATTER_HOST").unwrap_or_else(|_| "127.0.0.1".to_string())
}

fn default_port() -> u16 {
    std::env::var("CHATTER_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8080)
}

fn default_true() -> bool {
    true
}

fn default_ws_path() -> String {
    "/ws".to_string()
}

fn default_max_connections() -> usize {
    100_000
}

fn default_max_message_size() -> usize {
    chatter_protocol::codec::DEFAULT_MAX_FRAME_SIZE
}

fn default_outbound_queue_capacity() -> usize {
    chatter_core::connection::DEFAULT_OUTBOUND_CAPACITY
}

fn default_command_capacity() -> usize {
    1024
}

fn default_pong_wait() -> u64 {
    60_000 // 60 seconds
}

fn default_user_id_header() -> String {
    "x-user-id".to_string()
}

fn default_username_header() -> String {
    "x-username".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_report_interval() -> u64 {
    10_000
}

fn default_grace() -> u64 {
    5_000
}

fn default_write_grace() -> u64 {
    1_000
}

fn default_rate_per_second() -> u64 {
    5
}

fn default_rate_burst() -> u32 {
    10
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            transport: TransportConfig::default(),
            limits: LimitsConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            identity: IdentityConfig::default(),
            rate_limit: RateLimitConfig::default(),
            cors: CorsConfig::default(),
            metrics: MetricsConfig::default(),
            shutdown: ShutdownConfig::default(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            websocket_path: default_ws_path(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            max_message_size: default_max_message_size(),
            outbound_queue_capacity: default_outbound_queue_capacity(),
            command_capacity: default_command_capacity(),
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            pong_wait_ms: default_pong_wait(),
        }
    }
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            user_id_header: default_user_id_header(),
            username_header: default_username_header(),
            allow_query: true,
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
            report_interval_ms: default_report_interval(),
        }
    }
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            grace_ms: default_grace(),
            write_grace_ms: default_write_grace(),
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            per_second: default_rate_per_second(),
            burst: default_rate_burst(),
        }
    }
}

impl Config {
    /// Load configuration from the first existing default path, or defaults,
    /// then apply environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed, or an
    /// override has the wrong type.
    pub fn load() -> Result<Self> {
        for path in &CONFIG_PATHS {
            let expanded = shellexpand::tilde(path);
            if Path::new(expanded.as_ref()).exists() {
                return Self::from_file(expanded.as_ref())?.with_env_overrides();
            }
        }

        Self::default().with_env_overrides()
    }

    /// Load configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Layer `CHATTER__SECTION__KEY` environment variables over this config.
    ///
    /// # Errors
    ///
    /// Returns an error if an override cannot be converted to the field type.
    pub fn with_env_overrides(self) -> Result<Self> {
        self.with_overrides(
            ::config::Environment::with_prefix("CHATTER")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        )
    }

    fn with_overrides<S>(self, source: S) -> Result<Self>
    where
        S: ::config::Source + Send + Sync + 'static,
    {
        let base = ::config::Config::try_from(&self).context("Failed to serialize config")?;
        ::config::Config::builder()
            .add_source(base)
            .add_source(source)
            .build()
            .context("Failed to apply config overrides")?
            .try_deserialize()
            .context("Invalid config override")
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if `host:port` is not a valid socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid bind address {}:{}", self.host, self.port))
    }

    /// Hub settings derived from the limits section.
    #[must_use]
    pub fn hub_config(&self) -> HubConfig {
        HubConfig {
            command_capacity: self.limits.command_capacity,
            ..HubConfig::default()
        }
    }

    /// Per-connection settings derived from limits and heartbeat.
    #[must_use]
    pub fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig::default()
            .with_outbound_capacity(self.limits.outbound_queue_capacity)
            .with_max_frame_size(self.limits.max_message_size)
            .with_pong_wait(Duration::from_millis(self.heartbeat.pong_wait_ms))
            .with_write_grace(Duration::from_millis(self.shutdown.write_grace_ms))
    }

    #[must_use]
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown.grace_ms)
    }
}
