#![deny(unsafe_code)]

//! Configuration loading and validation for the berth gateway.
//!
//! Loads TOML configuration files and validates them against expected schemas.
//! Provides the [`GatewayConfig`] type as the central configuration structure,
//! and the [`addr`] module for parsing `scheme://address` listen specifications.
//!
//! The configuration is built once at startup and shared read-only with every
//! component that needs it.

/// Listen address parsing (`tcp://host:port`, `unix:///path`).
pub mod addr;

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

pub use addr::ListenAddr;

/// Default path of the gateway's own Unix socket (the one clients talk to).
pub const DEFAULT_UNIX_SOCKET: &str = "/var/run/docker.sock";

/// Default path of the real daemon's socket, distinct from the gateway's own.
pub const DEFAULT_DAEMON_SOCKET: &str = "/var/run/docker-real.sock";

/// Default TCP host when a `tcp://` address omits it.
pub const DEFAULT_TCP_HOST: &str = "127.0.0.1";

/// Group whose lookup failure is tolerated when chowning the Unix socket.
pub const DEFAULT_SOCKET_GROUP: &str = "docker";

/// Errors that can occur during configuration loading and validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("invalid bind address format: {0}")]
    InvalidAddress(String),
}

/// Top-level gateway configuration.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Listening surface.
    #[serde(default)]
    pub gateway: ListenConfig,

    /// Which backend serves the Engine API.
    #[serde(default)]
    pub backend: BackendConfig,

    /// External runtime settings (used when `backend.kind = "runtime"`).
    #[serde(default)]
    pub runtime: RuntimeConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Shutdown coordination.
    #[serde(default)]
    pub shutdown: ShutdownConfig,
}

/// Where the gateway listens for Engine API clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenConfig {
    /// Address specifications, `tcp://host:port` or `unix:///path`.
    #[serde(default = "default_hosts")]
    pub hosts: Vec<String>,

    /// Group name or numeric gid that should own Unix sockets. Empty = leave as is.
    #[serde(default = "default_group")]
    pub group: String,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            hosts: default_hosts(),
            group: default_group(),
        }
    }
}

fn default_hosts() -> Vec<String> {
    vec![format!("unix://{DEFAULT_UNIX_SOCKET}")]
}

fn default_group() -> String {
    DEFAULT_SOCKET_GROUP.to_string()
}

/// Backend selection, fixed for the lifetime of the process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackendKind {
    /// Forward every request verbatim to the real daemon socket.
    #[default]
    #[serde(rename = "daemon")]
    RealDaemon,
    /// Translate requests into invocations of an external runtime CLI.
    #[serde(rename = "runtime")]
    ExternalRuntime,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::RealDaemon => write!(f, "daemon"),
            BackendKind::ExternalRuntime => write!(f, "runtime"),
        }
    }
}

/// Backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Backend kind: "daemon" or "runtime".
    #[serde(default)]
    pub kind: BackendKind,

    /// Unix socket of the real daemon.
    #[serde(default = "default_daemon_socket")]
    pub daemon_socket: PathBuf,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            kind: BackendKind::default(),
            daemon_socket: default_daemon_socket(),
        }
    }
}

fn default_daemon_socket() -> PathBuf {
    PathBuf::from(DEFAULT_DAEMON_SOCKET)
}

/// External runtime configuration.
///
/// ## TOML Example
///
/// ```toml
/// [runtime]
/// program = "/usr/local/bin/rkt"
/// default_scheme = "docker"
/// native_registries = ["coreos.com", "quay.io/coreos"]
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Runtime binary, looked up on `PATH` when not absolute.
    #[serde(default = "default_runtime_program")]
    pub program: String,

    /// Scheme prefixed to image references that carry none.
    #[serde(default = "default_image_scheme")]
    pub default_scheme: String,

    /// Registries the runtime fetches natively; their images are passed unqualified.
    #[serde(default = "default_native_registries")]
    pub native_registries: Vec<String>,

    /// Shell started inside a container by the attach mapping.
    #[serde(default = "default_shell")]
    pub shell: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            program: default_runtime_program(),
            default_scheme: default_image_scheme(),
            native_registries: default_native_registries(),
            shell: default_shell(),
        }
    }
}

fn default_runtime_program() -> String {
    "rkt".to_string()
}

fn default_image_scheme() -> String {
    "docker".to_string()
}

fn default_native_registries() -> Vec<String> {
    vec!["coreos.com".to_string()]
}

fn default_shell() -> String {
    "/bin/sh".to_string()
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g. "info", "debug", "trace").
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

fn default_log_level() -> String {
    "info".to_string()
}

/// Shutdown configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShutdownConfig {
    /// Upper bound on how long cleanup actions may run, in seconds.
    #[serde(default = "default_shutdown_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_shutdown_timeout_secs(),
        }
    }
}

fn default_shutdown_timeout_secs() -> u64 {
    10
}

impl ShutdownConfig {
    /// The shutdown bound as a [`Duration`](std::time::Duration).
    pub fn timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.timeout_secs)
    }
}

impl GatewayConfig {
    /// Load configuration from a TOML file at the given path using async I/O.
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = tokio::fs::read_to_string(path).await?;
        let config: GatewayConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        let config: GatewayConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse every configured host into a [`ListenAddr`].
    pub fn listen_addrs(&self) -> Result<Vec<ListenAddr>, ConfigError> {
        self.gateway
            .hosts
            .iter()
            .map(|h| ListenAddr::parse(h))
            .collect()
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.gateway.hosts.is_empty() {
            return Err(ConfigError::Validation(
                "gateway.hosts must list at least one address".to_string(),
            ));
        }
        self.listen_addrs()?;

        if self.backend.daemon_socket.as_os_str().is_empty() {
            return Err(ConfigError::Validation(
                "backend.daemon_socket must not be empty".to_string(),
            ));
        }

        if self.runtime.program.trim().is_empty() {
            return Err(ConfigError::Validation(
                "runtime.program must not be empty".to_string(),
            ));
        }
        if self.runtime.default_scheme.is_empty() || self.runtime.default_scheme.contains("://") {
            return Err(ConfigError::Validation(format!(
                "runtime.default_scheme must be a bare scheme name, got {:?}",
                self.runtime.default_scheme
            )));
        }
        if self.runtime.shell.is_empty() {
            return Err(ConfigError::Validation(
                "runtime.shell must not be empty".to_string(),
            ));
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(ConfigError::Validation(format!(
                "logging.level must be one of {:?}, got {:?}",
                valid_levels, self.logging.level
            )));
        }

        if self.shutdown.timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "shutdown.timeout_secs must be at least 1".to_string(),
            ));
        }

        Ok(())
    }
}
