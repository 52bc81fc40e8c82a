//! Configuration builders for tests.
//!
//! Use [`TestConfigBuilder`] to create customised [`GatewayConfig`] values
//! without repeating boilerplate across crate boundaries.

use std::path::{Path, PathBuf};

use berth_config::{BackendKind, GatewayConfig};

/// Fluent builder for [`GatewayConfig`] in tests.
///
/// The builder starts from the defaults but clears the socket group, so unit
/// sockets created under a temp dir never need a `docker` group.
///
/// # Example
///
/// ```ignore
/// let config = TestConfigBuilder::new()
///     .unix_listener(tmp.path().join("gateway.sock"))
///     .daemon_socket(fake.socket_path())
///     .build();
/// ```
pub struct TestConfigBuilder {
    config: GatewayConfig,
}

impl TestConfigBuilder {
    pub fn new() -> Self {
        let mut config = GatewayConfig::default();
        config.gateway.group = String::new();
        Self { config }
    }

    /// Replace the listen addresses with a single Unix socket.
    pub fn unix_listener(mut self, path: impl AsRef<Path>) -> Self {
        self.config.gateway.hosts = vec![format!("unix://{}", path.as_ref().display())];
        self
    }

    /// Add a TCP listener.
    pub fn tcp_listener(mut self, host: &str, port: u16) -> Self {
        self.config.gateway.hosts.push(format!("tcp://{host}:{port}"));
        self
    }

    pub fn group(mut self, group: &str) -> Self {
        self.config.gateway.group = group.to_string();
        self
    }

    pub fn daemon_socket(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.backend.daemon_socket = path.into();
        self
    }

    /// Select the external runtime backend with the given program.
    pub fn runtime(mut self, program: &str) -> Self {
        self.config.backend.kind = BackendKind::ExternalRuntime;
        self.config.runtime.program = program.to_string();
        self
    }

    pub fn native_registries(mut self, registries: &[&str]) -> Self {
        self.config.runtime.native_registries =
            registries.iter().map(|r| r.to_string()).collect();
        self
    }

    pub fn log_level(mut self, level: &str) -> Self {
        self.config.logging.level = level.to_string();
        self
    }

    pub fn shutdown_timeout_secs(mut self, secs: u64) -> Self {
        self.config.shutdown.timeout_secs = secs;
        self
    }

    pub fn build(self) -> GatewayConfig {
        self.config
    }
}

impl Default for TestConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
