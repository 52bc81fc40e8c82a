//! Gateway daemon process: startup, listeners and shutdown.

use std::sync::Arc;

use berth_config::{BackendKind, ConfigError, GatewayConfig};
use tokio::sync::oneshot;
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::executor::{ExecError, ensure_program_available};
use crate::gateway::{GatewayState, router};
use crate::listener::{self, ListenerError};
use crate::shutdown::ShutdownCoordinator;

/// The berth gateway daemon.
#[derive(Debug)]
pub struct Daemon {
    state: Arc<GatewayState>,
    coordinator: ShutdownCoordinator,
}

impl Daemon {
    /// Create a daemon for the given configuration.
    ///
    /// Fails when the configuration is invalid or the external runtime is
    /// selected but its program cannot be found.
    pub fn new(config: GatewayConfig) -> Result<Self, DaemonError> {
        config.validate()?;

        if config.backend.kind == BackendKind::ExternalRuntime {
            let path = ensure_program_available(&config.runtime.program)?;
            info!(program = %config.runtime.program, path = %path.display(), "external runtime found");
        }

        let state = Arc::new(GatewayState::from_config(Arc::new(config)));
        Ok(Self::with_state(state))
    }

    /// Create a daemon around an already-built gateway state.
    pub fn with_state(state: Arc<GatewayState>) -> Self {
        let coordinator = ShutdownCoordinator::new(state.config().shutdown.timeout());
        Self { state, coordinator }
    }

    /// Bind every listen address and serve until all listeners are closed.
    ///
    /// Listeners are closed through the shutdown coordinator. A failure to
    /// bind any address aborts startup, and sockets already bound for the
    /// other addresses are removed again.
    pub async fn run(&self) -> Result<(), DaemonError> {
        let config = self.state.config();
        let addrs = config.listen_addrs()?;
        info!(
            backend = %config.backend.kind,
            listeners = addrs.len(),
            "berth gateway starting"
        );

        let mut binding = JoinSet::new();
        for addr in addrs {
            let group = config.gateway.group.clone();
            binding.spawn(async move { listener::bind(&addr, &group).await });
        }

        let mut bound = Vec::new();
        let mut failure = None;
        while let Some(res) = binding.join_next().await {
            match res {
                Ok(Ok(listener)) => bound.push(listener),
                Ok(Err(e)) => {
                    failure.get_or_insert(DaemonError::from(e));
                }
                Err(e) => {
                    failure.get_or_insert(DaemonError::Startup(format!("bind task failed: {e}")));
                }
            }
        }
        if let Some(err) = failure {
            for listener in bound {
                listener.close();
            }
            return Err(err);
        }

        let mut serving = JoinSet::new();
        for listener in bound {
            let label = listener
                .local_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|_| "listener".to_string());
            let (close_tx, close_rx) = oneshot::channel();
            self.coordinator
                .register(format!("close {label}"), move || async move {
                    let _ = close_tx.send(());
                });
            serving.spawn(listener::serve(
                listener,
                router(Arc::clone(&self.state)),
                close_rx,
            ));
        }

        while let Some(res) = serving.join_next().await {
            if let Err(e) = res {
                warn!(error = %e, "listener task failed");
            }
        }

        info!("all listeners closed");
        Ok(())
    }

    /// The coordinator that owns cleanup actions for this daemon.
    pub fn coordinator(&self) -> &ShutdownCoordinator {
        &self.coordinator
    }

    pub fn config(&self) -> &GatewayConfig {
        self.state.config()
    }
}

/// Errors from the daemon runtime.
#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    #[error("daemon startup failed: {0}")]
    Startup(String),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Runtime(#[from] ExecError),

    #[error(transparent)]
    Listener(#[from] ListenerError),
}
