#![deny(unsafe_code)]

//! berth CLI: flag parsing, logging bootstrap and the signal trap.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use anyhow::{Context, Result};
use berth_config::{BackendKind, GatewayConfig};
use berth_core::{Daemon, ShutdownCoordinator, build_info};
use clap::{Parser, Subcommand, ValueEnum};
use tokio::signal::unix::{SignalKind, signal};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// berth: an Engine API gateway in front of a container daemon or runtime.
#[derive(Parser, Debug)]
#[command(name = "berth", version = build_info::VERSION_LINE, about, long_about = None)]
struct Cli {
    /// Path to configuration file.
    #[arg(short, long, global = true, default_value = "berth.toml")]
    config: PathBuf,

    /// Increase log verbosity (-v, -vv).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Enable debug logging (same as -v).
    #[arg(short = 'D', long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the gateway.
    Serve(ServeArgs),

    /// Validate and display configuration.
    Config {
        /// Show the resolved configuration.
        #[arg(long)]
        show: bool,
    },
}

#[derive(clap::Args, Debug, Default)]
struct ServeArgs {
    /// Address to listen on (tcp://host:port or unix:///path); repeatable.
    #[arg(short = 'H', long = "host")]
    hosts: Vec<String>,

    /// Socket of the real daemon.
    #[arg(long)]
    daemon_socket: Option<PathBuf>,

    /// Group that should own Unix sockets.
    #[arg(short = 'G', long)]
    group: Option<String>,

    /// Backend runtime.
    #[arg(long, value_enum)]
    runtime: Option<RuntimeChoice>,

    /// External runtime binary.
    #[arg(long)]
    runtime_program: Option<String>,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum RuntimeChoice {
    /// Relay to the real daemon.
    Docker,
    /// Translate into rkt invocations.
    Rkt,
}

impl From<RuntimeChoice> for BackendKind {
    fn from(choice: RuntimeChoice) -> Self {
        match choice {
            RuntimeChoice::Docker => BackendKind::RealDaemon,
            RuntimeChoice::Rkt => BackendKind::ExternalRuntime,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let (config, found) = load_config(&cli.config).await?;
    init_tracing(&cli, &config);
    if !found {
        info!(path = %cli.config.display(), "config file not found, using defaults");
    }

    match cli.command {
        Commands::Serve(args) => cmd_serve(apply_overrides(config, args)).await,
        Commands::Config { show } => cmd_config(&cli.config, &config, show),
    }
}

fn init_tracing(cli: &Cli, config: &GatewayConfig) {
    let level = match (cli.verbose, cli.debug) {
        (0, false) => config.logging.level.as_str(),
        (0, true) | (1, _) => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .init();
}

fn apply_overrides(mut config: GatewayConfig, args: ServeArgs) -> GatewayConfig {
    if !args.hosts.is_empty() {
        config.gateway.hosts = args.hosts;
    }
    if let Some(socket) = args.daemon_socket {
        config.backend.daemon_socket = socket;
    }
    if let Some(group) = args.group {
        config.gateway.group = group;
    }
    if let Some(runtime) = args.runtime {
        config.backend.kind = runtime.into();
    }
    if let Some(program) = args.runtime_program {
        config.runtime.program = program;
    }
    config
}

async fn cmd_serve(config: GatewayConfig) -> Result<()> {
    info!(version = build_info::VERSION_LINE, "starting berth");

    let daemon = Arc::new(Daemon::new(config).context("failed to start gateway")?);
    let received = Arc::new(AtomicU32::new(0));
    spawn_signal_trap(daemon.coordinator().clone(), Arc::clone(&received))?;

    daemon.run().await?;

    if daemon.coordinator().is_shutting_down() {
        if !daemon.coordinator().wait().await {
            warn!("shutdown did not complete cleanly");
        }
        let signo = received.load(Ordering::SeqCst);
        if signo != 0 {
            std::process::exit(exit_code(signo));
        }
    }
    Ok(())
}

fn exit_code(signo: u32) -> i32 {
    128 + signo as i32
}

/// Install handlers for SIGINT, SIGTERM and SIGQUIT.
///
/// The first interrupt starts the coordinated shutdown, the third forces an
/// immediate exit. SIGQUIT exits at once unless `DEBUG` is set.
fn spawn_signal_trap(coordinator: ShutdownCoordinator, received: Arc<AtomicU32>) -> Result<()> {
    let mut sigint = signal(SignalKind::interrupt()).context("failed to install SIGINT handler")?;
    let mut sigterm =
        signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    let mut sigquit = signal(SignalKind::quit()).context("failed to install SIGQUIT handler")?;

    tokio::spawn(async move {
        let mut interrupts = 0u32;
        loop {
            let kind = tokio::select! {
                _ = sigint.recv() => SignalKind::interrupt(),
                _ = sigterm.recv() => SignalKind::terminate(),
                _ = sigquit.recv() => SignalKind::quit(),
            };
            let signo = kind.as_raw_value() as u32;

            if kind == SignalKind::quit() {
                if std::env::var_os("DEBUG").is_some() {
                    info!(signal = signo, "SIGQUIT ignored in debug mode");
                    continue;
                }
                std::process::exit(exit_code(signo));
            }

            interrupts += 1;
            match interrupts {
                1 => {
                    info!(signal = signo, "processing signal, shutting down");
                    received.store(signo, Ordering::SeqCst);
                    let coordinator = coordinator.clone();
                    tokio::spawn(async move { coordinator.shutdown().await });
                }
                2 => warn!("forcing shutdown: interrupt once more to exit immediately"),
                _ => {
                    warn!(signal = signo, "forced exit");
                    std::process::exit(exit_code(signo));
                }
            }
        }
    });
    Ok(())
}

fn cmd_config(config_path: &Path, config: &GatewayConfig, show: bool) -> Result<()> {
    if show {
        let toml_str = toml::to_string_pretty(config).context("failed to render config")?;
        println!("{toml_str}");
    } else {
        println!("Configuration at '{}' is valid.", config_path.display());
    }
    Ok(())
}

/// Load the config file, or defaults when it does not exist.
/// The flag reports whether the file was found.
async fn load_config(path: &Path) -> Result<(GatewayConfig, bool)> {
    if tokio::fs::try_exists(path).await.unwrap_or(false) {
        let config = GatewayConfig::load(path)
            .await
            .with_context(|| format!("invalid config file {}", path.display()))?;
        Ok((config, true))
    } else {
        Ok((GatewayConfig::default(), false))
    }
}
