//! Picker Daemon - Inference endpoint picker
//!
//! Keeps the picker's view of one serving pool in sync with a resources
//! file and with live backend telemetry.
//!
//! # Usage
//!
//! ```bash
//! # Pool name from the command line, everything else from defaults
//! picker-daemon --resources /etc/picker/resources.toml --pool-name vllm-pool
//!
//! # With config file
//! picker-daemon --config /etc/picker/picker.toml --resources resources.toml
//!
//! # Verbose logging
//! RUST_LOG=debug picker-daemon --resources resources.toml
//! ```
//!
//! # Signals
//!
//! - `SIGTERM` / `SIGINT`: Graceful shutdown
//! - `SIGHUP`: Re-read the resources file

mod resources;
mod scrape;
mod server;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tracing::{error, info};

use picker_core::{default_config_path, ConfigOverrides, PickerConfig};

use resources::FileResourceSource;
use server::{Control, PickerServer};

/// Picker Daemon - endpoint picker for an inference serving pool
#[derive(Parser, Debug)]
#[command(name = "picker-daemon")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Configuration file path
    #[arg(short = 'c', long, env = "PICKER_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Resources file declaring pools, models and memberships
    #[arg(short = 'r', long, env = "PICKER_RESOURCES", value_name = "FILE")]
    resources: PathBuf,

    /// Name of the pool to serve
    #[arg(long, env = "PICKER_POOL_NAME")]
    pool_name: Option<String>,

    /// Namespace of the pool to serve
    #[arg(long, env = "PICKER_POOL_NAMESPACE")]
    pool_namespace: Option<String>,

    /// Membership resource listing the pool's endpoints (default: pool name)
    #[arg(long, env = "PICKER_MEMBERSHIP_NAME")]
    membership_name: Option<String>,

    /// Workers per reconcile loop
    #[arg(long, env = "PICKER_WORKERS")]
    workers: Option<usize>,

    /// Telemetry refresh interval in milliseconds
    #[arg(long, env = "PICKER_REFRESH_INTERVAL_MS")]
    refresh_interval_ms: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, env = "PICKER_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

impl Args {
    fn overrides(&self) -> ConfigOverrides {
        let mut overrides = ConfigOverrides::new();
        if let Some(name) = &self.pool_name {
            overrides = overrides.with_pool_name(name.clone());
        }
        if let Some(namespace) = &self.pool_namespace {
            overrides = overrides.with_pool_namespace(namespace.clone());
        }
        if let Some(name) = &self.membership_name {
            overrides = overrides.with_membership(name.clone());
        }
        if let Some(workers) = self.workers {
            overrides = overrides.with_workers(workers);
        }
        if let Some(ms) = self.refresh_interval_ms {
            overrides = overrides.with_refresh_interval_ms(ms);
        }
        overrides
    }
}

/// Initialize logging with the specified level
fn init_logging(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!("picker_daemon={level},picker_core={level}"))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .init();
}

/// File config, then CLI and environment overrides on top
async fn load_config(args: &Args) -> Result<PickerConfig> {
    let mut config = match args.config.clone().or_else(default_config_path) {
        Some(path) => PickerConfig::load(&path)
            .await
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => PickerConfig::default(),
    };

    let overrides = args.overrides();
    overrides.apply(&mut config);
    config.validate().context("Invalid configuration")?;

    info!(
        source = ?config.source(),
        pool = %config.pool_id(),
        membership = %config.membership_id(),
        workers = config.reconcile.workers,
        refresh_interval_ms = config.refresh.interval_ms,
        "Configuration loaded"
    );
    Ok(config)
}

/// Forward process signals to the server as control requests
fn spawn_signal_handler(control: mpsc::Sender<Control>) -> Result<()> {
    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;
    let mut sighup = signal(SignalKind::hangup()).context("Failed to install SIGHUP handler")?;

    tokio::spawn(async move {
        loop {
            let request = tokio::select! {
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, initiating shutdown");
                    Control::Shutdown
                }
                _ = sigint.recv() => {
                    info!("Received SIGINT, initiating shutdown");
                    Control::Shutdown
                }
                _ = sighup.recv() => {
                    info!("Received SIGHUP, reloading resources");
                    Control::Reload
                }
            };
            if control.send(request).await.is_err() || request == Control::Shutdown {
                break;
            }
        }
    });
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args.log_level);

    info!("Picker Daemon starting");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = load_config(&args).await?;
    let source = FileResourceSource::open(&args.resources)
        .await
        .with_context(|| format!("Failed to open resources file {}", args.resources.display()))?;
    let server = PickerServer::new(config, source)?;

    let (control_tx, control_rx) = mpsc::channel(8);
    spawn_signal_handler(control_tx)?;

    match server.run(control_rx).await {
        Ok(()) => {
            info!("Picker daemon stopped cleanly");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Daemon stopped with error");
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_flags_become_overrides() {
        let args = Args::parse_from([
            "picker-daemon",
            "--resources",
            "resources.toml",
            "--pool-name",
            "vllm-pool",
            "--membership-name",
            "vllm-endpoints",
            "--workers",
            "4",
        ]);
        let mut config = PickerConfig::default();
        args.overrides().apply(&mut config);

        assert_eq!(config.pool.name, "vllm-pool");
        assert_eq!(
            config.membership_id(),
            picker_core::ResourceId::new("default", "vllm-endpoints")
        );
        assert_eq!(config.pool.namespace, "default");
        assert_eq!(config.reconcile.workers, 4);
        assert_eq!(config.source(), picker_core::ConfigSource::Cli);
    }

    #[test]
    fn test_resources_flag_is_required() {
        assert!(Args::try_parse_from(["picker-daemon"]).is_err());
    }
}
