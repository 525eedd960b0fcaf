//! biod - bioinformatics run orchestrator daemon
//!
//! Main entry point for the daemon binary.

use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

use std::path::PathBuf;

use bio_core::Config;
use biod::{Daemon, DaemonConfig, DEFAULT_PORT};
use clap::Parser;
use eyre::{eyre, WrapErr};
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(name = "biod", about = "Bioinformatics run orchestrator daemon", version)]
struct Cli {
    /// Port to listen on
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Config file (defaults to .bio/config when present)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Root directory for run directories (overrides config)
    #[arg(long)]
    base_path: Option<PathBuf>,

    /// SQLite database path (overrides config)
    #[arg(long)]
    db_path: Option<PathBuf>,

    /// Auth token required on API requests
    #[arg(long, env = "BIOD_AUTH_TOKEN")]
    token: Option<String>,
}

fn main() -> eyre::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing.
    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut settings = Config::discover(cli.config.as_deref()).wrap_err("failed to load config")?;
    if let Some(base_path) = cli.base_path {
        settings.base_path = base_path;
    }
    if let Some(db_path) = cli.db_path {
        settings.db_path = Some(db_path);
    }
    let cwd = std::env::current_dir().wrap_err("failed to resolve working directory")?;
    settings.resolve_paths(&cwd);

    let config = DaemonConfig {
        port: cli.port,
        auth_token: cli.token,
        ..DaemonConfig::from_settings(settings)
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .wrap_err("failed to create tokio runtime")?;

    runtime.block_on(async {
        let daemon = Daemon::new(config)
            .await
            .map_err(|e| eyre!("failed to initialize daemon: {e}"))?;

        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm =
                signal(SignalKind::terminate()).wrap_err("failed to register SIGTERM handler")?;
            let mut sigint =
                signal(SignalKind::interrupt()).wrap_err("failed to register SIGINT handler")?;

            tokio::select! {
                result = daemon.run() => result.map_err(|e| eyre!("daemon error: {e}"))?,
                _ = sigint.recv() => info!("received SIGINT, shutting down"),
                _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
            }
        }

        #[cfg(not(unix))]
        {
            tokio::select! {
                result = daemon.run() => result.map_err(|e| eyre!("daemon error: {e}"))?,
                _ = tokio::signal::ctrl_c() => info!("received SIGINT, shutting down"),
            }
        }

        Ok::<(), eyre::Report>(())
    })
}
