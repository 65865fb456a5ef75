//! mlreg: model registry and metrics tracker served over HTTP.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use mlreg_core::RegistryConfig;
use mlreg_core::logging::init_logging;
use mlreg_learn::RegistryService;
use mlreg_server::AppState;
use tracing::{error, info, warn};

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Model registry and metrics tracker
#[derive(Parser)]
#[command(name = "mlreg")]
#[command(version)]
struct Cli {
    /// Path to config.json (created with defaults if missing)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Data directory holding the database, model blobs and logs
    #[arg(short, long)]
    data_dir: Option<PathBuf>,

    /// Address to listen on, e.g. 0.0.0.0:8000
    #[arg(short, long)]
    bind: Option<String>,
}

fn load_config(cli: &Cli) -> Result<RegistryConfig> {
    let mut config = match (&cli.config, &cli.data_dir) {
        (Some(path), _) => RegistryConfig::load_from_path(path)?,
        (None, Some(dir)) => RegistryConfig::load_from_path(&dir.join("config.json"))?,
        (None, None) => RegistryConfig::load()?,
    };
    if let Some(dir) = &cli.data_dir {
        config.data_dir = dir.clone();
    }
    if let Some(bind) = &cli.bind {
        config.bind_addr = bind.clone();
    }
    config.validate()?;
    Ok(config)
}

/// Periodically drop finished training tasks past their retention.
fn spawn_task_purge(service: Arc<RegistryService>, days: u32, every: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        loop {
            ticker.tick().await;
            let tasks = Arc::clone(&service.tasks);
            match tokio::task::spawn_blocking(move || tasks.purge_finished(days)).await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => warn!("Task purge failed: {e}"),
                Err(e) => error!("Task purge did not complete: {e}"),
            }
        }
    });
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl-C: {e}");
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested");
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;
    config.ensure_dirs()?;
    let _log_guard = init_logging(&config)?;
    info!("Starting mlreg v{VERSION}");

    let service = RegistryService::open(&config).context("Failed to open registry")?;
    let addr = config.socket_addr()?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    let purge_every = Duration::from_secs(config.task_purge_interval_secs.max(60));
    let retention_days = config.task_retention_days;
    let state = AppState::new(service, config);
    spawn_task_purge(Arc::clone(&state.service), retention_days, purge_every);

    mlreg_server::serve(state, listener, shutdown_signal()).await?;
    info!("mlreg stopped");
    Ok(())
}
