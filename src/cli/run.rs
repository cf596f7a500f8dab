use crate::client::{Manager, ManagerError};
use crate::config::parse::load_config;
use crate::wal::NilNotifier;
use crate::web::run_server;
use prometheus::Registry;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};

#[derive(Debug, Error)]
pub enum RunError {
    #[error("config error: {0}")]
    Config(#[from] crate::config::parse::ConfigError),

    #[error("client setup error: {0}")]
    Manager(#[from] ManagerError),

    #[error("failed to listen for shutdown signal: {0}")]
    Signal(#[from] std::io::Error),

    #[error("task join error: {0}")]
    Join(#[from] tokio::task::JoinError),
}

pub async fn run(config_path: Option<PathBuf>) -> Result<(), Box<dyn std::error::Error>> {
    let config_path = match config_path {
        Some(path) => path,
        None => {
            eprintln!("Error: config not found");
            eprintln!("Searched locations:");
            eprintln!("  ~/.config/logship/config.yml");
            eprintln!("  /etc/logship/config.yml");
            eprintln!("\nUse --config <path> to specify a config file, or run 'logship config init' to generate one.");
            std::process::exit(1);
        }
    };

    run_shipper(&config_path).await.map_err(|e| e.into())
}

async fn run_shipper(config_path: &Path) -> Result<(), RunError> {
    info!(config_path = %config_path.display(), "Loading configuration");
    let config = load_config(config_path)?;

    let registry = Registry::new();

    // The WAL is written by another process, so watchers are driven by their
    // read timers rather than write notifications.
    let manager = Manager::new(&registry, &config, &NilNotifier)?;
    info!(
        manager = %manager.name(),
        wal_dir = %config.wal.dir.display(),
        clients = config.clients.len(),
        "WAL clients started"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let metrics_handle = config.metrics.clone().map(|metrics_config| {
        info!("Starting metrics server on {}", metrics_config.listen);
        let registry = registry.clone();
        tokio::spawn(async move {
            if let Err(e) = run_server(registry, metrics_config, shutdown_rx).await {
                error!(error = %e, "Metrics server error");
            }
        })
    });

    info!("Shipping logs, press Ctrl+C to shutdown");
    signal::ctrl_c().await?;
    info!(
        drain = config.wal.drain_on_shutdown,
        "Shutdown signal received"
    );

    manager.stop_with_drain(config.wal.drain_on_shutdown).await;

    let _ = shutdown_tx.send(true);
    if let Some(handle) = metrics_handle {
        handle.await?;
        info!("Metrics server stopped");
    }

    info!("Shutdown complete");
    Ok(())
}
