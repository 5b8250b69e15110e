use anyhow::Result;
use autoback::backup::restic::Restic;
use autoback::storage::Storage;
use autoback::utils::{config, logging};
use autoback::{BackupOrchestrator, ProgressStore};
use std::sync::Arc;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    logging::init_tracing();

    // Load configuration
    let config = Arc::new(config::load_config()?);

    info!("Starting autoback v{}", env!("CARGO_PKG_VERSION"));
    info!("Poll interval: {:?}", config.poll_interval);
    if let Some(prefix) = &config.host_prefix {
        info!("Host filesystem prefix: {}", prefix.display());
    }

    // Initialize storage layer
    let storage = Storage::new(&config.database_url).await?;
    storage.run_migrations().await?;

    // A missing tool is not fatal: drives can still be registered and the
    // binary may show up later (e.g. a package install).
    match Restic::version(&config.restic).await {
        Ok(version) => info!("Using {}", version),
        Err(e) => warn!("Backup tool unavailable: {}", e),
    }

    let orchestrator = BackupOrchestrator::new(config.clone(), ProgressStore::new());
    let handle = orchestrator.register_from_source(&storage).await?;

    shutdown_signal().await;
    handle.abort();

    info!("Stopped watching drives");
    Ok(())
}

async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
