// Quaero daemon entry point.

use anyhow::Result;
use common::bootstrap;
use common::config::Settings;
use common::telemetry;
use tokio::signal;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    let settings = Settings::load()?;
    settings
        .validate()
        .map_err(|reason| anyhow::anyhow!("Invalid configuration: {}", reason))?;

    if settings.environment == "development" {
        telemetry::init_human_logging(&settings.observability.log_level);
    } else {
        telemetry::init_json_logging(&settings.observability.log_level);
    }

    info!(environment = %settings.environment, "Starting quaerod");

    let engine = bootstrap::init_engine(&settings).await?;

    let reaper = engine.reaper.clone();
    let reaper_shutdown = engine.shutdown.clone();
    let reaper_handle = tokio::spawn(async move {
        reaper.run(reaper_shutdown).await;
    });

    let scheduler = engine.scheduler.clone();
    let scheduler_handle = tokio::spawn(async move {
        if let Err(e) = scheduler.start().await {
            error!(error = %e, "Scheduler error");
        }
    });

    info!("quaerod is running. Press Ctrl+C to shut down gracefully");
    match signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received"),
        Err(e) => error!(error = %e, "Failed to listen for shutdown signal"),
    }

    // Stop dispatching, let executors observe cancellation, demote leftover
    // running rows, then close the store.
    engine.shutdown.cancel();
    let _ = scheduler_handle.await;
    let _ = reaper_handle.await;
    engine.store.close().await;

    info!("quaerod shutdown complete");
    Ok(())
}
