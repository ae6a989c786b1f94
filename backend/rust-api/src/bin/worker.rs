//! Standalone worker process: runs both queue pools without the HTTP API.
//!
//! Events published here reach no live connections; clients of a split
//! deployment learn about results through the status poller.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use mathquest_api::{config::Config, services::AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mathquest_api=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    let config = Config::load()?;
    let app_state = AppState::new(config).await?;

    let workers = app_state.spawn_workers();
    tracing::info!(workers = workers.worker_count(), "Worker process started");

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received, finishing in-flight jobs");

    workers.shutdown().await;
    app_state.hub.shutdown().await;
    Ok(())
}
