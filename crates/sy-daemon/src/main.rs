//! switchyard daemon: starts the broker, the review patrols, and the
//! HTTP API.

use anyhow::{Context, Result};
use sy_core::config::EngineConfig;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let config = EngineConfig::load().context("failed to load configuration")?;
    sy_telemetry::logging::init_logging(&config.general.service_name, &config.general.log_level);

    info!(
        queues = config.broker.queues.len(),
        port = config.bridge.port,
        "switchyard starting"
    );

    let daemon = sy_daemon::daemon::Daemon::new(config)
        .await
        .context("failed to build engine")?;

    // Wire ctrl-c to graceful shutdown.
    let shutdown = daemon.shutdown_handle();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
            return;
        }
        info!("ctrl-c received, initiating shutdown");
        shutdown.trigger();
    });

    daemon.run().await
}
