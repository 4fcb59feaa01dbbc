//! # VoidCore Node
//!
//! Entry point: telemetry, configuration, runtime, then wait for Ctrl-C.

use anyhow::{Context, Result};
use tracing::info;

use void_node::{NodeConfig, NodeRuntime};
use void_telemetry::{init_telemetry, TelemetryConfig};

#[tokio::main]
async fn main() -> Result<()> {
    let _telemetry = init_telemetry(TelemetryConfig::from_env()).context("Failed to initialize telemetry")?;

    let config = NodeConfig::from_env().context("Failed to load node configuration")?;
    let runtime = NodeRuntime::new(config)?;
    runtime.start().await?;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("Shutdown signal received");

    runtime.shutdown().await;
    Ok(())
}
